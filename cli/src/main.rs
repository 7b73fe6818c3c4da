// swarmnet: command-line client for the snode network
//
// Inspect the snode pool, look up swarms, build onion paths and send
// JSON-RPC calls to an account's swarm.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use serde_json::Value;
use swarmnet_core::api::SnodeRequest;
use swarmnet_core::clock::ClockSync;
use swarmnet_core::snode::Snode;
use swarmnet_core::SwarmNetwork;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "swarmnet")]
#[command(about = "Onion-routed client for snode swarms", long_about = None)]
#[command(version)]
struct Cli {
    /// Debug logging for swarmnet crates
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or refresh the snode pool
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },
    /// Show the swarm of an account
    Swarm { account: String },
    /// Build an onion path and print its hops
    Path,
    /// Send a JSON-RPC call to an account's swarm
    Call {
        account: String,
        method: String,
        /// JSON object with the call parameters
        params: Option<String>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Sync with network time and show the offset
    Clock,
}

#[derive(Subcommand)]
enum PoolAction {
    Refresh,
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Set { key: String, value: String },
    Reset,
}

/// Keeps the file writer flushing until main returns
type LogGuard = Option<tracing_appender::non_blocking::WorkerGuard>;

fn init_logging(cli: &Cli, config: &config::Config) -> Result<LogGuard> {
    let filter = if cli.verbose {
        EnvFilter::new("swarmnet_core=debug,swarmnet=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let (file_layer, guard) = if config.log_to_file {
        let log_dir = config::Config::data_dir()?.join("logs");
        let appender = tracing_appender::rolling::daily(log_dir, "swarmnet.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    let json_layer = cli
        .json_logs
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!cli.json_logs).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _log_guard = init_logging(&cli, &config)?;

    match cli.command {
        Commands::Pool { action } => cmd_pool(&config, action).await,
        Commands::Swarm { account } => cmd_swarm(&config, &account).await,
        Commands::Path => cmd_path(&config).await,
        Commands::Call {
            account,
            method,
            params,
        } => cmd_call(&config, &account, &method, params.as_deref()).await,
        Commands::Config { action } => cmd_config(config, action),
        Commands::Clock => cmd_clock(&config).await,
    }
}

fn open_network(config: &config::Config) -> Result<SwarmNetwork> {
    let storage = config.storage_dir()?;
    SwarmNetwork::open(config.network.clone(), &storage)
        .with_context(|| format!("Failed to open snode store at {}", storage.display()))
}

fn print_node(index: usize, node: &Snode) {
    println!(
        "  {:>3}. {:<28} v{:<8} {}",
        index + 1,
        node.url().bright_cyan(),
        node.version.to_string(),
        short_key(node.ed25519_key()).dimmed()
    );
}

/// First 16 characters of a key; shorter keys are shown whole
fn short_key(key: &str) -> &str {
    key.get(..16).unwrap_or(key)
}

async fn cmd_pool(config: &config::Config, action: PoolAction) -> Result<()> {
    let network = open_network(config)?;
    match action {
        PoolAction::Refresh => {
            let pool = network.refresh_pool().await.context("Seed bootstrap failed")?;
            println!("{} Pool refreshed: {} snodes", "✓".green(), pool.len());
        }
        PoolAction::List => {
            let pool = network.pool().get_pool();
            println!("{}", "Snode Pool".bold());
            if pool.is_empty() {
                println!("  {}", "(empty, run `swarmnet pool refresh`)".dimmed());
            }
            for (i, node) in pool.iter().enumerate() {
                print_node(i, node);
            }
        }
    }
    Ok(())
}

async fn cmd_swarm(config: &config::Config, account: &str) -> Result<()> {
    let network = open_network(config)?;
    let swarm = network
        .get_swarm(account)
        .await
        .with_context(|| format!("Failed to get swarm for {}", account))?;

    println!("{} {}", "Swarm for".bold(), account.bright_yellow());
    for (i, node) in swarm.iter().enumerate() {
        print_node(i, node);
    }
    Ok(())
}

async fn cmd_path(config: &config::Config) -> Result<()> {
    let network = open_network(config)?;
    let path = network.build_path().await.context("Failed to build onion path")?;

    println!("{}", "Onion Path".bold());
    for (i, hop) in path.hops().iter().enumerate() {
        let role = if i == 0 { "guard" } else { "hop" };
        println!("  {} {:<6} {}", "→".bright_green(), role, hop.url().bright_cyan());
    }
    Ok(())
}

async fn cmd_call(
    config: &config::Config,
    account: &str,
    method: &str,
    params: Option<&str>,
) -> Result<()> {
    let params: Value = match params {
        Some(raw) => serde_json::from_str(raw).context("Params must be a JSON object")?,
        None => Value::Object(Default::default()),
    };
    anyhow::ensure!(params.is_object(), "Params must be a JSON object");

    let network = open_network(config)?;
    let response = network
        .send_to_swarm(account, SnodeRequest::new(method, params))
        .await
        .with_context(|| format!("{} failed", method))?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Reset => {
            config::Config::default().save()?;
            println!("{} Configuration reset to defaults", "✓".green());
        }
    }
    Ok(())
}

async fn cmd_clock(config: &config::Config) -> Result<()> {
    let network = open_network(config)?;
    if !network.resync_clock().await {
        anyhow::bail!("No snode answered the time query");
    }

    let offset = network.clock().offset_ms().unwrap_or(0);
    println!("{} Network time: {} ms", "✓".green(), network.clock().now_ms());
    println!("  Offset from system clock: {} ms", offset.to_string().bright_yellow());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_key() {
        assert_eq!(short_key(&"ab".repeat(32)), "abababababababab");
        assert_eq!(short_key("abc"), "abc");
        assert_eq!(short_key(""), "");
    }
}
