// Request batcher: coalesces concurrent calls sharing a key into one RPC
//
// A single spawned task owns every pending batch. Callers talk to it over an
// mpsc queue and get their own result back on a oneshot. A batch is sent
// `window` after its first member joined; members are answered in join order.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::snode::SnodeRequest;
use super::storage;
use super::swarm::SwarmRequest;
use super::{ApiError, ApiExecutor, ExecutorContext};

/// Pending commands the batch task will queue before callers wait
const COMMAND_QUEUE_DEPTH: usize = 100;

pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(100);

/// How requests of one kind are grouped, merged and split
pub trait Batcher: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;
    /// A request in the shape it takes inside a batch
    type Item: Send + 'static;

    /// `None` sends the request on its own, right away
    fn batch_key(&self, request: &Self::Request) -> Option<String>;

    fn transform(&self, request: &Self::Request) -> Result<Self::Item, ApiError>;

    /// Combined request; `first` is the earliest member still in the batch
    fn construct(&self, first: &Self::Request, items: Vec<Self::Item>) -> Self::Request;

    /// Split the combined response, one result per item, in item order
    fn deconstruct(
        &self,
        response: Self::Response,
    ) -> Result<Vec<Result<Self::Response, ApiError>>, ApiError>;
}

type Reply<B> = oneshot::Sender<Result<<B as Batcher>::Response, ApiError>>;

enum Command<B: Batcher> {
    Send {
        id: u64,
        key: String,
        request: B::Request,
        reply: Reply<B>,
    },
    Cancel {
        id: u64,
        key: String,
    },
}

struct Member<B: Batcher> {
    id: u64,
    request: B::Request,
    reply: Reply<B>,
}

struct PendingBatch<B: Batcher> {
    members: Vec<Member<B>>,
    deadline: Instant,
}

pub struct BatchExecutor<B: Batcher> {
    batcher: Arc<B>,
    inner: Arc<dyn ApiExecutor<B::Request, B::Response>>,
    commands: mpsc::Sender<Command<B>>,
    next_id: AtomicU64,
}

impl<B: Batcher> BatchExecutor<B> {
    /// Spawns the batch task; must be called inside a tokio runtime
    pub fn new(
        batcher: B,
        inner: Arc<dyn ApiExecutor<B::Request, B::Response>>,
        window: Duration,
    ) -> Self {
        let batcher = Arc::new(batcher);
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        tokio::spawn(run_batches(
            Arc::clone(&batcher),
            Arc::clone(&inner),
            receiver,
            window,
        ));
        Self {
            batcher,
            inner,
            commands,
            next_id: AtomicU64::new(0),
        }
    }
}

/// Sends a best-effort cancel if the caller stops waiting
struct CancelOnDrop<B: Batcher> {
    commands: mpsc::Sender<Command<B>>,
    id: u64,
    key: Option<String>,
}

impl<B: Batcher> CancelOnDrop<B> {
    fn disarm(&mut self) {
        self.key = None;
    }
}

impl<B: Batcher> Drop for CancelOnDrop<B> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let _ = self.commands.try_send(Command::Cancel { id: self.id, key });
        }
    }
}

#[async_trait]
impl<B: Batcher> ApiExecutor<B::Request, B::Response> for BatchExecutor<B> {
    async fn send(
        &self,
        ctx: &mut ExecutorContext,
        request: B::Request,
    ) -> Result<B::Response, ApiError> {
        let Some(key) = self.batcher.batch_key(&request) else {
            return self.inner.send(ctx, request).await;
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Send {
                id,
                key: key.clone(),
                request,
                reply,
            })
            .await
            .map_err(|_| ApiError::Batch("batch task stopped".to_string()))?;

        let mut cancel = CancelOnDrop {
            commands: self.commands.clone(),
            id,
            key: Some(key),
        };
        let outcome = result.await;
        cancel.disarm();

        outcome.map_err(|_| ApiError::Batch("batch dropped before completion".to_string()))?
    }
}

async fn run_batches<B: Batcher>(
    batcher: Arc<B>,
    inner: Arc<dyn ApiExecutor<B::Request, B::Response>>,
    mut commands: mpsc::Receiver<Command<B>>,
    window: Duration,
) {
    let mut pending: HashMap<String, PendingBatch<B>> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|b| b.deadline).min();

        let command = match next_deadline {
            None => commands.recv().await,
            Some(deadline) => tokio::select! {
                command = commands.recv() => command,
                _ = tokio::time::sleep_until(deadline) => {
                    dispatch_due(&batcher, &inner, &mut pending);
                    continue;
                }
            },
        };

        match command {
            Some(Command::Send {
                id,
                key,
                request,
                reply,
            }) => {
                let batch = pending.entry(key).or_insert_with(|| PendingBatch {
                    members: Vec::new(),
                    deadline: Instant::now() + window,
                });
                batch.members.push(Member { id, request, reply });
            }
            Some(Command::Cancel { id, key }) => {
                if let Some(batch) = pending.get_mut(&key) {
                    batch.members.retain(|m| m.id != id);
                    if batch.members.is_empty() {
                        pending.remove(&key);
                    }
                }
            }
            None => {
                // Executor dropped: flush what is left and stop
                for (key, batch) in pending.drain() {
                    spawn_batch(&batcher, &inner, key, batch);
                }
                tracing::debug!("Batch task stopped");
                return;
            }
        }
    }
}

fn dispatch_due<B: Batcher>(
    batcher: &Arc<B>,
    inner: &Arc<dyn ApiExecutor<B::Request, B::Response>>,
    pending: &mut HashMap<String, PendingBatch<B>>,
) {
    let now = Instant::now();
    let due: Vec<String> = pending
        .iter()
        .filter(|(_, b)| b.deadline <= now)
        .map(|(k, _)| k.clone())
        .collect();
    for key in due {
        if let Some(batch) = pending.remove(&key) {
            spawn_batch(batcher, inner, key, batch);
        }
    }
}

fn spawn_batch<B: Batcher>(
    batcher: &Arc<B>,
    inner: &Arc<dyn ApiExecutor<B::Request, B::Response>>,
    key: String,
    batch: PendingBatch<B>,
) {
    let batcher = Arc::clone(batcher);
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        execute_batch(batcher.as_ref(), inner.as_ref(), &key, batch.members).await;
    });
}

async fn execute_batch<B: Batcher>(
    batcher: &B,
    inner: &dyn ApiExecutor<B::Request, B::Response>,
    key: &str,
    members: Vec<Member<B>>,
) {
    let mut ready = Vec::with_capacity(members.len());
    let mut items = Vec::with_capacity(members.len());
    for member in members {
        match batcher.transform(&member.request) {
            Ok(item) => {
                items.push(item);
                ready.push(member);
            }
            Err(e) => {
                tracing::debug!("Batch member {} rejected: {}", member.id, e);
                let _ = member.reply.send(Err(e));
            }
        }
    }
    let combined = match ready.first() {
        Some(first) => batcher.construct(&first.request, items),
        None => return,
    };

    tracing::debug!("📦 Sending batch {} with {} requests", key, ready.len());
    let result = inner
        .send(&mut ExecutorContext::new(), combined)
        .await
        .and_then(|response| batcher.deconstruct(response))
        .and_then(|results| {
            if results.len() == ready.len() {
                Ok(results)
            } else {
                Err(ApiError::Batch(format!(
                    "batch response has {} results for {} requests",
                    results.len(),
                    ready.len()
                )))
            }
        });

    match result {
        Ok(results) => {
            for (member, result) in ready.into_iter().zip(results) {
                let _ = member.reply.send(result);
            }
        }
        Err(error) => {
            tracing::warn!("Batch {} failed: {}", key, error);
            for member in ready {
                let _ = member.reply.send(Err(error.clone()));
            }
        }
    }
}

/// Batches swarm calls per account into one snode `batch` RPC
#[derive(Debug, Default, Clone, Copy)]
pub struct SnodeBatcher;

/// Methods a storage server accepts inside `batch`
const BATCHABLE_METHODS: [&str; 5] = ["retrieve", "store", "delete", "expire", "get_expiries"];

impl Batcher for SnodeBatcher {
    type Request = SwarmRequest;
    type Response = Value;
    type Item = SnodeRequest;

    fn batch_key(&self, request: &SwarmRequest) -> Option<String> {
        if !BATCHABLE_METHODS.contains(&request.request.method.as_str()) {
            return None;
        }
        match &request.node_override {
            Some(node) => Some(format!("{}@{}", request.account_id, node)),
            None => Some(request.account_id.clone()),
        }
    }

    fn transform(&self, request: &SwarmRequest) -> Result<SnodeRequest, ApiError> {
        Ok(request.request.clone())
    }

    fn construct(&self, first: &SwarmRequest, items: Vec<SnodeRequest>) -> SwarmRequest {
        SwarmRequest {
            account_id: first.account_id.clone(),
            request: storage::batch(&items),
            node_override: first.node_override.clone(),
        }
    }

    fn deconstruct(&self, response: Value) -> Result<Vec<Result<Value, ApiError>>, ApiError> {
        let results = response
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| ApiError::Malformed("batch response has no results".to_string()))?;
        Ok(results.iter().map(sub_result).collect())
    }
}

/// One `{code, body}` entry of a `batch`/`sequence` response
pub fn sub_result(entry: &Value) -> Result<Value, ApiError> {
    let code = entry
        .get("code")
        .and_then(Value::as_u64)
        .and_then(|c| u16::try_from(c).ok())
        .ok_or_else(|| ApiError::Malformed("sub-response has no code".to_string()))?;
    let body = entry.get("body").cloned().unwrap_or(Value::Null);
    if (200..300).contains(&code) {
        Ok(body)
    } else {
        Err(ApiError::UnhandledStatus {
            code,
            body: Some(body.to_string()),
        })
    }
}
