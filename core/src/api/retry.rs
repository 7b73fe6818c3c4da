// Retry driver: replays a logical call while its failures ask for it

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{ApiError, ApiExecutor, ContextKey, ExecutorContext};
use crate::onion::FailureDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    None,
    Fixed { delay_ms: u64 },
    Uniform { min_ms: u64, max_ms: u64 },
}

impl Backoff {
    fn delay(&self) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Uniform { min_ms, max_ms } if max_ms > min_ms => {
                Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
            }
            Backoff::Uniform { min_ms, .. } => Duration::from_millis(min_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Uniform {
                min_ms: 100,
                max_ms: 500,
            },
        }
    }
}

/// Decision for an error, falling back to the onion default when none is attached
pub fn decide(error: &ApiError) -> FailureDecision {
    if let Some(decision) = error.decision() {
        return decision;
    }
    error
        .onion()
        .map(|e| e.default_decision())
        .unwrap_or(FailureDecision::Fail)
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
        }
    }

    /// Run `op` until it succeeds, fails for good, or the budget is spent.
    /// The same context is handed to every attempt.
    pub async fn run<T, F>(&self, ctx: &mut ExecutorContext, mut op: F) -> Result<T, ApiError>
    where
        F: for<'c> FnMut(
            &'c mut ExecutorContext,
        ) -> futures::future::BoxFuture<'c, Result<T, ApiError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let error = match op(ctx).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if attempt >= max_attempts || decide(&error) == FailureDecision::Fail {
                return Err(error);
            }

            let delay = self.backoff.delay();
            tracing::debug!(
                "Attempt {}/{} failed ({}), retrying in {:?}",
                attempt,
                max_attempts,
                error,
                delay
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }
}

/// Set on a context to make `RetryExecutor` try only once
pub struct DisableRetry;

impl ContextKey for DisableRetry {
    type Value = ();
}

pub struct RetryExecutor<Req, Res> {
    inner: Arc<dyn ApiExecutor<Req, Res>>,
    policy: RetryPolicy,
}

impl<Req, Res> RetryExecutor<Req, Res> {
    pub fn new(inner: Arc<dyn ApiExecutor<Req, Res>>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<Req, Res> ApiExecutor<Req, Res> for RetryExecutor<Req, Res>
where
    Req: Clone + Send + 'static,
    Res: Send + 'static,
{
    async fn send(&self, ctx: &mut ExecutorContext, req: Req) -> Result<Res, ApiError> {
        let policy = if ctx.contains::<DisableRetry>() {
            RetryPolicy::no_retry()
        } else {
            self.policy
        };
        let inner = Arc::clone(&self.inner);
        policy
            .run(ctx, move |ctx| {
                let inner = Arc::clone(&inner);
                let req = req.clone();
                Box::pin(async move { inner.send(ctx, req).await })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onion::{ErrorStatus, OnionError};
    use crate::snode::test_support::snode;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct Scripted {
        replies: Mutex<VecDeque<Result<u32, ApiError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<u32, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl ApiExecutor<&'static str, u32> for Scripted {
        async fn send(&self, _: &mut ExecutorContext, _: &'static str) -> Result<u32, ApiError> {
            *self.calls.lock() += 1;
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::Malformed("exhausted".into())))
        }
    }

    fn guard_down() -> ApiError {
        OnionError::GuardConnectionFailed {
            guard: snode(1),
            reason: "refused".into(),
        }
        .into()
    }

    fn retrying(inner: &Arc<Scripted>, max_attempts: u32) -> RetryExecutor<&'static str, u32> {
        let policy = RetryPolicy {
            max_attempts,
            backoff: Backoff::None,
        };
        RetryExecutor::new(inner.clone(), policy)
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let inner = Scripted::new(vec![Err(guard_down()), Err(guard_down()), Ok(7)]);
        let executor = retrying(&inner, 3);
        assert_eq!(executor.send(&mut ExecutorContext::new(), "x").await.unwrap(), 7);
        assert_eq!(*inner.calls.lock(), 3);
    }

    #[tokio::test]
    async fn test_budget_is_capped() {
        let inner = Scripted::new(vec![Err(guard_down()), Err(guard_down()), Ok(7)]);
        let executor = retrying(&inner, 2);
        assert!(executor.send(&mut ExecutorContext::new(), "x").await.is_err());
        assert_eq!(*inner.calls.lock(), 2);
    }

    #[tokio::test]
    async fn test_attached_decision_wins() {
        let fail = guard_down().with_decision(FailureDecision::Fail);
        let inner = Scripted::new(vec![Err(fail), Ok(7)]);
        let executor = retrying(&inner, 5);
        assert!(executor.send(&mut ExecutorContext::new(), "x").await.is_err());
        assert_eq!(*inner.calls.lock(), 1);

        let retry = ApiError::from(OnionError::DestinationError {
            status: ErrorStatus::new(421),
        })
        .with_decision(FailureDecision::Retry);
        let inner = Scripted::new(vec![Err(retry), Ok(7)]);
        let executor = retrying(&inner, 5);
        assert_eq!(executor.send(&mut ExecutorContext::new(), "x").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_destination_errors_fail_by_default() {
        let err = ApiError::from(OnionError::DestinationError {
            status: ErrorStatus::new(500),
        });
        let inner = Scripted::new(vec![Err(err), Ok(7)]);
        let executor = retrying(&inner, 5);
        assert!(executor.send(&mut ExecutorContext::new(), "x").await.is_err());
        assert_eq!(*inner.calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_disable_retry_key() {
        let inner = Scripted::new(vec![Err(guard_down()), Ok(7)]);
        let executor = retrying(&inner, 5);
        let mut ctx = ExecutorContext::new();
        ctx.set::<DisableRetry>(());
        assert!(executor.send(&mut ctx, "x").await.is_err());
        assert_eq!(*inner.calls.lock(), 1);
    }

    #[test]
    fn test_backoff_bounds() {
        let backoff = Backoff::Uniform {
            min_ms: 10,
            max_ms: 20,
        };
        for _ in 0..50 {
            let d = backoff.delay();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
        assert_eq!(Backoff::Fixed { delay_ms: 5 }.delay(), Duration::from_millis(5));
    }
}
