// API executors: typed requests layered over onion transport
//
// Each layer implements `ApiExecutor` and wraps the one below it:
// batch -> retry -> swarm -> snode -> onion rpc.

pub mod batch;
pub mod retry;
pub mod server;
pub mod snode;
pub mod storage;
pub mod swarm;

use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use thiserror::Error;

use crate::onion::{FailureDecision, OnionError, PathError};
use crate::snode::DirectoryError;

pub use batch::{BatchExecutor, Batcher, SnodeBatcher};
pub use retry::{Backoff, RetryExecutor, RetryPolicy};
pub use server::{OnionServerClient, ServerRequest, ServerResponse};
pub use snode::{OnionSnodeRpc, SnodeApiExecutor, SnodeApiRequest, SnodeRequest, SnodeRpc};
pub use swarm::{SwarmApiExecutor, SwarmRequest};

/// Typed key into an `ExecutorContext`
pub trait ContextKey: 'static {
    type Value: Send + Sync + 'static;
}

/// Scratch state for one logical call; survives its retries
#[derive(Default)]
pub struct ExecutorContext {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ExecutorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<K: ContextKey>(&self) -> Option<&K::Value> {
        self.values
            .get(&TypeId::of::<K>())
            .and_then(|v| v.downcast_ref::<K::Value>())
    }

    pub fn set<K: ContextKey>(&mut self, value: K::Value) {
        self.values.insert(TypeId::of::<K>(), Box::new(value));
    }

    pub fn remove<K: ContextKey>(&mut self) -> Option<K::Value> {
        self.values
            .remove(&TypeId::of::<K>())
            .and_then(|v| v.downcast::<K::Value>().ok())
            .map(|v| *v)
    }

    pub fn contains<K: ContextKey>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<K>())
    }
}

impl std::fmt::Debug for ExecutorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorContext")
            .field("entries", &self.values.len())
            .finish()
    }
}

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error(transparent)]
    Onion(#[from] OnionError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("Unhandled status {code}")]
    UnhandledStatus { code: u16, body: Option<String> },
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Batch failed: {0}")]
    Batch(String),
    #[error("{cause}")]
    WithDecision {
        cause: Box<ApiError>,
        decision: FailureDecision,
    },
}

impl ApiError {
    /// Attach (or replace) a retry decision
    pub fn with_decision(self, decision: FailureDecision) -> Self {
        match self {
            ApiError::WithDecision { cause, .. } => ApiError::WithDecision { cause, decision },
            other => ApiError::WithDecision {
                cause: Box::new(other),
                decision,
            },
        }
    }

    pub fn decision(&self) -> Option<FailureDecision> {
        match self {
            ApiError::WithDecision { decision, .. } => Some(*decision),
            _ => None,
        }
    }

    /// The error without any decision wrapper
    pub fn cause(&self) -> &ApiError {
        match self {
            ApiError::WithDecision { cause, .. } => cause.cause(),
            other => other,
        }
    }

    pub fn onion(&self) -> Option<&OnionError> {
        match self.cause() {
            ApiError::Onion(e) => Some(e),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self.cause() {
            ApiError::Onion(e) => e.status_code(),
            ApiError::UnhandledStatus { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// One layer of the request pipeline
#[async_trait]
pub trait ApiExecutor<Req, Res>: Send + Sync {
    async fn send(&self, ctx: &mut ExecutorContext, req: Req) -> Result<Res, ApiError>;
}
