//! Transactional cascades.
//!
//! A cascade is a named sequence of writes executed inside one engine
//! transaction. Each write is a [`Cascade::step`]; the first failing step
//! aborts the whole transaction and its error is returned wrapped in
//! `TransactionAborted` with the step name. Nothing a cascade wrote is ever
//! visible unless every step and the commit succeed.
//!
//! The body receives a borrowed [`Cascade`] and must only capture owned
//! data; bodies are usually `async fn`s taking `&Cascade`. Cache
//! invalidation belongs after [`run_cascade`] returns, never inside a
//! step, so a rolled-back cascade cannot evict live entries.

use crate::engine::{DocumentEngine, Executor, Transaction, TxnOptions};
use fleet_core::{FleetError, FleetResult, StorageError};
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Open transaction handed to a cascade body.
pub struct Cascade {
    name: &'static str,
    txn: Box<dyn Transaction>,
    steps: AtomicUsize,
}

impl Cascade {
    /// Transactional reads for checks that do not count as a step.
    pub fn executor(&self) -> &dyn Executor {
        self.txn.as_executor()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run one named write. A failure is wrapped in `TransactionAborted`,
    /// except a `NotFound` from the first step: a missing root entity is
    /// reported as-is.
    pub async fn step<'c, T, F, Fut>(&'c self, step: &'static str, f: F) -> FleetResult<T>
    where
        F: FnOnce(&'c dyn Executor) -> Fut,
        Fut: Future<Output = FleetResult<T>> + 'c,
    {
        let index = self.steps.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(cascade = self.name, step, index, "Running cascade step");
        match f(self.txn.as_executor()).await {
            Ok(value) => Ok(value),
            Err(e) if index == 0 && e.is_not_found() => Err(e),
            Err(e) => {
                tracing::debug!(cascade = self.name, step, error = %e, "Cascade step failed");
                Err(StorageError::TransactionAborted {
                    step: step.to_string(),
                    source: Box::new(e),
                }
                .into())
            }
        }
    }

    fn steps_run(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Cascade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cascade")
            .field("name", &self.name)
            .field("steps", &self.steps_run())
            .finish_non_exhaustive()
    }
}

/// Run `body` inside a transaction, committing on success.
///
/// On error or timeout the transaction is aborted. A timeout surfaces as
/// `Unavailable`; a failed commit as `TransactionAborted` at step `commit`.
/// Dropping the returned future drops the open transaction, which the
/// engine rolls back.
pub async fn run_cascade<T, F>(
    engine: &dyn DocumentEngine,
    name: &'static str,
    options: TxnOptions,
    timeout: Duration,
    body: F,
) -> FleetResult<T>
where
    F: for<'c> FnOnce(&'c Cascade) -> BoxFuture<'c, FleetResult<T>> + Send,
{
    let txn = engine.begin(options).await?;
    let cascade = Cascade {
        name,
        txn,
        steps: AtomicUsize::new(0),
    };
    tracing::debug!(cascade = name, ?options, "Cascade started");

    let outcome = tokio::time::timeout(timeout, body(&cascade)).await;
    let steps = cascade.steps_run();

    match outcome {
        Ok(Ok(value)) => {
            if let Err(e) = cascade.txn.commit().await {
                tracing::error!(cascade = name, error = %e, "Cascade commit failed");
                return Err(StorageError::TransactionAborted {
                    step: "commit".to_string(),
                    source: Box::new(e.into()),
                }
                .into());
            }
            tracing::info!(cascade = name, steps, "Cascade committed");
            Ok(value)
        }
        Ok(Err(e)) => {
            abort(cascade.txn, name).await;
            tracing::debug!(cascade = name, steps, error = %e, "Cascade rolled back");
            Err(e)
        }
        Err(_) => {
            abort(cascade.txn, name).await;
            tracing::error!(cascade = name, steps, ?timeout, "Cascade timed out");
            Err(FleetError::Storage(StorageError::Unavailable {
                reason: format!("cascade '{}' timed out after {:?}", name, timeout),
            }))
        }
    }
}

async fn abort(txn: Box<dyn Transaction>, name: &'static str) {
    if let Err(e) = txn.abort().await {
        tracing::warn!(cascade = name, error = %e, "Cascade abort failed");
    }
}
