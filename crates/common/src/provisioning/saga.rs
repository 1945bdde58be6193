//! Generic compensating saga runner
//!
//! A saga is an ordered list of steps, each with an optional undo action.
//! Steps run strictly in sequence, each bounded by a timeout. When one fails,
//! the steps that completed are compensated in reverse order. Every
//! compensation is attempted even if an earlier one fails; the failures are
//! collected and returned with the original error.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// A step (or its compensation) exceeded the saga's step timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{step} timed out after {}ms", .after.as_millis())]
pub struct StepTimeout {
    pub step: &'static str,
    pub after: Duration,
}

/// One forward action and its undo
#[async_trait]
pub trait SagaStep<C: Send, E: Send>: Send + Sync {
    /// Stable name used in logs and errors
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut C) -> Result<(), E>;

    /// Undo a completed `execute`. Must tolerate the effect being gone.
    async fn compensate(&self, _ctx: &mut C) -> Result<(), E> {
        Ok(())
    }

    /// Also compensate when this step's own `execute` failed or timed out,
    /// for actions whose effect may have landed before the failure surfaced.
    fn compensate_on_failure(&self) -> bool {
        false
    }
}

/// A rollback action that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationFailure {
    pub step: &'static str,
    pub message: String,
}

impl fmt::Display for CompensationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.message)
    }
}

/// Why a saga run failed
#[derive(Debug)]
pub struct SagaFailure<E> {
    /// Step whose execution failed
    pub step: &'static str,
    pub error: E,
    /// Empty when every rollback succeeded
    pub compensation_failures: Vec<CompensationFailure>,
}

impl<E> SagaFailure<E> {
    /// Whether the rollback left state behind
    pub fn is_compensated(&self) -> bool {
        self.compensation_failures.is_empty()
    }
}

pub struct Saga<C, E> {
    name: &'static str,
    steps: Vec<Box<dyn SagaStep<C, E>>>,
    step_timeout: Duration,
}

impl<C, E> Saga<C, E>
where
    C: Send,
    E: From<StepTimeout> + fmt::Display + Send,
{
    pub fn new(name: &'static str, step_timeout: Duration) -> Self {
        Self {
            name,
            steps: Vec::new(),
            step_timeout,
        }
    }

    /// Append a step
    pub fn step(mut self, step: impl SagaStep<C, E> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Names of the steps, in execution order
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step, compensating on the first failure
    pub async fn run(&self, ctx: &mut C) -> Result<(), SagaFailure<E>> {
        for (index, step) in self.steps.iter().enumerate() {
            debug!(saga = self.name, step = step.name(), "Executing step");

            let result = bounded(step.name(), self.step_timeout, step.execute(ctx)).await;

            if let Err(error) = result {
                warn!(saga = self.name, step = step.name(), error = %error, "Step failed, compensating");

                let undo = if step.compensate_on_failure() { index + 1 } else { index };
                let compensation_failures = self.compensate(ctx, undo).await;

                return Err(SagaFailure {
                    step: step.name(),
                    error,
                    compensation_failures,
                });
            }
        }

        Ok(())
    }

    /// Compensate the first `count` steps in reverse order
    async fn compensate(&self, ctx: &mut C, count: usize) -> Vec<CompensationFailure> {
        let mut failures = Vec::new();

        for step in self.steps[..count].iter().rev() {
            debug!(saga = self.name, step = step.name(), "Compensating step");

            if let Err(e) = bounded(step.name(), self.step_timeout, step.compensate(ctx)).await {
                error!(
                    saga = self.name,
                    step = step.name(),
                    error = %e,
                    manual_intervention_required = true,
                    "Compensation failed"
                );
                failures.push(CompensationFailure {
                    step: step.name(),
                    message: e.to_string(),
                });
            }
        }

        failures
    }
}

async fn bounded<F, E>(step: &'static str, after: Duration, fut: F) -> Result<(), E>
where
    F: Future<Output = Result<(), E>>,
    E: From<StepTimeout>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(StepTimeout { step, after }.into()),
    }
}
