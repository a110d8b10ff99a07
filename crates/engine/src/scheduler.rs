//! Task boundary every step execution passes through.
//!
//! The engine never spawns threads. Each step body is handed to a
//! [`TaskScheduler`] together with a [`TaskDescriptor`], letting an embedding
//! host add retries, tracing spans, or its own execution policy uniformly for
//! all step types.

use tracing::warn;

use crate::context::ExecutionContext;
use crate::error::{ErrorKind, FlowExecutionError};

/// Upper bound for [`RetryingScheduler`] attempts.
const MAX_ATTEMPTS: u32 = 10;

/// Whether a step may be run again after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Branching and sub-flow calls must not be replayed.
    Never,
    Allowed,
}

impl RetryPolicy {
    pub fn for_step_type(step_type: &str) -> Self {
        match step_type {
            "conditional_branch" | "flow_call" => RetryPolicy::Never,
            _ => RetryPolicy::Allowed,
        }
    }
}

/// Identity of one step execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub flow_id: String,
    pub step_id: String,
    pub step_type: String,
    /// Sub-flow nesting depth; the top-level flow runs at zero.
    pub depth: usize,
    pub retry: RetryPolicy,
}

/// Body of one step: produces the step's resulting context.
pub type StepBody<'b> = dyn FnMut() -> Result<ExecutionContext, FlowExecutionError> + 'b;

/// Runs step bodies.
pub trait TaskScheduler: Send + Sync {
    fn run_step(&self, task: &TaskDescriptor, body: &mut StepBody<'_>) -> Result<ExecutionContext, FlowExecutionError>;
}

/// Runs every body exactly once on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineScheduler;

impl TaskScheduler for InlineScheduler {
    fn run_step(&self, _task: &TaskDescriptor, body: &mut StepBody<'_>) -> Result<ExecutionContext, FlowExecutionError> {
        body()
    }
}

/// Re-runs retryable steps whose collaborator failed.
///
/// Only [`ErrorKind::Collaborator`] failures of [`RetryPolicy::Allowed`]
/// tasks are retried; every other error is returned immediately. A step's
/// `pre_actions` run once before the first attempt, while the step body and
/// the actions it nests are replayed on every attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryingScheduler {
    max_attempts: u32,
}

impl RetryingScheduler {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl TaskScheduler for RetryingScheduler {
    fn run_step(&self, task: &TaskDescriptor, body: &mut StepBody<'_>) -> Result<ExecutionContext, FlowExecutionError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match body() {
                Ok(context) => return Ok(context),
                Err(error)
                    if task.retry == RetryPolicy::Allowed && error.kind == ErrorKind::Collaborator && attempts < self.max_attempts =>
                {
                    warn!(
                        flow_id = %task.flow_id,
                        step_id = %task.step_id,
                        attempts,
                        error = %error,
                        "step attempt failed; retrying"
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }
}
