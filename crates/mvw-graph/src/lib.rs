//! Dependency-ordered task graph engine with per-step retry and fail-fast
//! skip propagation.
//!
//! A pipeline is a DAG of named [`Step`]s. The engine executes each step at
//! most once per run, in a deterministic topological order, passing small
//! result state between steps through a write-once [`RunContext`]. A failed
//! step transitively skips everything downstream of it; transient failures
//! are retried per the step's [`RetryPolicy`] before escalating.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mvw-graph";

/// Write-once key/value store scoped to a single pipeline run.
///
/// Steps write small results (paths, counts, messages) for downstream steps
/// to read. A key can be written exactly once per run; overwrites indicate a
/// step stomping on another step's namespace and are rejected.
#[derive(Debug, Default)]
pub struct RunContext {
    values: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("context key {0:?} was already written by an earlier step")]
    DuplicateKey(String),
    #[error("context key {0:?} was never written; an upstream step broke its contract")]
    MissingKey(String),
    #[error("context key {0:?} holds a value of an unexpected type")]
    WrongType(String),
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<JsonValue>) -> Result<(), ContextError> {
        if self.values.contains_key(key) {
            return Err(ContextError::DuplicateKey(key.to_string()));
        }
        self.values.insert(key.to_string(), value.into());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<&JsonValue, ContextError> {
        self.values
            .get(key)
            .ok_or_else(|| ContextError::MissingKey(key.to_string()))
    }

    pub fn get_str(&self, key: &str) -> Result<&str, ContextError> {
        self.get(key)?
            .as_str()
            .ok_or_else(|| ContextError::WrongType(key.to_string()))
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, ContextError> {
        self.get(key)?
            .as_i64()
            .ok_or_else(|| ContextError::WrongType(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

/// Failure taxonomy a step action reports to the engine.
///
/// Only [`StepError::Transient`] is ever retried. Fatal inputs and quality
/// violations have root causes a retry cannot fix.
#[derive(Debug, Error)]
pub enum StepError {
    /// Missing input or broken precondition (including referential
    /// violations); never retried.
    #[error("fatal: {0}")]
    Fatal(anyhow::Error),
    /// Infrastructure hiccup (connection drop, timeout); retried up to the
    /// step's attempt limit.
    #[error("transient: {0}")]
    Transient(anyhow::Error),
    /// A data-quality predicate evaluated false; the data is wrong, not the
    /// infrastructure.
    #[error("quality violation: {0}")]
    Quality(String),
}

impl StepError {
    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ContextError> for StepError {
    fn from(err: ContextError) -> Self {
        // A context contract violation is a design bug in the graph shape,
        // not a recoverable condition.
        Self::Fatal(err.into())
    }
}

/// Exponential, capped retry schedule for transient step failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retries. The right policy for validation and
    /// report steps, where a failure is a logic or data problem.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Retry transient failures with exponential backoff.
    pub fn transient(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// A unit of work executed by the engine.
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn run(&self, ctx: &mut RunContext) -> Result<(), StepError>;
}

/// Named step with declared upstream dependencies and a retry policy.
/// Immutable once the graph starts running.
pub struct Step {
    name: String,
    depends_on: Vec<String>,
    retry: RetryPolicy,
    action: Box<dyn StepAction>,
}

impl Step {
    pub fn new(name: impl Into<String>, action: impl StepAction + 'static) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            retry: RetryPolicy::none(),
            action: Box::new(action),
        }
    }

    /// Declare an upstream dependency by step name.
    pub fn after(mut self, upstream: impl Into<String>) -> Self {
        self.depends_on.push(upstream.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("step {0:?} is declared more than once")]
    DuplicateStep(String),
    #[error("step {step:?} depends on unknown step {upstream:?}")]
    UnknownDependency { step: String, upstream: String },
    #[error("dependency cycle involving step {0:?}")]
    Cycle(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Immutable record of one step's execution within a run.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub step: String,
    pub attempts: u32,
    pub status: StepStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Terminal record of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub outcomes: Vec<StepOutcome>,
}

impl PipelineRun {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// The first terminal step error, surfaced to the operator.
    pub fn first_error(&self) -> Option<&str> {
        self.outcomes
            .iter()
            .find(|o| o.status == StepStatus::Failed)
            .and_then(|o| o.error.as_deref())
    }

    pub fn outcome(&self, step: &str) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| o.step == step)
    }
}

/// Ordered set of steps plus the execution loop.
///
/// The engine validates the graph shape (duplicates, unknown dependencies,
/// cycles) before running anything, then executes steps one at a time in a
/// deterministic topological order. Independent steps are ordered by
/// insertion; fan-out/fan-in shapes are supported even though a linear chain
/// degenerates to plain sequential execution.
#[derive(Default)]
pub struct TaskGraph {
    steps: Vec<Step>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_step(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.add_step(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Kahn's algorithm, scanning ready steps in insertion order so the
    /// schedule is stable across runs.
    fn execution_order(&self) -> Result<Vec<usize>, GraphError> {
        let mut index_of = BTreeMap::new();
        for (idx, step) in self.steps.iter().enumerate() {
            if index_of.insert(step.name.as_str(), idx).is_some() {
                return Err(GraphError::DuplicateStep(step.name.clone()));
            }
        }

        let mut remaining_deps: Vec<usize> = vec![0; self.steps.len()];
        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (idx, step) in self.steps.iter().enumerate() {
            for upstream in &step.depends_on {
                let Some(&up_idx) = index_of.get(upstream.as_str()) else {
                    return Err(GraphError::UnknownDependency {
                        step: step.name.clone(),
                        upstream: upstream.clone(),
                    });
                };
                remaining_deps[idx] += 1;
                downstream[up_idx].push(idx);
            }
        }

        let mut order = Vec::with_capacity(self.steps.len());
        let mut scheduled = vec![false; self.steps.len()];
        while order.len() < self.steps.len() {
            let Some(next) = (0..self.steps.len())
                .find(|&idx| !scheduled[idx] && remaining_deps[idx] == 0)
            else {
                let stuck = self
                    .steps
                    .iter()
                    .enumerate()
                    .find(|(idx, _)| !scheduled[*idx])
                    .map(|(_, s)| s.name.clone())
                    .unwrap_or_default();
                return Err(GraphError::Cycle(stuck));
            };
            scheduled[next] = true;
            order.push(next);
            for &down in &downstream[next] {
                remaining_deps[down] -= 1;
            }
        }
        Ok(order)
    }

    pub async fn run(&self) -> Result<PipelineRun, GraphError> {
        let mut ctx = RunContext::new();
        self.run_with_context(&mut ctx).await
    }

    /// Execute all steps against a caller-owned context. The context is
    /// mutated only by step actions, one at a time.
    pub async fn run_with_context(&self, ctx: &mut RunContext) -> Result<PipelineRun, GraphError> {
        let order = self.execution_order()?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let mut status_by_index: Vec<Option<StepStatus>> = vec![None; self.steps.len()];
        let index_of: BTreeMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(idx, s)| (s.name.as_str(), idx))
            .collect();
        let mut outcomes = Vec::with_capacity(self.steps.len());

        for idx in order {
            let step = &self.steps[idx];
            let upstream_ok = step.depends_on.iter().all(|upstream| {
                index_of
                    .get(upstream.as_str())
                    .and_then(|&up_idx| status_by_index[up_idx])
                    == Some(StepStatus::Succeeded)
            });
            if !upstream_ok {
                warn!(%run_id, step = step.name.as_str(), "skipping step; upstream did not succeed");
                status_by_index[idx] = Some(StepStatus::Skipped);
                outcomes.push(StepOutcome {
                    step: step.name.clone(),
                    attempts: 0,
                    status: StepStatus::Skipped,
                    error: None,
                });
                continue;
            }

            let (status, attempts, error) = self.run_step(run_id, step, ctx).await;
            status_by_index[idx] = Some(status);
            outcomes.push(StepOutcome {
                step: step.name.clone(),
                attempts,
                status,
                error,
            });
        }

        let status = if outcomes.iter().all(|o| o.status == StepStatus::Succeeded) {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        Ok(PipelineRun {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status,
            outcomes,
        })
    }

    async fn run_step(
        &self,
        run_id: Uuid,
        step: &Step,
        ctx: &mut RunContext,
    ) -> (StepStatus, u32, Option<String>) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let span = info_span!("step", %run_id, step = step.name.as_str(), attempt = attempts);
            match step.action.run(ctx).instrument(span).await {
                Ok(()) => return (StepStatus::Succeeded, attempts, None),
                Err(err) if err.is_transient() && attempts < step.retry.max_attempts => {
                    let delay = step.retry.delay_for_attempt(attempts - 1);
                    warn!(
                        %run_id,
                        step = step.name.as_str(),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient step failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return (StepStatus::Failed, attempts, Some(err.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    struct Record {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl StepAction for Record {
        async fn run(&self, _ctx: &mut RunContext) -> Result<(), StepError> {
            self.log.lock().unwrap().push(self.label);
            Ok(())
        }
    }

    struct AlwaysFail(StepErrorKind);

    enum StepErrorKind {
        Fatal,
        Transient,
        Quality,
    }

    #[async_trait]
    impl StepAction for AlwaysFail {
        async fn run(&self, _ctx: &mut RunContext) -> Result<(), StepError> {
            Err(match self.0 {
                StepErrorKind::Fatal => StepError::fatal(anyhow::anyhow!("boom")),
                StepErrorKind::Transient => StepError::transient(anyhow::anyhow!("flaky")),
                StepErrorKind::Quality => StepError::Quality("predicate false".into()),
            })
        }
    }

    struct FailsThenSucceeds {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl StepAction for FailsThenSucceeds {
        async fn run(&self, _ctx: &mut RunContext) -> Result<(), StepError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StepError::transient(anyhow::anyhow!("connection dropped")));
            }
            Ok(())
        }
    }

    struct WriteKey {
        key: &'static str,
        value: i64,
    }

    #[async_trait]
    impl StepAction for WriteKey {
        async fn run(&self, ctx: &mut RunContext) -> Result<(), StepError> {
            ctx.set(self.key, self.value)?;
            Ok(())
        }
    }

    struct ReadKey {
        key: &'static str,
    }

    #[async_trait]
    impl StepAction for ReadKey {
        async fn run(&self, ctx: &mut RunContext) -> Result<(), StepError> {
            ctx.get_i64(self.key)?;
            Ok(())
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::transient(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn linear_chain_runs_in_declared_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = TaskGraph::new()
            .with_step(Step::new("c", Record { label: "c", log: log.clone() }).after("b"))
            .with_step(Step::new("a", Record { label: "a", log: log.clone() }))
            .with_step(Step::new("b", Record { label: "b", log: log.clone() }).after("a"));

        let run = graph.run().await.unwrap();
        assert!(run.succeeded());
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn fan_in_runs_after_all_upstreams() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = TaskGraph::new()
            .with_step(Step::new("merge", Record { label: "merge", log: log.clone() }).after("left").after("right"))
            .with_step(Step::new("left", Record { label: "left", log: log.clone() }))
            .with_step(Step::new("right", Record { label: "right", log: log.clone() }));

        let run = graph.run().await.unwrap();
        assert!(run.succeeded());
        let order = log.lock().unwrap().clone();
        assert_eq!(order.last(), Some(&"merge"));
        assert_eq!(order.len(), 3);
    }

    #[tokio::test]
    async fn failure_skips_downstream_transitively() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = TaskGraph::new()
            .with_step(Step::new("load", AlwaysFail(StepErrorKind::Fatal)))
            .with_step(Step::new("transform", Record { label: "transform", log: log.clone() }).after("load"))
            .with_step(Step::new("report", Record { label: "report", log: log.clone() }).after("transform"));

        let run = graph.run().await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.outcome("load").unwrap().status, StepStatus::Failed);
        assert_eq!(run.outcome("transform").unwrap().status, StepStatus::Skipped);
        assert_eq!(run.outcome("report").unwrap().status, StepStatus::Skipped);
        assert!(log.lock().unwrap().is_empty());
        assert!(run.first_error().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let graph = TaskGraph::new().with_step(
            Step::new(
                "flaky",
                FailsThenSucceeds { failures_left: AtomicU32::new(2) },
            )
            .with_retry(fast_retry(3)),
        );

        let run = graph.run().await.unwrap();
        assert!(run.succeeded());
        assert_eq!(run.outcome("flaky").unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn exhausted_retries_become_a_terminal_failure() {
        let graph = TaskGraph::new()
            .with_step(Step::new("flaky", AlwaysFail(StepErrorKind::Transient)).with_retry(fast_retry(3)));

        let run = graph.run().await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let outcome = run.outcome("flaky").unwrap();
        assert_eq!(outcome.status, StepStatus::Failed);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_never_retried() {
        let graph = TaskGraph::new()
            .with_step(Step::new("doomed", AlwaysFail(StepErrorKind::Fatal)).with_retry(fast_retry(5)));

        let run = graph.run().await.unwrap();
        assert_eq!(run.outcome("doomed").unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn quality_violations_are_never_retried() {
        let graph = TaskGraph::new()
            .with_step(Step::new("gate", AlwaysFail(StepErrorKind::Quality)).with_retry(fast_retry(5)));

        let run = graph.run().await.unwrap();
        let outcome = run.outcome("gate").unwrap();
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.error.as_deref().unwrap().contains("quality violation"));
    }

    #[tokio::test]
    async fn context_flows_between_steps() {
        let graph = TaskGraph::new()
            .with_step(Step::new("write", WriteKey { key: "rows", value: 42 }))
            .with_step(Step::new("read", ReadKey { key: "rows" }).after("write"));

        let run = graph.run().await.unwrap();
        assert!(run.succeeded());
    }

    #[tokio::test]
    async fn missing_context_key_is_a_fatal_step_failure() {
        let graph = TaskGraph::new()
            .with_step(Step::new("read", ReadKey { key: "never-written" }).with_retry(fast_retry(4)));

        let run = graph.run().await.unwrap();
        let outcome = run.outcome("read").unwrap();
        assert_eq!(outcome.status, StepStatus::Failed);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.error.as_deref().unwrap().contains("never-written"));
    }

    #[tokio::test]
    async fn duplicate_context_writes_fail_the_second_writer() {
        let graph = TaskGraph::new()
            .with_step(Step::new("first", WriteKey { key: "rows", value: 1 }))
            .with_step(Step::new("second", WriteKey { key: "rows", value: 2 }).after("first"));

        let run = graph.run().await.unwrap();
        assert_eq!(run.outcome("first").unwrap().status, StepStatus::Succeeded);
        assert_eq!(run.outcome("second").unwrap().status, StepStatus::Failed);
    }

    #[test]
    fn context_typed_accessors_reject_wrong_types() {
        let mut ctx = RunContext::new();
        ctx.set("path", "/tmp/data.csv").unwrap();
        assert_eq!(ctx.get_str("path").unwrap(), "/tmp/data.csv");
        assert_eq!(
            ctx.get_i64("path"),
            Err(ContextError::WrongType("path".into()))
        );
        assert_eq!(
            ctx.get("absent"),
            Err(ContextError::MissingKey("absent".into()))
        );
    }

    #[tokio::test]
    async fn duplicate_step_names_are_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = TaskGraph::new()
            .with_step(Step::new("a", Record { label: "a", log: log.clone() }))
            .with_step(Step::new("a", Record { label: "a", log: log.clone() }));

        assert_eq!(graph.run().await.unwrap_err(), GraphError::DuplicateStep("a".into()));
    }

    #[tokio::test]
    async fn unknown_dependencies_are_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = TaskGraph::new()
            .with_step(Step::new("a", Record { label: "a", log }).after("ghost"));

        assert_eq!(
            graph.run().await.unwrap_err(),
            GraphError::UnknownDependency { step: "a".into(), upstream: "ghost".into() }
        );
    }

    #[tokio::test]
    async fn cycles_are_rejected_before_any_step_runs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = TaskGraph::new()
            .with_step(Step::new("a", Record { label: "a", log: log.clone() }).after("b"))
            .with_step(Step::new("b", Record { label: "b", log: log.clone() }).after("a"));

        assert!(matches!(graph.run().await.unwrap_err(), GraphError::Cycle(_)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn retry_delay_is_exponential_and_capped() {
        let policy = RetryPolicy::transient(
            5,
            Duration::from_millis(100),
            Duration::from_millis(350),
        );
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
