//! Step DAG declaration and sequential execution with retry.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::events::EventOccurrence;

/// Default number of attempts per step. Remote calls occasionally observe
/// transient 5xx during control plane leader failover; real failures persist
/// across attempts.
pub const DEFAULT_RETRY_ATTEMPTS: usize = 3;

/// Fixed pause between attempts of a failed step.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(3);

type StepFuture = BoxFuture<'static, anyhow::Result<()>>;

/// One unit of work in a workflow.
pub struct Step {
    name: String,
    depends_on: Vec<String>,
    action: Arc<dyn Fn(CancellationToken) -> StepFuture + Send + Sync>,
    expected_events: Option<Arc<dyn Fn() -> Vec<EventOccurrence> + Send + Sync>>,
    done: bool,
}

impl Step {
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(CancellationToken) -> StepFuture + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            action: Arc::new(action),
            expected_events: None,
            done: false,
        }
    }

    /// Require the named steps to complete before this one runs.
    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.depends_on = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Attach a provider for the state-change events this step is expected
    /// to cause. Providers are invoked after the workflow has run, once the
    /// resource IDs they anchor on are known.
    pub fn expected_events<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Vec<EventOccurrence> + Send + Sync + 'static,
    {
        self.expected_events = Some(Arc::new(provider));
        self
    }

    /// Mark the step as already complete so execution skips it. Used to
    /// resume a workflow against resources that already exist.
    pub fn already_done(mut self) -> Self {
        self.done = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Construction or execution failure of a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("duplicate step name {0:?}")]
    DuplicateStep(String),

    #[error("step {step:?} depends on unknown step {dependency:?}")]
    UnknownDependency { step: String, dependency: String },

    #[error("cyclic step graph: {step:?} depends on {dependency:?} which is already on the path")]
    Cycle { step: String, dependency: String },

    // anyhow::Error is not a std Error, so it rides along as a display
    // field rather than a source.
    #[error("step {step:?} failed after {attempts} attempt(s): {error:#}")]
    StepFailed {
        step: String,
        attempts: usize,
        error: anyhow::Error,
    },
}

/// A named set of steps executed sequentially in dependency order.
pub struct Workflow {
    name: String,
    steps: Vec<Step>,
    retry_attempts: usize,
    retry_backoff: Duration,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White,
    Grey,
    Black,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff: RETRY_BACKOFF,
        }
    }

    /// Override the per-step attempt budget. `1` disables retry.
    pub fn with_retry_attempts(mut self, attempts: usize) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    #[cfg(test)]
    fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_step(&mut self, step: Step) -> Result<(), WorkflowError> {
        if self.steps.iter().any(|s| s.name == step.name) {
            return Err(WorkflowError::DuplicateStep(step.name));
        }
        self.steps.push(step);
        Ok(())
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Topological execution order over step indices, iterating the steps in
    /// insertion order. Unknown dependencies and cycles are construction
    /// errors, detected by grey/black marking rather than left to recursion.
    fn execution_order(&self) -> Result<Vec<usize>, WorkflowError> {
        let mut marks = vec![Mark::White; self.steps.len()];
        let mut order = Vec::with_capacity(self.steps.len());
        for index in 0..self.steps.len() {
            self.visit(index, &mut marks, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        index: usize,
        marks: &mut [Mark],
        order: &mut Vec<usize>,
    ) -> Result<(), WorkflowError> {
        if marks[index] == Mark::Black {
            return Ok(());
        }
        marks[index] = Mark::Grey;

        for dependency in &self.steps[index].depends_on {
            let dep_index =
                self.index_of(dependency)
                    .ok_or_else(|| WorkflowError::UnknownDependency {
                        step: self.steps[index].name.clone(),
                        dependency: dependency.clone(),
                    })?;
            match marks[dep_index] {
                Mark::Grey => {
                    return Err(WorkflowError::Cycle {
                        step: self.steps[index].name.clone(),
                        dependency: dependency.clone(),
                    });
                }
                Mark::White => self.visit(dep_index, marks, order)?,
                Mark::Black => {}
            }
        }

        marks[index] = Mark::Black;
        order.push(index);
        Ok(())
    }

    /// Run every step in dependency order. Steps already marked done are
    /// skipped; a failing step is retried up to the attempt budget with a
    /// fixed backoff, and exhausting the budget aborts the workflow.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), WorkflowError> {
        let order = self.execution_order()?;

        for index in order {
            let name = self.steps[index].name.clone();
            if self.steps[index].done {
                tracing::info!(workflow = %self.name, step = %name, "step already done, skipping");
                continue;
            }

            tracing::info!(workflow = %self.name, step = %name, "running step");
            let action = Arc::clone(&self.steps[index].action);
            let mut attempt = 1;
            loop {
                match action(cancel.clone()).await {
                    Ok(()) => {
                        self.steps[index].done = true;
                        tracing::info!(workflow = %self.name, step = %name, "step finished");
                        break;
                    }
                    Err(err) if attempt < self.retry_attempts => {
                        tracing::error!(
                            workflow = %self.name,
                            step = %name,
                            attempt,
                            error = %format!("{err:#}"),
                            "step failed, retrying"
                        );
                        attempt += 1;
                        tokio::time::sleep(self.retry_backoff).await;
                    }
                    Err(err) => {
                        return Err(WorkflowError::StepFailed {
                            step: name,
                            attempts: attempt,
                            error: err,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Concatenation of every step's expected events in execution order.
    /// Call after [`Workflow::run`]: providers read resource IDs recorded by
    /// the steps themselves.
    pub fn expected_events(&self) -> Result<Vec<EventOccurrence>, WorkflowError> {
        let mut events = Vec::new();
        for index in self.execution_order()? {
            if let Some(provider) = &self.steps[index].expected_events {
                events.extend(provider());
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use skiff_client::models::ResourceType;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_step(name: &str) -> Step {
        Step::new(name, |_| async { Ok(()) }.boxed())
    }

    fn tracing_step(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Step {
        let log = Arc::clone(log);
        let step_name = name.to_string();
        Step::new(name, move |_| {
            let log = Arc::clone(&log);
            let step_name = step_name.clone();
            async move {
                log.lock().unwrap().push(step_name);
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn empty_workflow_succeeds() {
        let mut workflow = Workflow::new("empty");
        workflow.run(CancellationToken::new()).await.unwrap();
        assert!(workflow.expected_events().unwrap().is_empty());
    }

    #[tokio::test]
    async fn runs_dependencies_before_dependents() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut workflow = Workflow::new("linear");
        // Insert out of dependency order on purpose.
        workflow
            .add_step(tracing_step("c", &log).depends_on(&["b"]))
            .unwrap();
        workflow
            .add_step(tracing_step("b", &log).depends_on(&["a"]))
            .unwrap();
        workflow.add_step(tracing_step("a", &log)).unwrap();

        workflow.run(CancellationToken::new()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(workflow.steps.iter().all(Step::is_done));
    }

    #[tokio::test]
    async fn unknown_dependency_names_both_steps() {
        let mut workflow = Workflow::new("broken");
        workflow.add_step(noop_step("a").depends_on(&["z"])).unwrap();

        let err = workflow.run(CancellationToken::new()).await.unwrap_err();
        match err {
            WorkflowError::UnknownDependency { step, dependency } => {
                assert_eq!(step, "a");
                assert_eq!(dependency, "z");
            }
            other => panic!("expected unknown dependency, got {other}"),
        }
    }

    #[tokio::test]
    async fn cycle_is_detected() {
        let mut workflow = Workflow::new("cyclic");
        workflow.add_step(noop_step("a").depends_on(&["b"])).unwrap();
        workflow.add_step(noop_step("b").depends_on(&["a"])).unwrap();

        let err = workflow.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Cycle { .. }), "got {err}");
    }

    #[tokio::test]
    async fn duplicate_step_is_rejected() {
        let mut workflow = Workflow::new("dup");
        workflow.add_step(noop_step("a")).unwrap();
        let err = workflow.add_step(noop_step("a")).unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateStep(name) if name == "a"));
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut workflow =
            Workflow::new("flaky").with_retry_backoff(Duration::from_millis(1));
        let counter = Arc::clone(&calls);
        workflow
            .add_step(Step::new("flaky", move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        anyhow::bail!("transient");
                    }
                    Ok(())
                }
                .boxed()
            }))
            .unwrap();

        workflow.run(CancellationToken::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_failure_exhausts_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut workflow =
            Workflow::new("doomed").with_retry_backoff(Duration::from_millis(1));
        let counter = Arc::clone(&calls);
        workflow
            .add_step(Step::new("doomed", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { anyhow::bail!("always") }.boxed()
            }))
            .unwrap();

        let err = workflow.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), DEFAULT_RETRY_ATTEMPTS);
        match err {
            WorkflowError::StepFailed { step, attempts, .. } => {
                assert_eq!(step, "doomed");
                assert_eq!(attempts, DEFAULT_RETRY_ATTEMPTS);
            }
            other => panic!("expected step failure, got {other}"),
        }
    }

    #[tokio::test]
    async fn single_attempt_budget_disables_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut workflow = Workflow::new("once").with_retry_attempts(1);
        let counter = Arc::clone(&calls);
        workflow
            .add_step(Step::new("once", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { anyhow::bail!("nope") }.boxed()
            }))
            .unwrap();

        workflow.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn done_steps_are_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut workflow = Workflow::new("resume");
        let counter = Arc::clone(&calls);
        workflow
            .add_step(
                Step::new("existing", move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }.boxed()
                })
                .already_done(),
            )
            .unwrap();

        workflow.run(CancellationToken::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expected_events_follow_execution_order() {
        let mut workflow = Workflow::new("events");
        workflow
            .add_step(noop_step("second").depends_on(&["first"]).expected_events(|| {
                vec![EventOccurrence::new(ResourceType::Cluster, "c1", "a", "b")]
            }))
            .unwrap();
        workflow
            .add_step(noop_step("first").expected_events(|| {
                vec![EventOccurrence::new(ResourceType::Cluster, "c1", "n/a", "a")]
            }))
            .unwrap();

        workflow.run(CancellationToken::new()).await.unwrap();
        let events = workflow.expected_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].new_state, "a");
        assert_eq!(events[1].new_state, "b");
    }
}
