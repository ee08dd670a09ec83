//! Mock step executors and state fixtures shared by Switchyard tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Notify;

use switchyard_core::error::StepError;
use switchyard_core::traits::{StepBundle, StepContext, StepExecutor};
use switchyard_core::types::WorkflowState;

type StepFn = dyn Fn(StepBundle, &Value) -> Result<StepBundle, StepError> + Send + Sync;

/// A step backed by a synchronous closure.
pub struct FnStep {
    step_type: String,
    f: Box<StepFn>,
}

impl FnStep {
    pub fn new<F>(step_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepBundle, &Value) -> Result<StepBundle, StepError> + Send + Sync + 'static,
    {
        Self {
            step_type: step_type.into(),
            f: Box::new(f),
        }
    }
}

impl StepExecutor for FnStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    fn execute<'a>(
        &'a self,
        inputs: StepBundle,
        config: &'a Value,
        _ctx: StepContext,
    ) -> BoxFuture<'a, Result<StepBundle, StepError>> {
        Box::pin(async move { (self.f)(inputs, config) })
    }
}

/// Records every input bundle it receives and returns fixed outputs.
#[derive(Clone)]
pub struct RecordingStep {
    step_type: String,
    outputs: StepBundle,
    calls: Arc<Mutex<Vec<StepBundle>>>,
}

impl RecordingStep {
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            outputs: StepBundle::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_output(mut self, name: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(name.into(), value);
        self
    }

    /// Input bundles seen so far, in call order.
    pub fn calls(&self) -> Vec<StepBundle> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl StepExecutor for RecordingStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    fn execute<'a>(
        &'a self,
        inputs: StepBundle,
        _config: &'a Value,
        _ctx: StepContext,
    ) -> BoxFuture<'a, Result<StepBundle, StepError>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(inputs);
            Ok(self.outputs.clone())
        })
    }
}

/// Always fails with the given message.
pub struct FailingStep {
    step_type: String,
    message: String,
    calls: AtomicUsize,
}

impl FailingStep {
    pub fn new(step_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            message: message.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StepExecutor for FailingStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    fn execute<'a>(
        &'a self,
        _inputs: StepBundle,
        _config: &'a Value,
        _ctx: StepContext,
    ) -> BoxFuture<'a, Result<StepBundle, StepError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StepError::transient(self.message.clone()))
        })
    }
}

/// Blocks until opened, then passes its inputs through as outputs.
///
/// Clones share the same gate.
#[derive(Clone)]
pub struct GateStep {
    step_type: String,
    gate: Arc<Notify>,
    entered: Arc<AtomicUsize>,
}

impl GateStep {
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            gate: Arc::new(Notify::new()),
            entered: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Release every waiting invocation.
    pub fn open(&self) {
        self.gate.notify_waiters();
    }

    /// Number of invocations that reached the gate.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` invocations reached the gate.
    pub async fn wait_for_entries(&self, n: usize) {
        while self.entered() < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

impl StepExecutor for GateStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    fn execute<'a>(
        &'a self,
        inputs: StepBundle,
        _config: &'a Value,
        _ctx: StepContext,
    ) -> BoxFuture<'a, Result<StepBundle, StepError>> {
        Box::pin(async move {
            let opened = self.gate.notified();
            tokio::pin!(opened);
            // register interest before announcing entry so open() cannot be missed
            opened.as_mut().enable();
            self.entered.fetch_add(1, Ordering::SeqCst);
            opened.await;
            Ok(inputs)
        })
    }
}

/// Sleeps before passing its inputs through.
pub struct SlowStep {
    step_type: String,
    delay: Duration,
}

impl SlowStep {
    pub fn new(step_type: impl Into<String>, delay: Duration) -> Self {
        Self {
            step_type: step_type.into(),
            delay,
        }
    }
}

impl StepExecutor for SlowStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    fn execute<'a>(
        &'a self,
        inputs: StepBundle,
        _config: &'a Value,
        _ctx: StepContext,
    ) -> BoxFuture<'a, Result<StepBundle, StepError>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(inputs)
        })
    }
}

/// Poll `check` until it holds, for up to five seconds.
///
/// For conditions settled by spawned invocations after the driver has its
/// answer, such as a workflow's layer being released.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Build a workflow state from a JSON object literal.
pub fn state(correlation_id: &str, data: Value) -> WorkflowState {
    WorkflowState::from_value(correlation_id, data).expect("fixture state must be an object")
}

/// A single-entry step bundle.
pub fn bundle(name: &str, value: Value) -> StepBundle {
    let mut b = StepBundle::new();
    b.insert(name.to_string(), value);
    b
}
