//! Mock implementations of handler and notifier traits

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use taskpilot_core::{
    models::{SafetyRefusal, TaskId},
    traits::{CallbackNotifier, CallbackPayload, HandlerContext, HandlerOutcome, TaskHandler},
    SchedulerError, SchedulerResult,
};

/// One scripted handler response
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(Value),
    Fail(String),
    Refuse(SafetyRefusal),
    Sleep(Duration, Value),
}

/// Handler that replays a script of responses, repeating the last one when exhausted
pub struct ScriptedHandler {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    calls: AtomicU32,
    executed: Arc<Mutex<Vec<TaskId>>>,
}

impl ScriptedHandler {
    pub fn new(name: &str, steps: Vec<Step>) -> Self {
        Self {
            name: name.to_string(),
            steps: Mutex::new(steps.into()),
            last: Mutex::new(None),
            calls: AtomicU32::new(0),
            executed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeeding(name: &str, value: Value) -> Self {
        Self::new(name, vec![Step::Succeed(value)])
    }

    pub fn failing(name: &str, message: &str) -> Self {
        Self::new(name, vec![Step::Fail(message.to_string())])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Task ids in the order they were executed
    pub fn executed_ids(&self) -> Vec<TaskId> {
        self.executed.lock().unwrap().clone()
    }

    fn next_step(&self) -> Step {
        let mut steps = self.steps.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        match steps.pop_front() {
            Some(step) => {
                *last = Some(step.clone());
                step
            }
            None => last
                .clone()
                .unwrap_or_else(|| Step::Succeed(Value::Null)),
        }
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    async fn execute(&self, context: &HandlerContext) -> SchedulerResult<HandlerOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().unwrap().push(context.task.id.clone());

        match self.next_step() {
            Step::Succeed(value) => Ok(HandlerOutcome::Completed(value)),
            Step::Fail(message) => Err(SchedulerError::HandlerFailure(message)),
            Step::Refuse(refusal) => Ok(HandlerOutcome::Refused(refusal)),
            Step::Sleep(duration, value) => {
                tokio::time::sleep(duration).await;
                Ok(HandlerOutcome::Completed(value))
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Handler that sleeps for a fixed time before succeeding
pub struct SleepingHandler {
    duration: Duration,
    started: AtomicU32,
    finished: AtomicU32,
}

impl SleepingHandler {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            started: AtomicU32::new(0),
            finished: AtomicU32::new(0),
        }
    }

    pub fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> u32 {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for SleepingHandler {
    async fn execute(&self, _context: &HandlerContext) -> SchedulerResult<HandlerOutcome> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.duration).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerOutcome::Completed(serde_json::json!({"slept_ms": self.duration.as_millis() as u64})))
    }

    fn name(&self) -> &str {
        "sleeping"
    }
}

/// Callback notifier that records deliveries and can fail a given number of times
#[derive(Default)]
pub struct RecordingNotifier {
    received: Mutex<Vec<(String, CallbackPayload)>>,
    failures_remaining: AtomicU32,
    attempts: AtomicU32,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(times: u32) -> Self {
        let notifier = Self::default();
        notifier.failures_remaining.store(times, Ordering::SeqCst);
        notifier
    }

    pub fn received(&self) -> Vec<(String, CallbackPayload)> {
        self.received.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CallbackNotifier for RecordingNotifier {
    async fn notify(&self, url: &str, payload: &CallbackPayload) -> SchedulerResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(SchedulerError::Callback("receiver unavailable".to_string()));
        }
        self.received
            .lock()
            .unwrap()
            .push((url.to_string(), payload.clone()));
        Ok(())
    }
}
