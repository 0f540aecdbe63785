//! Scripted capabilities for tests and dry runs.
//!
//! Each fake replays queued results in order, then falls back to a default,
//! and counts how often it was called.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::engine::{Engine, EngineError, EngineOutput, EngineRequest, QaCapability, QaContext};

/// Engine returning scripted results.
pub struct ScriptedEngine {
    id: String,
    script: Mutex<VecDeque<Result<EngineOutput, EngineError>>>,
    fallback: Result<EngineOutput, EngineError>,
    requests: Mutex<Vec<EngineRequest>>,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    /// An engine that succeeds with a generic summary unless scripted otherwise
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(EngineOutput::new("done")),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Result returned once the script runs out
    pub fn otherwise(mut self, result: Result<EngineOutput, EngineError>) -> Self {
        self.fallback = result;
        self
    }

    pub fn then(self, result: Result<EngineOutput, EngineError>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
        self
    }

    pub fn then_ok(self, summary: &str) -> Self {
        self.then(Ok(EngineOutput::new(summary)))
    }

    pub fn then_fail(self, message: &str, retryable: bool) -> Self {
        self.then(Err(EngineError::failure(message, retryable)))
    }

    pub fn then_unavailable(self, message: &str) -> Self {
        self.then(Err(EngineError::Unavailable(message.to_string())))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request seen so far, oldest first
    pub fn requests(&self) -> Vec<EngineRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, request: EngineRequest) -> Result<EngineOutput, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        log::debug!("Scripted engine {} running step {}", self.id, request.step_name);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        let next = self.script.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// QA capability returning scripted reports.
pub struct ScriptedQa {
    script: Mutex<VecDeque<Result<String, EngineError>>>,
    fallback: Result<String, EngineError>,
    contexts: Mutex<Vec<QaContext>>,
    calls: AtomicUsize,
}

impl ScriptedQa {
    /// Passes every step unless scripted otherwise
    pub fn passing() -> Self {
        Self::with_fallback(Ok("VERDICT: PASS".to_string()))
    }

    /// Fails every step unless scripted otherwise
    pub fn failing() -> Self {
        Self::with_fallback(Ok("Tests are missing.\nVERDICT: FAIL".to_string()))
    }

    fn with_fallback(fallback: Result<String, EngineError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            contexts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn then_report(self, report: &str) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(report.to_string()));
        self
    }

    pub fn then_pass(self) -> Self {
        self.then_report("VERDICT: PASS")
    }

    pub fn then_fail(self) -> Self {
        self.then_report("VERDICT: FAIL")
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn contexts(&self) -> Vec<QaContext> {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl QaCapability for ScriptedQa {
    fn id(&self) -> &str {
        "scripted-qa"
    }

    async fn evaluate(&self, context: &QaContext) -> Result<String, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(context.clone());
        let next = self.script.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}
