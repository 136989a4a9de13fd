use super::{GenerationBackend, GenerationRequest};
use crate::error::BackendError;
use crate::types::ArtifactKind;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A call the scripted backend received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCall {
    pub prompt: String,
    pub kind: ArtifactKind,
    pub credential: String,
}

#[derive(Default)]
struct Script {
    queued: VecDeque<Result<String, BackendError>>,
    calls: Vec<ScriptedCall>,
}

/// In-process backend that replays queued results. When the queue is empty
/// every call succeeds with a media reference derived from the call count.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
    latency: Option<Duration>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_results(results: Vec<Result<String, BackendError>>) -> Self {
        let backend = Self::new();
        backend.lock().queued.extend(results);
        backend
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn generate(&self, request: GenerationRequest) -> Result<String, BackendError> {
        let result = {
            let mut script = self.lock();
            script.calls.push(ScriptedCall {
                prompt: request.prompt.clone(),
                kind: request.kind,
                credential: request.credential.clone(),
            });
            let call = script.calls.len();
            script
                .queued
                .pop_front()
                .unwrap_or_else(|| Ok(format!("media://{}/{call}", request.kind)))
        };

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        result
    }
}
