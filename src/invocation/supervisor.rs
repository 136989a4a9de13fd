use super::events::EventSink;
use crate::backend::{GenerationBackend, GenerationRequest};
use crate::error::{InvocationError, StoreError};
use crate::state::StateStore;
use crate::tools::ToolAction;
use crate::types::{
    Actor, Artifact, ArtifactId, ArtifactKind, InvocationOutcome, Patch, SharedState,
    ToolInvocation,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bounded exponential backoff for transient backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

struct Completion {
    output: Value,
    artifact: Option<Artifact>,
}

/// Runs approved (or ungated) invocations against the generation backend
/// and records what they produce in the state store.
pub struct ExecutionSupervisor {
    store: Arc<StateStore>,
    backend: Arc<dyn GenerationBackend>,
    retry: RetryPolicy,
    patch_retries: usize,
}

impl ExecutionSupervisor {
    pub fn new(
        store: Arc<StateStore>,
        backend: Arc<dyn GenerationBackend>,
        retry: RetryPolicy,
        patch_retries: usize,
    ) -> Self {
        Self {
            store,
            backend,
            retry,
            patch_retries,
        }
    }

    /// Executes a running invocation to its outcome. Failures are folded
    /// into [`InvocationOutcome::Failed`]; nothing is dropped.
    pub async fn execute(
        &self,
        invocation: &ToolInvocation,
        action: ToolAction,
        credential: Option<String>,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> InvocationOutcome {
        let result = match action {
            ToolAction::Generate(kind) => {
                self.generate(invocation, kind, credential, events, cancel)
                    .await
            }
            ToolAction::Edit => self.edit(invocation, credential, events, cancel).await,
            ToolAction::SetField => self.set_field(invocation),
        };

        match result {
            Ok(Completion { output, artifact }) => InvocationOutcome::Succeeded { output, artifact },
            Err(err) => {
                tracing::warn!(
                    invocation_id = %invocation.id,
                    tool = %invocation.tool,
                    kind = ?err.kind(),
                    error = %err,
                    "invocation failed"
                );
                InvocationOutcome::Failed { error: err.info() }
            }
        }
    }

    async fn generate(
        &self,
        invocation: &ToolInvocation,
        kind: ArtifactKind,
        credential: Option<String>,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<Completion, InvocationError> {
        let credential = require_credential(invocation, credential)?;
        let name = required_str(invocation, "name")?;
        let prompt = required_str(invocation, "prompt")?;
        let description = optional_str(invocation, "description").unwrap_or(prompt);

        let full_prompt = match kind {
            ArtifactKind::Scene => compose_scene_prompt(invocation, prompt, &self.store.snapshot())?,
            _ => prompt.to_string(),
        };

        let media_ref = self
            .generate_with_retry(
                invocation,
                GenerationRequest {
                    prompt: full_prompt,
                    kind,
                    credential,
                },
                events,
                cancel,
            )
            .await?;

        let artifact = Artifact::new(kind, name, description, Some(media_ref), invocation.id);
        self.append(artifact)
    }

    async fn edit(
        &self,
        invocation: &ToolInvocation,
        credential: Option<String>,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<Completion, InvocationError> {
        let credential = require_credential(invocation, credential)?;
        let id = ArtifactId::parse(required_str(invocation, "artifact_id")?)
            .map_err(|reason| InvocationError::invalid(&invocation.tool, reason))?;
        let source = self
            .store
            .snapshot()
            .artifact(id)
            .cloned()
            .ok_or(InvocationError::ArtifactNotFound(id))?;
        let prompt = required_str(invocation, "prompt")?;

        let full_prompt = format!(
            "Revise the {} \"{}\" ({}).\nRequested change: {prompt}",
            source.kind, source.name, source.description
        );
        let media_ref = self
            .generate_with_retry(
                invocation,
                GenerationRequest {
                    prompt: full_prompt,
                    kind: source.kind,
                    credential,
                },
                events,
                cancel,
            )
            .await?;

        let description = if source.description.trim().is_empty() {
            prompt.to_string()
        } else {
            format!("{}; {prompt}", source.description)
        };
        let revised = source.revise(
            optional_str(invocation, "name").map(ToString::to_string),
            description,
            Some(media_ref),
            invocation.id,
        );
        self.append(revised)
    }

    fn set_field(&self, invocation: &ToolInvocation) -> Result<Completion, InvocationError> {
        let path = required_str(invocation, "path")?;
        let value = invocation.args.get("value").cloned().unwrap_or(Value::Null);

        let applied = self
            .store
            .apply_with_retry(Actor::Agent, self.patch_retries, |_| {
                Patch::set(path, value.clone())
            })
            .map_err(|err| match err {
                StoreError::InvalidPatch(reason) => {
                    InvocationError::invalid(&invocation.tool, reason.to_string())
                }
                other => other.into(),
            })?;

        Ok(Completion {
            output: json!({ "path": path, "value": value, "version": applied.version }),
            artifact: None,
        })
    }

    fn append(&self, artifact: Artifact) -> Result<Completion, InvocationError> {
        let applied = self
            .store
            .apply_with_retry(Actor::Engine, self.patch_retries, |_| {
                Patch::append(artifact.clone())
            })?;
        tracing::debug!(
            artifact_id = %artifact.id,
            kind = %artifact.kind,
            version = applied.version,
            "artifact appended"
        );

        Ok(Completion {
            output: json!({
                "artifact_id": artifact.id,
                "kind": artifact.kind,
                "name": artifact.name,
                "media_ref": artifact.media_ref,
                "revision": artifact.revision,
                "version": applied.version,
            }),
            artifact: Some(artifact),
        })
    }

    async fn generate_with_retry(
        &self,
        invocation: &ToolInvocation,
        request: GenerationRequest,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<String, InvocationError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            events.progress(
                invocation,
                attempt,
                format!("generating {} (attempt {attempt} of {max_attempts})", request.kind),
            );

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(InvocationError::Cancelled),
                result = self.backend.generate(request.clone()) => result,
            };

            match result {
                Ok(media_ref) => return Ok(media_ref),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        invocation_id = %invocation.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient backend failure; retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(InvocationError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(source) => {
                    return Err(InvocationError::Backend {
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }
}

fn require_credential(
    invocation: &ToolInvocation,
    credential: Option<String>,
) -> Result<String, InvocationError> {
    credential
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| InvocationError::MissingCredential {
            tool: invocation.tool.clone(),
        })
}

fn optional_str<'a>(invocation: &'a ToolInvocation, key: &str) -> Option<&'a str> {
    invocation
        .args
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn required_str<'a>(invocation: &'a ToolInvocation, key: &str) -> Result<&'a str, InvocationError> {
    optional_str(invocation, key).ok_or_else(|| {
        InvocationError::invalid(&invocation.tool, format!("missing required argument `{key}`"))
    })
}

/// Folds the referenced cast and setting into a scene prompt.
fn compose_scene_prompt(
    invocation: &ToolInvocation,
    prompt: &str,
    state: &SharedState,
) -> Result<String, InvocationError> {
    let mut composed = prompt.to_string();
    if let Some(ids) = invocation.args.get("character_ids").and_then(Value::as_array) {
        let mut cast = Vec::new();
        for raw in ids.iter().filter_map(Value::as_str) {
            let character = lookup(invocation, state, raw)?;
            cast.push(format!("- {}: {}", character.name, character.description));
        }
        if !cast.is_empty() {
            composed.push_str("\n\nCharacters:\n");
            composed.push_str(&cast.join("\n"));
        }
    }
    if let Some(raw) = invocation.args.get("background_id").and_then(Value::as_str) {
        let background = lookup(invocation, state, raw)?;
        composed.push_str(&format!(
            "\n\nSetting: {}: {}",
            background.name, background.description
        ));
    }
    Ok(composed)
}

fn lookup<'s>(
    invocation: &ToolInvocation,
    state: &'s SharedState,
    raw: &str,
) -> Result<&'s Artifact, InvocationError> {
    let id = ArtifactId::parse(raw)
        .map_err(|reason| InvocationError::invalid(&invocation.tool, reason))?;
    state.artifact(id).ok_or(InvocationError::ArtifactNotFound(id))
}
