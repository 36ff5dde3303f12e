//! Inference engine boundary.
//!
//! The bridge never runs model math itself.  An [`Engine`] takes a flat
//! prompt plus sampling settings and hands back a lazy stream of
//! [`GenerationEvent`]s.  Each call to [`Engine::generate`] starts a fresh
//! generation; the stream ends after the event carrying a stop reason.
//!
//! [`ScriptedEngine`] replays canned fragments and is what the tests and the
//! offline demo mode run against.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::{BridgeError, Result};
use crate::types::{GenerationEvent, SamplingConfig, StopReason, Usage, estimate_tokens};

/// A lazy, finite, non-restartable sequence of generation events.
pub type GenerationStream = BoxStream<'static, Result<GenerationEvent>>;

// ---------------------------------------------------------------------------
// Engine trait
// ---------------------------------------------------------------------------

/// A text-completion backend.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Identifier of the loaded model.
    fn model_id(&self) -> &str;

    /// Start generating a continuation of `prompt`.
    ///
    /// Generation halts when any of `stop` appears, when the model emits its
    /// end-of-sequence token, or after `sampling.max_tokens` tokens.
    /// Errors returned here mean nothing was generated; errors inside the
    /// stream mean generation broke off.
    async fn generate(
        &self,
        prompt: &str,
        stop: &[String],
        sampling: &SamplingConfig,
    ) -> Result<GenerationStream>;

    /// Embed each input.  Engines without an embedding model keep the
    /// default.
    async fn embed(&self, _inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(BridgeError::EngineUnsupported {
            capability: "embeddings".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Scripted engine
// ---------------------------------------------------------------------------

/// Replays a fixed list of fragments as if the model generated them.
///
/// Stop sequences and `max_tokens` (one fragment counts as one token) are
/// honored, so finish-reason handling can be exercised end to end.
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    model_id: String,
    fragments: Vec<String>,
    fail_after: Option<usize>,
    delay: Option<Duration>,
    embedding_dim: Option<usize>,
    calls: Arc<AtomicUsize>,
    sent: Arc<AtomicUsize>,
    last_prompt: Arc<Mutex<Option<String>>>,
}

impl ScriptedEngine {
    /// An engine that answers every prompt with `fragments`.
    pub fn new<I, S>(model_id: impl Into<String>, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            model_id: model_id.into(),
            fragments: fragments.into_iter().map(Into::into).collect(),
            fail_after: None,
            delay: None,
            embedding_dim: None,
            calls: Arc::new(AtomicUsize::new(0)),
            sent: Arc::new(AtomicUsize::new(0)),
            last_prompt: Arc::new(Mutex::new(None)),
        }
    }

    /// Break off with an engine error after `count` fragments.
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Pause before each fragment.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Serve bag-of-characters embeddings of the given width.
    pub fn with_embeddings(mut self, dim: usize) -> Self {
        self.embedding_dim = Some(dim.max(1));
        self
    }

    /// Number of `generate` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fragments handed to consumers so far, across all calls.  A fragment
    /// counts once the stream has been polled for it.
    pub fn fragments_sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// The prompt of the most recent `generate` call.
    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().ok().and_then(|guard| guard.clone())
    }

    /// Apply stops and the token limit to the script.
    fn plan(&self, stop: &[String], max_tokens: u32) -> (Vec<String>, StopReason) {
        let mut emitted: Vec<String> = Vec::new();
        let mut text = String::new();

        for fragment in &self.fragments {
            if emitted.len() >= max_tokens as usize {
                return (emitted, StopReason::MaxTokens);
            }
            let start = text.len();
            text.push_str(fragment);

            let cut = stop
                .iter()
                .filter(|s| !s.is_empty())
                .filter_map(|s| text.find(s.as_str()))
                .min();
            if let Some(cut) = cut {
                // The stop may begin in an earlier fragment.
                trim_to(&mut emitted, start, cut);
                if cut > start {
                    emitted.push(text[start..cut].to_owned());
                }
                return (emitted, StopReason::StopSequence);
            }
            emitted.push(fragment.clone());
        }
        (emitted, StopReason::EndOfSequence)
    }
}

/// Drop already planned text at or beyond byte `cut`, where `emitted`
/// covers bytes `0..end`.
fn trim_to(emitted: &mut Vec<String>, end: usize, cut: usize) {
    let mut position = end;
    while cut < position {
        let Some(last) = emitted.pop() else { break };
        position -= last.len();
        if cut > position {
            emitted.push(last[..cut - position].to_owned());
            break;
        }
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(
        &self,
        prompt: &str,
        stop: &[String],
        sampling: &SamplingConfig,
    ) -> Result<GenerationStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut guard) = self.last_prompt.lock() {
            *guard = Some(prompt.to_owned());
        }

        let (fragments, reason) = self.plan(stop, sampling.max_tokens);
        let fail_after = self.fail_after;
        let delay = self.delay;
        let sent = Arc::clone(&self.sent);
        let usage = Usage {
            prompt_tokens: estimate_tokens(prompt),
            completion_tokens: fragments.len() as u32,
        };
        tracing::debug!(
            model = %self.model_id,
            fragments = fragments.len(),
            ?reason,
            "scripted generation started"
        );

        let stream = async_stream::stream! {
            for (index, fragment) in fragments.into_iter().enumerate() {
                if fail_after == Some(index) {
                    yield Err(BridgeError::engine("scripted engine failure"));
                    return;
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                sent.fetch_add(1, Ordering::SeqCst);
                yield Ok(GenerationEvent::fragment(fragment));
            }
            yield Ok(GenerationEvent::finished(reason).with_usage(usage));
        };
        Ok(stream.boxed())
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let Some(dim) = self.embedding_dim else {
            return Err(BridgeError::EngineUnsupported {
                capability: "embeddings".into(),
            });
        };
        Ok(inputs.iter().map(|input| bag_of_chars(input, dim)).collect())
    }
}

/// Unit-length character histogram folded into `dim` buckets.
fn bag_of_chars(input: &str, dim: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dim];
    for ch in input.chars() {
        vector[ch as usize % dim] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}
