//! Run-level state machine: one outline, then strictly ordered batches.
//!
//! ```text
//! Idle -> OutlineReady -> SegmentGenerating(1) -> SegmentGenerating(2) -> ... -> Completed
//! ```
//!
//! History is appended only after a generation call returns successfully.
//! Dropping an in-flight `run_*` future therefore leaves the run exactly as
//! it was after the last successful batch.

use crate::core::error::{PipelineError, SequenceError};
use crate::core::state::{BatchIndex, Mode, Outline, ScriptHistory, Stage};
use crate::services::isolator::{isolate, IsolatedInputs};
use crate::services::llm::GenerationClient;
use crate::services::prompt::{PromptComposer, OUTLINE_PROSE_CHARS, TARGET_EPISODES};
use crate::services::sampling::SamplingProfile;
use log::{debug, info, warn};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    OutlineReady,
    /// Waiting on (or retrying) the given batch.
    SegmentGenerating(BatchIndex),
    Completed,
    Cancelled,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => f.write_str("idle"),
            PipelineState::OutlineReady => f.write_str("outline ready"),
            PipelineState::SegmentGenerating(batch) => write!(f, "generating batch {}", batch),
            PipelineState::Completed => f.write_str("completed"),
            PipelineState::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Stateless outline stage: isolate, compose, generate.
pub async fn run_outline(
    client: &dyn GenerationClient,
    composer: &PromptComposer,
    profile: &SamplingProfile,
    source: &str,
    layout: Option<&str>,
    style: Option<&str>,
) -> Result<Outline, PipelineError> {
    let inputs = isolate(source, style, layout, None)?;
    generate_outline(client, composer, profile, &inputs).await
}

/// Stateless segment stage. `history` is the full stored history text; only
/// its trailing window is sent.
#[allow(clippy::too_many_arguments)]
pub async fn run_segment(
    client: &dyn GenerationClient,
    composer: &PromptComposer,
    profile: &SamplingProfile,
    batch_index: u32,
    mode: Mode,
    source: &str,
    outline: &Outline,
    history: &str,
    layout: Option<&str>,
    style: Option<&str>,
) -> Result<String, PipelineError> {
    let tail = composer.window().history(history);
    let inputs = isolate(source, style, layout, Some(tail))?;
    generate_segment(client, composer, profile, batch_index, mode, &inputs, outline).await
}

async fn generate_outline(
    client: &dyn GenerationClient,
    composer: &PromptComposer,
    profile: &SamplingProfile,
    inputs: &IsolatedInputs,
) -> Result<Outline, PipelineError> {
    let prompt = composer.compose_outline(inputs)?;
    let payload = prompt.render();
    debug!("Outline payload: {} chars", payload.chars().count());

    let text = client.generate(&payload, profile).await?;
    let outline = Outline::from_text(&text);

    let episodes = outline.episode_count();
    if !TARGET_EPISODES.contains(&episodes) {
        warn!(
            "Outline roadmap covers {} episodes, expected {}-{}",
            episodes,
            TARGET_EPISODES.start(),
            TARGET_EPISODES.end()
        );
    }
    if !outline.roadmap.is_empty() && !outline.stages_are_consecutive() {
        warn!("Outline roadmap stages have gaps or overlaps");
    }
    let prose = outline.prose_chars();
    if !OUTLINE_PROSE_CHARS.contains(&prose) {
        warn!(
            "Outline prose is {} chars, expected {}-{}",
            prose,
            OUTLINE_PROSE_CHARS.start(),
            OUTLINE_PROSE_CHARS.end()
        );
    }
    Ok(outline)
}

async fn generate_segment(
    client: &dyn GenerationClient,
    composer: &PromptComposer,
    profile: &SamplingProfile,
    batch_index: u32,
    mode: Mode,
    inputs: &IsolatedInputs,
    outline: &Outline,
) -> Result<String, PipelineError> {
    let prompt = composer.compose_segment(batch_index, mode, inputs, outline)?;
    let payload = prompt.render();
    debug!("Batch {} payload: {} chars", batch_index, payload.chars().count());
    Ok(client.generate(&payload, profile).await?)
}

/// The last representable batch closes the run.
fn state_after(batch: BatchIndex) -> PipelineState {
    if batch == BatchIndex::MAX {
        PipelineState::Completed
    } else {
        PipelineState::SegmentGenerating(batch.next())
    }
}

/// Owns one run's inputs and artifacts. Runs share nothing, so separate
/// orchestrators may be driven concurrently.
#[derive(Debug)]
pub struct PipelineOrchestrator {
    inputs: IsolatedInputs,
    composer: PromptComposer,
    mode: Mode,
    state: PipelineState,
    outline: Option<Outline>,
    history: ScriptHistory,
}

impl PipelineOrchestrator {
    pub fn new(
        composer: PromptComposer,
        mode: Mode,
        source: &str,
        layout: Option<&str>,
        style: Option<&str>,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            inputs: isolate(source, style, layout, None)?,
            composer,
            mode,
            state: PipelineState::Idle,
            outline: None,
            history: ScriptHistory::new(),
        })
    }

    /// Rebuilds a run from stored artifacts.
    pub fn resume(
        composer: PromptComposer,
        mode: Mode,
        source: &str,
        layout: Option<&str>,
        style: Option<&str>,
        outline: Outline,
        history: ScriptHistory,
    ) -> Result<Self, PipelineError> {
        let mut run = Self::new(composer, mode, source, layout, style)?;
        run.state = match history.last_batch() {
            Some(last) => state_after(last),
            None => PipelineState::OutlineReady,
        };
        run.outline = Some(outline);
        run.history = history;
        Ok(run)
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn outline(&self) -> Option<&Outline> {
        self.outline.as_ref()
    }

    pub fn history(&self) -> &ScriptHistory {
        &self.history
    }

    /// Index the next `run_segment` call must use.
    pub fn next_batch(&self) -> Option<BatchIndex> {
        match self.state {
            PipelineState::OutlineReady => Some(BatchIndex::FIRST),
            PipelineState::SegmentGenerating(batch) => Some(batch),
            _ => None,
        }
    }

    fn closed(&self) -> SequenceError {
        SequenceError::RunClosed {
            state: self.state.to_string(),
        }
    }

    fn ensure_open(&self) -> Result<(), SequenceError> {
        match self.state {
            PipelineState::Completed | PipelineState::Cancelled => Err(self.closed()),
            _ => Ok(()),
        }
    }

    /// `Idle -> OutlineReady`. On failure the run stays `Idle` and nothing
    /// is stored.
    pub async fn run_outline(
        &mut self,
        client: &dyn GenerationClient,
        profile: &SamplingProfile,
    ) -> Result<&Outline, PipelineError> {
        self.ensure_open()?;
        if self.state != PipelineState::Idle {
            return Err(SequenceError::OutlineAlreadyGenerated.into());
        }

        info!("Generating outline (profile '{}')", profile.name);
        let outline = generate_outline(client, &self.composer, profile, &self.inputs).await?;
        info!(
            "Outline ready: {} roadmap stages covering {} episodes",
            outline.roadmap.len(),
            outline.episode_count()
        );
        self.state = PipelineState::OutlineReady;
        Ok(self.outline.insert(outline))
    }

    /// Generates batch `batch_index`, which must be exactly one past the last
    /// completed batch. The output is appended to history only on success.
    pub async fn run_segment(
        &mut self,
        client: &dyn GenerationClient,
        profile: &SamplingProfile,
        batch_index: u32,
    ) -> Result<&str, PipelineError> {
        let batch = BatchIndex::new(batch_index)?;
        let expected = match self.state {
            PipelineState::Idle => return Err(SequenceError::OutlineMissing.into()),
            PipelineState::OutlineReady => BatchIndex::FIRST,
            PipelineState::SegmentGenerating(next) => next,
            PipelineState::Completed | PipelineState::Cancelled => return Err(self.closed().into()),
        };
        if batch != expected {
            return Err(SequenceError::OutOfOrder {
                requested: batch.get(),
                expected: expected.get(),
            }
            .into());
        }

        let outline = self.outline.as_ref().ok_or(SequenceError::OutlineMissing)?;
        self.state = PipelineState::SegmentGenerating(batch);

        let tail = self.history.tail(self.composer.window().history_chars);
        let inputs = self.inputs.with_history(Some(&tail));
        let range = batch.episode_range();
        info!("Generating batch {} (episodes {}, {})", batch, range, self.mode);

        let text = generate_segment(client, &self.composer, profile, batch.get(), self.mode, &inputs, outline).await?;

        let appended = self.history.append(text);
        self.state = state_after(appended);
        info!(
            "Batch {} complete, history now {} chars",
            appended,
            self.history.char_len()
        );
        let entry = &self.history.batches()[self.history.len() - 1];
        Ok(entry.text.as_str())
    }

    /// Marks the run finished. Whether the roadmap is covered is the
    /// caller's call; at least one batch must exist.
    pub fn complete(&mut self) -> Result<(), SequenceError> {
        self.ensure_open()?;
        if self.state == PipelineState::Idle {
            return Err(SequenceError::OutlineMissing);
        }
        if self.history.is_empty() {
            return Err(SequenceError::NoBatches);
        }
        self.state = PipelineState::Completed;
        Ok(())
    }

    /// Stops the run between stages. Later stage requests fail.
    pub fn cancel(&mut self) {
        if self.state != PipelineState::Completed {
            self.state = PipelineState::Cancelled;
        }
    }

    /// Discards the outline and every batch built on it, handing the old
    /// history back to the caller. The run returns to `Idle`.
    pub fn invalidate_outline(&mut self) -> Result<ScriptHistory, SequenceError> {
        self.ensure_open()?;
        if self.outline.take().is_none() {
            return Err(SequenceError::OutlineMissing);
        }
        let discarded = std::mem::take(&mut self.history);
        if !discarded.is_empty() {
            warn!("Outline invalidated; discarding {} generated batches", discarded.len());
        }
        self.state = PipelineState::Idle;
        Ok(discarded)
    }

    pub fn stage_for_next(&self) -> Option<Stage> {
        match self.state {
            PipelineState::Idle => Some(Stage::Outline),
            PipelineState::OutlineReady | PipelineState::SegmentGenerating(_) => Some(Stage::Segment),
            _ => None,
        }
    }
}
