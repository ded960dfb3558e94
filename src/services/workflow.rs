use crate::core::config::Config;
use crate::core::error::PipelineError;
use crate::core::io::{read_json, write_json, Storage};
use crate::core::state::{BatchIndex, Mode, Outline, RunState, Stage, EPISODES_PER_BATCH};
use crate::services::llm::GenerationClient;
use crate::services::pipeline::{PipelineOrchestrator, PipelineState};
use crate::services::prompt::PromptComposer;
use crate::services::source::{is_source_file, load_text};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rand::Rng;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Used when neither `max_batches` nor a parsed roadmap gives a stopping
/// point: 27 batches reach episode 81.
const DEFAULT_BATCHES: u32 = 27;

/// Drives every source in the input folder through outline and batch
/// generation, persisting progress after each successful stage.
pub struct WorkflowManager {
    config: Config,
    client: Box<dyn GenerationClient>,
    storage: Arc<dyn Storage>,
    composer: PromptComposer,
    mode: Mode,
}

impl WorkflowManager {
    pub fn new(config: Config, client: Box<dyn GenerationClient>, storage: Arc<dyn Storage>, mode: Mode) -> Self {
        let composer = PromptComposer::new(
            config.generation.window.clone(),
            config.generation.banned_phrases.clone(),
        );
        Self {
            config,
            client,
            storage,
            composer,
            mode,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        let entries = self.storage.list(&self.config.input_folder).await?;
        let mut sources: Vec<String> = entries.into_iter().filter(|e| is_source_file(e)).collect();
        sources.sort();

        if sources.is_empty() {
            println!("No .txt or .epub sources found in {}", self.config.input_folder);
            return Ok(());
        }

        let style = self.load_reference(self.config.generation.style_reference.as_deref()).await?;
        let layout = self.load_reference(self.config.generation.layout_reference.as_deref()).await?;

        for path_str in &sources {
            let stem = Path::new(path_str)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| path_str.clone());

            println!("Processing source: {}", stem);
            let finished = self
                .process_source(path_str, &stem, style.as_deref(), layout.as_deref())
                .await
                .with_context(|| format!("Run for {} failed", stem))?;
            if !finished {
                println!("Stopping as requested. Progress is saved; rerun to resume.");
                return Ok(());
            }
        }

        println!("All sources processed!");
        Ok(())
    }

    async fn load_reference(&self, path: Option<&str>) -> Result<Option<String>> {
        match path {
            Some(p) => {
                let text = load_text(self.storage.as_ref(), p)
                    .await
                    .with_context(|| format!("Failed to load reference {}", p))?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    fn state_path(&self, stem: &str) -> String {
        Path::new(&self.config.build_folder)
            .join(stem)
            .join("state.json")
            .to_string_lossy()
            .to_string()
    }

    fn output_path(&self, stem: &str, file: &str) -> String {
        Path::new(&self.config.output_folder)
            .join(stem)
            .join(file)
            .to_string_lossy()
            .to_string()
    }

    fn batch_path(&self, stem: &str, batch: BatchIndex) -> String {
        self.output_path(stem, &format!("batch_{:04}.txt", batch.get()))
    }

    /// Rewrites output files missing for stages already recorded in state.
    async fn restore_artifacts(&self, stem: &str, run: &PipelineOrchestrator) -> Result<()> {
        if let Some(outline) = run.outline() {
            let path = self.output_path(stem, "outline.md");
            if !self.storage.exists(&path).await? {
                warn!("Restoring missing {}", path);
                self.storage.write(&path, outline.raw.as_bytes()).await?;
            }
        }
        for entry in run.history().batches() {
            let path = self.batch_path(stem, entry.batch);
            if !self.storage.exists(&path).await? {
                warn!("Restoring missing {}", path);
                self.storage.write(&path, entry.text.as_bytes()).await?;
            }
        }
        Ok(())
    }

    async fn load_state(&self, stem: &str) -> Result<RunState> {
        let path = self.state_path(stem);
        if self.storage.exists(&path).await? {
            read_json(self.storage.as_ref(), &path).await
        } else {
            Ok(RunState::new(self.mode))
        }
    }

    async fn save_state(&self, stem: &str, run: &PipelineOrchestrator, completed: bool) -> Result<()> {
        let state = RunState {
            mode: run.mode(),
            outline: run.outline().cloned(),
            history: run.history().clone(),
            completed,
        };
        write_json(self.storage.as_ref(), &self.state_path(stem), &state).await
    }

    fn target_batches(&self, outline: &Outline) -> u32 {
        if let Some(max) = self.config.generation.max_batches {
            return max;
        }
        match outline.episode_count() {
            0 => DEFAULT_BATCHES,
            episodes => BatchIndex::count_for_episodes(episodes),
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.config.llm.retry_delay_seconds * 1000;
        let backoff = base_ms.saturating_mul(1u64 << (attempt - 1).min(6));
        let jitter = rand::rng().random_range(0..=base_ms / 2);
        Duration::from_millis(backoff + jitter)
    }

    /// Backoff before the next attempt, or `None` when `err` is fatal or
    /// attempts are exhausted.
    fn retry_after(&self, err: &PipelineError, attempt: usize) -> Option<Duration> {
        if !err.is_retryable() || attempt >= self.config.llm.retry_count {
            return None;
        }
        Some(self.retry_delay(attempt as u32 + 1))
    }

    /// Returns false when the user asked to stop before the run finished.
    async fn process_source(
        &self,
        path_str: &str,
        stem: &str,
        style: Option<&str>,
        layout: Option<&str>,
    ) -> Result<bool> {
        let state = self.load_state(stem).await?;
        if state.completed {
            println!("Skipping completed run: {}", stem);
            return Ok(true);
        }
        if state.mode != self.mode {
            warn!(
                "{} was started as {}; keeping that instead of {}",
                stem, state.mode, self.mode
            );
        }

        let source = load_text(self.storage.as_ref(), path_str).await?;
        let mut run = match state.outline {
            Some(outline) => {
                println!("Resuming {} after batch {}", stem, state.history.len());
                PipelineOrchestrator::resume(
                    self.composer.clone(),
                    state.mode,
                    &source,
                    layout,
                    style,
                    outline,
                    state.history,
                )?
            }
            None => PipelineOrchestrator::new(self.composer.clone(), state.mode, &source, layout, style)?,
        };

        let sampling = &self.config.generation.sampling;
        let client = self.client.as_ref();

        if run.outline().is_none() {
            println!("Generating outline...");
            let profile = sampling.profile_for(Stage::Outline, run.mode());
            let mut attempt = 0;
            let raw = loop {
                match run.run_outline(client, profile).await {
                    Ok(outline) => break outline.raw.clone(),
                    Err(e) => match self.retry_after(&e, attempt) {
                        Some(delay) => {
                            attempt += 1;
                            warn!(
                                "Outline failed: {}. Retrying in {:?} ({}/{})",
                                e, delay, attempt, self.config.llm.retry_count
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(e).context("Outline generation failed"),
                    },
                }
            };
            self.storage
                .write(&self.output_path(stem, "outline.md"), raw.as_bytes())
                .await?;
            self.save_state(stem, &run, false).await?;
        } else {
            self.restore_artifacts(stem, &run).await?;
        }

        let target = run.outline().map(|o| self.target_batches(o)).unwrap_or(DEFAULT_BATCHES);
        info!(
            "{}: generating up to {} batches ({} episodes)",
            stem,
            target,
            u64::from(target) * u64::from(EPISODES_PER_BATCH)
        );

        let pb = ProgressBar::new(target as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches ({eta})")?
                .progress_chars("#>-"),
        );
        pb.set_position(run.history().len() as u64);

        let profile = sampling.profile_for(Stage::Segment, run.mode());
        while let Some(next) = run.next_batch() {
            if next.get() > target {
                break;
            }

            let mut attempt = 0;
            let text = loop {
                match run.run_segment(client, profile, next.get()).await {
                    Ok(text) => break text.to_string(),
                    Err(e) => match self.retry_after(&e, attempt) {
                        Some(delay) => {
                            attempt += 1;
                            warn!(
                                "Batch {} failed: {}. Retrying in {:?} ({}/{})",
                                next, e, delay, attempt, self.config.llm.retry_count
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            pb.abandon();
                            return Err(e).with_context(|| format!("Batch {} failed", next));
                        }
                    },
                }
            };

            self.storage
                .write(&self.batch_path(stem, next), text.as_bytes())
                .await?;
            self.save_state(stem, &run, false).await?;
            pb.inc(1);

            if !self.config.unattended && next.get() < target {
                let keep_going = pb.suspend(|| {
                    inquire::Confirm::new(&format!(
                        "Batch {} (episodes {}) done. Continue?",
                        next,
                        next.episode_range()
                    ))
                    .with_default(true)
                    .prompt()
                });
                if !keep_going.context("Failed to read confirmation")? {
                    run.cancel();
                    pb.abandon();
                    return Ok(false);
                }
            }
        }

        if run.state() != PipelineState::Completed {
            run.complete()?;
        }
        self.save_state(stem, &run, true).await?;
        self.storage
            .write(
                &self.output_path(stem, "script.txt"),
                run.history().concatenated().as_bytes(),
            )
            .await?;
        pb.finish_with_message("Run complete");
        println!(
            "Run complete: {} batches, {} chars",
            run.history().len(),
            run.history().char_len()
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{GenerationError, GenerationErrorKind};
    use crate::core::io::NativeStorage;
    use crate::core::state::ScriptHistory;
    use crate::services::sampling::SamplingProfile;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::Mutex;

    const OUTLINE: &str = "【剧本进度路线图】\n第 1-10 集：[开局] | 原著对应章节：[第1章-第3章] | 核心剧情钩子：退婚\n\n大纲正文。";

    #[derive(Debug)]
    struct MockClient {
        replies: Mutex<VecDeque<Result<String, GenerationError>>>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl MockClient {
        fn new(replies: Vec<Result<String, GenerationError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl GenerationClient for MockClient {
        async fn generate(&self, payload: &str, _profile: &SamplingProfile) -> Result<String, GenerationError> {
            self.calls.lock().unwrap().push(payload.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GenerationError::invalid_response("unexpected call")))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Config,
        build: std::path::PathBuf,
        output: std::path::PathBuf,
    }

    fn fixture(max_batches: u32) -> Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("input");
        let build = dir.path().join("build");
        let output = dir.path().join("output");
        fs::create_dir_all(&input)?;
        fs::write(input.join("novel.txt"), "第一章 少年出山。他推开了山门。")?;
        fs::write(input.join("notes.md"), "ignored")?;

        let yaml = format!(
            "input_folder: {}\noutput_folder: {}\nbuild_folder: {}\nunattended: true\n\
             llm:\n  provider: mock\n  retry_count: 2\n  retry_delay_seconds: 0\n\
             generation:\n  max_batches: {}\n",
            input.display(),
            output.display(),
            build.display(),
            max_batches
        );
        let config = Config::parse(&yaml)?;
        Ok(Fixture {
            _dir: dir,
            config,
            build,
            output,
        })
    }

    fn ok(text: &str) -> Result<String, GenerationError> {
        Ok(text.to_string())
    }

    #[tokio::test]
    async fn test_full_run_persists_artifacts_and_retries_transient_failures() -> Result<()> {
        let fx = fixture(3)?;
        let client = MockClient::new(vec![
            Err(GenerationError::new(GenerationErrorKind::RateLimited, "429")),
            ok(OUTLINE),
            ok("第一批。"),
            Err(GenerationError::network("reset")),
            ok("第二批。"),
            ok("第三批。"),
        ]);
        let calls = client.calls.clone();

        let mut manager = WorkflowManager::new(
            fx.config.clone(),
            Box::new(client),
            Arc::new(NativeStorage::new()),
            Mode::Male,
        );
        manager.run().await?;

        assert_eq!(calls.lock().unwrap().len(), 6);
        let state: RunState = serde_json::from_str(&fs::read_to_string(fx.build.join("novel/state.json"))?)?;
        assert!(state.completed);
        assert_eq!(state.history.concatenated(), "第一批。第二批。第三批。");
        assert_eq!(state.outline.unwrap().roadmap.len(), 1);

        let run_out = fx.output.join("novel");
        assert_eq!(fs::read_to_string(run_out.join("outline.md"))?, OUTLINE);
        assert_eq!(fs::read_to_string(run_out.join("batch_0002.txt"))?, "第二批。");
        assert_eq!(fs::read_to_string(run_out.join("script.txt"))?, "第一批。第二批。第三批。");

        // Completed runs are skipped on the next invocation.
        let idle = MockClient::new(vec![]);
        let idle_calls = idle.calls.clone();
        let mut again = WorkflowManager::new(fx.config.clone(), Box::new(idle), Arc::new(NativeStorage::new()), Mode::Male);
        again.run().await?;
        assert!(idle_calls.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_continues_from_saved_batch_and_restores_outputs() -> Result<()> {
        let fx = fixture(3)?;
        let mut history = ScriptHistory::new();
        history.append("已有第一批。".to_string());
        let state = RunState {
            mode: Mode::Female,
            outline: Some(Outline::from_text(OUTLINE)),
            history,
            completed: false,
        };
        // State recorded, but the process stopped before any output file was written.
        fs::create_dir_all(fx.build.join("novel"))?;
        fs::write(fx.build.join("novel/state.json"), serde_json::to_string(&state)?)?;

        let client = MockClient::new(vec![ok("第二批。"), ok("第三批。")]);
        let calls = client.calls.clone();
        let mut manager = WorkflowManager::new(fx.config.clone(), Box::new(client), Arc::new(NativeStorage::new()), Mode::Male);
        manager.run().await?;

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("第 4 - 6 集"));
        assert!(calls[0].contains("女频"));
        assert!(calls[0].contains("已有第一批。"));

        let run_out = fx.output.join("novel");
        assert_eq!(fs::read_to_string(run_out.join("outline.md"))?, OUTLINE);
        assert_eq!(fs::read_to_string(run_out.join("batch_0001.txt"))?, "已有第一批。");
        assert_eq!(fs::read_to_string(run_out.join("batch_0003.txt"))?, "第三批。");

        let state: RunState = serde_json::from_str(&fs::read_to_string(fx.build.join("novel/state.json"))?)?;
        assert_eq!(state.mode, Mode::Female);
        assert_eq!(state.history.concatenated(), "已有第一批。第二批。第三批。");
        Ok(())
    }

    #[tokio::test]
    async fn test_fatal_error_stops_run_and_keeps_progress() -> Result<()> {
        let fx = fixture(3)?;
        let client = MockClient::new(vec![
            ok(OUTLINE),
            ok("第一批。"),
            Err(GenerationError::new(GenerationErrorKind::Unauthorized, "key revoked")),
        ]);
        let calls = client.calls.clone();
        let mut manager = WorkflowManager::new(fx.config.clone(), Box::new(client), Arc::new(NativeStorage::new()), Mode::Male);

        let err = manager.run().await.unwrap_err();
        assert!(format!("{:#}", err).contains("key revoked"));
        assert_eq!(calls.lock().unwrap().len(), 3);

        let state: RunState = serde_json::from_str(&fs::read_to_string(fx.build.join("novel/state.json"))?)?;
        assert!(!state.completed);
        assert_eq!(state.history.concatenated(), "第一批。");
        assert!(!fx.output.join("novel/script.txt").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_retries_are_bounded() -> Result<()> {
        let fx = fixture(1)?;
        let client = MockClient::new(vec![
            ok(OUTLINE),
            Err(GenerationError::network("down")),
            Err(GenerationError::network("down")),
            Err(GenerationError::network("down")),
            ok("never reached"),
        ]);
        let calls = client.calls.clone();
        let mut manager = WorkflowManager::new(fx.config.clone(), Box::new(client), Arc::new(NativeStorage::new()), Mode::Male);

        assert!(manager.run().await.is_err());
        // One outline call plus the first attempt and two retries.
        assert_eq!(calls.lock().unwrap().len(), 4);
        Ok(())
    }

    #[test]
    fn test_target_batches_policy() -> Result<()> {
        let mut fx = fixture(5)?;
        let outline = Outline::from_text("第 1-10 集：甲\n第 11-70 集：乙\n正文");
        let manager = WorkflowManager::new(
            fx.config.clone(),
            Box::new(MockClient::new(vec![])),
            Arc::new(NativeStorage::new()),
            Mode::Male,
        );
        assert_eq!(manager.target_batches(&outline), 5);

        fx.config.generation.max_batches = None;
        let manager = WorkflowManager::new(
            fx.config.clone(),
            Box::new(MockClient::new(vec![])),
            Arc::new(NativeStorage::new()),
            Mode::Male,
        );
        assert_eq!(manager.target_batches(&outline), 24);
        assert_eq!(manager.target_batches(&Outline::from_text("无路线图")), DEFAULT_BATCHES);
        Ok(())
    }
}
