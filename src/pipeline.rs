use crate::chunker;
use crate::config::Config;
use crate::error::PipelineError;
use crate::generation::{CancelToken, GenerationClient};
use crate::llm::{validate_credential, ImageClient, LlmClient};
use crate::propagate;
use crate::prompts;
use crate::stages;
use crate::state::{fingerprint, PipelineState, Stage};
use crate::storage::Storage;
use std::sync::Arc;
use std::time::Duration;

/// The most recent stage failure, kept inspectable so an operator can
/// diagnose prompt/schema mismatches. For contract violations `raw` holds the
/// cleaned model output.
#[derive(Debug, Clone)]
pub struct LastError {
    pub message: String,
    pub raw: Option<String>,
}

/// Owns one pipeline run: the draft, its state, the generation clients and
/// the storage collaborator. Only one advance/regenerate operation may be in
/// flight at a time; the in-flight flag rejects overlapping calls.
pub struct PipelineManager {
    config: Config,
    generation: GenerationClient,
    image: Option<Box<dyn ImageClient>>,
    storage: Arc<dyn Storage>,
    draft: String,
    state: PipelineState,
    cancel: CancelToken,
    in_flight: bool,
    last_error: Option<LastError>,
    last_persist_error: Option<String>,
}

impl PipelineManager {
    pub fn new(
        config: Config,
        llm: Box<dyn LlmClient>,
        image: Option<Box<dyn ImageClient>>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let generation = GenerationClient::new(
            llm,
            config.llm.fallback_model.clone(),
            config.llm.retry_count,
            Duration::from_secs(config.llm.retry_delay_seconds),
        );
        Self {
            config,
            generation,
            image,
            storage,
            draft: String::new(),
            state: PipelineState::default(),
            cancel: CancelToken::new(),
            in_flight: false,
            last_error: None,
            last_persist_error: None,
        }
    }

    /// Builds the manager with clients derived from the config.
    pub fn from_config(config: Config, storage: Arc<dyn Storage>) -> anyhow::Result<Self> {
        let llm = crate::llm::create_llm(&config)?;
        let image = crate::llm::create_image_client(&config)?;
        Ok(Self::new(config, llm, image, storage))
    }

    fn state_path(&self) -> String {
        format!("{}/pipeline.json", self.config.build_folder)
    }

    /// Begins (or resumes) a run for `draft`. Saved progress belonging to a
    /// different draft is surfaced as `StaleDraft`, never silently resumed;
    /// call `reset()` to discard it. On resume the saved steering instruction
    /// wins over the `steering` argument, since artifacts were already built
    /// under it; `set_outline_instruction()` is the way to change it.
    pub async fn start(
        &mut self,
        draft: &str,
        steering: Option<String>,
    ) -> Result<(), PipelineError> {
        if draft.trim().is_empty() {
            return Err(PipelineError::validation("draft is empty"));
        }

        let current = fingerprint(draft);
        let path = self.state_path();
        let saved = match self.storage.exists(&path).await {
            Ok(true) => {
                let bytes = self
                    .storage
                    .read(&path)
                    .await
                    .map_err(|e| PipelineError::Persistence(e.to_string()))?;
                let blob = String::from_utf8(bytes)
                    .map_err(|e| PipelineError::Persistence(e.to_string()))?;
                Some(
                    serde_json::from_str::<PipelineState>(&blob)
                        .map_err(|e| PipelineError::Persistence(e.to_string()))?,
                )
            }
            Ok(false) => None,
            Err(e) => return Err(PipelineError::Persistence(e.to_string())),
        };

        self.draft = draft.to_string();
        if let Some(saved) = saved {
            if saved.draft_fingerprint != current {
                return Err(PipelineError::StaleDraft {
                    saved: saved.draft_fingerprint,
                    current,
                });
            }
            log::info!("resuming saved progress at stage {:?}", saved.stage);
            let steering = steering.filter(|s| !s.trim().is_empty());
            if steering.is_some() && steering != saved.steering_instruction {
                log::info!(
                    "resumed run keeps its saved steering instruction; \
                     use set_outline_instruction() to change it"
                );
            }
            self.state = saved;
        } else {
            self.state = PipelineState::new(draft);
            self.state.steering_instruction = steering.filter(|s| !s.trim().is_empty());
            self.persist().await;
        }
        Ok(())
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn snapshot(&self) -> PipelineState {
        self.state.clone()
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    pub fn last_persist_error(&self) -> Option<&str> {
        self.last_persist_error.as_deref()
    }

    /// Handle for cancelling the operation currently in flight. Tokens are
    /// re-armed at the start of each operation.
    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Clears all artifacts and saved progress; back to `NotStarted`.
    pub async fn reset(&mut self) -> Result<(), PipelineError> {
        self.state = PipelineState::new(&self.draft);
        self.last_error = None;
        self.storage
            .delete(&self.state_path())
            .await
            .map_err(|e| PipelineError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Checks the busy flag and credentials, re-arms the cancel token.
    fn begin_op(&mut self) -> Result<CancelToken, PipelineError> {
        if self.in_flight {
            return Err(PipelineError::Busy);
        }
        validate_credential(&self.config)?;
        if self.cancel.is_cancelled() {
            self.cancel = CancelToken::new();
        }
        self.in_flight = true;
        Ok(self.cancel.clone())
    }

    /// Clears the busy flag, records the outcome, persists on success.
    async fn finish_op(
        &mut self,
        result: Result<Stage, PipelineError>,
    ) -> Result<Stage, PipelineError> {
        self.in_flight = false;
        match &result {
            Ok(_) => {
                self.last_error = None;
                self.persist().await;
            }
            Err(e) => {
                let raw = match e {
                    PipelineError::Contract { raw, .. } => Some(raw.clone()),
                    _ => None,
                };
                self.last_error = Some(LastError {
                    message: e.to_string(),
                    raw,
                });
            }
        }
        result
    }

    /// Runs the next pending stage, or retries the one that last failed.
    /// Failure leaves the stage pointer unchanged, so calling again is a
    /// plain retry. The state is persisted after every successful transition,
    /// so a crash loses at most one stage's work.
    pub async fn advance(&mut self) -> Result<Stage, PipelineError> {
        let cancel = self.begin_op()?;
        let result = self.advance_inner(&cancel).await;
        self.finish_op(result).await
    }

    async fn advance_inner(&mut self, cancel: &CancelToken) -> Result<Stage, PipelineError> {
        let model = self.config.llm.model.clone();
        match self.state.stage {
            Stage::NotStarted => {
                let chunks = chunker::chunk(&self.draft, self.config.pipeline.chunk_max_bytes);
                let condensed = stages::run_summarize(
                    &self.generation,
                    &model,
                    &chunks,
                    self.state.steering_instruction.as_deref(),
                    cancel,
                )
                .await?;
                self.state.condensed_draft = Some(condensed);
                self.state.stage = Stage::Summarizing;
            }
            Stage::Summarizing => {
                let prefix = self.condensed_prefix()?;
                let elements = stages::run_extract_elements(
                    &self.generation,
                    &model,
                    &prefix,
                    self.state.steering_instruction.as_deref(),
                    cancel,
                )
                .await?;
                self.state.elements = Some(elements);
                self.state.stage = Stage::ElementsExtracted;
            }
            Stage::ElementsExtracted => {
                let prefix = self.condensed_prefix()?;
                let elements = self.state.elements.clone().ok_or_else(|| {
                    PipelineError::validation("story elements missing; run extraction first")
                })?;
                let chapters = stages::run_outline(
                    &self.generation,
                    &model,
                    &prefix,
                    &elements,
                    self.state.steering_instruction.as_deref(),
                    cancel,
                )
                .await?;
                self.state.chapters = chapters;
                self.state.stage = Stage::Outlined;
            }
            Stage::Outlined | Stage::Expanding => {
                if self.state.stage == Stage::Outlined {
                    self.state.current_chapter = 0;
                }
                let index = self.state.current_chapter;
                let total = self.state.chapters.len();
                let elements = self.state.elements.clone().unwrap_or_default();
                let text = stages::run_expand_chapter(
                    &self.generation,
                    &model,
                    &self.state.chapters[index],
                    &self.state.chapters[..index],
                    &elements,
                    index + 1 == total,
                    cancel,
                )
                .await?;
                self.state.chapters[index].expanded_text = Some(text);
                self.state.chapters[index].expansion_count = 0;
                self.state.current_chapter = index + 1;
                self.state.stage = if index + 1 == total {
                    Stage::Complete
                } else {
                    Stage::Expanding
                };
            }
            Stage::Complete => {
                log::info!("pipeline already complete");
            }
        }
        Ok(self.state.stage)
    }

    /// Edits a chapter's guiding instruction and propagates the consequences
    /// downstream: chapters before `index` stay byte-identical, chapters from
    /// `index` on are re-outlined and their prose cleared.
    pub async fn edit_chapter_instruction(
        &mut self,
        index: usize,
        text: Option<String>,
    ) -> Result<Stage, PipelineError> {
        let cancel = self.begin_op()?;
        let result = self.edit_chapter_inner(index, text, &cancel).await;
        self.finish_op(result).await
    }

    async fn edit_chapter_inner(
        &mut self,
        index: usize,
        text: Option<String>,
        cancel: &CancelToken,
    ) -> Result<Stage, PipelineError> {
        let prefix = self.condensed_prefix()?;
        propagate::propagate_chapter_edit(
            &self.generation,
            &self.config.llm.model,
            &prefix,
            &mut self.state,
            index,
            text,
            cancel,
        )
        .await?;
        Ok(self.state.stage)
    }

    /// Changes the outline-level instruction and regenerates every chapter,
    /// with a refinement pass preserving chapter-specific overrides.
    pub async fn set_outline_instruction(
        &mut self,
        text: Option<String>,
    ) -> Result<Stage, PipelineError> {
        let cancel = self.begin_op()?;
        let result = self.set_outline_inner(text, &cancel).await;
        self.finish_op(result).await
    }

    async fn set_outline_inner(
        &mut self,
        text: Option<String>,
        cancel: &CancelToken,
    ) -> Result<Stage, PipelineError> {
        let prefix = self.condensed_prefix()?;
        propagate::propagate_global_edit(
            &self.generation,
            &self.config.llm.model,
            &prefix,
            &mut self.state,
            text,
            cancel,
        )
        .await?;
        Ok(self.state.stage)
    }

    /// Appends 500-1000 more words to an already-expanded chapter. Strictly
    /// append-only; bumps the chapter's expansion count.
    pub async fn expand_more(&mut self, index: usize) -> Result<Stage, PipelineError> {
        let cancel = self.begin_op()?;
        let result = self.expand_more_inner(index, &cancel).await;
        self.finish_op(result).await
    }

    async fn expand_more_inner(
        &mut self,
        index: usize,
        cancel: &CancelToken,
    ) -> Result<Stage, PipelineError> {
        let chapter = self
            .state
            .chapters
            .get(index)
            .ok_or_else(|| PipelineError::validation("chapter index out of range"))?;
        if chapter.expanded_text.is_none() {
            return Err(PipelineError::validation(
                "chapter has no expanded text yet; expand it first",
            ));
        }
        let elements = self.state.elements.clone().unwrap_or_default();
        let more = stages::run_expand_more(
            &self.generation,
            &self.config.llm.model,
            chapter,
            &elements,
            cancel,
        )
        .await?;
        let chapter = &mut self.state.chapters[index];
        let existing = chapter.expanded_text.take().unwrap_or_default();
        chapter.expanded_text = Some(format!("{}\n\n{}", existing, more));
        chapter.expansion_count += 1;
        Ok(self.state.stage)
    }

    /// Re-expands one already-expanded chapter from its outline entry,
    /// replacing its prose wholesale.
    pub async fn regenerate_chapter(&mut self, index: usize) -> Result<Stage, PipelineError> {
        let cancel = self.begin_op()?;
        let result = self.regenerate_chapter_inner(index, &cancel).await;
        self.finish_op(result).await
    }

    async fn regenerate_chapter_inner(
        &mut self,
        index: usize,
        cancel: &CancelToken,
    ) -> Result<Stage, PipelineError> {
        let total = self.state.chapters.len();
        let chapter = self
            .state
            .chapters
            .get(index)
            .ok_or_else(|| PipelineError::validation("chapter index out of range"))?;
        if chapter.expanded_text.is_none() {
            return Err(PipelineError::validation(
                "chapter has no expanded text yet; use advance()",
            ));
        }
        let elements = self.state.elements.clone().unwrap_or_default();
        let text = stages::run_expand_chapter(
            &self.generation,
            &self.config.llm.model,
            chapter,
            &self.state.chapters[..index],
            &elements,
            index + 1 == total,
            cancel,
        )
        .await?;
        let chapter = &mut self.state.chapters[index];
        chapter.expanded_text = Some(text);
        chapter.expansion_count = 0;
        Ok(self.state.stage)
    }

    /// Best-effort illustration for one chapter. Completes with "no image"
    /// rather than failing; requires the optional image config section.
    pub async fn illustrate_chapter(&mut self, index: usize) -> Result<Stage, PipelineError> {
        let cancel = self.begin_op()?;
        let result = self.illustrate_chapter_inner(index, &cancel).await;
        self.finish_op(result).await
    }

    async fn illustrate_chapter_inner(
        &mut self,
        index: usize,
        cancel: &CancelToken,
    ) -> Result<Stage, PipelineError> {
        let image_config = self
            .config
            .image
            .clone()
            .ok_or_else(|| PipelineError::validation("illustration is not configured"))?;
        let image_client = self
            .image
            .as_deref()
            .ok_or_else(|| PipelineError::validation("illustration is not configured"))?;
        let chapter = self
            .state
            .chapters
            .get(index)
            .ok_or_else(|| PipelineError::validation("chapter index out of range"))?;
        let illustration = stages::run_illustrate(
            &self.generation,
            image_client,
            &image_config,
            &self.config.llm.model,
            chapter,
            cancel,
        )
        .await?;
        let chapter = &mut self.state.chapters[index];
        chapter.image_prompt = Some(illustration.prompt);
        chapter.image_url = illustration.url;
        Ok(self.state.stage)
    }

    /// Illustrates every expanded chapter plus a cover, pausing between
    /// consecutive image requests as a crude rate-limit backoff.
    pub async fn illustrate_all(&mut self) -> Result<Stage, PipelineError> {
        let cancel = self.begin_op()?;
        let result = self.illustrate_all_inner(&cancel).await;
        self.finish_op(result).await
    }

    async fn illustrate_all_inner(
        &mut self,
        cancel: &CancelToken,
    ) -> Result<Stage, PipelineError> {
        let image_config = self
            .config
            .image
            .clone()
            .ok_or_else(|| PipelineError::validation("illustration is not configured"))?;
        let delay = Duration::from_millis(image_config.request_delay_ms);
        let total = self.state.chapters.len();

        for index in 0..total {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if self.state.chapters[index].expanded_text.is_none() {
                continue;
            }
            let image_client = self
                .image
                .as_deref()
                .ok_or_else(|| PipelineError::validation("illustration is not configured"))?;
            let illustration = stages::run_illustrate(
                &self.generation,
                image_client,
                &image_config,
                &self.config.llm.model,
                &self.state.chapters[index],
                cancel,
            )
            .await?;
            let chapter = &mut self.state.chapters[index];
            chapter.image_prompt = Some(illustration.prompt);
            chapter.image_url = illustration.url;
            tokio::time::sleep(delay).await;
        }

        if let Some(elements) = self.state.elements.clone() {
            if let Some(image_client) = self.image.as_deref() {
                self.state.cover_image_url =
                    stages::run_cover(image_client, &image_config, &elements).await;
            }
        }
        Ok(self.state.stage)
    }

    fn condensed_prefix(&self) -> Result<String, PipelineError> {
        let condensed = self.state.condensed_draft.as_deref().ok_or_else(|| {
            PipelineError::validation("condensed draft missing; run summarization first")
        })?;
        Ok(prompts::truncate_to_char_boundary(
            condensed,
            self.config.pipeline.condensed_prefix_bytes,
        ))
    }

    /// Fire-and-forget persistence: a failed write is reported, never allowed
    /// to roll back or corrupt in-memory progress.
    async fn persist(&mut self) {
        let blob = match serde_json::to_string_pretty(&self.state) {
            Ok(blob) => blob,
            Err(e) => {
                log::warn!("failed to serialize pipeline state: {}", e);
                self.last_persist_error = Some(e.to_string());
                return;
            }
        };
        match self.storage.write(&self.state_path(), blob.as_bytes()).await {
            Ok(()) => self.last_persist_error = None,
            Err(e) => {
                log::warn!("failed to persist pipeline state: {}", e);
                self.last_persist_error = Some(e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LlmConfig, OllamaConfig, PipelineConfig};
    use crate::storage::MemoryStorage;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const DRAFT: &str = "Alice meets Bob. They fight a dragon. They win.";

    /// Routes canned answers by prompt content, the way the real stages
    /// distinguish themselves.
    #[derive(Debug)]
    struct StoryLlm {
        calls: Arc<Mutex<usize>>,
        break_outline: Arc<AtomicBool>,
    }

    impl StoryLlm {
        fn new() -> Self {
            Self {
                calls: Arc::new(Mutex::new(0)),
                break_outline: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    fn outline_json() -> String {
        let chapters: Vec<String> = (0..6)
            .map(|i| {
                format!(
                    r#"{{"title": "Chapter title {i}", "summary": "Alice and Bob face trial {i}. It tests them. They endure.", "keyEvents": ["trial {i}"], "characterTraits": ["Alice: brave", "Bob: loyal"], "timeline": "day {i}"}}"#
                )
            })
            .collect();
        format!("[{}]", chapters.join(","))
    }

    #[async_trait]
    impl LlmClient for StoryLlm {
        async fn chat(&self, _system: &str, user: &str, _model: &str) -> Result<String> {
            *self.calls.lock().unwrap() += 1;

            if user.contains("Condense the following draft excerpt") {
                return Ok("Alice and Bob meet, fight a dragon together, and win.".to_string());
            }
            if user.contains("Extract the story elements") {
                return Ok(r#"{
                    "characters": [
                        {"name": "Alice", "gender": "Female", "role": "hero", "traits": "brave"},
                        {"name": "Bob", "gender": "Male", "role": "ally", "traits": "loyal"}
                    ],
                    "keyEvents": ["Alice meets Bob", "They fight a dragon", "They win"],
                    "timeline": ["meeting", "battle", "victory"],
                    "uniqueDetails": ["the dragon guards a bridge"],
                    "mainStoryLines": ["friendship", "courage", "triumph"]
                }"#
                .to_string());
            }
            if user.contains("Plan a chapter outline")
                || user.contains("Re-plan chapters")
                || user.contains("Output strictly a JSON array")
            {
                if self.break_outline.load(Ordering::SeqCst) {
                    return Ok("nonsense".to_string());
                }
                return Ok(outline_json());
            }
            if user.contains("Write this chapter") {
                return Ok("Alice and Bob press onward through the valley. ".repeat(120));
            }
            if user.contains("Continue this chapter") {
                return Ok("More trials await them beyond the ridge. ".repeat(80));
            }
            Ok("unrouted prompt".to_string())
        }
    }

    fn test_config() -> Config {
        Config {
            build_folder: "build".to_string(),
            unattended: true,
            llm: LlmConfig {
                provider: "ollama".to_string(),
                model: "primary".to_string(),
                fallback_model: "fallback".to_string(),
                retry_count: 3,
                retry_delay_seconds: 0,
                gemini: None,
                ollama: Some(OllamaConfig {
                    base_url: "http://localhost:11434".to_string(),
                }),
                openai: None,
            },
            image: None,
            pipeline: PipelineConfig::default(),
        }
    }

    fn manager(storage: Arc<MemoryStorage>) -> (PipelineManager, Arc<AtomicBool>) {
        let llm = Box::new(StoryLlm::new());
        let break_outline = llm.break_outline.clone();
        (
            PipelineManager::new(test_config(), llm, None, storage),
            break_outline,
        )
    }

    async fn advance_to_outlined(mgr: &mut PipelineManager) {
        assert_eq!(mgr.advance().await.unwrap(), Stage::Summarizing);
        assert_eq!(mgr.advance().await.unwrap(), Stage::ElementsExtracted);
        assert_eq!(mgr.advance().await.unwrap(), Stage::Outlined);
    }

    #[tokio::test]
    async fn end_to_end_scenario() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut mgr, _) = manager(storage);
        mgr.start(DRAFT, None).await.unwrap();

        assert_eq!(mgr.advance().await.unwrap(), Stage::Summarizing);
        let condensed = mgr.state().condensed_draft.clone().unwrap();
        assert!(!condensed.trim().is_empty());

        assert_eq!(mgr.advance().await.unwrap(), Stage::ElementsExtracted);
        let elements = mgr.state().elements.clone().unwrap();
        let names: Vec<&str> = elements.characters.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"Alice") && names.contains(&"Bob"));

        assert_eq!(mgr.advance().await.unwrap(), Stage::Outlined);
        let count = mgr.state().chapters.len();
        assert!((6..=10).contains(&count));
        for chapter in &mgr.state().chapters {
            assert!(!chapter.title.is_empty());
            assert!(!chapter.summary.is_empty());
            assert!(!chapter.timeline.is_empty());
        }

        // First expansion references nothing from later chapters (there is
        // nothing to reference), and lands in the word budget.
        let stage = mgr.advance().await.unwrap();
        assert_eq!(stage, Stage::Expanding);
        let words = mgr.state().chapters[0]
            .expanded_text
            .as_ref()
            .unwrap()
            .split_whitespace()
            .count();
        assert!((800..=1500).contains(&words), "got {words} words");

        let mut stage = stage;
        while stage != Stage::Complete {
            stage = mgr.advance().await.unwrap();
        }
        assert_eq!(mgr.state().stage, Stage::Complete);
        assert!(mgr
            .state()
            .chapters
            .iter()
            .all(|c| c.expanded_text.is_some()));
    }

    #[tokio::test]
    async fn failed_outline_does_not_advance_stage() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut mgr, break_outline) = manager(storage);
        mgr.start(DRAFT, None).await.unwrap();

        assert_eq!(mgr.advance().await.unwrap(), Stage::Summarizing);
        assert_eq!(mgr.advance().await.unwrap(), Stage::ElementsExtracted);

        break_outline.store(true, Ordering::SeqCst);
        let err = mgr.advance().await.unwrap_err();
        assert!(matches!(err, PipelineError::Contract { .. }));

        assert_eq!(mgr.state().stage, Stage::ElementsExtracted);
        assert!(mgr.state().chapters.is_empty());
        // The raw offending text stays inspectable.
        assert_eq!(mgr.last_error().unwrap().raw.as_deref(), Some("nonsense"));

        // advance() doubles as retry.
        break_outline.store(false, Ordering::SeqCst);
        assert_eq!(mgr.advance().await.unwrap(), Stage::Outlined);
        assert!(mgr.last_error().is_none());
    }

    #[tokio::test]
    async fn progress_survives_a_new_manager() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut mgr, _) = manager(storage.clone());
        mgr.start(DRAFT, None).await.unwrap();
        advance_to_outlined(&mut mgr).await;
        let saved_chapters = mgr.state().chapters.clone();
        drop(mgr);

        let (mut resumed, _) = manager(storage);
        resumed.start(DRAFT, None).await.unwrap();
        assert_eq!(resumed.state().stage, Stage::Outlined);
        assert_eq!(resumed.state().chapters, saved_chapters);
    }

    #[tokio::test]
    async fn resume_keeps_saved_steering_instruction() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut mgr, _) = manager(storage.clone());
        mgr.start(DRAFT, Some("keep it grim".to_string())).await.unwrap();
        assert_eq!(mgr.advance().await.unwrap(), Stage::Summarizing);
        drop(mgr);

        let (mut resumed, _) = manager(storage);
        resumed
            .start(DRAFT, Some("make it a comedy".to_string()))
            .await
            .unwrap();
        assert_eq!(
            resumed.state().steering_instruction.as_deref(),
            Some("keep it grim")
        );
    }

    #[tokio::test]
    async fn stale_draft_is_surfaced_not_resumed() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut mgr, _) = manager(storage.clone());
        mgr.start(DRAFT, None).await.unwrap();
        assert_eq!(mgr.advance().await.unwrap(), Stage::Summarizing);
        drop(mgr);

        let (mut other, _) = manager(storage);
        let err = other.start("A completely different draft.", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::StaleDraft { .. }));

        // Reset discards the old progress, after which the new draft starts.
        other.reset().await.unwrap();
        other.start("A completely different draft.", None).await.unwrap();
        assert_eq!(other.state().stage, Stage::NotStarted);
    }

    #[tokio::test]
    async fn persistence_failure_is_reported_not_fatal() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut mgr, _) = manager(storage.clone());
        mgr.start(DRAFT, None).await.unwrap();

        storage.set_fail_writes(true);
        assert_eq!(mgr.advance().await.unwrap(), Stage::Summarizing);
        assert!(mgr.last_persist_error().is_some());
        assert!(mgr.state().condensed_draft.is_some());

        storage.set_fail_writes(false);
        assert_eq!(mgr.advance().await.unwrap(), Stage::ElementsExtracted);
        assert!(mgr.last_persist_error().is_none());
    }

    #[tokio::test]
    async fn expand_more_is_append_only() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut mgr, _) = manager(storage);
        mgr.start(DRAFT, None).await.unwrap();
        advance_to_outlined(&mut mgr).await;
        assert_eq!(mgr.advance().await.unwrap(), Stage::Expanding);

        let original = mgr.state().chapters[0].expanded_text.clone().unwrap();
        mgr.expand_more(0).await.unwrap();
        let after_first = mgr.state().chapters[0].expanded_text.clone().unwrap();
        assert!(after_first.len() > original.len());
        assert!(after_first.starts_with(&original));
        assert_eq!(mgr.state().chapters[0].expansion_count, 1);

        mgr.expand_more(0).await.unwrap();
        let after_second = mgr.state().chapters[0].expanded_text.clone().unwrap();
        assert!(after_second.len() > after_first.len());
        assert!(after_second.starts_with(&after_first));
        assert_eq!(mgr.state().chapters[0].expansion_count, 2);
    }

    #[tokio::test]
    async fn expand_more_rejects_unexpanded_chapter() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut mgr, _) = manager(storage);
        mgr.start(DRAFT, None).await.unwrap();
        advance_to_outlined(&mut mgr).await;

        let err = mgr.expand_more(3).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        let err = mgr.expand_more(99).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn regenerate_chapter_replaces_prose() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut mgr, _) = manager(storage);
        mgr.start(DRAFT, None).await.unwrap();
        advance_to_outlined(&mut mgr).await;
        assert_eq!(mgr.advance().await.unwrap(), Stage::Expanding);

        mgr.expand_more(0).await.unwrap();
        assert_eq!(mgr.state().chapters[0].expansion_count, 1);

        mgr.regenerate_chapter(0).await.unwrap();
        assert_eq!(mgr.state().chapters[0].expansion_count, 0);
        assert!(mgr.state().chapters[0].expanded_text.is_some());
    }

    #[tokio::test]
    async fn missing_credential_fails_before_any_call() {
        let storage = Arc::new(MemoryStorage::new());
        let llm = Box::new(StoryLlm::new());
        let calls = llm.calls.clone();
        let mut config = test_config();
        config.llm.ollama = None;
        let mut mgr = PipelineManager::new(config, llm, None, storage);
        mgr.start(DRAFT, None).await.unwrap();

        let err = mgr.advance().await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingCredential { .. }));
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_draft_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut mgr, _) = manager(storage);
        let err = mgr.start("   ", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn illustration_unconfigured_is_a_validation_error() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut mgr, _) = manager(storage);
        mgr.start(DRAFT, None).await.unwrap();
        advance_to_outlined(&mut mgr).await;
        assert_eq!(mgr.advance().await.unwrap(), Stage::Expanding);

        let err = mgr.illustrate_chapter(0).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}
