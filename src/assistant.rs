//! The upward surface: one object wiring the store, pipeline, retrieval and
//! conversation together from injected collaborators.

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::audit::{CompletenessReport, ConsistencyAuditor};
use crate::collaborators::{CollaboratorOp, Collaborators};
use crate::config::Settings;
use crate::conversation::{ChatResponse, ConversationOrchestrator};
use crate::db::{Database, ProcessingStatus, Stage, StageRun, Video};
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::{PipelineOrchestrator, PipelineProgress};
use crate::retrieval::ContextRetriever;
use crate::utils::init_logging;
use crate::{log_info, log_warn};

const ENABLE_LOGS: bool = true;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatus {
    pub video: Video,
    pub processing_status: ProcessingStatus,
    pub report: CompletenessReport,
    pub stages: Vec<StageRun>,
    pub background_running: bool,
    pub progress: Option<PipelineProgress>,
}

pub struct VideoAssistant {
    db: Database,
    collaborators: Collaborators,
    pipeline: PipelineOrchestrator,
    auditor: ConsistencyAuditor,
    conversation: ConversationOrchestrator,
}

impl VideoAssistant {
    /// Open the on-disk store under `settings.data_dir` and wire everything up.
    ///
    /// This is the application entry point: it also installs the logger at
    /// `settings.log_level()` unless one is already set. Embedders calling
    /// [`VideoAssistant::with_database`] set up logging themselves.
    pub fn open(settings: Settings, collaborators: Collaborators) -> PipelineResult<Self> {
        init_logging(settings.log_level());
        let db = Database::new(settings.database_path())
            .map_err(|err| PipelineError::from_store("open database", 1, err))?
            .with_write_policy(settings.pipeline.write_policy());
        Ok(Self::with_database(db, settings, collaborators))
    }

    pub fn with_database(db: Database, settings: Settings, collaborators: Collaborators) -> Self {
        let completion_timeout = settings.pipeline.timeout_for(CollaboratorOp::Complete);
        let retriever = ContextRetriever::new(db.clone(), settings.retrieval.clone());
        let conversation = ConversationOrchestrator::new(
            db.clone(),
            retriever,
            collaborators.language_model.clone(),
            settings.conversation.clone(),
            completion_timeout,
        );
        let pipeline = PipelineOrchestrator::new(db.clone(), collaborators.clone(), settings.pipeline);

        Self {
            auditor: ConsistencyAuditor::new(db.clone()),
            db,
            collaborators,
            pipeline,
            conversation,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Store the bytes, register the video and run Stage 1 before returning.
    /// Captioning and Stage 3 continue in the background.
    ///
    /// A Stage 1 failure still returns the id; the video is then in `error`.
    pub async fn upload(&self, filename: &str, bytes: &[u8]) -> PipelineResult<String> {
        let video_id = Uuid::new_v4().to_string();
        let storage_path = {
            let files = self.collaborators.files.clone();
            let (id, name, data) = (video_id.clone(), filename.to_string(), bytes.to_vec());
            tokio::task::spawn_blocking(move || files.save(&id, &name, &data))
                .await
                .map_err(|err| PipelineError::persistence("save upload", 1, &anyhow::Error::new(err)))?
                .map_err(|err| PipelineError::persistence("save upload", 1, &err))?
        };

        let video = Video::new(
            video_id.clone(),
            filename.to_string(),
            storage_path.to_string_lossy().into_owned(),
            Utc::now(),
        );
        self.db.upsert_video(&video).await?;
        log_info!("video {video_id}: uploaded {filename} ({} bytes)", bytes.len());

        if let Err(err) = self.pipeline.process_video(&video_id).await {
            log_warn!("[extraction] video {video_id}: upload processing failed: {err}");
        }
        Ok(video_id)
    }

    pub async fn get_status(&self, video_id: &str) -> PipelineResult<VideoStatus> {
        let video = self.db.require_video(video_id).await?;
        let report = self.auditor.check_completeness(video_id).await?;
        let stages = self.db.get_stage_runs(video_id).await?;
        let tracker = self.pipeline.tracker();

        Ok(VideoStatus {
            processing_status: video.status,
            video,
            report,
            stages,
            background_running: tracker.is_running(video_id),
            progress: tracker.progress(video_id),
        })
    }

    pub async fn chat(&self, message: &str, video_id: &str) -> PipelineResult<ChatResponse> {
        self.conversation.chat(message, video_id).await
    }

    pub async fn reset_memory(&self, video_id: &str) -> PipelineResult<u64> {
        self.db.require_video(video_id).await?;
        self.conversation.reset_memory(video_id).await
    }

    /// Returns false when nothing was running for the video.
    pub fn cancel_processing(&self, video_id: &str) -> bool {
        self.pipeline.tracker().cancel(video_id)
    }

    /// Wait for the background stages of a video, if any are tracked.
    pub async fn wait_for_processing(&self, video_id: &str) -> Option<PipelineProgress> {
        self.pipeline.tracker().wait(video_id).await
    }

    pub async fn reprocess_stage(&self, video_id: &str, stage: Stage) -> PipelineResult<StageRun> {
        self.pipeline.reprocess_stage(video_id, stage).await
    }

    /// Remove a video with all its records, turns and stored files.
    pub async fn delete_video(&self, video_id: &str) -> PipelineResult<bool> {
        if self.pipeline.tracker().cancel(video_id) {
            self.pipeline.tracker().wait(video_id).await;
        }
        let removed = self.db.delete_video(video_id).await?;
        if removed {
            let files = self.collaborators.files.clone();
            let id = video_id.to_string();
            let cleanup = tokio::task::spawn_blocking(move || files.remove(&id)).await;
            match cleanup {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log_warn!("video {video_id}: failed to remove stored files: {err:#}"),
                Err(err) => log_warn!("video {video_id}: file cleanup did not finish: {err}"),
            }
            log_info!("video {video_id}: deleted");
        }
        Ok(removed)
    }

    /// Restart videos left mid-pipeline by a previous process, each from the
    /// stage its status says was interrupted. Returns the ids resumed.
    pub async fn recover_interrupted(&self) -> PipelineResult<Vec<String>> {
        let interrupted = self
            .db
            .list_videos_with_status(&[
                ProcessingStatus::Pending,
                ProcessingStatus::Extracting,
                ProcessingStatus::Captioning,
                ProcessingStatus::Transcribing,
            ])
            .await?;

        let mut resumed = Vec::new();
        for video in interrupted {
            let from = match video.status {
                ProcessingStatus::Captioning => Stage::Captioning,
                ProcessingStatus::Transcribing => Stage::TranscriptionDetection,
                _ => Stage::Extraction,
            };
            if self.pipeline.spawn_background(&video.id, from) {
                log_info!("[{from}] video {}: resuming interrupted processing", video.id);
                resumed.push(video.id);
            }
        }
        Ok(resumed)
    }

    /// Cancel background work and wait for it to stop.
    pub async fn shutdown(&self) {
        self.pipeline.tracker().shutdown().await;
    }
}
