use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::audit::ConsistencyAuditor;
use crate::collaborators::{invoke, CollaboratorOp, Collaborators, ExtractedFrame};
use crate::config::PipelineSettings;
use crate::db::{
    ContextPayload, ContextRecord, ContextType, Database, DetectionPayload, MetadataPayload,
    ProcessingStatus, Stage, StageRun, StageRunStatus, TranscriptPayload, Video,
};
use crate::error::{PipelineError, PipelineResult};
use crate::{log_error, log_info, log_warn};

use super::controller::{PipelineHandle, PipelineProgress, ProcessingTracker, Reservation};
use super::sampling::{base_interval, expected_frame_count, sampling_interval};
use super::writer::write_stage;

const ENABLE_LOGS: bool = true;

/// Drives videos through extraction, captioning and transcription/detection.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    db: Database,
    collaborators: Collaborators,
    settings: PipelineSettings,
    auditor: ConsistencyAuditor,
    tracker: Arc<ProcessingTracker>,
    permits: Arc<Semaphore>,
}

struct DetectionPass {
    records: Vec<ContextRecord>,
    warnings: Vec<String>,
    /// True when at least one batch came back, so stored detections may be replaced.
    returned: bool,
    failure: Option<PipelineError>,
}

impl PipelineOrchestrator {
    pub fn new(db: Database, collaborators: Collaborators, settings: PipelineSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_videos.max(1)));
        Self {
            auditor: ConsistencyAuditor::new(db.clone()),
            db,
            collaborators,
            settings,
            tracker: Arc::new(ProcessingTracker::new()),
            permits,
        }
    }

    pub fn tracker(&self) -> &ProcessingTracker {
        &self.tracker
    }

    fn timeout(&self, op: CollaboratorOp) -> Duration {
        self.settings.timeout_for(op)
    }

    /// Stage 1 in the foreground, then the rest in the background. The
    /// video's slot in the tracker is held from the first stage to the last.
    pub async fn process_video(&self, video_id: &str) -> PipelineResult<StageRun> {
        let reservation = self.reserve(video_id, Stage::Extraction)?;
        let run = self
            .run_stage(video_id, Stage::Extraction, reservation.cancel_token())
            .await?;
        self.hand_off(reservation, Stage::Captioning);
        Ok(run)
    }

    /// Run one stage and record its outcome in `stage_runs`.
    pub async fn run_stage(
        &self,
        video_id: &str,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> PipelineResult<StageRun> {
        let video = self.db.require_video(video_id).await?;
        self.db.advance_video_status(video_id, stage.status()).await?;

        let mut run = StageRun::started(video_id, stage);
        self.record(&run).await;
        log_info!("[{stage}] video {video_id}: stage started");

        let result = match stage {
            Stage::Extraction => self.extraction(&video, &mut run, cancel).await,
            Stage::Captioning => self.captioning(&video, &mut run, cancel).await,
            Stage::TranscriptionDetection => {
                self.transcription_detection(&video, &mut run, cancel).await
            }
        };

        if stage == Stage::Extraction {
            if let Err(err) = &result {
                self.fail_video_without_frames(video_id, err).await;
            }
        } else if result.is_ok() {
            self.audit(video_id, &mut run).await;
        }

        self.conclude(run, result).await
    }

    /// Re-run a single stage on demand. Status never moves backwards; a new
    /// extraction also refreshes the stages that depend on its frames.
    pub async fn reprocess_stage(&self, video_id: &str, stage: Stage) -> PipelineResult<StageRun> {
        let reservation = self.reserve(video_id, stage)?;
        let run = self
            .run_stage(video_id, stage, reservation.cancel_token())
            .await?;
        match stage {
            Stage::Extraction => self.hand_off(reservation, Stage::Captioning),
            Stage::TranscriptionDetection => {
                self.db
                    .advance_video_status(video_id, ProcessingStatus::Complete)
                    .await?;
            }
            Stage::Captioning => {}
        }
        Ok(run)
    }

    fn reserve(&self, video_id: &str, stage: Stage) -> PipelineResult<Reservation<'_>> {
        self.tracker.reserve(video_id, stage).ok_or_else(|| {
            PipelineError::query(
                format!("video {video_id} is still processing"),
                Some("wait for processing to finish or cancel it first".into()),
            )
        })
    }

    /// Start `from` and every later stage on a background task.
    ///
    /// Returns false when the video already has a run in flight.
    pub fn spawn_background(&self, video_id: &str, from: Stage) -> bool {
        let (handle, start) = self.launch(video_id, from);
        if !self.tracker.register(video_id, handle) {
            log_warn!("[{from}] video {video_id}: a run is already active");
            return false;
        }
        let _ = start.send(());
        true
    }

    /// Continue from `from` in the background, keeping the reserved slot.
    fn hand_off(&self, reservation: Reservation<'_>, from: Stage) {
        let (handle, start) = self.launch(reservation.video_id(), from);
        reservation.into_background(handle);
        let _ = start.send(());
    }

    /// Spawn a background run that waits for `start` before touching the
    /// video; dropping the sender abandons it.
    fn launch(&self, video_id: &str, from: Stage) -> (PipelineHandle, oneshot::Sender<()>) {
        let cancel_token = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(PipelineProgress::Queued);
        let (start_tx, start_rx) = oneshot::channel();

        let orchestrator = self.clone();
        let task_video_id = video_id.to_string();
        let task_token = cancel_token.clone();
        let handle = tokio::spawn(async move {
            if start_rx.await.is_err() {
                return;
            }
            orchestrator
                .run_background(&task_video_id, from, task_token, progress_tx)
                .await;
        });

        (PipelineHandle::new(handle, cancel_token, progress_rx), start_tx)
    }

    async fn run_background(
        &self,
        video_id: &str,
        from: Stage,
        cancel: CancellationToken,
        progress: watch::Sender<PipelineProgress>,
    ) {
        let _permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    progress.send_replace(PipelineProgress::Failed("pipeline is shut down".into()));
                    return;
                }
            },
            _ = cancel.cancelled() => {
                progress.send_replace(PipelineProgress::Cancelled);
                return;
            }
        };

        let stages = std::iter::once(from).chain(from.following().iter().copied());
        for stage in stages {
            if cancel.is_cancelled() {
                log_info!("[{stage}] video {video_id}: cancelled before stage start");
                progress.send_replace(PipelineProgress::Cancelled);
                return;
            }
            progress.send_replace(PipelineProgress::Running(stage));

            match self.run_stage(video_id, stage, &cancel).await {
                Ok(run) => {
                    log_info!(
                        "[{stage}] video {video_id}: {} ({}/{} records)",
                        run.status.as_str(),
                        run.stored,
                        run.expected
                    );
                }
                Err(PipelineError::Cancelled(_)) => {
                    progress.send_replace(PipelineProgress::Cancelled);
                    return;
                }
                Err(err) if err.is_stage_local() && stage != Stage::Extraction => {
                    log_warn!("[{stage}] video {video_id}: stage failed, continuing: {err}");
                }
                Err(err) => {
                    log_error!("[{stage}] video {video_id}: processing stopped: {err}");
                    progress.send_replace(PipelineProgress::Failed(err.to_string()));
                    return;
                }
            }
        }

        match self
            .db
            .advance_video_status(video_id, ProcessingStatus::Complete)
            .await
        {
            Ok(status) => {
                log_info!("video {video_id}: background processing finished with status {status}");
                progress.send_replace(PipelineProgress::Finished(status));
            }
            Err(err) => {
                log_error!("video {video_id}: failed to mark processing complete: {err}");
                progress.send_replace(PipelineProgress::Failed(err.to_string()));
            }
        }
    }

    async fn extraction(
        &self,
        video: &Video,
        run: &mut StageRun,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        let video_id = video.id.as_str();
        let path = PathBuf::from(&video.storage_path);
        let mut records = Vec::new();

        let metadata = {
            let frames = self.collaborators.frames.clone();
            let path = path.clone();
            invoke(
                CollaboratorOp::ExtractFrames,
                self.timeout(CollaboratorOp::ExtractFrames),
                move || frames.metadata(&path),
            )
            .await
        };

        let duration = match metadata {
            Ok(metadata) => {
                records.push(ContextRecord::new(
                    video_id,
                    0.0,
                    ContextPayload::Metadata(MetadataPayload {
                        duration: metadata.duration,
                        fps: metadata.fps,
                        width: metadata.width,
                        height: metadata.height,
                    }),
                ));
                if metadata.duration.is_finite() && metadata.duration > 0.0 {
                    self.db.set_video_duration(video_id, metadata.duration).await?;
                    Some(metadata.duration)
                } else {
                    None
                }
            }
            Err(err) => {
                log_warn!("[extraction] video {video_id}: metadata unavailable: {err}");
                run.warnings.push(format!("metadata unavailable: {err}"));
                None
            }
        };

        let max_frames = self.settings.max_frames.max(1);
        let interval = duration
            .map(|duration| sampling_interval(duration, max_frames))
            .unwrap_or_else(|| base_interval(0.0));

        let extracted = {
            let frames = self.collaborators.frames.clone();
            let path = path.clone();
            invoke(
                CollaboratorOp::ExtractFrames,
                self.timeout(CollaboratorOp::ExtractFrames),
                move || frames.extract(&path, interval, max_frames),
            )
            .await
        };

        let mut frames = match extracted {
            Ok(frames) => frames,
            Err(err) => {
                log_warn!("[extraction] video {video_id}: interval extraction failed: {err}");
                run.warnings.push(format!("interval extraction failed: {err}"));
                Vec::new()
            }
        };
        frames.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        frames.truncate(max_frames);

        if frames.is_empty() {
            let extractor = self.collaborators.frames.clone();
            let fallback = invoke(
                CollaboratorOp::ExtractFrames,
                self.timeout(CollaboratorOp::ExtractFrames),
                move || extractor.extract_at(&path, 0.0),
            )
            .await;
            match fallback {
                Ok(image_path) => {
                    log_warn!("[extraction] video {video_id}: using a single fallback frame at 0:00");
                    run.warnings
                        .push("no frames at the sampling interval; stored one frame at 0:00".into());
                    frames.push(ExtractedFrame {
                        timestamp: 0.0,
                        image_path,
                    });
                }
                Err(err) => {
                    return Err(PipelineError::ExtractionFailed {
                        video_id: video_id.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        run.expected = duration
            .map(|duration| expected_frame_count(duration, max_frames))
            .unwrap_or(frames.len()) as u64;
        records.extend(
            frames
                .into_iter()
                .map(|frame| ContextRecord::frame(video_id, frame.timestamp, frame.image_path)),
        );

        // Captions and detections describe the old frames; they go in the
        // same transaction and the background run rebuilds them.
        let mut types = Stage::Extraction.context_types().to_vec();
        types.extend_from_slice(Stage::Extraction.invalidates());

        self.ensure_not_cancelled(video_id, cancel)?;
        let outcome = write_stage(
            &self.db,
            video_id,
            Stage::Extraction.as_str(),
            &types,
            records,
        )
        .await?;
        run.warnings.extend(outcome.warnings);

        let stored_frames = self
            .db
            .query_context(video_id, Some(ContextType::Frame), None)
            .await?;
        run.stored = stored_frames.len() as u64;

        let Some(first_frame) = stored_frames.first().and_then(ContextRecord::as_frame) else {
            return Err(PipelineError::ExtractionFailed {
                video_id: video_id.to_string(),
                reason: "every extracted frame failed validation".into(),
            });
        };
        self.db.set_thumbnail(video_id, &first_frame.image_path).await?;
        Ok(())
    }

    async fn captioning(
        &self,
        video: &Video,
        run: &mut StageRun,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        let video_id = video.id.as_str();
        let frames = self.frame_paths(video_id).await?;
        run.expected = frames.len() as u64;

        let mut records = Vec::with_capacity(frames.len());
        let mut failure = None;

        for (batch_index, batch) in frames.chunks(self.settings.caption_batch_size.max(1)).enumerate() {
            self.ensure_not_cancelled(video_id, cancel)?;

            let captioner = self.collaborators.captioner.clone();
            let paths: Vec<String> = batch.iter().map(|(_, path)| path.clone()).collect();
            let outputs = invoke(
                CollaboratorOp::Caption,
                self.timeout(CollaboratorOp::Caption),
                move || captioner.caption_batch(&paths),
            )
            .await;

            match outputs {
                Ok(outputs) => {
                    if outputs.len() != batch.len() {
                        run.warnings.push(format!(
                            "caption batch {batch_index} returned {} results for {} frames",
                            outputs.len(),
                            batch.len()
                        ));
                    }
                    for ((timestamp, path), output) in batch.iter().zip(outputs) {
                        records.push(ContextRecord::caption(
                            video_id,
                            *timestamp,
                            output.text,
                            output.confidence,
                            Some(path.clone()),
                        ));
                    }
                }
                Err(err) => {
                    log_warn!("[captioning] video {video_id}: batch {batch_index} failed: {err}");
                    run.warnings.push(format!("caption batch {batch_index} failed: {err}"));
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            if records.is_empty() {
                // Nothing new to store; keep whatever an earlier run wrote.
                return Err(err);
            }
        }

        self.ensure_not_cancelled(video_id, cancel)?;
        let outcome = write_stage(
            &self.db,
            video_id,
            Stage::Captioning.as_str(),
            Stage::Captioning.context_types(),
            records,
        )
        .await?;
        run.stored = outcome.stored;
        run.warnings.extend(outcome.warnings);
        Ok(())
    }

    async fn transcription_detection(
        &self,
        video: &Video,
        run: &mut StageRun,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        let video_id = video.id.as_str();
        let frames = self.frame_paths(video_id).await?;

        let transcription = {
            let transcriber = self.collaborators.transcriber.clone();
            let path = PathBuf::from(&video.storage_path);
            invoke(
                CollaboratorOp::Transcribe,
                self.timeout(CollaboratorOp::Transcribe),
                move || transcriber.transcribe(&path),
            )
        };
        let detection = self.detect_objects(video_id, &frames, cancel);
        let (transcription, detection) = tokio::join!(transcription, detection);

        let mut types = Vec::new();
        let mut records = Vec::new();
        let mut failure = None;

        match transcription {
            Ok(segments) => {
                types.push(ContextType::TranscriptSegment);
                records.extend(segments.into_iter().map(|segment| {
                    ContextRecord::transcript_segment(
                        video_id,
                        TranscriptPayload {
                            start: segment.start,
                            end: segment.end,
                            text: segment.text,
                            confidence: segment.confidence,
                        },
                    )
                }));
            }
            Err(err) => {
                log_warn!("[transcription_detection] video {video_id}: transcription failed: {err}");
                run.warnings.push(format!("transcription failed: {err}"));
                failure = Some(err);
            }
        }

        run.warnings.extend(detection.warnings);
        if detection.returned {
            types.push(ContextType::ObjectDetection);
            records.extend(detection.records);
        }
        if failure.is_none() {
            failure = detection.failure;
        }

        if types.is_empty() {
            return Err(failure.unwrap_or_else(|| PipelineError::Collaborator {
                op: CollaboratorOp::Transcribe,
                message: "no collaborator returned output".into(),
            }));
        }

        // Sort so each type is inserted in timestamp order.
        records.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        run.expected = records.len() as u64;

        self.ensure_not_cancelled(video_id, cancel)?;
        let outcome = write_stage(
            &self.db,
            video_id,
            Stage::TranscriptionDetection.as_str(),
            &types,
            records,
        )
        .await?;
        run.stored = outcome.stored;
        run.warnings.extend(outcome.warnings);
        Ok(())
    }

    async fn detect_objects(
        &self,
        video_id: &str,
        frames: &[(f64, String)],
        cancel: &CancellationToken,
    ) -> DetectionPass {
        let mut pass = DetectionPass {
            records: Vec::new(),
            warnings: Vec::new(),
            returned: frames.is_empty(),
            failure: None,
        };

        for (batch_index, batch) in frames.chunks(self.settings.detection_batch_size.max(1)).enumerate() {
            if cancel.is_cancelled() {
                pass.failure = Some(PipelineError::Cancelled(video_id.to_string()));
                break;
            }

            let detector = self.collaborators.detector.clone();
            let paths: Vec<String> = batch.iter().map(|(_, path)| path.clone()).collect();
            let outputs = invoke(
                CollaboratorOp::DetectObjects,
                self.timeout(CollaboratorOp::DetectObjects),
                move || detector.detect_batch(&paths),
            )
            .await;

            match outputs {
                Ok(outputs) => {
                    pass.returned = true;
                    if outputs.len() != batch.len() {
                        pass.warnings.push(format!(
                            "detection batch {batch_index} returned {} results for {} frames",
                            outputs.len(),
                            batch.len()
                        ));
                    }
                    for ((timestamp, path), output) in batch.iter().zip(outputs) {
                        if output.objects.is_empty() {
                            continue;
                        }
                        pass.records.push(ContextRecord::new(
                            video_id,
                            *timestamp,
                            ContextPayload::ObjectDetection(DetectionPayload {
                                objects: output.objects,
                                image_path: Some(path.clone()),
                            }),
                        ));
                    }
                }
                Err(err) => {
                    log_warn!(
                        "[transcription_detection] video {video_id}: detection batch {batch_index} failed: {err}"
                    );
                    pass.warnings.push(format!("detection batch {batch_index} failed: {err}"));
                    pass.failure = Some(err);
                    break;
                }
            }
        }

        pass
    }

    async fn frame_paths(&self, video_id: &str) -> PipelineResult<Vec<(f64, String)>> {
        let frames = self
            .db
            .query_context(video_id, Some(ContextType::Frame), None)
            .await?;
        Ok(frames
            .iter()
            .filter_map(|record| {
                record
                    .as_frame()
                    .map(|frame| (record.timestamp, frame.image_path.clone()))
            })
            .collect())
    }

    fn ensure_not_cancelled(&self, video_id: &str, cancel: &CancellationToken) -> PipelineResult<()> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(video_id.to_string()));
        }
        Ok(())
    }

    /// Stage 1 is the only video-fatal stage: with no frames stored there is
    /// nothing to caption or chat about.
    async fn fail_video_without_frames(&self, video_id: &str, err: &PipelineError) {
        if matches!(err, PipelineError::NotFound { .. } | PipelineError::Cancelled(_)) {
            return;
        }
        let frames = self
            .db
            .count_context(video_id, ContextType::Frame)
            .await
            .unwrap_or(0);
        if frames > 0 {
            return;
        }
        log_error!("[extraction] video {video_id}: no frames stored, marking video as error: {err}");
        if let Err(status_err) = self
            .db
            .update_video_status(video_id, ProcessingStatus::Error)
            .await
        {
            log_error!("[extraction] video {video_id}: failed to set error status: {status_err}");
        }
    }

    async fn conclude(
        &self,
        mut run: StageRun,
        result: PipelineResult<()>,
    ) -> PipelineResult<StageRun> {
        run.finished_at = Some(Utc::now());
        match &result {
            Ok(()) => {
                run.status = if run.warnings.is_empty() && run.stored >= run.expected {
                    StageRunStatus::Succeeded
                } else {
                    StageRunStatus::Partial
                };
            }
            Err(PipelineError::Cancelled(_)) => {
                run.status = StageRunStatus::Cancelled;
            }
            Err(err) => {
                log_error!("[{}] video {}: stage failed: {err}", run.stage, run.video_id);
                run.status = StageRunStatus::Failed;
                run.warnings.push(err.to_string());
            }
        }
        self.record(&run).await;
        result.map(|()| run)
    }

    /// Critical consistency issues become warnings on the stage run.
    async fn audit(&self, video_id: &str, run: &mut StageRun) {
        let stage = run.stage;
        match self.auditor.verify_or_raise(video_id).await {
            Ok(_) => {}
            Err(PipelineError::Consistency { issues, .. }) => {
                log_error!(
                    "[{stage}] video {video_id}: consistency check failed: {}",
                    issues.join("; ")
                );
                run.warnings
                    .extend(issues.into_iter().map(|issue| format!("consistency: {issue}")));
            }
            Err(err) => {
                log_warn!("[{stage}] video {video_id}: consistency check unavailable: {err}");
            }
        }
    }

    async fn record(&self, run: &StageRun) {
        if let Err(err) = self.db.record_stage_run(run).await {
            log_warn!(
                "[{}] video {}: failed to record stage run: {err}",
                run.stage,
                run.video_id
            );
        }
    }
}
