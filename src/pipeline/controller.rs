use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use log::info;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::{ProcessingStatus, Stage};

/// What a background run is doing right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum PipelineProgress {
    Queued,
    Running(Stage),
    Finished(ProcessingStatus),
    Cancelled,
    Failed(String),
}

impl PipelineProgress {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineProgress::Finished(_) | PipelineProgress::Cancelled | PipelineProgress::Failed(_)
        )
    }
}

/// Handle to one video's background stages.
pub struct PipelineHandle {
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
    progress_rx: watch::Receiver<PipelineProgress>,
}

impl PipelineHandle {
    pub fn new(
        handle: JoinHandle<()>,
        cancel_token: CancellationToken,
        progress_rx: watch::Receiver<PipelineProgress>,
    ) -> Self {
        Self {
            handle,
            cancel_token,
            progress_rx,
        }
    }

    /// Finished once the task exits or has reported a terminal state.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished() || self.progress_rx.borrow().is_terminal()
    }

    pub fn progress(&self) -> PipelineProgress {
        self.progress_rx.borrow().clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

enum TrackedRun {
    /// A stage running on the caller's task, holding the slot through a [`Reservation`].
    Foreground {
        stage: Stage,
        cancel_token: CancellationToken,
    },
    Background(PipelineHandle),
}

impl TrackedRun {
    fn is_finished(&self) -> bool {
        match self {
            TrackedRun::Foreground { .. } => false,
            TrackedRun::Background(handle) => handle.is_finished(),
        }
    }

    fn cancel(&self) {
        match self {
            TrackedRun::Foreground { cancel_token, .. } => cancel_token.cancel(),
            TrackedRun::Background(handle) => handle.cancel(),
        }
    }
}

/// Claim on a video's processing slot for foreground work.
///
/// Dropping it frees the slot; [`Reservation::into_background`] hands the
/// slot to a background run without ever leaving it empty.
pub struct Reservation<'a> {
    tracker: &'a ProcessingTracker,
    video_id: String,
    cancel_token: CancellationToken,
    held: bool,
}

impl Reservation<'_> {
    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn into_background(mut self, handle: PipelineHandle) {
        self.tracker
            .lock()
            .insert(self.video_id.clone(), TrackedRun::Background(handle));
        self.held = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let mut runs = self.tracker.lock();
        if matches!(runs.get(&self.video_id), Some(TrackedRun::Foreground { .. })) {
            runs.remove(&self.video_id);
        }
    }
}

/// Foreground and background runs keyed by video id. A video holds at most
/// one slot; every claim is checked and taken under one lock.
#[derive(Default)]
pub struct ProcessingTracker {
    runs: Mutex<HashMap<String, TrackedRun>>,
}

impl ProcessingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrackedRun>> {
        match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Claim the slot for a foreground `stage`, or `None` if the video is busy.
    pub fn reserve(&self, video_id: &str, stage: Stage) -> Option<Reservation<'_>> {
        let mut runs = self.lock();
        runs.retain(|_, tracked| !tracked.is_finished());
        if runs.contains_key(video_id) {
            return None;
        }
        let cancel_token = CancellationToken::new();
        runs.insert(
            video_id.to_string(),
            TrackedRun::Foreground {
                stage,
                cancel_token: cancel_token.clone(),
            },
        );
        Some(Reservation {
            tracker: self,
            video_id: video_id.to_string(),
            cancel_token,
            held: true,
        })
    }

    /// Track a new background run. Returns false, cancelling `handle` and
    /// leaving the tracker untouched, when the video already holds a slot.
    pub fn register(&self, video_id: &str, handle: PipelineHandle) -> bool {
        let mut runs = self.lock();
        runs.retain(|_, tracked| !tracked.is_finished());
        if runs.contains_key(video_id) {
            handle.cancel();
            return false;
        }
        runs.insert(video_id.to_string(), TrackedRun::Background(handle));
        true
    }

    pub fn is_running(&self, video_id: &str) -> bool {
        self.lock()
            .get(video_id)
            .map(|tracked| !tracked.is_finished())
            .unwrap_or(false)
    }

    pub fn progress(&self, video_id: &str) -> Option<PipelineProgress> {
        self.lock().get(video_id).map(|tracked| match tracked {
            TrackedRun::Foreground { stage, .. } => PipelineProgress::Running(*stage),
            TrackedRun::Background(handle) => handle.progress(),
        })
    }

    /// Ask a run to stop at its next checkpoint. Writes already issued finish.
    pub fn cancel(&self, video_id: &str) -> bool {
        match self.lock().get(video_id) {
            Some(tracked) if !tracked.is_finished() => {
                tracked.cancel();
                info!("Cancellation requested for video {video_id}");
                true
            }
            _ => false,
        }
    }

    /// Wait until the background run for `video_id` reports a terminal state.
    ///
    /// Returns the final progress, or `None` when no background run is tracked.
    pub async fn wait(&self, video_id: &str) -> Option<PipelineProgress> {
        let mut progress_rx = match self.lock().get(video_id)? {
            TrackedRun::Background(handle) => handle.progress_rx.clone(),
            TrackedRun::Foreground { .. } => return None,
        };
        let finished = progress_rx
            .wait_for(PipelineProgress::is_terminal)
            .await
            .map(|progress| progress.clone())
            .ok();
        // Sender dropped without a terminal update: the task ended abnormally.
        Some(finished.unwrap_or_else(|| progress_rx.borrow().clone()))
    }

    /// Cancel every run and wait for background tasks to exit.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, TrackedRun)> = self.lock().drain().collect();
        for (video_id, tracked) in drained {
            tracked.cancel();
            if let TrackedRun::Background(handle) = tracked {
                if let Err(err) = handle.handle.await {
                    log::error!("Pipeline task for video {video_id} failed to join: {err}");
                }
            }
        }
    }
}
