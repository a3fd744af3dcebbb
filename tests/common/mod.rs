#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use framechat::collaborators::{
    CaptionOutput, DetectionOutput, ExtractedFrame, TranscriptOutput, VideoMetadata,
};
use framechat::db::{BoundingBox, ContextCounts, DetectedObject, ProcessingStatus};
use framechat::pipeline::PipelineProgress;
use framechat::{
    Captioner, Collaborators, FrameExtractor, LanguageModel, LocalFileStore, ObjectDetector,
    Settings, Transcriber, VideoAssistant,
};
use tempfile::TempDir;

/// Blocks collaborator calls until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    signal: Condvar,
}

impl Gate {
    pub fn closed() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.signal.notify_all();
    }

    pub fn close(&self) {
        *self.open.lock().unwrap() = false;
    }

    fn pass(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.signal.wait(open).unwrap();
        }
    }
}

fn frame_name(timestamp: f64) -> String {
    format!("frame_{timestamp:.1}.jpg")
}

fn timestamp_of(image_path: &str) -> f64 {
    Path::new(image_path)
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix("frame_"))
        .and_then(|name| name.strip_suffix(".jpg"))
        .and_then(|value| value.parse().ok())
        .unwrap_or(0.0)
}

pub struct FakeFrames {
    duration: Mutex<f64>,
    broken: bool,
}

impl FakeFrames {
    pub fn new(duration: f64) -> Self {
        Self {
            duration: Mutex::new(duration),
            broken: false,
        }
    }

    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::new(60.0)
        }
    }

    /// Later extractions see a clip of this length.
    pub fn set_duration(&self, duration: f64) {
        *self.duration.lock().unwrap() = duration;
    }

    fn duration(&self) -> f64 {
        *self.duration.lock().unwrap()
    }
}

impl FrameExtractor for FakeFrames {
    fn extract(&self, video_path: &Path, interval_secs: f64, max_frames: usize) -> Result<Vec<ExtractedFrame>> {
        if self.broken {
            bail!("decoder could not open {}", video_path.display());
        }
        let duration = self.duration();
        let mut frames = Vec::new();
        let mut timestamp = 0.0;
        while timestamp < duration && frames.len() < max_frames {
            frames.push(ExtractedFrame {
                timestamp,
                image_path: self.extract_at(video_path, timestamp)?,
            });
            timestamp += interval_secs;
        }
        Ok(frames)
    }

    fn extract_at(&self, video_path: &Path, timestamp: f64) -> Result<String> {
        if self.broken {
            bail!("decoder could not open {}", video_path.display());
        }
        let dir = video_path.parent().unwrap_or_else(|| Path::new("/frames"));
        Ok(dir.join(frame_name(timestamp)).to_string_lossy().into_owned())
    }

    fn metadata(&self, video_path: &Path) -> Result<VideoMetadata> {
        if self.broken {
            bail!("no metadata for {}", video_path.display());
        }
        Ok(VideoMetadata {
            duration: self.duration(),
            fps: 30.0,
            width: 1280,
            height: 720,
        })
    }
}

/// Dog in the first half of the clip, a person talking in the second.
pub fn scene_at(timestamp: f64) -> &'static str {
    if timestamp < 30.0 {
        "a dog running across the park"
    } else {
        "a person talking to the camera"
    }
}

#[derive(Default)]
pub struct FakeCaptioner {
    pub gate: Option<Arc<Gate>>,
    pub broken: AtomicBool,
    /// Batches that reached the captioner, counted before the gate.
    pub entered: AtomicUsize,
    /// Batches that got past the gate.
    pub calls: AtomicUsize,
}

impl FakeCaptioner {
    pub fn broken() -> Self {
        Self {
            broken: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }
}

impl Captioner for FakeCaptioner {
    fn caption_batch(&self, image_paths: &[String]) -> Result<Vec<CaptionOutput>> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            bail!("captioning model unavailable");
        }
        Ok(image_paths
            .iter()
            .map(|path| CaptionOutput {
                text: scene_at(timestamp_of(path)).to_string(),
                confidence: 0.9,
            })
            .collect())
    }
}

#[derive(Default)]
pub struct FakeTranscriber {
    pub delay: Option<Duration>,
}

impl Transcriber for FakeTranscriber {
    fn transcribe(&self, _video_path: &Path) -> Result<Vec<TranscriptOutput>> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Ok(vec![
            TranscriptOutput {
                start: 0.0,
                end: 10.0,
                text: "welcome to the park".into(),
                confidence: Some(0.8),
            },
            TranscriptOutput {
                start: 40.0,
                end: 50.0,
                text: "hello world".into(),
                confidence: None,
            },
        ])
    }
}

pub struct FakeDetector;

impl ObjectDetector for FakeDetector {
    fn detect_batch(&self, image_paths: &[String]) -> Result<Vec<DetectionOutput>> {
        Ok(image_paths
            .iter()
            .map(|path| {
                let class_name = if timestamp_of(path) < 30.0 { "dog" } else { "person" };
                DetectionOutput {
                    objects: vec![DetectedObject {
                        class_name: class_name.into(),
                        confidence: 0.88,
                        bbox: Some(BoundingBox {
                            x: 0.1,
                            y: 0.2,
                            width: 0.3,
                            height: 0.4,
                        }),
                    }],
                }
            })
            .collect())
    }
}

#[derive(Default)]
pub struct FakeLanguageModel {
    pub broken: bool,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeLanguageModel {
    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

impl LanguageModel for FakeLanguageModel {
    fn complete(&self, prompt: &str, _system_prompt: &str, _temperature: f32, _max_tokens: u32) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.broken {
            bail!("language model returned 503");
        }
        Ok("Here is what happens in the video.".into())
    }
}

pub struct Fakes {
    pub frames: Arc<FakeFrames>,
    pub captioner: Arc<FakeCaptioner>,
    pub transcriber: FakeTranscriber,
    pub llm: Arc<FakeLanguageModel>,
}

impl Default for Fakes {
    fn default() -> Self {
        Self {
            frames: Arc::new(FakeFrames::new(60.0)),
            captioner: Arc::new(FakeCaptioner::default()),
            transcriber: FakeTranscriber::default(),
            llm: Arc::new(FakeLanguageModel::default()),
        }
    }
}

impl Fakes {
    pub fn gated(gate: &Arc<Gate>) -> Self {
        Self {
            captioner: Arc::new(FakeCaptioner {
                gate: Some(gate.clone()),
                ..FakeCaptioner::default()
            }),
            ..Self::default()
        }
    }
}

pub struct TestApp {
    pub assistant: VideoAssistant,
    pub frames: Arc<FakeFrames>,
    pub llm: Arc<FakeLanguageModel>,
    pub captioner: Arc<FakeCaptioner>,
    pub dir: TempDir,
}

pub fn start(fakes: Fakes) -> TestApp {
    start_with(fakes, |_| {})
}

pub fn start_with(fakes: Fakes, tweak: impl FnOnce(&mut Settings)) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings {
        data_dir: dir.path().to_path_buf(),
        ..Settings::default()
    };
    tweak(&mut settings);

    let frames: Arc<dyn FrameExtractor> = fakes.frames.clone();
    let captioner: Arc<dyn Captioner> = fakes.captioner.clone();
    let language_model: Arc<dyn LanguageModel> = fakes.llm.clone();
    let collaborators = Collaborators {
        frames,
        captioner,
        transcriber: Arc::new(fakes.transcriber),
        detector: Arc::new(FakeDetector),
        language_model,
        files: Arc::new(LocalFileStore::new(settings.uploads_dir())),
    };

    TestApp {
        assistant: VideoAssistant::open(settings, collaborators).unwrap(),
        frames: fakes.frames,
        llm: fakes.llm,
        captioner: fakes.captioner,
        dir,
    }
}

impl TestApp {
    pub async fn upload(&self) -> String {
        self.assistant
            .upload("clip.mp4", b"not really an mp4")
            .await
            .unwrap()
    }

    /// Upload and wait for every background stage.
    pub async fn upload_processed(&self) -> String {
        let video_id = self.upload().await;
        let finished = self.assistant.wait_for_processing(&video_id).await;
        assert_eq!(
            finished,
            Some(PipelineProgress::Finished(ProcessingStatus::Complete))
        );
        video_id
    }

    /// Poll until `done` holds, for at most two seconds.
    pub async fn eventually(&self, mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within two seconds");
    }

    pub async fn counts(&self, video_id: &str) -> ContextCounts {
        self.assistant
            .database()
            .count_context_by_type(video_id)
            .await
            .unwrap()
    }
}
