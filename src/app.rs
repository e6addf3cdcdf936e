use crate::{
    analyzer::Analyze,
    api::{HistoryResponse, SourceDescriptor, StatusResponse},
    capture::FrameCapture,
    error::SourceError,
    history::Board,
    scheduler::{BackoffPolicy, ScheduleStatus, Scheduler, SchedulerHandle},
    source::{SourceBackend, VideoSourceManager},
    stats::AnalysisStats,
    utils::img_with_bbox,
};
use image::codecs::jpeg::JpegEncoder;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::{watch, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub policy: BackoffPolicy,
    /// Where annotated frames are archived, if anywhere.
    pub image_path: Option<String>,
}

#[derive(Default)]
struct Control {
    scheduler: Option<SchedulerHandle>,
}

pub struct App<B, A> {
    sources: VideoSourceManager<B>,
    analyzer: Arc<A>,
    capture: Arc<FrameCapture>,
    board: Arc<RwLock<Board>>,
    schedule: Arc<watch::Sender<ScheduleStatus>>,
    stats: Arc<Mutex<AnalysisStats>>,
    config: AppConfig,
    /// Written under `control`, read without it.
    analysis_enabled: AtomicBool,
    control: Mutex<Control>,
}

impl<B: SourceBackend, A: Analyze> App<B, A> {
    pub fn new(backend: B, analyzer: A, config: AppConfig) -> Self {
        let sources = VideoSourceManager::new(backend);
        let capture = FrameCapture::new(sources.frames(), sources.subscribe());
        let (schedule, _) = watch::channel(ScheduleStatus::default());
        Self {
            sources,
            analyzer: Arc::new(analyzer),
            capture: Arc::new(capture),
            board: Arc::new(RwLock::new(Board::default())),
            schedule: Arc::new(schedule),
            stats: Arc::new(Mutex::new(AnalysisStats::default())),
            config,
            analysis_enabled: AtomicBool::new(false),
            control: Mutex::new(Control::default()),
        }
    }

    pub fn schedule(&self) -> watch::Receiver<ScheduleStatus> {
        self.schedule.subscribe()
    }

    pub fn sources(&self) -> &VideoSourceManager<B> {
        &self.sources
    }

    pub fn board(&self) -> &Arc<RwLock<Board>> {
        &self.board
    }

    /// Stops analysis, drops the old detections and switches source. Analysis
    /// resumes on its own if it was enabled and the new source came up.
    pub async fn set_source(&self, descriptor: SourceDescriptor) -> Result<(), SourceError> {
        {
            let mut control = self.control.lock().await;
            self.halt(&mut control).await;
            self.board.write().await.clear_detections();
        }

        // Opening can take seconds; status, stop and retry stay available meanwhile.
        let result = self.sources.set_source(descriptor).await;

        let mut control = self.control.lock().await;
        if result.is_ok() && self.analysis_enabled() && self.sources.is_active() {
            self.ensure_running(&mut control);
        }
        result
    }

    pub fn analysis_enabled(&self) -> bool {
        self.analysis_enabled.load(Ordering::SeqCst)
    }

    /// Enables analysis. Returns true if the loop is running afterwards.
    pub async fn start_analysis(&self) -> bool {
        let mut control = self.control.lock().await;
        self.analysis_enabled.store(true, Ordering::SeqCst);
        if !self.sources.is_active() {
            info!("Analysis enabled, waiting for an active video source");
            return false;
        }
        self.ensure_running(&mut control);
        true
    }

    pub async fn stop_analysis(&self) {
        let mut control = self.control.lock().await;
        self.analysis_enabled.store(false, Ordering::SeqCst);
        self.halt(&mut control).await;
    }

    /// Skips the pending backoff. Returns false unless the running loop is rate limited.
    pub async fn manual_retry(&self) -> bool {
        if !self.schedule.borrow().is_rate_limited {
            return false;
        }
        let control = self.control.lock().await;
        match control.scheduler.as_ref() {
            Some(scheduler) if !scheduler.is_finished() => {
                scheduler.manual_override();
                true
            }
            _ => false,
        }
    }

    pub async fn shutdown(&self) {
        let mut control = self.control.lock().await;
        self.analysis_enabled.store(false, Ordering::SeqCst);
        self.halt(&mut control).await;
        self.sources.teardown().await;
        info!("Shut down");
    }

    /// Stops analysis whenever the source stops being active, until cancelled.
    pub fn watch_source(self: &Arc<Self>, cancellation_token: CancellationToken) -> JoinHandle<()> {
        let app = self.clone();
        let mut status = self.sources.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => return,
                    changed = status.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                if status.borrow_and_update().is_active() {
                    continue;
                }
                let mut control = app.control.lock().await;
                // A switch may have completed while we waited for the lock.
                if !app.sources.is_active() && control.scheduler.is_some() {
                    info!("Video source is no longer active, stopping analysis");
                    app.halt(&mut control).await;
                }
            }
        })
    }

    pub async fn status(&self) -> StatusResponse {
        let analysis_enabled = self.analysis_enabled();
        let detected_objects = self.board.read().await.detections().to_vec();
        let schedule = self.schedule.borrow().clone();
        StatusResponse {
            success: true,
            analysis_enabled,
            source: self.sources.status(),
            schedule,
            detected_objects,
        }
    }

    pub async fn history(&self) -> HistoryResponse {
        let board = self.board.read().await;
        HistoryResponse {
            success: true,
            entries: board.history().snapshot(),
            stats: board.history().stats(),
        }
    }

    /// The displayed frame with the current detections drawn on it.
    pub async fn annotated_frame(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(frame) = self.sources.frames().borrow().clone() else {
            return Ok(None);
        };
        if !frame.readable {
            return Err(crate::error::CaptureError::SecurityRestriction.into());
        }
        let detections = self.board.read().await.detections().to_vec();
        let jpeg = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
            let img = img_with_bbox(&detections, &frame.jpeg)?;
            let mut buffer = Vec::new();
            JpegEncoder::new_with_quality(&mut buffer, 90).encode_image(&img)?;
            Ok(buffer)
        })
        .await??;
        Ok(Some(jpeg))
    }

    fn ensure_running(&self, control: &mut Control) {
        if control.scheduler.as_ref().is_some_and(|s| !s.is_finished()) {
            return;
        }
        let scheduler = Scheduler::new(
            self.capture.clone(),
            self.analyzer.clone(),
            self.board.clone(),
            self.config.policy,
            self.schedule.clone(),
        )
        .with_stats(self.stats.clone())
        .with_image_path(self.config.image_path.clone());
        control.scheduler = Some(scheduler.spawn());
    }

    async fn halt(&self, control: &mut Control) {
        if let Some(scheduler) = control.scheduler.take() {
            scheduler.stop().await;
            debug!("Analysis loop halted");
        }
    }
}
