use crate::{api::SourceDescriptor, error::SourceError};
use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub jpeg: Bytes,
    pub received_at: DateTime<Local>,
    /// False when the frame comes from a cross-origin source that forbids reading pixels.
    pub readable: bool,
}

pub type FrameSlot = watch::Receiver<Option<Arc<VideoFrame>>>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    #[default]
    Idle,
    Acquiring,
    Active,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    pub state: SourceState,
    pub descriptor: Option<SourceDescriptor>,
    pub failure_reason: Option<String>,
}

impl SourceStatus {
    pub fn is_active(&self) -> bool {
        self.state == SourceState::Active
    }
}

/// Keeps a device or connection open until released.
pub trait StreamHandle: Send + 'static {
    /// Stops all underlying capture. Called exactly once per handle.
    fn release(&mut self);
}

pub struct OpenedStream {
    pub frames: mpsc::Receiver<VideoFrame>,
    pub handle: Box<dyn StreamHandle>,
}

pub trait SourceBackend: Send + Sync + 'static {
    fn open(
        &self,
        descriptor: &SourceDescriptor,
    ) -> impl Future<Output = Result<OpenedStream, SourceError>> + Send;
}

struct Shared {
    status: watch::Sender<SourceStatus>,
    frames: watch::Sender<Option<Arc<VideoFrame>>>,
    /// Bumped on every teardown so a stale pump cannot publish.
    generation: AtomicU64,
}

#[derive(Default)]
struct Active {
    handle: Option<Box<dyn StreamHandle>>,
    pump: Option<JoinHandle<()>>,
}

pub struct VideoSourceManager<B> {
    backend: B,
    active: Mutex<Active>,
    shared: Arc<Shared>,
}

impl<B: SourceBackend> VideoSourceManager<B> {
    pub fn new(backend: B) -> Self {
        let (status, _) = watch::channel(SourceStatus::default());
        let (frames, _) = watch::channel(None);
        Self {
            backend,
            active: Mutex::new(Active::default()),
            shared: Arc::new(Shared {
                status,
                frames,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn frames(&self) -> FrameSlot {
        self.shared.frames.subscribe()
    }

    pub fn subscribe(&self) -> watch::Receiver<SourceStatus> {
        self.shared.status.subscribe()
    }

    pub fn status(&self) -> SourceStatus {
        self.shared.status.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.shared.status.borrow().is_active()
    }

    /// Switches to `descriptor`. The previous source is released first, even if
    /// the new one then fails to start.
    pub async fn set_source(&self, descriptor: SourceDescriptor) -> Result<(), SourceError> {
        let mut active = self.active.lock().await;
        self.release(&mut active);

        info!("Acquiring video source: {}", descriptor);
        self.shared.status.send_replace(SourceStatus {
            state: SourceState::Acquiring,
            descriptor: Some(descriptor.clone()),
            failure_reason: None,
        });

        match self.backend.open(&descriptor).await {
            Ok(OpenedStream { frames, handle }) => {
                let generation = self.shared.generation.load(Ordering::SeqCst);
                active.handle = Some(handle);
                active.pump = Some(tokio::spawn(pump(self.shared.clone(), generation, frames)));
                self.shared.status.send_modify(|status| {
                    status.state = SourceState::Active;
                });
                info!("Video source active: {}", descriptor);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to acquire {}: {}", descriptor, e);
                self.shared.status.send_modify(|status| {
                    status.state = SourceState::Failed;
                    status.failure_reason = Some(e.to_string());
                });
                Err(e)
            }
        }
    }

    pub async fn teardown(&self) {
        let mut active = self.active.lock().await;
        self.release(&mut active);
        self.shared.status.send_replace(SourceStatus::default());
    }

    fn release(&self, active: &mut Active) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(pump) = active.pump.take() {
            pump.abort();
        }
        if let Some(mut handle) = active.handle.take() {
            handle.release();
            debug!("Released video source");
        }
        self.shared.frames.send_replace(None);
    }
}

async fn pump(shared: Arc<Shared>, generation: u64, mut frames: mpsc::Receiver<VideoFrame>) {
    let shared = &*shared;
    let current = || shared.generation.load(Ordering::SeqCst) == generation;

    while let Some(frame) = frames.recv().await {
        let frame = Arc::new(frame);
        let published = shared.frames.send_if_modified(|slot| {
            if !current() {
                return false;
            }
            *slot = Some(frame);
            true
        });
        if !published {
            return;
        }
    }

    shared.frames.send_if_modified(|slot| {
        if !current() {
            return false;
        }
        *slot = None;
        true
    });
    shared.status.send_if_modified(|status| {
        if !current() {
            return false;
        }
        warn!("Video stream ended");
        status.state = SourceState::Idle;
        status.failure_reason = Some("the video stream ended".to_string());
        true
    });
}
