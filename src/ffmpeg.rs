use crate::{
    api::SourceDescriptor,
    error::SourceError,
    source::{OpenedStream, SourceBackend, StreamHandle, VideoFrame},
};
use bytes::{Buf, Bytes, BytesMut};
use chrono::Local;
use futures::StreamExt;
use reqwest::header::{ACCESS_CONTROL_ALLOW_ORIGIN, ORIGIN};
use std::{process::Stdio, time::Duration};
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStderr, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, info, warn};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const STDERR_TAIL_BYTES: usize = 4096;

#[cfg(target_os = "linux")]
pub const DEFAULT_WEBCAM_DEVICE: &str = "/dev/video0";
#[cfg(target_os = "macos")]
pub const DEFAULT_WEBCAM_DEVICE: &str = "0";
#[cfg(target_os = "windows")]
pub const DEFAULT_WEBCAM_DEVICE: &str = "Integrated Camera";
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub const DEFAULT_WEBCAM_DEVICE: &str = "/dev/video0";

#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    pub ffmpeg: String,
    pub webcam_device: String,
    /// Ideal capture size; large enough for detection, small enough to upload.
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub startup_timeout: Duration,
    /// Check http(s) streams for `Access-Control-Allow-Origin`.
    pub check_cross_origin: bool,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            webcam_device: DEFAULT_WEBCAM_DEVICE.to_string(),
            width: 1280,
            height: 720,
            fps: 2,
            startup_timeout: Duration::from_secs(15),
            check_cross_origin: true,
        }
    }
}

pub struct FfmpegBackend {
    config: FfmpegConfig,
    client: reqwest::Client,
}

impl FfmpegBackend {
    pub fn new(config: FfmpegConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn input_args(&self, descriptor: &SourceDescriptor) -> Vec<String> {
        let size = format!("{}x{}", self.config.width, self.config.height);
        let device = self.config.webcam_device.as_str();
        match descriptor {
            SourceDescriptor::Webcam if cfg!(target_os = "macos") => strings(&[
                "-f",
                "avfoundation",
                "-framerate",
                "30",
                "-video_size",
                size.as_str(),
                "-i",
                device,
            ]),
            SourceDescriptor::Webcam if cfg!(target_os = "windows") => {
                let input = format!("video={device}");
                strings(&["-f", "dshow", "-video_size", size.as_str(), "-i", input.as_str()])
            }
            SourceDescriptor::Webcam => {
                strings(&["-f", "v4l2", "-video_size", size.as_str(), "-i", device])
            }
            SourceDescriptor::Url { address } => strings(&["-re", "-i", address.as_str()]),
        }
    }

    fn output_args(&self) -> Vec<String> {
        let fps = self.config.fps.max(1).to_string();
        strings(&[
            "-an", "-r", fps.as_str(), "-f", "image2pipe", "-c:v", "mjpeg", "-q:v", "3", "pipe:1",
        ])
    }

    /// Mirrors the browser rule: pixels of a cross-origin stream are readable only
    /// when the server grants `Access-Control-Allow-Origin`.
    async fn cross_origin_readable(&self, address: &str) -> bool {
        if !self.config.check_cross_origin || !is_http(address) {
            return true;
        }
        match self
            .client
            .head(address)
            .header(ORIGIN, "http://localhost")
            .send()
            .await
        {
            Ok(response) => {
                let readable = response.headers().contains_key(ACCESS_CONTROL_ALLOW_ORIGIN);
                if !readable {
                    warn!("{} does not allow cross-origin reads, frames cannot be analyzed", address);
                }
                readable
            }
            Err(e) => {
                // ffmpeg reports unreachable addresses with a better message.
                debug!("Cross-origin check of {} failed: {}", address, e);
                true
            }
        }
    }
}

impl SourceBackend for FfmpegBackend {
    async fn open(&self, descriptor: &SourceDescriptor) -> Result<OpenedStream, SourceError> {
        let readable = match descriptor {
            SourceDescriptor::Url { address } => self.cross_origin_readable(address).await,
            SourceDescriptor::Webcam => true,
        };

        let mut child = Command::new(&self.config.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error"])
            .args(self.input_args(descriptor))
            .args(self.output_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SourceError::Spawn(format!("{}: {}", self.config.ffmpeg, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Spawn("ffmpeg stdout is not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SourceError::Spawn("ffmpeg stderr is not piped".into()))?;
        let stderr_tail = tokio::spawn(read_tail(stderr));

        let mut reader = FramedRead::new(stdout, MjpegCodec);
        let first = match tokio::time::timeout(self.config.startup_timeout, reader.next()).await {
            Ok(Some(Ok(jpeg))) => jpeg,
            Ok(Some(Err(e))) => return Err(SourceError::Other(e.to_string())),
            Ok(None) => {
                let _ = child.wait().await;
                let stderr = stderr_tail.await.unwrap_or_default();
                return Err(classify_ffmpeg_failure(descriptor, &stderr));
            }
            Err(_) => {
                stderr_tail.abort();
                return Err(SourceError::Other(format!(
                    "no frame received within {:?}",
                    self.config.startup_timeout
                )));
            }
        };
        info!("First frame received from {}, {} bytes", descriptor, first.len());

        let (tx, rx) = mpsc::channel(2);
        let forward = tokio::spawn(async move {
            let mut next = Some(first);
            while let Some(jpeg) = next.take() {
                let frame = VideoFrame {
                    jpeg,
                    received_at: Local::now(),
                    readable,
                };
                if tx.send(frame).await.is_err() {
                    return;
                }
                next = match reader.next().await {
                    Some(Ok(jpeg)) => Some(jpeg),
                    Some(Err(e)) => {
                        warn!("Video stream read failed: {}", e);
                        None
                    }
                    None => None,
                };
            }
        });

        Ok(OpenedStream {
            frames: rx,
            handle: Box::new(FfmpegHandle {
                child,
                forward,
                stderr_tail,
            }),
        })
    }
}

struct FfmpegHandle {
    child: Child,
    forward: JoinHandle<()>,
    stderr_tail: JoinHandle<String>,
}

impl StreamHandle for FfmpegHandle {
    fn release(&mut self) {
        self.forward.abort();
        self.stderr_tail.abort();
        if let Err(e) = self.child.start_kill() {
            debug!("ffmpeg already exited: {}", e);
        }
    }
}

impl Drop for FfmpegHandle {
    fn drop(&mut self) {
        self.forward.abort();
        self.stderr_tail.abort();
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn is_http(address: &str) -> bool {
    let lower = address.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

async fn read_tail(mut stderr: ChildStderr) -> String {
    let mut tail = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    tail.drain(..tail.len() - STDERR_TAIL_BYTES);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

/// Maps ffmpeg's last words to a reason the user can act on.
pub fn classify_ffmpeg_failure(descriptor: &SourceDescriptor, stderr: &str) -> SourceError {
    let last_line = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("ffmpeg exited without output")
        .trim()
        .to_string();
    let lower = stderr.to_ascii_lowercase();

    match descriptor {
        SourceDescriptor::Webcam => {
            if lower.contains("permission denied") || lower.contains("not authorized") {
                SourceError::PermissionDenied
            } else if lower.contains("device or resource busy") || lower.contains("in use") {
                SourceError::Busy
            } else if lower.contains("no such file or directory")
                || lower.contains("no such device")
                || lower.contains("could not find video device")
            {
                SourceError::NotFound
            } else {
                SourceError::Other(last_line)
            }
        }
        SourceDescriptor::Url { .. } => {
            if lower.contains("invalid data found")
                || lower.contains("unknown input format")
                || lower.contains("protocol not found")
                || lower.contains("403")
                || lower.contains("forbidden")
            {
                SourceError::Unsupported(last_line)
            } else {
                SourceError::Other(last_line)
            }
        }
    }
}

/// Splits a concatenated MJPEG byte stream into individual JPEG images.
#[derive(Debug, Default, Clone, Copy)]
pub struct MjpegCodec;

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

impl Decoder for MjpegCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        let Some(start) = find(&src[..], &SOI) else {
            // A trailing 0xFF may be the first half of the next marker.
            let keep = usize::from(src.last() == Some(&0xFF));
            let discard = src.len() - keep;
            src.advance(discard);
            return Ok(None);
        };
        src.advance(start);

        match find(&src[SOI.len()..], &EOI) {
            Some(end) => Ok(Some(src.split_to(SOI.len() + end + EOI.len()).freeze())),
            None if src.len() > MAX_FRAME_BYTES => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "MJPEG frame exceeds the maximum size",
            )),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                buf.clear();
                Ok(None)
            }
        }
    }
}
