//! Network video source (RTSP/HTTP/...), decoded by an `ffmpeg` child process.
//!
//! The stream's native size is read with `ffprobe` first; ffmpeg then writes
//! rgb24 frames of that size to a pipe. A reader thread keeps only the newest
//! one, so a slow consumer always gets the freshest frame and stale frames are
//! discarded (buffer depth 1).

use crate::frame;
use crate::{FrameSource, SourceError};
use image::RgbImage;
use parking_lot::{Condvar, Mutex};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const FFMPEG_BIN: &str = "ffmpeg";
const FFPROBE_BIN: &str = "ffprobe";

#[derive(Default)]
struct SlotState {
    latest: Option<RgbImage>,
    ended: Option<String>,
}

/// Single-frame mailbox shared between the pipe reader and the consumer.
#[derive(Default)]
pub(crate) struct LatestFrame {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl LatestFrame {
    fn put(&self, frame: RgbImage) {
        let mut state = self.state.lock();
        if state.latest.replace(frame).is_some() {
            tracing::trace!("discarding stale network frame");
        }
        self.ready.notify_one();
    }

    fn end(&self, reason: String) {
        let mut state = self.state.lock();
        state.ended = Some(reason);
        self.ready.notify_all();
    }

    /// Take the newest frame, waiting up to `timeout` for one to arrive.
    fn take(&self, timeout: Duration) -> Result<RgbImage, SourceError> {
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.latest.take() {
                return Ok(frame);
            }
            if let Some(reason) = &state.ended {
                return Err(SourceError::CaptureFailed(reason.clone()));
            }
            if self.ready.wait_for(&mut state, timeout).timed_out() {
                return Err(SourceError::Timeout(timeout));
            }
        }
    }
}

/// Read fixed-size rgb24 frames from `pipe` until it closes.
fn spawn_reader<R>(mut pipe: R, width: u32, height: u32, slot: Arc<LatestFrame>) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    std::thread::Builder::new()
        .name("lobby-net-reader".into())
        .spawn(move || {
            let frame_len = (width * height * 3) as usize;
            loop {
                let mut buf = vec![0u8; frame_len];
                if let Err(e) = pipe.read_exact(&mut buf) {
                    slot.end(format!("network stream ended: {e}"));
                    return;
                }
                match frame::rgb24_to_image(buf, width, height) {
                    Ok(img) => slot.put(img),
                    Err(e) => {
                        slot.end(e.to_string());
                        return;
                    }
                }
            }
        })
}

/// Parse ffprobe's `WIDTHxHEIGHT` answer.
fn parse_dimensions(output: &str) -> Option<(u32, u32)> {
    let line = output.lines().map(str::trim).find(|line| !line.is_empty())?;
    let (width, height) = line.split_once('x')?;
    let width: u32 = width.trim().parse().ok()?;
    let height: u32 = height.trim().parse().ok()?;
    (width > 0 && height > 0).then_some((width, height))
}

fn rtsp_args(url: &str) -> Vec<String> {
    if url.starts_with("rtsp://") {
        vec!["-rtsp_transport".into(), "tcp".into()]
    } else {
        Vec::new()
    }
}

/// Native frame size of the first video stream at `url`.
fn stream_dimensions(url: &str) -> Result<(u32, u32), SourceError> {
    let mut args: Vec<String> = vec!["-v".into(), "error".into()];
    args.extend(rtsp_args(url));
    args.extend([
        "-select_streams".into(),
        "v:0".into(),
        "-show_entries".into(),
        "stream=width,height".into(),
        "-of".into(),
        "csv=p=0:s=x".into(),
        url.to_string(),
    ]);
    let output = Command::new(FFPROBE_BIN)
        .args(&args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(SourceError::DecoderSpawn)?;
    if !output.status.success() {
        return Err(SourceError::CaptureFailed(format!("ffprobe failed for {url}")));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_dimensions(&text)
        .ok_or_else(|| SourceError::CaptureFailed(format!("no video stream size reported for {url}")))
}

pub struct NetworkSource {
    url: String,
    width: u32,
    height: u32,
    read_timeout: Duration,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    slot: Arc<LatestFrame>,
}

impl NetworkSource {
    /// Start decoding `url` at its native frame size.
    pub fn open(url: &str, read_timeout: Duration) -> Result<Self, SourceError> {
        if url.trim().is_empty() {
            return Err(SourceError::NotConfigured("network url is empty".into()));
        }
        let mut source = Self {
            url: url.to_string(),
            width: 0,
            height: 0,
            read_timeout,
            child: None,
            reader: None,
            slot: Arc::new(LatestFrame::default()),
        };
        source.spawn_decoder()?;
        Ok(source)
    }

    fn ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["-nostdin".into(), "-loglevel".into(), "error".into()];
        args.extend(rtsp_args(&self.url));
        args.extend([
            "-i".into(),
            self.url.clone(),
            "-an".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-f".into(),
            "rawvideo".into(),
            "pipe:1".into(),
        ]);
        args
    }

    fn spawn_decoder(&mut self) -> Result<(), SourceError> {
        // The size can change across reconnects.
        let (width, height) = stream_dimensions(&self.url)?;
        self.width = width;
        self.height = height;

        let mut child = Command::new(FFMPEG_BIN)
            .args(self.ffmpeg_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(SourceError::DecoderSpawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::CaptureFailed("ffmpeg stdout not captured".into()))?;

        self.slot = Arc::new(LatestFrame::default());
        self.reader = Some(
            spawn_reader(stdout, self.width, self.height, Arc::clone(&self.slot))
                .map_err(SourceError::DecoderSpawn)?,
        );
        self.child = Some(child);

        tracing::info!(url = %self.url, width = self.width, height = self.height, "network decoder started");
        Ok(())
    }

    fn stop_decoder(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                tracing::debug!(error = %e, "ffmpeg already exited");
            }
            let _ = child.wait();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl FrameSource for NetworkSource {
    fn describe(&self) -> String {
        format!("network source {}", self.url)
    }

    fn read_frame(&mut self) -> Result<RgbImage, SourceError> {
        match self.slot.take(self.read_timeout) {
            Err(SourceError::CaptureFailed(reason)) => {
                // The decoder is gone; bring up a fresh one for the next read.
                self.stop_decoder();
                if let Err(e) = self.spawn_decoder() {
                    tracing::warn!(url = %self.url, error = %e, "failed to restart network decoder");
                }
                Err(SourceError::CaptureFailed(reason))
            }
            other => other,
        }
    }
}

impl Drop for NetworkSource {
    fn drop(&mut self) {
        self.stop_decoder();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frames(values: &[u8], width: u32, height: u32) -> Vec<u8> {
        values
            .iter()
            .flat_map(|&v| vec![v; (width * height * 3) as usize])
            .collect()
    }

    #[test]
    fn test_only_newest_frame_is_kept() {
        let slot = Arc::new(LatestFrame::default());
        let reader = spawn_reader(Cursor::new(frames(&[10, 20, 30], 2, 2)), 2, 2, Arc::clone(&slot)).unwrap();
        reader.join().unwrap();

        let frame = slot.take(Duration::from_millis(10)).unwrap();
        assert_eq!(frame.get_pixel(0, 0).0, [30, 30, 30]);

        // Stream closed after the last frame.
        assert!(matches!(slot.take(Duration::from_millis(10)), Err(SourceError::CaptureFailed(_))));
    }

    #[test]
    fn test_take_times_out_without_frames() {
        let slot = LatestFrame::default();
        assert!(matches!(slot.take(Duration::from_millis(5)), Err(SourceError::Timeout(_))));
    }

    #[test]
    fn test_empty_url_is_not_configured() {
        assert!(matches!(
            NetworkSource::open("  ", Duration::from_secs(1)),
            Err(SourceError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_ffmpeg_args_for_rtsp() {
        let source = NetworkSource {
            url: "rtsp://cam/stream".into(),
            width: 640,
            height: 480,
            read_timeout: Duration::from_secs(1),
            child: None,
            reader: None,
            slot: Arc::new(LatestFrame::default()),
        };
        let args = source.ffmpeg_args();
        assert!(args.windows(2).any(|w| w[0] == "-rtsp_transport" && w[1] == "tcp"));
        assert!(!args.iter().any(|arg| arg == "-vf"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn test_parse_dimensions() {
        assert_eq!(parse_dimensions("1920x1080\n"), Some((1920, 1080)));
        assert_eq!(parse_dimensions("\n 640x360 \n"), Some((640, 360)));
        assert_eq!(parse_dimensions("0x0"), None);
        assert_eq!(parse_dimensions("N/A"), None);
        assert_eq!(parse_dimensions(""), None);
    }
}
