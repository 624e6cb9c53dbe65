//! Pulled transports: open a [`FrameSource`] and pump it through the pipeline.
//!
//! Both pulled kinds (network and local camera) run the same loop; only the
//! source differs.

use crate::activation::ActiveFlag;
use crate::pipeline::{Pipeline, PipelineError};
use crate::settings::CameraSource;
use crate::streams::{StreamHandle, TransportKind};
use lobby_core::VisionError;
use lobby_hw::{Camera, FrameSource, NetworkSource, SourceError};
use std::time::Duration;
use thiserror::Error;

const NETWORK_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("source: {0}")]
    Source(#[from] SourceError),
    #[error("pipeline: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("worker panicked: {0}")]
    Panicked(String),
}

/// Why a pull loop returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullExit {
    /// The stream's stop flag was set.
    Stopped,
    /// Detection was switched off.
    Deactivated,
}

/// Opens frame sources for a transport kind.
pub trait SourceFactory: Send + Sync {
    fn open(
        &self,
        kind: TransportKind,
        camera: &CameraSource,
    ) -> Result<Box<dyn FrameSource>, SourceError>;
}

/// Real devices: V4L2 cameras and ffmpeg-decoded network streams.
pub struct DeviceSources;

impl SourceFactory for DeviceSources {
    fn open(
        &self,
        kind: TransportKind,
        camera: &CameraSource,
    ) -> Result<Box<dyn FrameSource>, SourceError> {
        // Devices deliver their native size; the pipeline resizes.
        match kind {
            TransportKind::Network => match camera {
                CameraSource::Network { url } => Ok(Box::new(NetworkSource::open(url, NETWORK_READ_TIMEOUT)?)),
                _ => Err(SourceError::NotConfigured("no network source configured".into())),
            },
            TransportKind::LocalCamera => Ok(Box::new(Camera::open(device_index(camera))?)),
            TransportKind::Push => Err(SourceError::NotConfigured(
                "push frames are submitted by sessions, not pulled".into(),
            )),
        }
    }
}

/// Local device selected by the camera settings; anything else means device 0.
pub fn device_index(camera: &CameraSource) -> u32 {
    match camera {
        CameraSource::Device { device_index } => *device_index,
        _ => 0,
    }
}

/// The pulled transport that keeps recognition running without a viewer.
pub fn background_kind(camera: &CameraSource) -> Option<TransportKind> {
    match camera {
        CameraSource::Push => None,
        CameraSource::Default | CameraSource::Device { .. } => Some(TransportKind::LocalCamera),
        CameraSource::Network { .. } => Some(TransportKind::Network),
    }
}

/// Read, process and enqueue frames in read order until stopped or deactivated.
///
/// Read and per-frame processing failures are logged and retried after
/// `retry`; only a dead vision thread ends the loop with an error.
pub fn run_pull_loop(
    source: &mut dyn FrameSource,
    pipeline: &Pipeline,
    handle: &StreamHandle,
    active: &ActiveFlag,
    retry: Duration,
) -> Result<PullExit, WorkerError> {
    let kind = pipeline.kind();
    let mut consecutive_failures = 0u32;
    tracing::info!(%kind, stream = %handle.id, source = %source.describe(), "pull loop started");

    loop {
        if !handle.is_live() {
            return Ok(PullExit::Stopped);
        }
        if !active.get() {
            return Ok(PullExit::Deactivated);
        }

        let frame = match source.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures == 1 {
                    tracing::warn!(%kind, error = %e, "frame read failed; retrying");
                } else {
                    tracing::debug!(%kind, error = %e, consecutive_failures, "frame read failed");
                }
                std::thread::sleep(retry);
                continue;
            }
        };
        if consecutive_failures > 0 {
            tracing::info!(%kind, after = consecutive_failures, "frame reads recovered");
            consecutive_failures = 0;
        }

        match pipeline.process_blocking(frame) {
            Ok(processed) => {
                handle.push_frame(processed.jpeg);
            }
            Err(PipelineError::Vision(VisionError::ChannelClosed)) => {
                return Err(PipelineError::Vision(VisionError::ChannelClosed).into());
            }
            Err(e) => {
                tracing::warn!(%kind, error = %e, "frame processing failed");
                std::thread::sleep(retry);
            }
        }
    }
}

/// Open the source for `kind` and run the pull loop on it.
pub fn run_pull_session(
    factory: &dyn SourceFactory,
    camera: &CameraSource,
    pipeline: &Pipeline,
    handle: &StreamHandle,
    active: &ActiveFlag,
    retry: Duration,
) -> Result<PullExit, WorkerError> {
    let mut source = factory.open(pipeline.kind(), camera)?;
    let exit = run_pull_loop(source.as_mut(), pipeline, handle, active, retry)?;
    tracing::info!(kind = %pipeline.kind(), stream = %handle.id, ?exit, "pull loop finished");
    Ok(exit)
}

/// Open `camera` once and read a single frame.
pub fn grab_one(factory: &dyn SourceFactory, camera: &CameraSource) -> Result<(u32, u32), SourceError> {
    let kind = background_kind(camera)
        .ok_or_else(|| SourceError::NotConfigured("push source has no device to test".into()))?;
    let mut source = factory.open(kind, camera)?;
    let frame = source.read_frame()?;
    Ok(frame.dimensions())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted frame sources.

    use super::*;
    use crate::vision::testing::face_frame;
    use image::RgbImage;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plays back a script; an exhausted script repeats its last step.
    pub struct ScriptedSource {
        script: VecDeque<Result<RgbImage, String>>,
        last: Result<RgbImage, String>,
    }

    impl ScriptedSource {
        pub fn new(script: Vec<Result<RgbImage, String>>) -> Self {
            Self {
                script: script.into(),
                last: Err("empty script".into()),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn describe(&self) -> String {
            "scripted source".into()
        }

        fn read_frame(&mut self) -> Result<RgbImage, SourceError> {
            if let Some(step) = self.script.pop_front() {
                self.last = step;
            }
            std::thread::sleep(Duration::from_millis(2));
            self.last.clone().map_err(SourceError::CaptureFailed)
        }
    }

    /// Factory whose opens fail a fixed number of times before producing
    /// a source that keeps showing one face of `identity`.
    pub struct ScriptedFactory {
        pub failing_opens: AtomicUsize,
        pub opens: AtomicUsize,
        pub identity: u8,
    }

    impl ScriptedFactory {
        pub fn new(failing_opens: usize, identity: u8) -> Self {
            Self {
                failing_opens: AtomicUsize::new(failing_opens),
                opens: AtomicUsize::new(0),
                identity,
            }
        }
    }

    impl SourceFactory for ScriptedFactory {
        fn open(
            &self,
            _kind: TransportKind,
            _camera: &CameraSource,
        ) -> Result<Box<dyn FrameSource>, SourceError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failing_opens.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_opens.store(remaining - 1, Ordering::SeqCst);
                return Err(SourceError::DeviceNotFound("scripted".into()));
            }
            Ok(Box::new(ScriptedSource::new(vec![Ok(face_frame(1, self.identity))])))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::pipeline::Sighting;
    use crate::settings::Settings;
    use crate::vision::spawn_vision;
    use crate::vision::testing::{face_frame, ScriptedVision};
    use lobby_core::overlay::OverlayStyle;
    use lobby_core::Gallery;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn pipeline(kind: TransportKind) -> (Pipeline, mpsc::Receiver<Sighting>) {
        let (tx, rx) = mpsc::channel(8);
        let pipeline = Pipeline::new(
            kind,
            &Settings::default(),
            spawn_vision(ScriptedVision).unwrap(),
            Gallery::new(),
            Arc::new(OverlayStyle::default()),
            tx,
        );
        (pipeline, rx)
    }

    #[test]
    fn test_background_kind_follows_camera_source() {
        assert_eq!(background_kind(&CameraSource::Push), None);
        assert_eq!(background_kind(&CameraSource::Default), Some(TransportKind::LocalCamera));
        assert_eq!(
            background_kind(&CameraSource::Device { device_index: 3 }),
            Some(TransportKind::LocalCamera)
        );
        assert_eq!(
            background_kind(&CameraSource::Network { url: "rtsp://x".into() }),
            Some(TransportKind::Network)
        );
        assert_eq!(device_index(&CameraSource::Device { device_index: 3 }), 3);
        assert_eq!(device_index(&CameraSource::Default), 0);
    }

    #[tokio::test]
    async fn test_read_failures_do_not_end_the_loop() {
        let (pipeline, _rx) = pipeline(TransportKind::Network);
        let handle = Arc::new(StreamHandle::new(TransportKind::Network, false, 4));
        let active = ActiveFlag::default();
        active.set(true);

        let mut source = ScriptedSource::new(vec![
            Err("dropped".into()),
            Err("dropped".into()),
            Ok(face_frame(1, 0)),
        ]);

        let worker = {
            let handle = Arc::clone(&handle);
            let active = active.clone();
            tokio::task::spawn_blocking(move || {
                run_pull_loop(&mut source, &pipeline, &handle, &active, Duration::from_millis(1))
            })
        };

        // Frames arrive despite the failed reads; the queue stays bounded.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(handle.queued() > 0);
        assert!(handle.queued() <= handle.capacity());

        handle.stop();
        assert_eq!(worker.await.unwrap().unwrap(), PullExit::Stopped);
    }

    #[tokio::test]
    async fn test_loop_ends_when_deactivated() {
        let (pipeline, _rx) = pipeline(TransportKind::LocalCamera);
        let handle = StreamHandle::new(TransportKind::LocalCamera, true, 4);
        let active = ActiveFlag::default();

        let mut source = ScriptedSource::new(vec![Ok(face_frame(0, 0))]);
        let exit = tokio::task::spawn_blocking(move || {
            run_pull_loop(&mut source, &pipeline, &handle, &active, Duration::from_millis(1))
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(exit, PullExit::Deactivated);
    }

    #[test]
    fn test_grab_one_reports_frame_size() {
        let factory = ScriptedFactory::new(0, 1);
        assert_eq!(grab_one(&factory, &CameraSource::Default).unwrap(), (640, 480));
        assert!(matches!(
            grab_one(&factory, &CameraSource::Push),
            Err(SourceError::NotConfigured(_))
        ));

        let failing = ScriptedFactory::new(1, 1);
        assert!(grab_one(&failing, &CameraSource::Default).is_err());
        assert_eq!(failing.opens.load(Ordering::SeqCst), 1);
    }
}
