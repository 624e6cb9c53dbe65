//! Owns the vision model on a dedicated OS thread.
//!
//! Inference is CPU-bound and the model keeps mutable session state, so every
//! caller goes through a clone-safe [`VisionHandle`] that serialises requests
//! over a channel and waits on a oneshot reply.

use image::RgbImage;
use lobby_core::{Detection, VisionError, VisionModel};
use tokio::sync::{mpsc, oneshot};

struct VisionRequest {
    image: RgbImage,
    reply: oneshot::Sender<Result<Vec<Detection>, VisionError>>,
}

#[derive(Clone)]
pub struct VisionHandle {
    tx: mpsc::Sender<VisionRequest>,
}

impl VisionHandle {
    /// Detect and embed faces from async context.
    pub async fn detect(&self, image: RgbImage) -> Result<Vec<Detection>, VisionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VisionRequest { image, reply })
            .await
            .map_err(|_| VisionError::ChannelClosed)?;
        rx.await.map_err(|_| VisionError::ChannelClosed)?
    }

    /// False once the vision thread has exited.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Detect and embed faces from a blocking worker thread.
    ///
    /// Must not be called from inside the async runtime.
    pub fn detect_blocking(&self, image: RgbImage) -> Result<Vec<Detection>, VisionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .blocking_send(VisionRequest { image, reply })
            .map_err(|_| VisionError::ChannelClosed)?;
        rx.blocking_recv().map_err(|_| VisionError::ChannelClosed)?
    }
}

/// Move `model` onto its own thread and return a handle to it.
pub fn spawn_vision<M>(mut model: M) -> Result<VisionHandle, VisionError>
where
    M: VisionModel + 'static,
{
    let (tx, mut rx) = mpsc::channel::<VisionRequest>(4);

    std::thread::Builder::new()
        .name("lobby-vision".into())
        .spawn(move || {
            tracing::info!("vision thread started");
            while let Some(req) = rx.blocking_recv() {
                let result = model.detect_and_embed(&req.image);
                if let Err(e) = &result {
                    tracing::debug!(error = %e, "vision request failed");
                }
                let _ = req.reply.send(result);
            }
            tracing::info!("vision thread exiting");
        })
        .map_err(|e| VisionError::ModelNotLoaded(format!("failed to spawn vision thread: {e}")))?;

    Ok(VisionHandle { tx })
}
