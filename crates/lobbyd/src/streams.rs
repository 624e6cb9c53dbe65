//! Stream handles: one per running transport instance, each with a bounded
//! queue of encoded frames and a cooperative stop flag.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Frames submitted one at a time by an interactive session.
    Push,
    Network,
    LocalCamera,
}

impl TransportKind {
    pub fn is_pulled(self) -> bool {
        !matches!(self, TransportKind::Push)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Push => "push",
            TransportKind::Network => "network",
            TransportKind::LocalCamera => "local_camera",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(TransportKind::Push),
            "network" => Ok(TransportKind::Network),
            "local_camera" | "camera" => Ok(TransportKind::LocalCamera),
            other => Err(format!("unknown transport kind: {other}")),
        }
    }
}

/// What a consumer got when asking for the next frame.
#[derive(Debug, PartialEq, Eq)]
pub enum NextFrame {
    Frame(Vec<u8>),
    /// Nothing arrived within the wait; the stream is still live.
    Pending,
    Ended,
}

pub struct StreamHandle {
    pub id: Uuid,
    pub kind: TransportKind,
    /// Started by the supervisor rather than by a viewer.
    pub background: bool,
    capacity: usize,
    live: watch::Sender<bool>,
    tx: mpsc::Sender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    dropped: AtomicU64,
}

impl StreamHandle {
    pub fn new(kind: TransportKind, background: bool, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (live, _) = watch::channel(true);
        Self {
            id: Uuid::new_v4(),
            kind,
            background,
            capacity,
            live,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an encoded frame without ever blocking.
    ///
    /// A full queue drops the new frame. Returns whether it was queued.
    pub fn push_frame(&self, frame: Vec<u8>) -> bool {
        if !self.is_live() {
            return false;
        }
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!(stream = %self.id, kind = %self.kind, dropped, "queue full; frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn stop(&self) {
        if self.live.send_replace(false) {
            tracing::debug!(stream = %self.id, kind = %self.kind, "stream stopped");
        }
    }

    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        let mut rx = self.live.subscribe();
        let _ = rx.wait_for(|live| !*live).await;
    }

    pub fn queued(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Pop the next frame, waiting up to `wait`.
    ///
    /// Frames queued before a stop are still handed out; after that the stream ends.
    pub async fn next_frame(&self, wait: Duration) -> NextFrame {
        let mut rx = self.rx.lock().await;
        if let Ok(frame) = rx.try_recv() {
            return NextFrame::Frame(frame);
        }
        if !self.is_live() {
            return NextFrame::Ended;
        }

        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => NextFrame::Frame(frame),
                None => NextFrame::Ended,
            },
            _ = self.stopped() => NextFrame::Ended,
            _ = tokio::time::sleep(wait) => NextFrame::Pending,
        }
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("background", &self.background)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Every live stream handle, across all transports.
#[derive(Default)]
pub struct StreamRegistry {
    handles: Mutex<HashMap<Uuid, Arc<StreamHandle>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, kind: TransportKind, background: bool, capacity: usize) -> Arc<StreamHandle> {
        let handle = Arc::new(StreamHandle::new(kind, background, capacity));
        self.handles.lock().insert(handle.id, Arc::clone(&handle));
        tracing::debug!(stream = %handle.id, %kind, background, "stream created");
        handle
    }

    /// Create a pulled stream unless a live one of this kind already exists.
    ///
    /// Returns the handle and whether it was newly created.
    pub fn get_or_create_pulled(
        &self,
        kind: TransportKind,
        background: bool,
        capacity: usize,
    ) -> (Arc<StreamHandle>, bool) {
        let mut handles = self.handles.lock();
        if let Some(existing) = handles.values().find(|h| h.kind == kind && h.is_live()) {
            return (Arc::clone(existing), false);
        }
        let handle = Arc::new(StreamHandle::new(kind, background, capacity));
        handles.insert(handle.id, Arc::clone(&handle));
        tracing::debug!(stream = %handle.id, %kind, background, "stream created");
        (handle, true)
    }

    pub fn find_pulled(&self, kind: TransportKind) -> Option<Arc<StreamHandle>> {
        self.handles
            .lock()
            .values()
            .find(|h| h.kind == kind && h.is_live())
            .cloned()
    }

    /// Stop and forget one stream.
    pub fn remove(&self, id: Uuid) -> Option<Arc<StreamHandle>> {
        let handle = self.handles.lock().remove(&id)?;
        handle.stop();
        Some(handle)
    }

    /// Stop and forget every stream, viewer-driven or not.
    pub fn clear_all(&self) -> usize {
        let drained: Vec<_> = self.handles.lock().drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.stop();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    pub fn counts(&self) -> HashMap<TransportKind, usize> {
        let mut counts = HashMap::new();
        for handle in self.handles.lock().values() {
            *counts.entry(handle.kind).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_queue_drops_newest() {
        let handle = StreamHandle::new(TransportKind::Network, false, 3);
        for i in 0..5u8 {
            handle.push_frame(vec![i]);
        }
        assert_eq!(handle.queued(), 3);
        assert_eq!(handle.dropped(), 2);
    }

    #[tokio::test]
    async fn test_queue_never_exceeds_bound() {
        let handle = StreamHandle::new(TransportKind::LocalCamera, true, 10);
        for i in 0..100u8 {
            handle.push_frame(vec![i]);
            assert!(handle.queued() <= 10);
        }
        // The oldest frames survive; the overflow was discarded.
        assert_eq!(handle.next_frame(Duration::from_millis(1)).await, NextFrame::Frame(vec![0]));
    }

    #[tokio::test]
    async fn test_next_frame_pending_then_ended() {
        let handle = StreamHandle::new(TransportKind::Network, false, 2);
        assert_eq!(handle.next_frame(Duration::from_millis(5)).await, NextFrame::Pending);

        handle.push_frame(vec![7]);
        handle.stop();
        assert!(!handle.push_frame(vec![8]));
        assert_eq!(handle.next_frame(Duration::from_millis(5)).await, NextFrame::Frame(vec![7]));
        assert_eq!(handle.next_frame(Duration::from_millis(5)).await, NextFrame::Ended);
    }

    #[tokio::test]
    async fn test_stop_wakes_waiting_consumer() {
        let handle = Arc::new(StreamHandle::new(TransportKind::Network, false, 2));
        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.next_frame(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.stop();
        assert_eq!(waiter.await.unwrap(), NextFrame::Ended);
    }

    #[test]
    fn test_single_pulled_instance_per_kind() {
        let registry = StreamRegistry::new();
        let (first, created) = registry.get_or_create_pulled(TransportKind::Network, true, 10);
        assert!(created);
        let (again, created) = registry.get_or_create_pulled(TransportKind::Network, false, 10);
        assert!(!created);
        assert_eq!(first.id, again.id);

        let (_, created) = registry.get_or_create_pulled(TransportKind::LocalCamera, false, 10);
        assert!(created);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_clear_all_stops_everything() {
        let registry = StreamRegistry::new();
        let push = registry.create(TransportKind::Push, false, 10);
        let (net, _) = registry.get_or_create_pulled(TransportKind::Network, true, 10);

        assert_eq!(registry.clear_all(), 2);
        assert!(registry.is_empty());
        assert!(!push.is_live());
        assert!(!net.is_live());
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [TransportKind::Push, TransportKind::Network, TransportKind::LocalCamera] {
            assert_eq!(kind.as_str().parse::<TransportKind>().unwrap(), kind);
        }
        assert!("satellite".parse::<TransportKind>().is_err());
    }
}
