//! Display and interactive subscribers, and fan-out to them.

use crate::settings::DisplaySettings;
use crate::streams::StreamHandle;
use chrono::{DateTime, Utc};
use lobby_core::{DetectionResult, RecognitionEvent};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 32;

/// Everything a display screen is ever sent.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayMessage {
    Recognition(RecognitionEvent),
    Config(DisplaySettings),
}

impl DisplayMessage {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DisplayMessage::Recognition(event) => serde_json::to_value(event).unwrap_or_default(),
            DisplayMessage::Config(display) => serde_json::json!({
                "type": "config",
                "display": display,
            }),
        }
    }
}

/// Everything an interactive session is ever sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteractiveMessage {
    DetectionStarted,
    DetectionStopped,
    #[serde(rename = "face_detection_result")]
    Detections {
        faces: Vec<DetectionResult>,
        frame_width: u32,
        frame_height: u32,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "detection_error")]
    Error { message: String },
}

pub struct InteractiveSubscriber {
    pub id: Uuid,
    /// Destination of this session's annotated frames.
    stream: Mutex<Arc<StreamHandle>>,
    detecting: AtomicBool,
    tx: mpsc::Sender<InteractiveMessage>,
}

impl InteractiveSubscriber {
    pub fn stream(&self) -> Arc<StreamHandle> {
        Arc::clone(&self.stream.lock())
    }

    /// Swap in a fresh stream, e.g. after a forced stop cleared the old one.
    pub fn replace_stream(&self, stream: Arc<StreamHandle>) -> Arc<StreamHandle> {
        std::mem::replace(&mut *self.stream.lock(), stream)
    }

    pub fn is_detecting(&self) -> bool {
        self.detecting.load(Ordering::Acquire)
    }

    pub fn set_detecting(&self, detecting: bool) {
        self.detecting.store(detecting, Ordering::Release);
    }

    /// Deliver without blocking; a slow session loses the message.
    pub fn send(&self, message: InteractiveMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(session = %self.id, error = %e, "interactive message not delivered");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct SubscriberRegistry {
    displays: Mutex<HashMap<Uuid, mpsc::Sender<DisplayMessage>>>,
    interactive: Mutex<HashMap<Uuid, Arc<InteractiveSubscriber>>>,
    latest: Mutex<Option<RecognitionEvent>>,
    send_timeout: Duration,
}

impl SubscriberRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            displays: Mutex::new(HashMap::new()),
            interactive: Mutex::new(HashMap::new()),
            latest: Mutex::new(None),
            send_timeout,
        }
    }

    pub fn register_display(&self) -> (Uuid, mpsc::Receiver<DisplayMessage>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.displays.lock().insert(id, tx);
        tracing::info!(display = %id, "display subscriber connected");
        (id, rx)
    }

    /// Deliver to one display without waiting.
    pub fn send_to_display(&self, id: Uuid, message: DisplayMessage) -> bool {
        let Some(tx) = self.displays.lock().get(&id).cloned() else {
            return false;
        };
        tx.try_send(message).is_ok()
    }

    pub fn unregister_display(&self, id: Uuid) -> bool {
        let removed = self.displays.lock().remove(&id).is_some();
        if removed {
            tracing::info!(display = %id, "display subscriber disconnected");
        }
        removed
    }

    pub fn add_interactive(
        &self,
        stream: Arc<StreamHandle>,
    ) -> (Arc<InteractiveSubscriber>, mpsc::Receiver<InteractiveMessage>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let subscriber = Arc::new(InteractiveSubscriber {
            id: Uuid::new_v4(),
            stream: Mutex::new(stream),
            detecting: AtomicBool::new(false),
            tx,
        });
        self.interactive.lock().insert(subscriber.id, Arc::clone(&subscriber));
        tracing::info!(session = %subscriber.id, "interactive subscriber connected");
        (subscriber, rx)
    }

    pub fn interactive(&self, id: Uuid) -> Option<Arc<InteractiveSubscriber>> {
        self.interactive.lock().get(&id).cloned()
    }

    pub fn remove_interactive(&self, id: Uuid) -> Option<Arc<InteractiveSubscriber>> {
        let removed = self.interactive.lock().remove(&id);
        if removed.is_some() {
            tracing::info!(session = %id, "interactive subscriber disconnected");
        }
        removed
    }

    pub fn interactive_sessions(&self) -> Vec<Arc<InteractiveSubscriber>> {
        self.interactive.lock().values().cloned().collect()
    }

    pub fn display_count(&self) -> usize {
        self.displays.lock().len()
    }

    pub fn interactive_count(&self) -> usize {
        self.interactive.lock().len()
    }

    /// Send `message` to every display concurrently.
    ///
    /// A slow or gone display never holds up the others. Displays whose
    /// channel is closed are dropped from the registry.
    pub async fn broadcast(&self, message: DisplayMessage) -> BroadcastReport {
        let targets: Vec<(Uuid, mpsc::Sender<DisplayMessage>)> = self
            .displays
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let timeout = self.send_timeout;
        let sends = targets.into_iter().map(|(id, tx)| {
            let message = message.clone();
            async move { (id, tx.send_timeout(message, timeout).await) }
        });
        let results = futures::future::join_all(sends).await;

        let mut report = BroadcastReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    report.failed += 1;
                    tracing::warn!(display = %id, "display too slow; message dropped");
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    report.failed += 1;
                    tracing::warn!(display = %id, "display channel closed; removing");
                    self.unregister_display(id);
                }
            }
        }
        report
    }

    pub fn set_latest(&self, event: RecognitionEvent) {
        *self.latest.lock() = Some(event);
    }

    pub fn latest(&self) -> Option<RecognitionEvent> {
        self.latest.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::TransportKind;
    use lobby_core::Identity;

    fn event(name: &str) -> RecognitionEvent {
        let identity = Identity {
            person_id: format!("id-{name}"),
            name: name.to_string(),
            score: 0.9,
        };
        RecognitionEvent::new(&identity, "Guest", None)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_display() {
        let registry = SubscriberRegistry::new(Duration::from_millis(50));
        let (_, mut d1) = registry.register_display();
        let (_, mut d2) = registry.register_display();

        let report = registry.broadcast(DisplayMessage::Recognition(event("Alice"))).await;
        assert_eq!(report, BroadcastReport { delivered: 2, failed: 0 });

        for rx in [&mut d1, &mut d2] {
            match rx.recv().await {
                Some(DisplayMessage::Recognition(e)) => assert_eq!(e.name, "Alice"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_failed_display_is_isolated() {
        let registry = SubscriberRegistry::new(Duration::from_millis(20));
        let (_, mut healthy) = registry.register_display();
        let (gone, gone_rx) = registry.register_display();
        drop(gone_rx);
        // Fill a third display's queue so its next send times out.
        let (_, _stuck_rx) = registry.register_display();
        for _ in 0..CHANNEL_CAPACITY {
            registry.broadcast(DisplayMessage::Config(DisplaySettings::default())).await;
            let _ = healthy.recv().await;
        }

        let report = registry.broadcast(DisplayMessage::Recognition(event("Bob"))).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert!(matches!(healthy.recv().await, Some(DisplayMessage::Recognition(_))));
        // The closed display was dropped on the first broadcast.
        assert!(!registry.unregister_display(gone));
        assert_eq!(registry.display_count(), 2);
    }

    #[tokio::test]
    async fn test_latest_recognition_is_single_slot() {
        let registry = SubscriberRegistry::new(Duration::from_millis(20));
        assert!(registry.latest().is_none());
        registry.set_latest(event("Alice"));
        registry.set_latest(event("Bob"));
        assert_eq!(registry.latest().map(|e| e.name), Some("Bob".to_string()));
    }

    #[test]
    fn test_interactive_detecting_flag() {
        let registry = SubscriberRegistry::new(Duration::from_millis(20));
        let stream = Arc::new(StreamHandle::new(TransportKind::Push, false, 4));
        let (session, mut rx) = registry.add_interactive(stream);

        assert!(!session.is_detecting());
        session.set_detecting(true);
        assert!(registry.interactive(session.id).unwrap().is_detecting());

        assert!(session.send(InteractiveMessage::DetectionStarted));
        assert_eq!(rx.try_recv().unwrap(), InteractiveMessage::DetectionStarted);

        assert!(registry.remove_interactive(session.id).is_some());
        assert_eq!(registry.interactive_count(), 0);
    }

    #[test]
    fn test_wire_shapes() {
        let json = DisplayMessage::Recognition(event("Alice")).to_json();
        assert_eq!(json["type"], "recognition");
        assert_eq!(json["name"], "Alice");

        let json = DisplayMessage::Config(DisplaySettings::default()).to_json();
        assert_eq!(json["type"], "config");
        assert_eq!(json["display"]["timer"], 5);

        let json = serde_json::to_value(InteractiveMessage::Error { message: "boom".into() }).unwrap();
        assert_eq!(json["type"], "detection_error");
        assert_eq!(json["message"], "boom");
    }
}
