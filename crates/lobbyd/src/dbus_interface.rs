use crate::directory::CredentialChangeRequest;
use crate::runtime::{ClientHold, CommandError, EnrollRequest, Runtime};
use crate::settings::{CameraSource, DisplaySettings, RecognitionSettings};
use crate::streams::{NextFrame, TransportKind};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use zbus::fdo;
use zbus::interface;
use zbus::message::Header;
use zbus::object_server::SignalEmitter;

/// D-Bus interface for the lobby daemon.
///
/// Bus name: io.lobby.Lobby1
/// Object path: /io/lobby/Lobby1
///
/// Structured results are returned as JSON strings. Display and session
/// messages are emitted as `DisplayEvent` and `SessionEvent` signals; both
/// are released when the client that opened them leaves the bus.
pub struct LobbyService {
    runtime: Arc<Runtime>,
}

impl LobbyService {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }
}

impl From<CommandError> for fdo::Error {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::UnknownSession(_) | CommandError::NotPulled(_) => fdo::Error::InvalidArgs(e.to_string()),
            CommandError::Settings(_) => fdo::Error::InvalidArgs(e.to_string()),
            _ => fdo::Error::Failed(e.to_string()),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("encode failed: {e}")))
}

fn from_json<T: DeserializeOwned>(json: &str) -> fdo::Result<T> {
    serde_json::from_str(json).map_err(|e| fdo::Error::InvalidArgs(format!("invalid JSON: {e}")))
}

fn parse_id(id: &str) -> fdo::Result<Uuid> {
    id.parse()
        .map_err(|_| fdo::Error::InvalidArgs(format!("not a valid id: {id}")))
}

fn parse_kind(kind: &str) -> fdo::Result<TransportKind> {
    kind.parse().map_err(fdo::Error::InvalidArgs)
}

fn bind_caller(runtime: &Runtime, header: &Header<'_>, hold: ClientHold) {
    match header.sender() {
        Some(sender) => runtime.bind_to_client(sender.as_str(), hold),
        None => tracing::debug!(?hold, "call without sender; not bound to a client"),
    }
}

/// Release displays and sessions whose bus client disconnects.
pub async fn watch_disconnects(connection: &zbus::Connection, runtime: Arc<Runtime>) -> zbus::Result<JoinHandle<()>> {
    let dbus = fdo::DBusProxy::new(connection).await?;
    let mut changes = dbus.receive_name_owner_changed().await?;

    Ok(tokio::spawn(async move {
        let _dbus = dbus;
        while let Some(signal) = changes.next().await {
            let args = match signal.args() {
                Ok(args) => args,
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable NameOwnerChanged signal");
                    continue;
                }
            };
            let name = args.name().as_str();
            if name.starts_with(':') && args.new_owner().is_none() {
                runtime.release_client(name);
            }
        }
        tracing::debug!("disconnect watcher ended");
    }))
}

#[interface(name = "io.lobby.Lobby1")]
impl LobbyService {
    /// Enroll a person from an encoded reference image. An empty id is generated.
    async fn enroll(&self, id: &str, name: &str, title: &str, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(name, bytes = image.len(), "enroll requested");
        let request = EnrollRequest {
            id: Some(id.to_string()).filter(|id| !id.is_empty()),
            name: name.to_string(),
            title: title.to_string(),
            image,
        };
        match self.runtime.enroll(request).await {
            Ok(person) => to_json(&serde_json::json!({ "status": "enrolled", "person": person })),
            Err(e) => {
                tracing::info!(name, reason = e.code(), error = %e, "enrollment rejected");
                to_json(&serde_json::json!({
                    "status": "error",
                    "reason": e.code(),
                    "message": e.to_string(),
                }))
            }
        }
    }

    async fn delete_person(&self, id: &str) -> fdo::Result<bool> {
        tracing::info!(person_id = id, "delete requested");
        Ok(self.runtime.delete_person(id).await?)
    }

    async fn list_people(&self) -> fdo::Result<String> {
        to_json(&self.runtime.list_people().await?)
    }

    async fn rebuild_gallery(&self) -> fdo::Result<u32> {
        let entries = self
            .runtime
            .rebuild_gallery()
            .await
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;
        Ok(entries as u32)
    }

    async fn start_detection(&self, actor: &str) -> fdo::Result<String> {
        to_json(&self.runtime.start_detection(actor)?)
    }

    async fn stop_detection(&self, actor: &str, force: bool) -> fdo::Result<String> {
        to_json(&self.runtime.stop_detection(actor, force)?)
    }

    async fn get_detection_status(&self) -> fdo::Result<String> {
        to_json(&self.runtime.get_detection_status())
    }

    async fn status(&self) -> fdo::Result<String> {
        to_json(&self.runtime.system_status().await?)
    }

    async fn poll_latest_recognition(&self) -> fdo::Result<String> {
        to_json(&self.runtime.poll_latest_recognition())
    }

    /// Register a display. Its messages follow as `DisplayEvent` signals
    /// carrying the returned subscriber id.
    async fn register_display(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<String> {
        let (id, mut rx) = self.runtime.register_display();
        bind_caller(&self.runtime, &header, ClientHold::Display(id));
        let emitter = emitter.to_owned();
        let subscriber = id.to_string();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let json = message.to_json().to_string();
                if let Err(e) = Self::display_event(&emitter, &subscriber, &json).await {
                    tracing::warn!(display = %subscriber, error = %e, "display signal failed");
                }
            }
            tracing::debug!(display = %subscriber, "display forwarding ended");
        });
        Ok(id.to_string())
    }

    async fn unregister_display(&self, id: &str) -> fdo::Result<bool> {
        Ok(self.runtime.unregister_display(parse_id(id)?))
    }

    /// Open an interactive session. Its messages follow as `SessionEvent` signals.
    async fn open_session(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<String> {
        let (id, mut rx) = self.runtime.open_session();
        bind_caller(&self.runtime, &header, ClientHold::Session(id));
        let emitter = emitter.to_owned();
        let session = id.to_string();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(session = %session, error = %e, "session message not encodable");
                        continue;
                    }
                };
                if let Err(e) = Self::session_event(&emitter, &session, &json).await {
                    tracing::warn!(session = %session, error = %e, "session signal failed");
                }
            }
            tracing::debug!(session = %session, "session forwarding ended");
        });
        Ok(id.to_string())
    }

    async fn set_detecting(&self, session: &str, detecting: bool) -> fdo::Result<()> {
        Ok(self.runtime.set_detecting(parse_id(session)?, detecting)?)
    }

    /// Process one encoded frame. Returns `null` while the session is not detecting.
    async fn submit_frame(&self, session: &str, frame: Vec<u8>) -> fdo::Result<String> {
        let report = self.runtime.submit_frame(parse_id(session)?, &frame).await?;
        to_json(&report)
    }

    /// Next annotated JPEG of a session: `("frame", bytes)`, `("pending", [])` or `("ended", [])`.
    async fn next_session_frame(&self, session: &str) -> fdo::Result<(String, Vec<u8>)> {
        Ok(frame_reply(self.runtime.next_session_frame(parse_id(session)?).await?))
    }

    async fn close_session(&self, session: &str) -> fdo::Result<bool> {
        Ok(self.runtime.close_session(parse_id(session)?))
    }

    /// Detect and match faces in one encoded image. Nothing is announced.
    async fn detect_image(&self, image: Vec<u8>) -> fdo::Result<String> {
        tracing::debug!(bytes = image.len(), "one-shot detection requested");
        to_json(&self.runtime.detect_image(&image).await?)
    }

    /// Start or join the pulled stream of `kind` (`network` or `local_camera`).
    async fn start_stream(&self, kind: &str) -> fdo::Result<String> {
        Ok(self.runtime.start_stream(parse_kind(kind)?)?.to_string())
    }

    async fn next_frame(&self, kind: &str) -> fdo::Result<(String, Vec<u8>)> {
        Ok(frame_reply(self.runtime.next_frame(parse_kind(kind)?).await?))
    }

    async fn stop_stream(&self, kind: &str) -> fdo::Result<bool> {
        Ok(self.runtime.stop_stream(parse_kind(kind)?))
    }

    async fn login(&self, id: &str, password: &str) -> fdo::Result<String> {
        let outcome = self.runtime.login(id, password).await?;
        to_json(&serde_json::json!({ "result": outcome, "message": outcome.message() }))
    }

    async fn change_credentials(
        &self,
        current_id: &str,
        current_password: &str,
        new_id: &str,
        new_password: &str,
        confirm_password: &str,
    ) -> fdo::Result<String> {
        let request = CredentialChangeRequest {
            current_id: current_id.to_string(),
            current_password: current_password.to_string(),
            new_id: new_id.to_string(),
            new_password: new_password.to_string(),
            confirm_password: confirm_password.to_string(),
        };
        let outcome = self.runtime.change_credentials(request).await?;
        to_json(&serde_json::json!({ "result": outcome, "message": outcome.message() }))
    }

    async fn get_settings(&self) -> fdo::Result<String> {
        to_json(&self.runtime.settings())
    }

    /// Replace the camera selection, e.g. `{"source":"network","url":"rtsp://..."}`.
    async fn set_camera(&self, camera: &str) -> fdo::Result<String> {
        let camera: CameraSource = from_json(camera)?;
        to_json(&self.runtime.update_camera(camera)?)
    }

    async fn set_recognition(&self, recognition: &str) -> fdo::Result<String> {
        let recognition: RecognitionSettings = from_json(recognition)?;
        to_json(&self.runtime.update_recognition(recognition)?)
    }

    async fn set_display(&self, display: &str) -> fdo::Result<String> {
        let display: DisplaySettings = from_json(display)?;
        to_json(&self.runtime.update_display(display).await?)
    }

    /// Open a camera once and grab a frame. An empty argument tests the configured source.
    async fn test_camera(&self, camera: &str) -> fdo::Result<String> {
        let camera = if camera.trim().is_empty() {
            None
        } else {
            Some(from_json::<CameraSource>(camera)?)
        };
        to_json(&self.runtime.test_camera(camera).await)
    }

    #[zbus(signal)]
    async fn display_event(emitter: &SignalEmitter<'_>, subscriber: &str, event: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn session_event(emitter: &SignalEmitter<'_>, session: &str, event: &str) -> zbus::Result<()>;
}

fn frame_reply(next: NextFrame) -> (String, Vec<u8>) {
    match next {
        NextFrame::Frame(jpeg) => ("frame".into(), jpeg),
        NextFrame::Pending => ("pending".into(), Vec::new()),
        NextFrame::Ended => ("ended".into(), Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_errors_map_to_dbus_errors() {
        let unknown: fdo::Error = CommandError::UnknownSession(Uuid::nil()).into();
        assert!(matches!(unknown, fdo::Error::InvalidArgs(_)));

        let inactive: fdo::Error = CommandError::Inactive.into();
        assert!(matches!(inactive, fdo::Error::Failed(m) if m == "detection is not active"));
    }

    #[test]
    fn test_camera_argument_parsing() {
        let camera: CameraSource = from_json(r#"{"source":"device","device_index":2}"#).unwrap();
        assert_eq!(camera, CameraSource::Device { device_index: 2 });
        assert!(from_json::<CameraSource>(r#"{"source":"satellite"}"#).is_err());
        assert!(parse_kind("camera").is_ok());
        assert!(parse_id("nope").is_err());
    }

    #[test]
    fn test_frame_reply_shapes() {
        assert_eq!(frame_reply(NextFrame::Frame(vec![1, 2])), ("frame".into(), vec![1, 2]));
        assert_eq!(frame_reply(NextFrame::Ended).0, "ended");
    }
}
