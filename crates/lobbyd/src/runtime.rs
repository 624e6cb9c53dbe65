//! The daemon's runtime state and every command it answers.
//!
//! One [`Runtime`] owns the registries, the activation switch, the gallery and
//! the background workers. It is created once by `main`, shared behind an
//! `Arc`, and torn down with [`Runtime::shutdown`].

use crate::activation::{Activated, Activation, ActivationState, StateError};
use crate::directory::{
    AuthOutcome, CredentialChange, CredentialChangeRequest, Directory, DirectoryError, InsertOutcome,
};
use crate::pipeline::{decode_image, Pipeline, PipelineError, Sighting};
use crate::settings::{CameraSource, DisplaySettings, RecognitionSettings, Settings, SettingsError, SettingsStore};
use crate::streams::{NextFrame, StreamHandle, StreamRegistry, TransportKind};
use crate::subscribers::{DisplayMessage, InteractiveMessage, InteractiveSubscriber, SubscriberRegistry};
use crate::supervisor::{Launch, RetryPolicy, Supervisor, WorkerJob, WorkerState};
use crate::transport::{self, SourceFactory};
use crate::vision::VisionHandle;
use chrono::{DateTime, Utc};
use image::ImageFormat;
use lobby_core::overlay::OverlayStyle;
use lobby_core::{Deduplicator, DetectionResult, Gallery, GalleryBuilder, Person, RecognitionEvent, VisionError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const SIGHTING_QUEUE: usize = 64;
const DISPLAY_SEND_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("no face found in the image")]
    NoFace,
    #[error("{0} faces found in the image; exactly one is required")]
    MultipleFaces(usize),
    #[error("person id already exists: {0}")]
    DuplicateId(String),
    #[error("vision: {0}")]
    Vision(#[from] VisionError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl EnrollmentError {
    /// Stable identifier for callers that branch on the failure.
    pub fn code(&self) -> &'static str {
        match self {
            EnrollmentError::EmptyName => "empty_name",
            EnrollmentError::InvalidImage(_) => "invalid_image",
            EnrollmentError::NoFace => "no_face",
            EnrollmentError::MultipleFaces(_) => "multiple_faces",
            EnrollmentError::DuplicateId(_) => "duplicate_id",
            EnrollmentError::Vision(_) => "vision",
            EnrollmentError::Directory(_) => "directory",
        }
    }
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("detection is not active")]
    Inactive,
    #[error("unknown session: {0}")]
    UnknownSession(Uuid),
    #[error("{0} is not a pulled transport")]
    NotPulled(TransportKind),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct EnrollRequest {
    /// Generated when absent.
    pub id: Option<String>,
    pub name: String,
    pub title: String,
    /// Encoded image (PNG, JPEG, ...).
    pub image: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub session_id: Uuid,
    pub already_active: bool,
    /// Background transport of the configured source.
    pub worker: Option<TransportKind>,
    /// What that worker is doing right now, as the supervisor sees it.
    pub worker_state: Option<WorkerState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped { cleared: usize },
    /// A non-forced stop declined because subscribers are still connected.
    KeptActive { displays: usize, interactive: usize },
    AlreadyInactive,
}

/// Per-frame answer to an interactive session.
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub faces: Vec<DetectionResult>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionStatus {
    pub active: bool,
    pub session_id: Option<Uuid>,
    pub started_by: Option<String>,
    pub changed_at: Option<DateTime<Utc>>,
    pub display_subscribers: usize,
    pub interactive_subscribers: usize,
    pub streams: BTreeMap<String, usize>,
    pub workers: BTreeMap<String, WorkerState>,
    pub gallery_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub uptime_secs: i64,
    pub people: usize,
    pub vision_ready: bool,
    pub camera: CameraSource,
    pub detection: DetectionStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraTest {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// A subscription held open on behalf of a bus client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientHold {
    Display(Uuid),
    Session(Uuid),
}

/// Everything the runtime is built from.
pub struct RuntimeParts {
    pub settings: SettingsStore,
    pub directory: Directory,
    pub activation: Activation,
    pub vision: VisionHandle,
    pub sources: Arc<dyn SourceFactory>,
    pub style: OverlayStyle,
}

pub struct Runtime {
    settings: SettingsStore,
    directory: Directory,
    activation: Activation,
    vision: VisionHandle,
    sources: Arc<dyn SourceFactory>,
    style: Arc<OverlayStyle>,
    gallery: Gallery,
    rebuild_lock: tokio::sync::Mutex<()>,
    subscribers: SubscriberRegistry,
    clients: Mutex<HashMap<String, Vec<ClientHold>>>,
    streams: Arc<StreamRegistry>,
    supervisor: Supervisor,
    dedup: Mutex<Deduplicator>,
    sightings: mpsc::Sender<Sighting>,
    announcer: Mutex<Option<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
}

impl Runtime {
    /// Build the runtime, load the gallery and apply the resume-on-boot policy.
    pub async fn start(parts: RuntimeParts) -> Result<Arc<Self>, CommandError> {
        let streams = Arc::new(StreamRegistry::new());
        let (sightings, sightings_rx) = mpsc::channel(SIGHTING_QUEUE);

        let runtime = Arc::new(Self {
            settings: parts.settings,
            directory: parts.directory,
            activation: parts.activation,
            vision: parts.vision,
            sources: parts.sources,
            style: Arc::new(parts.style),
            gallery: Gallery::new(),
            rebuild_lock: tokio::sync::Mutex::new(()),
            subscribers: SubscriberRegistry::new(DISPLAY_SEND_TIMEOUT),
            clients: Mutex::new(HashMap::new()),
            supervisor: Supervisor::new(Arc::clone(&streams)),
            streams,
            dedup: Mutex::new(Deduplicator::new()),
            sightings,
            announcer: Mutex::new(None),
            started_at: Utc::now(),
        });

        let announcer = tokio::spawn(announce_loop(Arc::downgrade(&runtime), sightings_rx));
        *runtime.announcer.lock() = Some(announcer);

        runtime.rebuild_gallery().await?;
        runtime.resume()?;
        Ok(runtime)
    }

    fn resume(&self) -> Result<(), CommandError> {
        if !self.activation.is_active() {
            return Ok(());
        }
        let settings = self.settings.get();
        if settings.detection.resume_on_boot {
            tracing::info!(session_id = ?self.activation.session_id(), "resuming detection from persisted state");
            self.dedup.lock().reset();
            self.launch_background(&settings);
        } else {
            tracing::info!("resume on boot disabled; resetting detection to inactive");
            self.activation.deactivate("boot")?;
        }
        Ok(())
    }

    /// Stop every worker and stream. The persisted activation state is left as is.
    pub fn shutdown(&self) {
        self.supervisor.cancel_all();
        let cleared = self.streams.clear_all();
        if let Some(announcer) = self.announcer.lock().take() {
            announcer.abort();
        }
        tracing::info!(cleared, "runtime shut down");
    }

    // --- directory -------------------------------------------------------

    pub async fn enroll(&self, request: EnrollRequest) -> Result<Person, EnrollmentError> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(EnrollmentError::EmptyName);
        }
        let image = decode_image(&request.image).map_err(|e| EnrollmentError::InvalidImage(e.to_string()))?;

        let faces = self.vision.detect(image.clone()).await?;
        match faces.len() {
            0 => return Err(EnrollmentError::NoFace),
            1 => {}
            n => return Err(EnrollmentError::MultipleFaces(n)),
        }

        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| EnrollmentError::InvalidImage(e.to_string()))?;

        let id = request
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let title = request.title.trim().to_string();

        match self.directory.insert_person(&id, &name, &title, Some(png)).await? {
            InsertOutcome::Inserted => {}
            InsertOutcome::Duplicate => return Err(EnrollmentError::DuplicateId(id)),
        }
        tracing::info!(person_id = %id, name = %name, "person enrolled");

        self.rebuild_gallery().await?;
        Ok(Person {
            id,
            name,
            title,
            has_reference_image: true,
        })
    }

    pub async fn delete_person(&self, id: &str) -> Result<bool, CommandError> {
        let removed = self.directory.delete_person(id).await?;
        if removed {
            tracing::info!(person_id = id, "person deleted");
            self.rebuild_gallery().await?;
        }
        Ok(removed)
    }

    pub async fn list_people(&self) -> Result<Vec<Person>, CommandError> {
        Ok(self.directory.list_people().await?)
    }

    /// Rebuild the gallery from every stored reference image and publish it.
    pub async fn rebuild_gallery(&self) -> Result<usize, DirectoryError> {
        let _guard = self.rebuild_lock.lock().await;
        let references = self.directory.reference_images().await?;

        let mut builder = GalleryBuilder::new();
        for reference in references {
            let image = match decode_image(&reference.image) {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(person_id = %reference.person_id, error = %e, "unreadable reference image; skipping");
                    continue;
                }
            };
            match self.vision.detect(image).await {
                Ok(detections) => {
                    builder.add_reference(&reference.person_id, &reference.name, &reference.title, detections);
                }
                Err(e) => {
                    tracing::warn!(person_id = %reference.person_id, error = %e, "reference embedding failed; skipping");
                }
            }
        }

        let snapshot = builder.build();
        let size = snapshot.len();
        self.gallery.publish(snapshot);
        tracing::info!(entries = size, "gallery rebuilt");
        Ok(size)
    }

    pub fn gallery_size(&self) -> usize {
        self.gallery.len()
    }

    pub async fn login(&self, id: &str, password: &str) -> Result<AuthOutcome, CommandError> {
        let outcome = self.directory.authenticate_admin(id, password).await?;
        tracing::info!(admin = id, result = outcome.message(), "admin login");
        Ok(outcome)
    }

    pub async fn change_credentials(
        &self,
        request: CredentialChangeRequest,
    ) -> Result<CredentialChange, CommandError> {
        Ok(self.directory.change_admin_credentials(request).await?)
    }

    // --- activation ------------------------------------------------------

    pub fn start_detection(&self, actor: &str) -> Result<StartOutcome, CommandError> {
        let settings = self.settings.get();
        match self.activation.activate(actor)? {
            Activated::Started(session_id) => {
                self.dedup.lock().reset();
                let worker = self.launch_background(&settings);
                Ok(StartOutcome {
                    session_id,
                    already_active: false,
                    worker,
                    worker_state: worker.and_then(|kind| self.supervisor.state(kind)),
                })
            }
            Activated::AlreadyActive(session_id) => {
                let worker = transport::background_kind(&settings.camera);
                let mut worker_state = worker.and_then(|kind| self.supervisor.state(kind));
                if let Some(WorkerState::Failed { error }) = &worker_state {
                    tracing::info!(actor, %session_id, error = %error, "relaunching failed background worker");
                    self.launch_background(&settings);
                    worker_state = worker.and_then(|kind| self.supervisor.state(kind));
                } else {
                    tracing::debug!(actor, %session_id, "start requested while active; no-op");
                }
                Ok(StartOutcome {
                    session_id,
                    already_active: true,
                    worker,
                    worker_state,
                })
            }
        }
    }

    pub fn stop_detection(&self, actor: &str, force: bool) -> Result<StopOutcome, CommandError> {
        if !self.activation.is_active() {
            return Ok(StopOutcome::AlreadyInactive);
        }

        if !force {
            let displays = self.subscribers.display_count();
            let interactive = self.subscribers.interactive_count();
            if displays + interactive > 0 {
                tracing::info!(actor, displays, interactive, "soft stop declined; subscribers connected");
                return Ok(StopOutcome::KeptActive { displays, interactive });
            }
        }

        self.activation.deactivate(actor)?;
        let cleared = self.streams.clear_all();
        self.supervisor.cancel_all();
        for session in self.subscribers.interactive_sessions() {
            if session.is_detecting() {
                session.set_detecting(false);
                session.send(InteractiveMessage::DetectionStopped);
            }
        }
        tracing::info!(actor, force, cleared, "detection stopped");
        Ok(StopOutcome::Stopped { cleared })
    }

    /// Launch the supervised worker for the configured pulled source, if any.
    fn launch_background(&self, settings: &Settings) -> Option<TransportKind> {
        let kind = transport::background_kind(&settings.camera)?;
        let job = self.pull_job(kind, settings);
        let policy = RetryPolicy {
            max_retries: settings.supervisor.max_retries,
            delay: Duration::from_secs(settings.supervisor.retry_delay_secs),
        };
        match self.supervisor.launch(
            kind,
            job,
            policy,
            self.activation.flag(),
            settings.stream.queue_capacity,
        ) {
            Launch::Started(stream) | Launch::Existing(stream) => {
                tracing::debug!(%kind, stream = %stream.id, "background stream in place");
            }
        }
        Some(kind)
    }

    fn pipeline(&self, kind: TransportKind, settings: &Settings) -> Pipeline {
        Pipeline::new(
            kind,
            settings,
            self.vision.clone(),
            self.gallery.clone(),
            Arc::clone(&self.style),
            self.sightings.clone(),
        )
    }

    fn pull_job(&self, kind: TransportKind, settings: &Settings) -> WorkerJob {
        let pipeline = self.pipeline(kind, settings);
        let sources = Arc::clone(&self.sources);
        let camera = settings.camera.clone();
        let active = self.activation.flag();
        let retry = Duration::from_millis(settings.stream.read_retry_ms);

        Arc::new(move |stream: &StreamHandle| {
            transport::run_pull_session(sources.as_ref(), &camera, &pipeline, stream, &active, retry)
        })
    }

    pub fn activation_state(&self) -> ActivationState {
        self.activation.get()
    }

    // --- subscribers -----------------------------------------------------

    /// Connect a display. It is sent the current theme straight away.
    pub fn register_display(&self) -> (Uuid, mpsc::Receiver<DisplayMessage>) {
        let (id, rx) = self.subscribers.register_display();
        let display = self.settings.get().display;
        self.subscribers.send_to_display(id, DisplayMessage::Config(display));
        (id, rx)
    }

    pub fn unregister_display(&self, id: Uuid) -> bool {
        self.subscribers.unregister_display(id)
    }

    pub fn poll_latest_recognition(&self) -> Option<RecognitionEvent> {
        self.subscribers.latest()
    }

    /// Open an interactive session with its own push stream.
    pub fn open_session(&self) -> (Uuid, mpsc::Receiver<InteractiveMessage>) {
        let capacity = self.settings.get().stream.queue_capacity;
        let stream = self.streams.create(TransportKind::Push, false, capacity);
        let (session, rx) = self.subscribers.add_interactive(stream);
        (session.id, rx)
    }

    pub fn close_session(&self, id: Uuid) -> bool {
        match self.subscribers.remove_interactive(id) {
            Some(session) => {
                self.streams.remove(session.stream().id);
                true
            }
            None => false,
        }
    }

    /// Remember that `client` holds `hold`, so it can be released when the client goes away.
    pub fn bind_to_client(&self, client: &str, hold: ClientHold) {
        self.clients.lock().entry(client.to_string()).or_default().push(hold);
    }

    /// Drop every display and session `client` still holds. Returns how many were open.
    pub fn release_client(&self, client: &str) -> usize {
        let Some(holds) = self.clients.lock().remove(client) else {
            return 0;
        };
        let released = holds
            .into_iter()
            .filter(|hold| match *hold {
                ClientHold::Display(id) => self.unregister_display(id),
                ClientHold::Session(id) => self.close_session(id),
            })
            .count();
        if released > 0 {
            tracing::info!(client, released, "bus client gone; subscriptions released");
        }
        released
    }

    fn session(&self, id: Uuid) -> Result<Arc<InteractiveSubscriber>, CommandError> {
        self.subscribers.interactive(id).ok_or(CommandError::UnknownSession(id))
    }

    pub fn set_detecting(&self, id: Uuid, detecting: bool) -> Result<(), CommandError> {
        let session = self.session(id)?;
        if detecting && !session.stream().is_live() {
            let capacity = self.settings.get().stream.queue_capacity;
            let fresh = self.streams.create(TransportKind::Push, false, capacity);
            let old = session.replace_stream(fresh);
            self.streams.remove(old.id);
        }
        session.set_detecting(detecting);
        session.send(if detecting {
            InteractiveMessage::DetectionStarted
        } else {
            InteractiveMessage::DetectionStopped
        });
        tracing::debug!(session = %id, detecting, "session detection toggled");
        Ok(())
    }

    /// Run one submitted frame through the pipeline on behalf of a session.
    ///
    /// Returns `None` while the session is not detecting. Failures are also
    /// reported to the session as a non-fatal error message.
    pub async fn submit_frame(&self, id: Uuid, frame: &[u8]) -> Result<Option<FrameReport>, CommandError> {
        let session = self.session(id)?;
        if !session.is_detecting() {
            return Ok(None);
        }

        let processed = match decode_image(frame) {
            Ok(image) => {
                let settings = self.settings.get();
                self.pipeline(TransportKind::Push, &settings).process(image).await
            }
            Err(e) => Err(e),
        };
        let processed = match processed {
            Ok(processed) => processed,
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "frame processing failed");
                session.send(InteractiveMessage::Error { message: e.to_string() });
                return Err(e.into());
            }
        };

        session.stream().push_frame(processed.jpeg);
        let report = FrameReport {
            faces: processed.detections,
            frame_width: processed.width,
            frame_height: processed.height,
            timestamp: Utc::now(),
        };
        session.send(InteractiveMessage::Detections {
            faces: report.faces.clone(),
            frame_width: report.frame_width,
            frame_height: report.frame_height,
            timestamp: report.timestamp,
        });
        Ok(Some(report))
    }

    /// Detect and match faces in one encoded image outside any session.
    ///
    /// Matches are only returned; they never become sightings or display events.
    pub async fn detect_image(&self, image: &[u8]) -> Result<FrameReport, CommandError> {
        let image = decode_image(image)?;
        let settings = self.settings.get();
        let processed = self
            .pipeline(TransportKind::Push, &settings)
            .silent()
            .process(image)
            .await?;
        tracing::debug!(faces = processed.detections.len(), "one-shot detection");
        Ok(FrameReport {
            faces: processed.detections,
            frame_width: processed.width,
            frame_height: processed.height,
            timestamp: Utc::now(),
        })
    }

    /// Next annotated frame of a session's own stream.
    pub async fn next_session_frame(&self, id: Uuid) -> Result<NextFrame, CommandError> {
        let session = self.session(id)?;
        let wait = Duration::from_millis(self.settings.get().stream.frame_wait_ms);
        Ok(session.stream().next_frame(wait).await)
    }

    // --- pulled streams --------------------------------------------------

    /// Start (or join) the pulled stream of `kind`.
    pub fn start_stream(&self, kind: TransportKind) -> Result<Uuid, CommandError> {
        if !kind.is_pulled() {
            return Err(CommandError::NotPulled(kind));
        }
        if !self.activation.is_active() {
            return Err(CommandError::Inactive);
        }

        let settings = self.settings.get();
        let (stream, created) =
            self.streams
                .get_or_create_pulled(kind, false, settings.stream.queue_capacity);
        if !created {
            tracing::debug!(%kind, stream = %stream.id, "joining existing stream");
            return Ok(stream.id);
        }

        let job = self.pull_job(kind, &settings);
        let streams = Arc::clone(&self.streams);
        let handle = Arc::clone(&stream);
        tokio::spawn(async move {
            let worker = Arc::clone(&handle);
            match tokio::task::spawn_blocking(move || job(&*worker)).await {
                Ok(Ok(exit)) => tracing::debug!(%kind, ?exit, "viewer stream ended"),
                Ok(Err(e)) => tracing::warn!(%kind, error = %e, "viewer stream failed"),
                Err(e) => tracing::warn!(%kind, error = %e, "viewer stream panicked"),
            }
            streams.remove(handle.id);
        });

        tracing::info!(%kind, stream = %stream.id, "viewer stream started");
        Ok(stream.id)
    }

    pub async fn next_frame(&self, kind: TransportKind) -> Result<NextFrame, CommandError> {
        if !kind.is_pulled() {
            return Err(CommandError::NotPulled(kind));
        }
        let Some(stream) = self.streams.find_pulled(kind) else {
            return Ok(NextFrame::Ended);
        };
        let wait = Duration::from_millis(self.settings.get().stream.frame_wait_ms);
        Ok(stream.next_frame(wait).await)
    }

    /// Stop the viewer-driven stream of `kind`. Background streams keep running.
    pub fn stop_stream(&self, kind: TransportKind) -> bool {
        match self.streams.find_pulled(kind) {
            Some(stream) if !stream.background => {
                self.streams.remove(stream.id);
                tracing::info!(%kind, stream = %stream.id, "viewer stream stopped");
                true
            }
            _ => false,
        }
    }

    // --- settings --------------------------------------------------------

    pub fn settings(&self) -> Settings {
        self.settings.get()
    }

    /// Takes effect for transports started afterwards.
    pub fn update_camera(&self, camera: CameraSource) -> Result<Settings, CommandError> {
        Ok(self.settings.update(|s| s.camera = camera)?)
    }

    pub fn update_recognition(&self, recognition: RecognitionSettings) -> Result<Settings, CommandError> {
        Ok(self.settings.update(|s| s.recognition = recognition)?)
    }

    /// Persist the theme and push it to every display.
    pub async fn update_display(&self, display: DisplaySettings) -> Result<Settings, CommandError> {
        let settings = self.settings.update(|s| s.display = display)?;
        let report = self
            .subscribers
            .broadcast(DisplayMessage::Config(settings.display.clone()))
            .await;
        tracing::info!(delivered = report.delivered, failed = report.failed, "display settings pushed");
        Ok(settings)
    }

    /// Open a source once and read a frame. Uses the configured source when `camera` is `None`.
    pub async fn test_camera(&self, camera: Option<CameraSource>) -> CameraTest {
        let settings = self.settings.get();
        let camera = camera.unwrap_or(settings.camera);
        let sources = Arc::clone(&self.sources);

        let grabbed = tokio::task::spawn_blocking(move || transport::grab_one(sources.as_ref(), &camera)).await;
        match grabbed {
            Ok(Ok((width, height))) => CameraTest {
                ok: true,
                message: format!("camera working: {width}x{height}"),
                width: Some(width),
                height: Some(height),
            },
            Ok(Err(e)) => CameraTest {
                ok: false,
                message: e.to_string(),
                width: None,
                height: None,
            },
            Err(e) => CameraTest {
                ok: false,
                message: format!("camera test failed: {e}"),
                width: None,
                height: None,
            },
        }
    }

    // --- status ----------------------------------------------------------

    pub fn get_detection_status(&self) -> DetectionStatus {
        let state = self.activation.get();
        DetectionStatus {
            active: state.active,
            session_id: state.session_id,
            started_by: state.started_by,
            changed_at: state.changed_at,
            display_subscribers: self.subscribers.display_count(),
            interactive_subscribers: self.subscribers.interactive_count(),
            streams: self
                .streams
                .counts()
                .into_iter()
                .map(|(kind, n)| (kind.to_string(), n))
                .collect(),
            workers: self
                .supervisor
                .states()
                .into_iter()
                .map(|(kind, state)| (kind.to_string(), state))
                .collect(),
            gallery_size: self.gallery.len(),
        }
    }

    pub async fn system_status(&self) -> Result<SystemStatus, CommandError> {
        Ok(SystemStatus {
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            people: self.directory.count_people().await?,
            vision_ready: self.vision.is_alive(),
            camera: self.settings.get().camera,
            detection: self.get_detection_status(),
        })
    }

    // --- announcements ---------------------------------------------------

    /// Turn a sighting into an event if detection is active and the cooldown allows.
    async fn announce(&self, sighting: Sighting) -> Option<RecognitionEvent> {
        if !self.activation.is_active() {
            return None;
        }
        let cooldown = self.settings.get().recognition.cooldown();
        let identity = sighting.identity;
        if !self
            .dedup
            .lock()
            .should_announce(&identity.person_id, Instant::now(), cooldown)
        {
            return None;
        }

        let title = self
            .gallery
            .snapshot()
            .get(&identity.person_id)
            .map(|entry| entry.title.clone())
            .unwrap_or_default();
        let event = RecognitionEvent::new(&identity, title, self.activation.session_id());

        self.subscribers.set_latest(event.clone());
        let report = self
            .subscribers
            .broadcast(DisplayMessage::Recognition(event.clone()))
            .await;
        tracing::info!(
            person_id = %event.person_id,
            name = %event.name,
            score = event.score,
            kind = %sighting.kind,
            delivered = report.delivered,
            failed = report.failed,
            "recognition announced"
        );
        Some(event)
    }
}

async fn announce_loop(runtime: Weak<Runtime>, mut sightings: mpsc::Receiver<Sighting>) {
    while let Some(sighting) = sightings.recv().await {
        let Some(runtime) = runtime.upgrade() else {
            break;
        };
        runtime.announce(sighting).await;
    }
    tracing::debug!("announcer exiting");
}
