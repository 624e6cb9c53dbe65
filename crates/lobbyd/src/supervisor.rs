//! Retry wrapper around background (non-viewer-driven) pull loops.
//!
//! At most one background worker runs per transport kind. A worker that fails
//! is restarted after a fixed delay while detection stays active, up to a
//! retry budget; once the budget is spent it stays down until the next admin
//! start.

use crate::activation::ActiveFlag;
use crate::streams::{StreamHandle, StreamRegistry, TransportKind};
use crate::transport::{PullExit, WorkerError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Observable lifecycle of a supervised worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    Retrying { attempt: u32 },
    Stopped,
    Failed { error: String },
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

/// One attempt of a worker: run to completion on a blocking thread.
pub type WorkerJob = Arc<dyn Fn(&StreamHandle) -> Result<PullExit, WorkerError> + Send + Sync>;

#[derive(Debug, Clone)]
pub enum Launch {
    Started(Arc<StreamHandle>),
    /// A live stream of this kind already exists and is reused.
    Existing(Arc<StreamHandle>),
}

struct Worker {
    stream: Arc<StreamHandle>,
    state: watch::Receiver<WorkerState>,
}

pub struct Supervisor {
    streams: Arc<StreamRegistry>,
    workers: Mutex<HashMap<TransportKind, Worker>>,
}

impl Supervisor {
    pub fn new(streams: Arc<StreamRegistry>) -> Self {
        Self {
            streams,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Start the background worker for `kind` unless a live stream of that
    /// kind already exists.
    pub fn launch(
        &self,
        kind: TransportKind,
        job: WorkerJob,
        policy: RetryPolicy,
        active: ActiveFlag,
        queue_capacity: usize,
    ) -> Launch {
        let mut workers = self.workers.lock();
        if let Some(previous) = workers.get(&kind) {
            if previous.state.borrow().is_terminal() {
                // A finished worker may still hold its stream for a moment.
                self.streams.remove(previous.stream.id);
            }
        }
        let (stream, created) = self.streams.get_or_create_pulled(kind, true, queue_capacity);
        if !created {
            tracing::debug!(%kind, stream = %stream.id, "stream already running; not launching another");
            return Launch::Existing(stream);
        }

        let (state_tx, state_rx) = watch::channel(WorkerState::Starting);
        workers.insert(
            kind,
            Worker {
                stream: Arc::clone(&stream),
                state: state_rx,
            },
        );

        let streams = Arc::clone(&self.streams);
        let handle = Arc::clone(&stream);
        tokio::spawn(async move {
            supervise(kind, job, policy, active, &handle, &state_tx).await;
            streams.remove(handle.id);
        });

        tracing::info!(%kind, stream = %stream.id, max_retries = policy.max_retries, "background worker launched");
        Launch::Started(stream)
    }

    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.workers.lock().drain().collect();
        for (kind, worker) in drained {
            self.streams.remove(worker.stream.id);
            tracing::info!(%kind, "background worker cancelled");
        }
    }

    pub fn state(&self, kind: TransportKind) -> Option<WorkerState> {
        self.workers.lock().get(&kind).map(|w| w.state.borrow().clone())
    }

    pub fn states(&self) -> HashMap<TransportKind, WorkerState> {
        self.workers
            .lock()
            .iter()
            .map(|(kind, w)| (*kind, w.state.borrow().clone()))
            .collect()
    }

    /// Watch the state of the worker for `kind`.
    pub fn subscribe(&self, kind: TransportKind) -> Option<watch::Receiver<WorkerState>> {
        self.workers.lock().get(&kind).map(|w| w.state.clone())
    }
}

async fn supervise(
    kind: TransportKind,
    job: WorkerJob,
    policy: RetryPolicy,
    active: ActiveFlag,
    stream: &Arc<StreamHandle>,
    state: &watch::Sender<WorkerState>,
) {
    let mut failures = 0u32;

    loop {
        state.send_replace(WorkerState::Running);

        let attempt = {
            let job = Arc::clone(&job);
            let stream = Arc::clone(stream);
            tokio::task::spawn_blocking(move || job(&*stream)).await
        };
        let error = match attempt {
            Ok(Ok(exit)) => {
                tracing::info!(%kind, ?exit, "background worker finished");
                state.send_replace(WorkerState::Stopped);
                return;
            }
            Ok(Err(e)) => e,
            Err(join) => WorkerError::Panicked(join.to_string()),
        };

        if !active.get() || !stream.is_live() {
            tracing::info!(%kind, error = %error, "worker failed after stop; not retrying");
            state.send_replace(WorkerState::Stopped);
            return;
        }

        failures += 1;
        if failures > policy.max_retries {
            tracing::error!(%kind, fatal = true, attempts = failures, error = %error, "background worker gave up");
            state.send_replace(WorkerState::Failed {
                error: error.to_string(),
            });
            return;
        }

        tracing::warn!(%kind, attempt = failures, max = policy.max_retries, error = %error, "background worker failed; retrying");
        state.send_replace(WorkerState::Retrying { attempt: failures });

        tokio::select! {
            _ = tokio::time::sleep(policy.delay) => {}
            _ = stream.stopped() => {}
        }
        if !active.get() || !stream.is_live() {
            state.send_replace(WorkerState::Stopped);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            delay: Duration::from_millis(5),
        }
    }

    fn active() -> ActiveFlag {
        let flag = ActiveFlag::default();
        flag.set(true);
        flag
    }

    async fn settle(rx: &mut watch::Receiver<WorkerState>) -> WorkerState {
        let settled = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.is_terminal()))
            .await
            .expect("worker did not settle")
            .unwrap();
        WorkerState::clone(&settled)
    }

    #[tokio::test]
    async fn test_fails_after_retry_budget() {
        let streams = Arc::new(StreamRegistry::new());
        let supervisor = Supervisor::new(Arc::clone(&streams));
        let calls = Arc::new(AtomicU32::new(0));

        let job: WorkerJob = {
            let calls = Arc::clone(&calls);
            Arc::new(move |_stream: &StreamHandle| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(WorkerError::Panicked("boom".into()))
            })
        };
        supervisor.launch(TransportKind::Network, job, policy(3), active(), 10);

        let mut rx = supervisor.subscribe(TransportKind::Network).unwrap();
        assert!(matches!(settle(&mut rx).await, WorkerState::Failed { .. }));
        // One initial attempt plus three retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(streams.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_job_is_retried() {
        let streams = Arc::new(StreamRegistry::new());
        let supervisor = Supervisor::new(Arc::clone(&streams));
        let calls = Arc::new(AtomicU32::new(0));

        let job: WorkerJob = {
            let calls = Arc::clone(&calls);
            Arc::new(move |_stream: &StreamHandle| {
                calls.fetch_add(1, Ordering::SeqCst);
                panic!("decoder blew up");
            })
        };
        supervisor.launch(TransportKind::Network, job, policy(2), active(), 10);

        let mut rx = supervisor.subscribe(TransportKind::Network).unwrap();
        match settle(&mut rx).await {
            WorkerState::Failed { error } => assert!(error.contains("panicked"), "{error}"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_relaunch_after_failure() {
        let streams = Arc::new(StreamRegistry::new());
        let supervisor = Supervisor::new(Arc::clone(&streams));
        let calls = Arc::new(AtomicU32::new(0));

        let job: WorkerJob = {
            let calls = Arc::clone(&calls);
            Arc::new(move |stream: &StreamHandle| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(WorkerError::Panicked("first run".into()));
                }
                while stream.is_live() {
                    std::thread::sleep(Duration::from_millis(2));
                }
                Ok(PullExit::Stopped)
            })
        };
        supervisor.launch(TransportKind::Network, Arc::clone(&job), policy(0), active(), 10);
        let mut rx = supervisor.subscribe(TransportKind::Network).unwrap();
        assert!(matches!(settle(&mut rx).await, WorkerState::Failed { .. }));

        assert!(matches!(
            supervisor.launch(TransportKind::Network, job, policy(0), active(), 10),
            Launch::Started(_)
        ));
        let mut rx = supervisor.subscribe(TransportKind::Network).unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == WorkerState::Running))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(supervisor.state(TransportKind::Network), Some(WorkerState::Running));
        supervisor.cancel_all();
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let streams = Arc::new(StreamRegistry::new());
        let supervisor = Supervisor::new(Arc::clone(&streams));
        let calls = Arc::new(AtomicU32::new(0));

        let job: WorkerJob = {
            let calls = Arc::clone(&calls);
            Arc::new(move |_stream: &StreamHandle| {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(WorkerError::Panicked("flaky".into()))
                } else {
                    Ok(PullExit::Stopped)
                }
            })
        };
        supervisor.launch(TransportKind::LocalCamera, job, policy(10), active(), 10);

        let mut rx = supervisor.subscribe(TransportKind::LocalCamera).unwrap();
        assert_eq!(settle(&mut rx).await, WorkerState::Stopped);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_once_inactive() {
        let streams = Arc::new(StreamRegistry::new());
        let supervisor = Supervisor::new(Arc::clone(&streams));
        let flag = active();

        let job: WorkerJob = {
            let flag = flag.clone();
            Arc::new(move |_stream: &StreamHandle| {
                flag.set(false);
                Err(WorkerError::Panicked("lost device".into()))
            })
        };
        supervisor.launch(TransportKind::Network, job, policy(10), flag, 10);

        let mut rx = supervisor.subscribe(TransportKind::Network).unwrap();
        assert_eq!(settle(&mut rx).await, WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_single_instance_per_kind() {
        let streams = Arc::new(StreamRegistry::new());
        let supervisor = Supervisor::new(Arc::clone(&streams));

        let job: WorkerJob = Arc::new(|stream: &StreamHandle| {
            while stream.is_live() {
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(PullExit::Stopped)
        });

        let first = supervisor.launch(TransportKind::Network, Arc::clone(&job), policy(1), active(), 10);
        let second = supervisor.launch(TransportKind::Network, job, policy(1), active(), 10);
        let (Launch::Started(a), Launch::Existing(b)) = (first, second) else {
            panic!("expected one start and one reuse");
        };
        assert_eq!(a.id, b.id);
        assert_eq!(streams.len(), 1);

        let mut rx = supervisor.subscribe(TransportKind::Network).unwrap();
        supervisor.cancel_all();
        assert_eq!(settle(&mut rx).await, WorkerState::Stopped);
        assert!(streams.is_empty());
    }
}
