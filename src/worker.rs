//! The bridge between a caller and one foreign module.
//!
//! A worker owns a dedicated OS thread. The module is built on that thread
//! and never leaves it, so its arena has a single owner and needs no locking.
//! The caller talks to the worker through a [`WorkerHandle`] (inbound) and an
//! unbounded channel of [`Outbound`] messages.
//!
//! ```text
//!   Uninitialized --module loaded--> Ready --request--> Busy
//!                                      ^                  |
//!                                      +---blob / error---+
//! ```
//!
//! A request posted while Busy is rejected, never queued. The Busy→Ready step
//! happens under the same lock as the emission of the final message, so a
//! caller that has seen `blob` or `error` can always post the next request.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::anyhow;
use bridge_protocol::{ConversionRequest, ErrorKind, Outbound};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::error::{BridgeError, ProtocolError};
use crate::event::{LogEvent, LogSink};
use crate::logger::ConversionMetrics;
use crate::module::ForeignModule;
use crate::session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Ready,
    Busy,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<WorkerState>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, message: Outbound) {
        if self.outbound.send(message).is_err() {
            debug!("outbound receiver dropped");
        }
    }
}

/// Log sink given to the module loader and used by every session.
///
/// Lines arriving before readiness go to `tracing` only, so nothing but
/// `ready` can open the outbound stream.
#[derive(Clone)]
pub struct Outbox {
    shared: Arc<Shared>,
}

impl LogSink for Outbox {
    fn emit(&self, event: LogEvent) {
        debug!(target: "stepmesh::log", "{}", event.message);
        if *self.shared.lock() == WorkerState::Uninitialized {
            return;
        }
        self.shared.send(Outbound::log(event.message));
    }
}

#[derive(Debug)]
struct Job {
    request: ConversionRequest,
    accepted: Instant,
}

#[derive(Debug)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
    jobs: mpsc::Sender<Job>,
    thread: Option<JoinHandle<()>>,
}

/// Starts a worker thread. `loader` runs on that thread and builds the
/// module; its [`Outbox`] argument is the sink for module diagnostics.
pub fn spawn<M, F>(loader: F) -> std::io::Result<(WorkerHandle, mpsc::UnboundedReceiver<Outbound>)>
where
    M: ForeignModule + 'static,
    F: FnOnce(Outbox) -> anyhow::Result<M> + Send + 'static,
{
    let (outbound, events) = mpsc::unbounded_channel();
    // One slot: a job is only handed over while the worker is Ready.
    let (jobs, job_rx) = mpsc::channel(1);
    let shared = Arc::new(Shared { state: Mutex::new(WorkerState::Uninitialized), outbound });

    let engine_shared = Arc::clone(&shared);
    let thread = thread::Builder::new()
        .name("stepmesh-worker".to_string())
        .spawn(move || run_engine::<M, F>(engine_shared, loader, job_rx))?;

    Ok((WorkerHandle { shared, jobs, thread: Some(thread) }, events))
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        *self.shared.lock()
    }

    /// Submit a request.
    ///
    /// * before readiness: `NotReady`, nothing is emitted;
    /// * while a conversion runs: `Busy`, and an `error` message with kind
    ///   `busy` is emitted;
    /// * after the worker thread is gone: `Closed`.
    pub fn post_message(&self, request: ConversionRequest) -> Result<(), ProtocolError> {
        let mut state = self.shared.lock();
        match *state {
            WorkerState::Uninitialized => {
                if self.jobs.is_closed() {
                    return Err(ProtocolError::Closed);
                }
                warn!("request received before the worker was ready");
                Err(ProtocolError::NotReady)
            }
            WorkerState::Busy => {
                warn!(id = ?request.id, "rejecting request, a conversion is already running");
                self.shared.send(Outbound::error(
                    ErrorKind::Busy,
                    ProtocolError::Busy.to_string(),
                    request.id,
                ));
                Err(ProtocolError::Busy)
            }
            WorkerState::Ready => {
                let job = Job { request, accepted: Instant::now() };
                match self.jobs.try_send(job) {
                    Ok(()) => {
                        *state = WorkerState::Busy;
                        Ok(())
                    }
                    Err(TrySendError::Full(_)) => Err(ProtocolError::Busy),
                    Err(TrySendError::Closed(_)) => Err(ProtocolError::Closed),
                }
            }
        }
    }

    /// Stop accepting requests and wait for the worker thread to finish the
    /// conversion it is running, if any.
    pub fn shutdown(self) {
        let WorkerHandle { jobs, thread, .. } = self;
        drop(jobs);
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

/// Waits for `ready`. A load failure or a closed channel is an error.
pub async fn wait_ready(events: &mut mpsc::UnboundedReceiver<Outbound>) -> Result<(), BridgeError> {
    loop {
        match events.recv().await {
            Some(Outbound::Ready) => return Ok(()),
            Some(Outbound::Error { error, .. }) => return Err(anyhow!(error).into()),
            Some(other) => debug!(message = other.type_name(), "ignoring message before ready"),
            None => return Err(ProtocolError::Closed.into()),
        }
    }
}

fn run_engine<M, F>(shared: Arc<Shared>, loader: F, mut jobs: mpsc::Receiver<Job>)
where
    M: ForeignModule,
    F: FnOnce(Outbox) -> anyhow::Result<M>,
{
    let outbox = Outbox { shared: Arc::clone(&shared) };
    let mut module = match loader(outbox.clone()) {
        Ok(module) => module,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to load foreign module");
            shared.send(Outbound::error(ErrorKind::Load, format!("{err:#}"), None));
            return;
        }
    };

    {
        let mut state = shared.lock();
        *state = WorkerState::Ready;
        shared.send(Outbound::Ready);
    }
    info!("foreign module loaded, worker ready");

    let metrics = ConversionMetrics::new();
    while let Some(Job { request, accepted }) = jobs.blocking_recv() {
        let session_id = Uuid::new_v4();
        let span = info_span!("session", %session_id, request_id = ?request.id);
        let _entered = span.enter();

        metrics.started();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            session::run(&mut module, &request, &outbox)
        }))
        .unwrap_or_else(|_| Err(anyhow!("conversion panicked").into()));
        metrics.finished(outcome.is_ok(), accepted.elapsed());

        let id = request.id;
        let message = match outcome {
            Ok(result) => Outbound::Blob { blob: result.into_blob(), id },
            Err(err) => {
                warn!(error = %err, "conversion failed");
                Outbound::error(err.kind(), err.to_string(), id)
            }
        };

        let mut state = shared.lock();
        shared.send(message);
        *state = WorkerState::Ready;
    }
    debug!("job channel closed, worker exiting");
}
