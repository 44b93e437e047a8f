//! Cross-thread event bridge from fit workers to the event loop.
//!
//! Workers run on plain OS threads and must never block on the event loop.
//! They push [`JobEvent`]s into an unbounded tokio channel; a single
//! dispatcher task on the event loop receives them and awaits each handler
//! to completion before taking the next, so handlers observe events in
//! emission order and never interleave.

use std::future::Future;

use fitview_types::{FitEvent, JobId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A fit event tagged with the job that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    /// Job that emitted the event.
    pub job_id: JobId,
    /// The event itself.
    pub event: FitEvent,
}

/// Consumer of bridged events, run by [`run_dispatcher`].
pub trait EventHandler: Send {
    /// Handle one event. The next event is not delivered until the
    /// returned future completes.
    fn handle(&mut self, event: JobEvent) -> impl Future<Output = ()> + Send;
}

/// Sending half of the bridge. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<JobEvent>,
}

/// Receiving half of the bridge, owned by the dispatcher.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<JobEvent>,
}

/// Create a connected sender/receiver pair.
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx })
}

impl EventSender {
    /// An emitter that stamps every event with `job_id`.
    pub fn for_job(&self, job_id: JobId) -> JobEmitter {
        JobEmitter {
            job_id,
            tx: self.tx.clone(),
        }
    }
}

impl EventReceiver {
    /// Receive the next event, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }
}

/// Per-job emitter used by a worker thread.
#[derive(Debug, Clone)]
pub struct JobEmitter {
    job_id: JobId,
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl JobEmitter {
    /// Job this emitter belongs to.
    pub const fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Enqueue an event without blocking.
    ///
    /// Returns `false` when the event loop is gone; the event is dropped
    /// and a warning logged.
    pub fn emit(&self, event: FitEvent) -> bool {
        let kind = event.kind();
        match self.tx.send(JobEvent {
            job_id: self.job_id,
            event,
        }) {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    job_id = %self.job_id,
                    kind,
                    "Event loop unavailable, dropping fit event"
                );
                false
            }
        }
    }
}

/// Receive events until every sender is dropped, handing each to
/// `handler` in order. Returns the number of events dispatched.
pub async fn run_dispatcher<H: EventHandler>(mut receiver: EventReceiver, mut handler: H) -> u64 {
    let mut dispatched: u64 = 0;
    while let Some(event) = receiver.recv().await {
        debug!(job_id = %event.job_id, kind = event.event.kind(), "Dispatching fit event");
        handler.handle(event).await;
        dispatched = dispatched.saturating_add(1);
    }
    info!(dispatched, "Fit event dispatcher stopped");
    dispatched
}
