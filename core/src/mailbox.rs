use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{error, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use armature_values::Value;

/// A handler queued for execution on the owning component's task thread.
#[derive(Clone)]
pub(crate) enum ErasedHandler {
    Void(Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>),
    Write(Arc<dyn Fn(&dyn Value) -> anyhow::Result<()> + Send + Sync>),
}

/// One queued event delivery: the subscriber's handler plus its own copy of
/// the payload.
pub(crate) struct QueuedCall {
    /// "component:interface:event", for log lines only.
    pub origin: String,
    pub handler: ErasedHandler,
    pub payload: Option<Box<dyn Value>>,
}

/// Sending half of a component's event mailbox. Cloned into every provided
/// interface that subscribes one of the component's handlers.
#[derive(Clone)]
pub(crate) struct MailboxSender {
    component: String,
    tx: Sender<QueuedCall>,
}

impl MailboxSender {
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Deliver without blocking. A full mailbox drops this one delivery;
    /// the firing side is never stalled by a slow subscriber.
    pub fn deliver(&self, call: QueuedCall) {
        match self.tx.try_send(call) {
            Ok(()) => {}
            Err(TrySendError::Full(call)) => {
                warn!(
                    "mailbox of component '{}' is full, dropping event from {}",
                    self.component, call.origin
                );
            }
            Err(TrySendError::Disconnected(call)) => {
                warn!(
                    "mailbox of component '{}' is gone, dropping event from {}",
                    self.component, call.origin
                );
            }
        }
    }
}

pub(crate) fn mailbox(component: &str, capacity: usize) -> (MailboxSender, Receiver<QueuedCall>) {
    let (tx, rx) = bounded(capacity);
    (
        MailboxSender {
            component: component.to_string(),
            tx,
        },
        rx,
    )
}

/// Run every queued handler. Called by the task driver at the top of each
/// cycle, so handlers interleave with steps on the component's own thread
/// and never run concurrently with them.
pub(crate) fn drain(component: &str, rx: &Receiver<QueuedCall>) {
    while let Ok(call) = rx.try_recv() {
        let outcome = catch_unwind(AssertUnwindSafe(|| run_handler(&call)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    "event handler in component '{}' failed for {}: {:#}",
                    component, call.origin, e
                );
            }
            Err(_) => {
                error!(
                    "event handler in component '{}' panicked for {}",
                    component, call.origin
                );
            }
        }
    }
}

fn run_handler(call: &QueuedCall) -> anyhow::Result<()> {
    match (&call.handler, &call.payload) {
        (ErasedHandler::Void(f), _) => f(),
        (ErasedHandler::Write(f), Some(payload)) => f(payload.as_ref()),
        (ErasedHandler::Write(_), None) => {
            anyhow::bail!("queued delivery from {} lost its payload", call.origin)
        }
    }
}
