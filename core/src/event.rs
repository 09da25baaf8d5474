use log::{debug, warn};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use armature_values::{CommandShape, Payload, TypeIdentity, Value};

use crate::mailbox::{ErasedHandler, MailboxSender, QueuedCall};

/// Forwards fired events across a process boundary. Implemented by the
/// proxy layer; the payload is handed over already in its JSON wire form.
pub trait EventForwarder: Send + Sync {
    fn forward(&self, event: &str, payload: Option<&serde_json::Value>);
}

/// One subscription on an event generator.
pub(crate) enum Subscriber {
    /// A local handler, delivered onto its component's mailbox.
    Queued {
        key: SubscriberKey,
        mailbox: MailboxSender,
        handler: ErasedHandler,
    },
    /// A proxy forwarding the event to another process.
    Forward {
        key: String,
        forwarder: Arc<dyn EventForwarder>,
    },
}

/// Identity of a local subscription, used to keep repeated connects from
/// piling up duplicate deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SubscriberKey {
    pub component: String,
    pub interface: String,
    pub handler: String,
}

/// A named event slot on a provided interface. Firing fans out to every
/// subscriber, each on its own task thread.
pub(crate) struct EventGenerator {
    pub origin: String,
    pub name: String,
    pub shape: CommandShape,
    pub payload: Option<TypeIdentity>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventGenerator {
    pub fn new(
        origin: String,
        name: String,
        shape: CommandShape,
        payload: Option<TypeIdentity>,
    ) -> Self {
        Self {
            origin,
            name,
            shape,
            payload,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a local handler. Subscribing the same handler twice is a
    /// no-op, so reconnecting an already-connected pair stays idempotent.
    pub fn subscribe(&self, key: SubscriberKey, mailbox: MailboxSender, handler: ErasedHandler) {
        let mut subscribers = self.subscribers();
        let duplicate = subscribers.iter().any(|s| match s {
            Subscriber::Queued { key: existing, .. } => *existing == key,
            Subscriber::Forward { .. } => false,
        });
        if duplicate {
            debug!(
                "event {}:{} already delivers to {}:{}:{}, skipping duplicate subscription",
                self.origin, self.name, key.component, key.interface, key.handler
            );
            return;
        }
        subscribers.push(Subscriber::Queued {
            key,
            mailbox,
            handler,
        });
    }

    pub fn unsubscribe(&self, key: &SubscriberKey) {
        self.subscribers().retain(|s| match s {
            Subscriber::Queued { key: existing, .. } => existing != key,
            Subscriber::Forward { .. } => true,
        });
    }

    /// Register a cross-process forwarder under a connection-unique key.
    pub fn subscribe_forwarder(&self, key: String, forwarder: Arc<dyn EventForwarder>) {
        let mut subscribers = self.subscribers();
        let duplicate = subscribers.iter().any(|s| match s {
            Subscriber::Forward { key: existing, .. } => *existing == key,
            Subscriber::Queued { .. } => false,
        });
        if duplicate {
            debug!(
                "event {}:{} already forwards for {}, skipping duplicate",
                self.origin, self.name, key
            );
            return;
        }
        subscribers.push(Subscriber::Forward { key, forwarder });
    }

    pub fn unsubscribe_forwarder(&self, key: &str) {
        self.subscribers().retain(|s| match s {
            Subscriber::Forward { key: existing, .. } => existing != key,
            Subscriber::Queued { .. } => true,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    pub fn fire_void(&self) {
        let subscribers = self.subscribers();
        for s in subscribers.iter() {
            match s {
                Subscriber::Queued {
                    mailbox, handler, ..
                } => {
                    mailbox.deliver(QueuedCall {
                        origin: format!("{}:{}", self.origin, self.name),
                        handler: handler.clone(),
                        payload: None,
                    });
                }
                Subscriber::Forward { forwarder, .. } => {
                    forwarder.forward(&self.name, None);
                }
            }
        }
    }

    pub fn fire_value(&self, payload: &dyn Value) {
        let subscribers = self.subscribers();
        // The JSON form is built at most once, and only if a proxy listens.
        let mut wire_form: Option<serde_json::Value> = None;
        for s in subscribers.iter() {
            match s {
                Subscriber::Queued {
                    mailbox, handler, ..
                } => {
                    mailbox.deliver(QueuedCall {
                        origin: format!("{}:{}", self.origin, self.name),
                        handler: handler.clone(),
                        payload: Some(payload.clone_value()),
                    });
                }
                Subscriber::Forward { forwarder, .. } => {
                    if wire_form.is_none() {
                        match payload.to_json() {
                            Ok(json) => wire_form = Some(json),
                            Err(e) => {
                                warn!(
                                    "event {}:{} payload cannot cross the process boundary: {}",
                                    self.origin, self.name, e
                                );
                                continue;
                            }
                        }
                    }
                    forwarder.forward(&self.name, wire_form.as_ref());
                }
            }
        }
    }
}

/// Handle for firing a void event, held by the providing component's logic.
#[derive(Clone)]
pub struct EventVoidFn {
    generator: Arc<EventGenerator>,
}

impl EventVoidFn {
    pub(crate) fn new(generator: Arc<EventGenerator>) -> Self {
        Self { generator }
    }

    pub fn name(&self) -> &str {
        &self.generator.name
    }

    pub fn subscriber_count(&self) -> usize {
        self.generator.subscriber_count()
    }

    pub fn fire(&self) {
        self.generator.fire_void();
    }
}

/// Handle for firing an event that carries a payload.
pub struct EventWriteFn<T> {
    generator: Arc<EventGenerator>,
    _payload: PhantomData<fn(T)>,
}

impl<T> Clone for EventWriteFn<T> {
    fn clone(&self) -> Self {
        Self {
            generator: self.generator.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T: Payload> EventWriteFn<T> {
    pub(crate) fn new(generator: Arc<EventGenerator>) -> Self {
        Self {
            generator,
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.generator.name
    }

    pub fn subscriber_count(&self) -> usize {
        self.generator.subscriber_count()
    }

    /// Fire with a payload. Each subscriber gets its own copy, delivered
    /// onto its own task thread; the call never blocks on a subscriber.
    pub fn fire(&self, payload: &T) {
        self.generator.fire_value(payload);
    }
}
