use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use armature_core::{EventForwarder, ProvidedInterface, RemoteCall, RequiredInterface, Runtime};
use armature_values::{CommandError, CommandShape, ExecutionResult, Value};

use crate::transport::{Endpoint, FrameSender, TransportError};
use crate::wire::{Frame, WireResult};

/// One staged or confirmed session on the serving side of a link.
struct Session {
    provided: ProvidedInterface,
    forward_key: String,
    active: bool,
}

/// Serve one link against the given runtime: answer resolves, invoke
/// commands, forward events. The thread lives until the peer goes away or
/// the last session is torn down.
pub(crate) fn spawn_server_link(runtime: Runtime, endpoint: Endpoint) {
    let process = runtime.process_name().to_string();
    let spawned = thread::Builder::new()
        .name(format!("remote-serve-{process}"))
        .spawn(move || serve(runtime, endpoint));
    if let Err(e) = spawned {
        warn!("could not spawn serving thread for process '{process}': {e}");
    }
}

fn serve(runtime: Runtime, endpoint: Endpoint) {
    let process = runtime.process_name().to_string();
    let mut sessions: HashMap<u64, Session> = HashMap::new();
    loop {
        let frame = match endpoint.recv() {
            Ok(frame) => frame,
            Err(TransportError::Codec(e)) => {
                warn!("process '{process}' dropping unreadable frame: {e}");
                continue;
            }
            Err(_) => break,
        };
        match frame {
            Frame::ResolveInterface {
                session,
                component,
                interface,
            } => {
                let reply = match runtime.find_provided(&component, &interface) {
                    Some(provided) => {
                        let descriptor = provided.descriptor();
                        sessions.insert(
                            session,
                            Session {
                                provided,
                                forward_key: format!("remote-session-{session}"),
                                active: false,
                            },
                        );
                        Frame::InterfaceResolved {
                            session,
                            descriptor,
                        }
                    }
                    None => Frame::ResolveFailed {
                        session,
                        reason: format!(
                            "process '{process}' has no provided interface {component}:{interface}"
                        ),
                    },
                };
                if endpoint.send(&reply).is_err() {
                    break;
                }
            }
            Frame::ConfirmConnection { session, events } => {
                let Some(record) = sessions.get_mut(&session) else {
                    warn!("process '{process}' got a confirm for unknown session {session}");
                    continue;
                };
                record.active = true;
                for event in &events {
                    let relay = Arc::new(EventRelay {
                        session,
                        sender: endpoint.sender(),
                    });
                    if let Err(e) = record.provided.subscribe_event_forwarder(
                        event,
                        record.forward_key.clone(),
                        relay,
                    ) {
                        warn!("session {session}: cannot forward event '{event}': {e}");
                    }
                }
                info!(
                    "process '{process}' confirmed session {session} ({} events forwarded)",
                    events.len()
                );
            }
            Frame::AbortConnection { session } | Frame::Disconnect { session } => {
                if let Some(record) = sessions.remove(&session) {
                    record
                        .provided
                        .unsubscribe_event_forwarders(&record.forward_key);
                    info!("process '{process}' closed session {session}");
                }
                // Every link serves one connect attempt; nothing left to do
                // once its session is gone.
                if sessions.is_empty() {
                    break;
                }
            }
            Frame::Call {
                session,
                request,
                command,
                arg,
            } => {
                let result: WireResult = match sessions.get(&session) {
                    Some(record) if record.active => {
                        record.provided.invoke_json(command, arg.as_ref())
                    }
                    _ => Err(CommandError::NotConnected),
                };
                if endpoint
                    .send(&Frame::CallReply { request, result })
                    .is_err()
                {
                    break;
                }
            }
            other => {
                debug!("process '{process}' ignoring unexpected frame: {other:?}");
            }
        }
    }
    for (session, record) in sessions {
        record
            .provided
            .unsubscribe_event_forwarders(&record.forward_key);
        debug!("process '{process}' dropped session {session} with its link");
    }
}

/// Pushes fired events over the link. Registered on the serving side's
/// generators once the session is confirmed; best-effort, a dead link just
/// stops forwarding.
struct EventRelay {
    session: u64,
    sender: FrameSender,
}

impl EventForwarder for EventRelay {
    fn forward(&self, event: &str, payload: Option<&serde_json::Value>) {
        let frame = Frame::Event {
            session: self.session,
            event: event.to_string(),
            payload: payload.cloned(),
        };
        if self.sender.send(&frame).is_err() {
            debug!(
                "session {}: event '{event}' not forwarded, link is gone",
                self.session
            );
        }
    }
}

/// Client-side state shared by every remote call target of one connection
/// and its pump thread.
pub(crate) struct ClientShared {
    label: String,
    session: u64,
    sender: FrameSender,
    pending: Mutex<HashMap<u64, Sender<WireResult>>>,
    next_request: AtomicU64,
    timeout_ms: AtomicU64,
    alive: AtomicBool,
}

impl ClientShared {
    pub fn new(label: String, session: u64, sender: FrameSender, call_timeout: Duration) -> Self {
        Self {
            label,
            session,
            sender,
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            timeout_ms: AtomicU64::new(call_timeout.as_millis() as u64),
            alive: AtomicBool::new(true),
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn sender(&self) -> &FrameSender {
        &self.sender
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn set_call_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Sender<WireResult>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A required-side call target that forwards over the link instead of
/// calling a local function. Bound into command slots at connect time.
pub(crate) struct RemoteTarget {
    pub shared: Arc<ClientShared>,
    pub command: usize,
    pub shape: CommandShape,
}

impl RemoteCall for RemoteTarget {
    fn call(&self, arg: Option<&dyn Value>) -> ExecutionResult<Option<serde_json::Value>> {
        if !self.shared.is_alive() {
            return Err(CommandError::ProxyDisconnected);
        }
        let arg = match arg {
            Some(value) => Some(value.to_json().map_err(|e| CommandError::InvalidInputType {
                expected: "a payload with a JSON wire form".to_string(),
                actual: e.to_string(),
            })?),
            None => None,
        };
        let request = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Call {
            session: self.shared.session,
            request,
            command: self.command,
            arg,
        };

        if !self.shape.produces_output() {
            // Fire and forget: done once the frame is on the link. Ordering
            // per connection still holds, the link never reorders.
            return match self.shared.sender.send(&frame) {
                Ok(()) => Ok(None),
                Err(_) => {
                    self.shared.mark_dead();
                    Err(CommandError::ProxyDisconnected)
                }
            };
        }

        let (tx, rx) = bounded(1);
        self.shared.pending().insert(request, tx);
        if self.shared.sender.send(&frame).is_err() {
            self.shared.pending().remove(&request);
            self.shared.mark_dead();
            return Err(CommandError::ProxyDisconnected);
        }
        match rx.recv_timeout(self.shared.call_timeout()) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                // The connection stays intact; a reply that still shows up
                // is dropped by the pump as unsolicited.
                self.shared.pending().remove(&request);
                Err(CommandError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(CommandError::ProxyDisconnected),
        }
    }
}

/// Route incoming frames of one confirmed connection: replies to their
/// waiting callers, events onto the subscribing component's mailbox.
pub(crate) fn spawn_client_pump(
    endpoint: Endpoint,
    shared: Arc<ClientShared>,
    required: RequiredInterface,
) {
    let fallback = shared.clone();
    let spawned = thread::Builder::new()
        .name(format!("remote-pump-{}", shared.session))
        .spawn(move || {
            let label = &shared.label;
            loop {
                match endpoint.recv() {
                    Ok(Frame::CallReply { request, result }) => {
                        match shared.pending().remove(&request) {
                            Some(tx) => {
                                let _ = tx.send(result);
                            }
                            None => debug!(
                                "{label}: dropping reply to request {request} nobody waits for"
                            ),
                        }
                    }
                    Ok(Frame::Event { event, payload, .. }) => {
                        required.deliver_remote_event(&event, payload.as_ref());
                    }
                    Ok(Frame::Disconnect { .. }) => break,
                    Ok(other) => debug!("{label}: ignoring unexpected frame: {other:?}"),
                    Err(TransportError::Codec(e)) => {
                        warn!("{label}: dropping unreadable frame: {e}");
                    }
                    Err(_) => break,
                }
            }
            shared.mark_dead();
            // Dropping the reply senders wakes every in-flight caller; they
            // report ProxyDisconnected.
            shared.pending().clear();
            debug!("{label}: link closed");
        });
    if let Err(e) = spawned {
        warn!("{}: could not spawn pump thread: {e}", fallback.label);
        fallback.mark_dead();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::duplex;
    use armature_core::{Component, SchedulingPolicy};

    fn client_with_peer(
        call_timeout: Duration,
    ) -> (Arc<ClientShared>, Endpoint) {
        let (client, server) = duplex(Duration::ZERO);
        let shared = Arc::new(ClientShared::new(
            "test-link".to_string(),
            1,
            client.sender(),
            call_timeout,
        ));
        let mut component = Component::new("consumer", SchedulingPolicy::Continuous);
        let required = component
            .add_required_interface("control")
            .expect("fresh interface name");
        spawn_client_pump(client, shared.clone(), required);
        (shared, server)
    }

    #[test]
    fn silent_peer_times_the_call_out() {
        let (shared, _server) = client_with_peer(Duration::from_millis(20));
        let target = RemoteTarget {
            shared: shared.clone(),
            command: 0,
            shape: CommandShape::Read,
        };
        assert_eq!(target.call(None), Err(CommandError::Timeout));
        // A timeout is not a disconnect.
        assert!(shared.is_alive());
    }

    #[test]
    fn dead_peer_turns_into_proxy_disconnected() {
        let (shared, server) = client_with_peer(Duration::from_secs(1));
        drop(server);
        let target = RemoteTarget {
            shared: shared.clone(),
            command: 0,
            shape: CommandShape::Read,
        };
        // The pump notices the dead link; once it has, calls fail fast.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            match target.call(None) {
                Err(CommandError::ProxyDisconnected) => break,
                other => {
                    assert!(
                        std::time::Instant::now() < deadline,
                        "still not disconnected, last result {other:?}"
                    );
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
        assert!(!shared.is_alive());
    }

    #[test]
    fn fire_and_forget_returns_before_any_reply() {
        let (shared, server) = client_with_peer(Duration::from_millis(1));
        let target = RemoteTarget {
            shared,
            command: 2,
            shape: CommandShape::Write,
        };
        let payload = 3.5f64;
        assert_eq!(target.call(Some(&payload)), Ok(None));
        // The frame really went out.
        match server.recv_timeout(Duration::from_secs(1)).unwrap() {
            Frame::Call {
                command, arg, ..
            } => {
                assert_eq!(command, 2);
                assert_eq!(arg.unwrap(), serde_json::json!(3.5));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
