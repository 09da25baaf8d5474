use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

use armature_core::{
    BindFailure, CommandDesc, ConnectionReport, EventDesc, InterfaceDescriptor,
    RequiredInterface, Runtime,
};

use crate::proxy::{spawn_client_pump, spawn_server_link, ClientShared, RemoteTarget};
use crate::transport::{duplex, TransportError};
use crate::wire::Frame;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("process '{0}' is already registered")]
    DuplicateProcess(String),
    #[error("process '{0}' is not registered")]
    UnknownProcess(String),
    #[error("component '{component}' has no required interface '{interface}'")]
    UnknownRequiredInterface { component: String, interface: String },
    #[error("the serving process rejected the connection: {0}")]
    Rejected(String),
    #[error("connection handshake failed: {0}")]
    Transport(#[from] TransportError),
    #[error("the serving process answered out of protocol")]
    Protocol,
}

/// Where a cross-process connection should go, and how the simulated link
/// between the two processes behaves.
#[derive(Debug, Clone)]
pub struct RemoteConnectSpec {
    pub client_process: String,
    pub client_component: String,
    pub client_interface: String,
    pub server_process: String,
    pub server_component: String,
    pub server_interface: String,
    /// One-way latency applied to every frame, in each direction.
    pub latency: Duration,
    /// Deadline for Read/QualifiedRead round trips. Defaults to the client
    /// runtime's configured remote timeout.
    pub call_timeout: Option<Duration>,
}

impl RemoteConnectSpec {
    pub fn new(
        client: (&str, &str, &str),
        server: (&str, &str, &str),
    ) -> Self {
        Self {
            client_process: client.0.to_string(),
            client_component: client.1.to_string(),
            client_interface: client.2.to_string(),
            server_process: server.0.to_string(),
            server_component: server.1.to_string(),
            server_interface: server.2.to_string(),
            latency: Duration::ZERO,
            call_timeout: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

/// Registry of process runtimes, standing in for the machinery that would
/// locate another process on a real network. Holds one [`Runtime`] handle
/// per process name and brokers the two-phase cross-process connect.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    processes: Mutex<HashMap<String, Runtime>>,
    next_session: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runtime under its configured process name.
    pub fn register(&self, runtime: &Runtime) -> Result<(), RemoteError> {
        let mut processes = self.processes();
        let name = runtime.process_name().to_string();
        if processes.contains_key(&name) {
            return Err(RemoteError::DuplicateProcess(name));
        }
        info!("registered process '{name}'");
        processes.insert(name, runtime.clone());
        Ok(())
    }

    pub fn unregister(&self, process: &str) -> Result<(), RemoteError> {
        self.processes()
            .remove(process)
            .map(|_| ())
            .ok_or_else(|| RemoteError::UnknownProcess(process.to_string()))
    }

    pub fn process_names(&self) -> Vec<String> {
        self.processes().keys().cloned().collect()
    }

    fn processes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Runtime>> {
        self.inner
            .processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn find(&self, process: &str) -> Result<Runtime, RemoteError> {
        self.processes()
            .get(process)
            .cloned()
            .ok_or_else(|| RemoteError::UnknownProcess(process.to_string()))
    }

    /// Connect a required interface in one process to a provided interface
    /// in another, over a simulated link.
    ///
    /// Two phases: the serving process first describes the interface and
    /// stages a session; the requesting side binds its slots against the
    /// description, then confirms. Only a confirmed session serves calls and
    /// forwards events, so a failure on either side leaves nothing
    /// half-bound behind. Binding follows the local rules: per-name shape
    /// and payload-type checks, partial failures reported but not fatal.
    pub fn connect(
        &self,
        spec: &RemoteConnectSpec,
    ) -> Result<(RemoteConnection, ConnectionReport), RemoteError> {
        let client_runtime = self.find(&spec.client_process)?;
        let server_runtime = self.find(&spec.server_process)?;
        let required = client_runtime
            .find_required(&spec.client_component, &spec.client_interface)
            .ok_or_else(|| RemoteError::UnknownRequiredInterface {
                component: spec.client_component.clone(),
                interface: spec.client_interface.clone(),
            })?;

        let (client_ep, server_ep) = duplex(spec.latency);
        spawn_server_link(server_runtime, server_ep);

        let session = self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        client_ep.send(&Frame::ResolveInterface {
            session,
            component: spec.server_component.clone(),
            interface: spec.server_interface.clone(),
        })?;

        // The handshake deadline budgets for the link's own latency; the
        // per-call timeout does not apply to it.
        let handshake = client_runtime.config().remote_timeout() + 2 * spec.latency;
        let descriptor = match client_ep.recv_timeout(handshake) {
            Ok(Frame::InterfaceResolved {
                session: got,
                descriptor,
            }) if got == session => descriptor,
            Ok(Frame::ResolveFailed { reason, .. }) => {
                return Err(RemoteError::Rejected(reason));
            }
            Ok(_) => {
                let _ = client_ep.send(&Frame::AbortConnection { session });
                return Err(RemoteError::Protocol);
            }
            Err(e) => {
                let _ = client_ep.send(&Frame::AbortConnection { session });
                return Err(RemoteError::Transport(e));
            }
        };

        let label = format!(
            "{}:{}:{} -> {}:{}:{}",
            spec.client_process,
            spec.client_component,
            spec.client_interface,
            spec.server_process,
            spec.server_component,
            spec.server_interface
        );
        let call_timeout = spec
            .call_timeout
            .unwrap_or_else(|| client_runtime.config().remote_timeout());
        let shared = Arc::new(ClientShared::new(
            label.clone(),
            session,
            client_ep.sender(),
            call_timeout,
        ));

        let report = bind_against_descriptor(&required, &descriptor, &shared, &label);

        if let Err(e) = client_ep.send(&Frame::ConfirmConnection {
            session,
            events: report.bound_events.clone(),
        }) {
            // Nothing half-bound may survive a failed handshake.
            for name in &report.bound_commands {
                required.unbind_command(name);
            }
            return Err(e.into());
        }
        spawn_client_pump(client_ep, shared.clone(), required.clone());
        info!(
            "connected {label} (session {session}, {} commands, {} events bound)",
            report.bound_commands.len(),
            report.bound_events.len()
        );

        let connection = RemoteConnection {
            label,
            shared,
            required,
            bound_commands: report.bound_commands.clone(),
        };
        Ok((connection, report))
    }
}

fn bind_against_descriptor(
    required: &RequiredInterface,
    descriptor: &InterfaceDescriptor,
    shared: &Arc<ClientShared>,
    label: &str,
) -> ConnectionReport {
    let mut report = ConnectionReport::default();

    for slot in required.slot_descs() {
        let found: Option<(usize, &CommandDesc)> = descriptor
            .commands
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == slot.name);
        match found {
            None => {
                warn!("{label}: no provided command '{}'", slot.name);
                report.failed_commands.push(BindFailure {
                    name: slot.name,
                    reason: "no matching provided command".to_string(),
                });
            }
            Some((index, command)) => {
                if command.shape != slot.shape {
                    warn!(
                        "{label}: command '{}' is {} here, {} there",
                        slot.name, slot.shape, command.shape
                    );
                    report.failed_commands.push(BindFailure {
                        name: slot.name,
                        reason: format!("shape mismatch: {} vs {}", slot.shape, command.shape),
                    });
                } else if slot.arg_type != command.arg_type || slot.out_type != command.out_type {
                    warn!("{label}: command '{}' payload types disagree", slot.name);
                    report.failed_commands.push(BindFailure {
                        name: slot.name,
                        reason: "payload type mismatch".to_string(),
                    });
                } else {
                    let target = Arc::new(RemoteTarget {
                        shared: shared.clone(),
                        command: index,
                        shape: command.shape,
                    });
                    match required.bind_remote(&slot.name, target) {
                        Ok(()) => report.bound_commands.push(slot.name),
                        Err(e) => report.failed_commands.push(BindFailure {
                            name: slot.name,
                            reason: e.to_string(),
                        }),
                    }
                }
            }
        }
    }

    for handler in required.handler_descs() {
        let found: Option<&EventDesc> =
            descriptor.events.iter().find(|e| e.name == handler.name);
        match found {
            None => {
                warn!("{label}: no event generator '{}'", handler.name);
                report.failed_events.push(BindFailure {
                    name: handler.name,
                    reason: "no matching event generator".to_string(),
                });
            }
            Some(event) => {
                if event.shape != handler.shape || event.payload_type != handler.payload_type {
                    warn!(
                        "{label}: event '{}' shape or payload disagrees",
                        handler.name
                    );
                    report.failed_events.push(BindFailure {
                        name: handler.name,
                        reason: "event shape or payload mismatch".to_string(),
                    });
                } else {
                    report.bound_events.push(handler.name);
                }
            }
        }
    }

    report
}

/// A live cross-process connection, held by the requesting side. Dropping it
/// disconnects: the session is torn down on both sides and every command
/// slot it bound returns to unbound.
pub struct RemoteConnection {
    label: String,
    shared: Arc<ClientShared>,
    required: RequiredInterface,
    bound_commands: Vec<String>,
}

impl RemoteConnection {
    pub fn session(&self) -> u64 {
        self.shared.session()
    }

    /// Whether the link under this connection is still up. Timeouts do not
    /// clear this; a dead transport does.
    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Change the deadline for subsequent Read/QualifiedRead round trips.
    pub fn set_call_timeout(&self, timeout: Duration) {
        self.shared.set_call_timeout(timeout);
    }

    /// Tear the connection down. Equivalent to dropping it.
    pub fn disconnect(self) {}
}

impl Drop for RemoteConnection {
    fn drop(&mut self) {
        let _ = self.shared.sender().send(&Frame::Disconnect {
            session: self.shared.session(),
        });
        self.shared.mark_dead();
        for name in &self.bound_commands {
            self.required.unbind_command(name);
        }
        info!("disconnected {}", self.label);
    }
}
