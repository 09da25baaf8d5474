use crossbeam_channel::Receiver;
use log::{info, warn};
use slab::Slab;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

use armature_values::TypeIdentity;

use crate::command::SlotTarget;
use crate::component::{Component, ComponentLogic};
use crate::config::RuntimeConfig;
use crate::interface::{ProvidedInterface, RequiredInterface};
use crate::mailbox::QueuedCall;
use crate::task::{
    finish_callback_task, spawn_driver, CallbackBody, CallbackEntry, SchedulingPolicy, TaskCore,
    TaskState,
};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("component '{0}' is already registered")]
    DuplicateComponent(String),
    #[error("component '{0}' is not registered")]
    UnknownComponent(String),
    #[error("component '{component}' already has an interface '{interface}'")]
    DuplicateInterface { component: String, interface: String },
    #[error("interface {interface} already has a command '{command}'")]
    DuplicateCommand { interface: String, command: String },
    #[error("interface {interface} has no command '{command}'")]
    UnknownCommand { interface: String, command: String },
    #[error("interface {interface} already has an event '{event}'")]
    DuplicateEvent { interface: String, event: String },
    #[error("interface {interface} has no event '{event}'")]
    UnknownEvent { interface: String, event: String },
    #[error("task of component '{0}' was already created")]
    AlreadyCreated(String),
    #[error("task of component '{0}' is still running")]
    TaskRunning(String),
    #[error("component '{0}' is not callback-driven")]
    NotCallbackDriven(String),
    #[error("failed to spawn task thread for '{component}': {source}")]
    ThreadSpawn {
        component: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("component '{0}' is not registered")]
    UnknownComponent(String),
    #[error("component '{component}' has no required interface '{interface}'")]
    UnknownRequiredInterface { component: String, interface: String },
    #[error("component '{component}' has no provided interface '{interface}'")]
    UnknownProvidedInterface { component: String, interface: String },
    #[error("no such connection: {0:?}")]
    UnknownConnection(ConnectionId),
}

/// Handle of one established connection; the unit of disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionId(usize);

#[derive(Debug, Clone)]
pub struct BindFailure {
    pub name: String,
    pub reason: String,
}

/// What a connect actually bound. A connection with failures is still
/// usable for everything that did bind; callers that cannot accept partial
/// operation check here (or ask the individual handles via `is_bound`).
#[derive(Debug, Clone, Default)]
pub struct ConnectionReport {
    pub bound_commands: Vec<String>,
    pub failed_commands: Vec<BindFailure>,
    pub bound_events: Vec<String>,
    pub failed_events: Vec<BindFailure>,
}

impl ConnectionReport {
    pub fn is_complete(&self) -> bool {
        self.failed_commands.is_empty() && self.failed_events.is_empty()
    }
}

struct Connection {
    client_component: String,
    client_interface: String,
    server_component: String,
    server_interface: String,
    bound_commands: Vec<String>,
    bound_events: Vec<String>,
}

struct Runnable {
    logic: Box<dyn ComponentLogic>,
    inbox: Receiver<QueuedCall>,
}

struct ComponentRecord {
    policy: SchedulingPolicy,
    core: Arc<TaskCore>,
    provided: Vec<ProvidedInterface>,
    required: Vec<RequiredInterface>,
    runnable: Option<Runnable>,
    thread: Option<JoinHandle<()>>,
    callback: Option<Arc<Mutex<CallbackBody>>>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    components: Mutex<HashMap<String, ComponentRecord>>,
    connections: Mutex<Slab<Connection>>,
}

/// The process-local component registry and connection broker.
///
/// An explicit context object: construct one at process start and pass it
/// around. Cloning is cheap and every clone refers to the same registry.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                components: Mutex::new(HashMap::new()),
                connections: Mutex::new(Slab::new()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RuntimeConfig::default())
    }

    pub fn process_name(&self) -> &str {
        &self.inner.config.process_name
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    fn components(&self) -> MutexGuard<'_, HashMap<String, ComponentRecord>> {
        self.inner
            .components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn connections(&self) -> MutexGuard<'_, Slab<Connection>> {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Build a component whose mailbox depth comes from this runtime's
    /// config. Registration still happens through [`Runtime::add_component`].
    pub fn new_component(&self, name: &str, policy: SchedulingPolicy) -> Component {
        Component::with_mailbox_capacity(name, policy, self.inner.config.mailbox_capacity)
    }

    pub fn add_component(&self, component: Component) -> Result<(), RuntimeError> {
        let mut components = self.components();
        if components.contains_key(component.name()) {
            return Err(RuntimeError::DuplicateComponent(component.name().to_string()));
        }
        let (name, policy, provided, required, inbox, logic, core) = component.into_parts();
        info!("registered component '{}'", name);
        components.insert(
            name,
            ComponentRecord {
                policy,
                core,
                provided,
                required,
                runnable: Some(Runnable { logic, inbox }),
                thread: None,
                callback: None,
            },
        );
        Ok(())
    }

    /// Remove a component whose task is not running. Connections it was
    /// part of are removed with it.
    pub fn remove_component(&self, name: &str) -> Result<(), RuntimeError> {
        {
            let components = self.components();
            let record = components
                .get(name)
                .ok_or_else(|| RuntimeError::UnknownComponent(name.to_string()))?;
            let state = record.core.state();
            if !matches!(state, TaskState::Constructed) && !state.is_terminal() {
                return Err(RuntimeError::TaskRunning(name.to_string()));
            }
        }
        self.disconnect_component(name);
        self.components().remove(name);
        info!("removed component '{}'", name);
        Ok(())
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components().keys().cloned().collect()
    }

    pub fn find_provided(&self, component: &str, interface: &str) -> Option<ProvidedInterface> {
        self.components()
            .get(component)?
            .provided
            .iter()
            .find(|i| i.name() == interface)
            .cloned()
    }

    pub fn find_required(&self, component: &str, interface: &str) -> Option<RequiredInterface> {
        self.components()
            .get(component)?
            .required
            .iter()
            .find(|i| i.name() == interface)
            .cloned()
    }

    // --- task lifecycle ---

    /// Create the component's task: spawn its driver thread (or, for a
    /// callback-driven component, arm its entry point) and run the startup
    /// hook.
    pub fn create(&self, name: &str) -> Result<(), RuntimeError> {
        let mut components = self.components();
        let record = components
            .get_mut(name)
            .ok_or_else(|| RuntimeError::UnknownComponent(name.to_string()))?;
        if record.core.state() != TaskState::Constructed {
            return Err(RuntimeError::AlreadyCreated(name.to_string()));
        }
        let Some(runnable) = record.runnable.take() else {
            return Err(RuntimeError::AlreadyCreated(name.to_string()));
        };
        match record.policy {
            SchedulingPolicy::Periodic(_) | SchedulingPolicy::Continuous => {
                let handle = spawn_driver(record.core.clone(), runnable.logic, runnable.inbox)
                    .map_err(|source| RuntimeError::ThreadSpawn {
                        component: name.to_string(),
                        source,
                    })?;
                record.thread = Some(handle);
            }
            SchedulingPolicy::FromCallback => {
                record.callback = Some(Arc::new(Mutex::new(CallbackBody {
                    logic: runnable.logic,
                    inbox: runnable.inbox,
                })));
                record.core.begin_initializing();
            }
        }
        Ok(())
    }

    /// Entry point of a callback-driven component, to hand to the foreign
    /// code that owns the driving thread.
    pub fn callback_entry(&self, name: &str) -> Result<CallbackEntry, RuntimeError> {
        let components = self.components();
        let record = components
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownComponent(name.to_string()))?;
        let body = record
            .callback
            .as_ref()
            .ok_or_else(|| RuntimeError::NotCallbackDriven(name.to_string()))?;
        Ok(CallbackEntry::new(record.core.clone(), body.clone()))
    }

    pub fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.with_core(name, |core| core.request_start())
    }

    /// Move an active task back to Ready; its thread parks after the
    /// current step completes. `start` resumes it.
    pub fn suspend(&self, name: &str) -> Result<(), RuntimeError> {
        self.with_core(name, |core| core.request_suspend())
    }

    /// Terminate a task. Parked tasks are woken so the request is always
    /// observed; the call returns once the task thread has exited. The
    /// component's connections are removed, so peers see `NotConnected`
    /// instead of calling into a dead component.
    pub fn kill(&self, name: &str) -> Result<(), RuntimeError> {
        self.stop(name, true)
    }

    /// Gracefully end a task; identical mechanics to [`Runtime::kill`] but
    /// the task settles in `Finished`.
    pub fn finish(&self, name: &str) -> Result<(), RuntimeError> {
        self.stop(name, false)
    }

    fn stop(&self, name: &str, kill: bool) -> Result<(), RuntimeError> {
        let (core, thread, callback) = {
            let mut components = self.components();
            let record = components
                .get_mut(name)
                .ok_or_else(|| RuntimeError::UnknownComponent(name.to_string()))?;
            if kill {
                record.core.request_kill();
            } else {
                record.core.request_finish();
            }
            (
                record.core.clone(),
                record.thread.take(),
                record.callback.clone(),
            )
        };
        if let Some(handle) = thread {
            if handle.join().is_err() {
                warn!("task thread of '{}' ended with a panic", name);
            }
        } else if let Some(body) = callback {
            // No thread to join. Whoever gets the body lock first runs the
            // cleanup: either us, or a foreign invocation already in flight.
            while !core.state().is_terminal() {
                if let Ok(mut body) = body.try_lock() {
                    finish_callback_task(&core, &mut body);
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        } else {
            // Never created; settle the state directly.
            core.force_terminal();
        }
        self.disconnect_component(name);
        Ok(())
    }

    pub fn state(&self, name: &str) -> Result<TaskState, RuntimeError> {
        let components = self.components();
        let record = components
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownComponent(name.to_string()))?;
        Ok(record.core.state())
    }

    pub fn wait_for_state(
        &self,
        name: &str,
        state: TaskState,
        timeout: Duration,
    ) -> Result<bool, RuntimeError> {
        let core = {
            let components = self.components();
            components
                .get(name)
                .ok_or_else(|| RuntimeError::UnknownComponent(name.to_string()))?
                .core
                .clone()
        };
        Ok(core.wait_for_state(state, timeout))
    }

    fn with_core<R>(&self, name: &str, f: impl FnOnce(&TaskCore) -> R) -> Result<R, RuntimeError> {
        let components = self.components();
        let record = components
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownComponent(name.to_string()))?;
        Ok(f(&record.core))
    }

    /// Create every registered component's task. Failures are logged and do
    /// not stop the rest.
    pub fn create_all(&self) {
        for name in self.component_names() {
            if let Err(e) = self.create(&name) {
                warn!("create_all: {e}");
            }
        }
    }

    pub fn start_all(&self) {
        for name in self.component_names() {
            if let Err(e) = self.start(&name) {
                warn!("start_all: {e}");
            }
        }
    }

    /// Kill every task. All kill requests are issued before any join, so
    /// tasks wind down in parallel rather than one after the other.
    pub fn kill_all(&self) {
        let names = self.component_names();
        for name in &names {
            if let Err(e) = self.with_core(name, |core| core.request_kill()) {
                warn!("kill_all: {e}");
            }
        }
        for name in &names {
            if let Err(e) = self.stop(name, true) {
                warn!("kill_all: {e}");
            }
        }
    }

    /// Wait until every task reached a terminal state.
    pub fn wait_all_finished(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let cores: Vec<Arc<TaskCore>> = self
            .components()
            .values()
            .map(|record| record.core.clone())
            .collect();
        for core in cores {
            loop {
                if core.state().is_terminal() {
                    break;
                }
                if std::time::Instant::now() >= deadline {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        true
    }

    // --- connections ---

    /// Bind a client component's required interface to a server component's
    /// provided interface: every name-matching command pair whose shape and
    /// payload types agree, and every name-matching event pair likewise.
    ///
    /// Partial binding is allowed; per-name failures land in the returned
    /// report (and the log) without aborting the rest. Connecting the same
    /// pair twice returns the existing connection.
    pub fn connect(
        &self,
        client_component: &str,
        client_interface: &str,
        server_component: &str,
        server_interface: &str,
    ) -> Result<(ConnectionId, ConnectionReport), ConnectError> {
        let (required, provided) = {
            let components = self.components();
            let client = components
                .get(client_component)
                .ok_or_else(|| ConnectError::UnknownComponent(client_component.to_string()))?;
            let server = components
                .get(server_component)
                .ok_or_else(|| ConnectError::UnknownComponent(server_component.to_string()))?;
            let required = client
                .required
                .iter()
                .find(|i| i.name() == client_interface)
                .cloned()
                .ok_or_else(|| ConnectError::UnknownRequiredInterface {
                    component: client_component.to_string(),
                    interface: client_interface.to_string(),
                })?;
            let provided = server
                .provided
                .iter()
                .find(|i| i.name() == server_interface)
                .cloned()
                .ok_or_else(|| ConnectError::UnknownProvidedInterface {
                    component: server_component.to_string(),
                    interface: server_interface.to_string(),
                })?;
            (required, provided)
        };

        let report = bind_interfaces(&required, &provided);
        info!(
            "connected {}:{} -> {}:{} ({} commands, {} events bound)",
            client_component,
            client_interface,
            server_component,
            server_interface,
            report.bound_commands.len(),
            report.bound_events.len()
        );

        let mut connections = self.connections();
        let existing_key = connections
            .iter()
            .find(|(_, c)| {
                c.client_component == client_component
                    && c.client_interface == client_interface
                    && c.server_component == server_component
                    && c.server_interface == server_interface
            })
            .map(|(key, _)| key);
        let id = match existing_key {
            Some(key) => {
                let connection = &mut connections[key];
                connection.bound_commands = report.bound_commands.clone();
                connection.bound_events = report.bound_events.clone();
                ConnectionId(key)
            }
            None => ConnectionId(connections.insert(Connection {
                client_component: client_component.to_string(),
                client_interface: client_interface.to_string(),
                server_component: server_component.to_string(),
                server_interface: server_interface.to_string(),
                bound_commands: report.bound_commands.clone(),
                bound_events: report.bound_events.clone(),
            })),
        };
        Ok((id, report))
    }

    /// Undo a connection: every command slot it bound returns to unbound
    /// (calls yield `NotConnected`) and every event subscription it created
    /// is removed.
    pub fn disconnect(&self, id: ConnectionId) -> Result<(), ConnectError> {
        let connection = {
            let mut connections = self.connections();
            if !connections.contains(id.0) {
                return Err(ConnectError::UnknownConnection(id));
            }
            connections.remove(id.0)
        };
        self.unbind(&connection);
        info!(
            "disconnected {}:{} -> {}:{}",
            connection.client_component,
            connection.client_interface,
            connection.server_component,
            connection.server_interface
        );
        Ok(())
    }

    fn unbind(&self, connection: &Connection) {
        let required = self.find_required(&connection.client_component, &connection.client_interface);
        let provided = self.find_provided(&connection.server_component, &connection.server_interface);
        if let Some(required) = &required {
            for slot in required.slots() {
                if connection.bound_commands.contains(&slot.name) {
                    slot.unbind();
                }
            }
        }
        if let (Some(required), Some(provided)) = (&required, &provided) {
            for event in &connection.bound_events {
                if let Some(generator) = provided.find_event(event) {
                    generator.unsubscribe(&required.subscriber_key(event));
                }
            }
        }
    }

    fn disconnect_component(&self, name: &str) {
        let ids: Vec<ConnectionId> = {
            let connections = self.connections();
            connections
                .iter()
                .filter(|(_, c)| c.client_component == name || c.server_component == name)
                .map(|(key, _)| ConnectionId(key))
                .collect()
        };
        for id in ids {
            if let Err(e) = self.disconnect(id) {
                warn!("disconnecting '{}': {e}", name);
            }
        }
    }
}

fn types_match(a: &Option<TypeIdentity>, b: &Option<TypeIdentity>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.matches(b),
        _ => false,
    }
}

fn bind_interfaces(required: &RequiredInterface, provided: &ProvidedInterface) -> ConnectionReport {
    let mut report = ConnectionReport::default();

    for slot in required.slots() {
        match provided.find_command(&slot.name) {
            None => {
                warn!(
                    "binding {}:{}: no provided command '{}'",
                    required.component(),
                    required.name(),
                    slot.name
                );
                report.failed_commands.push(BindFailure {
                    name: slot.name.clone(),
                    reason: "no matching provided command".to_string(),
                });
            }
            Some((index, command)) => {
                if command.shape != slot.shape {
                    warn!(
                        "binding {}:{}: command '{}' is {} here, {} there",
                        required.component(),
                        required.name(),
                        slot.name,
                        slot.shape,
                        command.shape
                    );
                    report.failed_commands.push(BindFailure {
                        name: slot.name.clone(),
                        reason: format!("shape mismatch: {} vs {}", slot.shape, command.shape),
                    });
                } else if !types_match(&slot.arg, &command.arg)
                    || !types_match(&slot.out, &command.out)
                {
                    warn!(
                        "binding {}:{}: command '{}' payload types disagree",
                        required.component(),
                        required.name(),
                        slot.name
                    );
                    report.failed_commands.push(BindFailure {
                        name: slot.name.clone(),
                        reason: "payload type mismatch".to_string(),
                    });
                } else {
                    slot.bind(SlotTarget::Local {
                        table: Arc::downgrade(provided.command_table()),
                        index,
                    });
                    report.bound_commands.push(slot.name.clone());
                }
            }
        }
    }

    required.with_handlers(|handlers| {
        for handler in handlers {
            match provided.find_event(&handler.name) {
                None => {
                    warn!(
                        "binding {}:{}: no event generator '{}'",
                        required.component(),
                        required.name(),
                        handler.name
                    );
                    report.failed_events.push(BindFailure {
                        name: handler.name.clone(),
                        reason: "no matching event generator".to_string(),
                    });
                }
                Some(generator) => {
                    if generator.shape != handler.shape
                        || !types_match(&generator.payload, &handler.payload)
                    {
                        warn!(
                            "binding {}:{}: event '{}' shape or payload disagrees",
                            required.component(),
                            required.name(),
                            handler.name
                        );
                        report.failed_events.push(BindFailure {
                            name: handler.name.clone(),
                            reason: "event shape or payload mismatch".to_string(),
                        });
                    } else {
                        generator.subscribe(
                            required.subscriber_key(&handler.name),
                            required.mailbox().clone(),
                            handler.handler.clone(),
                        );
                        report.bound_events.push(handler.name.clone());
                    }
                }
            }
        }
    });

    report
}
