use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use armature_values::{CommandError, CommandShape, ExecutionResult, Payload, TypeIdentity};

use crate::command::{
    decoder_for, qualified_read_kernel, read_kernel, void_kernel, write_kernel, CommandSlot,
    CommandTable, Kernel, ProvidedCommand, QualifiedReadFn, ReadFn, RemoteCall, SlotTarget,
    VoidFn, WriteFn,
};
use crate::event::{EventForwarder, EventGenerator, EventVoidFn, EventWriteFn, SubscriberKey};
use crate::mailbox::{ErasedHandler, MailboxSender};
use crate::runtime::RuntimeError;

/// Description of one command, as exchanged between proxies at bind time.
/// Type identities degrade to names here; that is all that can cross a
/// process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDesc {
    pub name: String,
    pub shape: CommandShape,
    pub arg_type: Option<String>,
    pub out_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDesc {
    pub name: String,
    pub shape: CommandShape,
    pub payload_type: Option<String>,
}

/// Everything a remote peer needs to know to bind against an interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub interface: String,
    pub commands: Vec<CommandDesc>,
    pub events: Vec<EventDesc>,
}

struct ProvidedInner {
    component: String,
    name: String,
    commands: Arc<CommandTable>,
    events: RwLock<Vec<Arc<EventGenerator>>>,
}

/// A provided interface: the implementing side of a connection. Owns the
/// concrete commands and the event generator slots.
///
/// Cheap to clone; all clones refer to the same tables.
#[derive(Clone)]
pub struct ProvidedInterface {
    inner: Arc<ProvidedInner>,
}

impl ProvidedInterface {
    pub(crate) fn new(component: &str, name: &str) -> Self {
        Self {
            inner: Arc::new(ProvidedInner {
                component: component.to_string(),
                name: name.to_string(),
                commands: Arc::new(RwLock::new(Vec::new())),
                events: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn component(&self) -> &str {
        &self.inner.component
    }

    fn origin(&self) -> String {
        format!("{}:{}", self.inner.component, self.inner.name)
    }

    fn push_command(&self, command: ProvidedCommand) -> Result<(), RuntimeError> {
        let mut commands = self
            .inner
            .commands
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if commands.iter().any(|c| c.name == command.name) {
            return Err(RuntimeError::DuplicateCommand {
                interface: self.origin(),
                command: command.name,
            });
        }
        commands.push(Arc::new(command));
        Ok(())
    }

    /// Register a command with no argument and no output.
    pub fn add_void<F>(&self, name: &str, f: F) -> Result<(), RuntimeError>
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push_command(ProvidedCommand {
            name: name.to_string(),
            shape: CommandShape::Void,
            arg: None,
            out: None,
            enabled: AtomicBool::new(true),
            kernel: Kernel::Void(void_kernel(f)),
            decode_arg: None,
        })
    }

    /// Register a command producing one output value.
    pub fn add_read<T, F>(&self, name: &str, f: F) -> Result<(), RuntimeError>
    where
        T: Payload,
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.push_command(ProvidedCommand {
            name: name.to_string(),
            shape: CommandShape::Read,
            arg: None,
            out: Some(TypeIdentity::of::<T>()),
            enabled: AtomicBool::new(true),
            kernel: Kernel::Read(read_kernel(f)),
            decode_arg: None,
        })
    }

    /// Register a command consuming one input value.
    pub fn add_write<T, F>(&self, name: &str, f: F) -> Result<(), RuntimeError>
    where
        T: Payload,
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push_command(ProvidedCommand {
            name: name.to_string(),
            shape: CommandShape::Write,
            arg: Some(TypeIdentity::of::<T>()),
            out: None,
            enabled: AtomicBool::new(true),
            kernel: Kernel::Write(write_kernel(f)),
            decode_arg: Some(decoder_for::<T>()),
        })
    }

    /// Register a command consuming one input and producing one output.
    pub fn add_qualified_read<Q, T, F>(&self, name: &str, f: F) -> Result<(), RuntimeError>
    where
        Q: Payload,
        T: Payload,
        F: Fn(&Q) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.push_command(ProvidedCommand {
            name: name.to_string(),
            shape: CommandShape::QualifiedRead,
            arg: Some(TypeIdentity::of::<Q>()),
            out: Some(TypeIdentity::of::<T>()),
            enabled: AtomicBool::new(true),
            kernel: Kernel::QualifiedRead(qualified_read_kernel(f)),
            decode_arg: Some(decoder_for::<Q>()),
        })
    }

    /// Enable or disable a command by name. Calls through a disabled
    /// command return `Disabled` until it is re-enabled.
    pub fn set_command_enabled(&self, name: &str, enabled: bool) -> Result<(), RuntimeError> {
        let commands = self
            .inner
            .commands
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let command = commands
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| RuntimeError::UnknownCommand {
                interface: self.origin(),
                command: name.to_string(),
            })?;
        command.enabled.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    /// Declare a void event generator and return the handle used to fire it.
    pub fn add_event_void(&self, name: &str) -> Result<EventVoidFn, RuntimeError> {
        let generator = self.push_event(name, CommandShape::Void, None)?;
        Ok(EventVoidFn::new(generator))
    }

    /// Declare a payload-carrying event generator.
    pub fn add_event<T: Payload>(&self, name: &str) -> Result<EventWriteFn<T>, RuntimeError> {
        let generator = self.push_event(name, CommandShape::Write, Some(TypeIdentity::of::<T>()))?;
        Ok(EventWriteFn::new(generator))
    }

    fn push_event(
        &self,
        name: &str,
        shape: CommandShape,
        payload: Option<TypeIdentity>,
    ) -> Result<Arc<EventGenerator>, RuntimeError> {
        let mut events = self
            .inner
            .events
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if events.iter().any(|e| e.name == name) {
            return Err(RuntimeError::DuplicateEvent {
                interface: self.origin(),
                event: name.to_string(),
            });
        }
        let generator = Arc::new(EventGenerator::new(
            self.origin(),
            name.to_string(),
            shape,
            payload,
        ));
        events.push(generator.clone());
        Ok(generator)
    }

    pub(crate) fn command_table(&self) -> &Arc<CommandTable> {
        &self.inner.commands
    }

    pub(crate) fn find_command(&self, name: &str) -> Option<(usize, Arc<ProvidedCommand>)> {
        self.inner
            .commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
            .map(|(i, c)| (i, c.clone()))
    }

    pub(crate) fn find_event(&self, name: &str) -> Option<Arc<EventGenerator>> {
        self.inner
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| e.name == name)
            .cloned()
    }

    /// Describe this interface for a remote peer.
    pub fn descriptor(&self) -> InterfaceDescriptor {
        let commands = self
            .inner
            .commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| CommandDesc {
                name: c.name.clone(),
                shape: c.shape,
                arg_type: c.arg.map(|t| t.name().to_string()),
                out_type: c.out.map(|t| t.name().to_string()),
            })
            .collect();
        let events = self
            .inner
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| EventDesc {
                name: e.name.clone(),
                shape: e.shape,
                payload_type: e.payload.map(|t| t.name().to_string()),
            })
            .collect();
        InterfaceDescriptor {
            interface: self.inner.name.clone(),
            commands,
            events,
        }
    }

    /// Invoke a command by table index with a JSON argument, producing a
    /// JSON output. This is the type-erased entry the server-side proxy
    /// drives; argument mismatches surface as `InvalidInputType` at call
    /// time since nothing stronger is known on this path.
    pub fn invoke_json(
        &self,
        index: usize,
        arg: Option<&serde_json::Value>,
    ) -> ExecutionResult<Option<serde_json::Value>> {
        let command = self
            .inner
            .commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
            .ok_or(CommandError::NotConnected)?;
        if !command.is_enabled() {
            return Err(CommandError::Disabled);
        }
        let decode = |json: &serde_json::Value| -> ExecutionResult<Box<dyn armature_values::Value>> {
            let decoder = command
                .decode_arg
                .as_ref()
                .ok_or(CommandError::NotConnected)?;
            decoder(json).map_err(|e| CommandError::InvalidInputType {
                expected: command
                    .arg
                    .map(|t| t.name().to_string())
                    .unwrap_or_else(|| "none".to_string()),
                actual: e,
            })
        };
        match (&command.kernel, arg) {
            (Kernel::Void(f), None) => f().map(|_| None),
            (Kernel::Read(f), None) => {
                let out = f()?;
                let json = out
                    .to_json()
                    .map_err(|e| CommandError::CalleeFailed(e.to_string()))?;
                Ok(Some(json))
            }
            (Kernel::Write(f), Some(json)) => {
                let value = decode(json)?;
                f(value.as_ref()).map(|_| None)
            }
            (Kernel::QualifiedRead(f), Some(json)) => {
                let value = decode(json)?;
                let out = f(value.as_ref())?;
                let json = out
                    .to_json()
                    .map_err(|e| CommandError::CalleeFailed(e.to_string()))?;
                Ok(Some(json))
            }
            _ => Err(CommandError::InvalidInputType {
                expected: format!("argument layout of a {} command", command.shape),
                actual: if arg.is_some() {
                    "unexpected argument".to_string()
                } else {
                    "missing argument".to_string()
                },
            }),
        }
    }

    /// Attach a cross-process forwarder to one event generator.
    pub fn subscribe_event_forwarder(
        &self,
        event: &str,
        key: String,
        forwarder: Arc<dyn EventForwarder>,
    ) -> Result<(), RuntimeError> {
        let generator = self.find_event(event).ok_or_else(|| RuntimeError::UnknownEvent {
            interface: self.origin(),
            event: event.to_string(),
        })?;
        generator.subscribe_forwarder(key, forwarder);
        Ok(())
    }

    /// Detach every forwarder registered under `key`.
    pub fn unsubscribe_event_forwarders(&self, key: &str) {
        let events = self
            .inner
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for generator in events.iter() {
            generator.unsubscribe_forwarder(key);
        }
    }
}

pub(crate) struct HandlerReg {
    pub name: String,
    pub shape: CommandShape,
    pub payload: Option<TypeIdentity>,
    pub handler: ErasedHandler,
    pub decode: Option<crate::command::ArgDecoder>,
}

struct RequiredInner {
    component: String,
    name: String,
    mailbox: MailboxSender,
    slots: RwLock<Vec<Arc<CommandSlot>>>,
    handlers: RwLock<Vec<HandlerReg>>,
}

/// A required interface: the consuming side of a connection. Owns command
/// slots (unbound until connected) and event handler registrations.
///
/// Cheap to clone; all clones refer to the same tables.
#[derive(Clone)]
pub struct RequiredInterface {
    inner: Arc<RequiredInner>,
}

impl RequiredInterface {
    pub(crate) fn new(component: &str, name: &str, mailbox: MailboxSender) -> Self {
        Self {
            inner: Arc::new(RequiredInner {
                component: component.to_string(),
                name: name.to_string(),
                mailbox,
                slots: RwLock::new(Vec::new()),
                handlers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn component(&self) -> &str {
        &self.inner.component
    }

    fn origin(&self) -> String {
        format!("{}:{}", self.inner.component, self.inner.name)
    }

    fn push_slot(&self, slot: CommandSlot) -> Result<Arc<CommandSlot>, RuntimeError> {
        let mut slots = self
            .inner
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if slots.iter().any(|s| s.name == slot.name) {
            return Err(RuntimeError::DuplicateCommand {
                interface: self.origin(),
                command: slot.name,
            });
        }
        let slot = Arc::new(slot);
        slots.push(slot.clone());
        Ok(slot)
    }

    /// Declare a void command this interface expects a provider for.
    pub fn add_void(&self, name: &str) -> Result<VoidFn, RuntimeError> {
        let slot = self.push_slot(CommandSlot::new(
            name.to_string(),
            CommandShape::Void,
            None,
            None,
        ))?;
        Ok(VoidFn::new(slot))
    }

    pub fn add_read<T: Payload>(&self, name: &str) -> Result<ReadFn<T>, RuntimeError> {
        let slot = self.push_slot(CommandSlot::new(
            name.to_string(),
            CommandShape::Read,
            None,
            Some(TypeIdentity::of::<T>()),
        ))?;
        Ok(ReadFn::new(slot))
    }

    pub fn add_write<T: Payload>(&self, name: &str) -> Result<WriteFn<T>, RuntimeError> {
        let slot = self.push_slot(CommandSlot::new(
            name.to_string(),
            CommandShape::Write,
            Some(TypeIdentity::of::<T>()),
            None,
        ))?;
        Ok(WriteFn::new(slot))
    }

    pub fn add_qualified_read<Q: Payload, T: Payload>(
        &self,
        name: &str,
    ) -> Result<QualifiedReadFn<Q, T>, RuntimeError> {
        let slot = self.push_slot(CommandSlot::new(
            name.to_string(),
            CommandShape::QualifiedRead,
            Some(TypeIdentity::of::<Q>()),
            Some(TypeIdentity::of::<T>()),
        ))?;
        Ok(QualifiedReadFn::new(slot))
    }

    /// Register a handler for a void event on the provider side.
    pub fn add_event_handler_void<F>(&self, name: &str, f: F) -> Result<(), RuntimeError>
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push_handler(HandlerReg {
            name: name.to_string(),
            shape: CommandShape::Void,
            payload: None,
            handler: ErasedHandler::Void(Arc::new(f)),
            decode: None,
        })
    }

    /// Register a handler for a payload-carrying event. The handler runs on
    /// this component's own task thread, never on the firing thread.
    pub fn add_event_handler<T, F>(&self, name: &str, f: F) -> Result<(), RuntimeError>
    where
        T: Payload,
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let erased = move |value: &dyn armature_values::Value| -> anyhow::Result<()> {
            match armature_values::downcast_value::<T>(value) {
                Some(payload) => f(payload),
                None => anyhow::bail!(
                    "event payload has type {}, handler expects {}",
                    value.type_identity().name(),
                    std::any::type_name::<T>()
                ),
            }
        };
        self.push_handler(HandlerReg {
            name: name.to_string(),
            shape: CommandShape::Write,
            payload: Some(TypeIdentity::of::<T>()),
            handler: ErasedHandler::Write(Arc::new(erased)),
            decode: Some(decoder_for::<T>()),
        })
    }

    fn push_handler(&self, reg: HandlerReg) -> Result<(), RuntimeError> {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.iter().any(|h| h.name == reg.name) {
            return Err(RuntimeError::DuplicateEvent {
                interface: self.origin(),
                event: reg.name,
            });
        }
        handlers.push(reg);
        Ok(())
    }

    pub(crate) fn mailbox(&self) -> &MailboxSender {
        &self.inner.mailbox
    }

    pub(crate) fn slots(&self) -> Vec<Arc<CommandSlot>> {
        self.inner
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn with_handlers<R>(&self, f: impl FnOnce(&[HandlerReg]) -> R) -> R {
        let handlers = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&handlers)
    }

    pub(crate) fn subscriber_key(&self, handler: &str) -> SubscriberKey {
        SubscriberKey {
            component: self.inner.component.clone(),
            interface: self.inner.name.clone(),
            handler: handler.to_string(),
        }
    }

    /// Describe this interface's command slots, for remote bind checking.
    pub fn slot_descs(&self) -> Vec<CommandDesc> {
        self.inner
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| CommandDesc {
                name: s.name.clone(),
                shape: s.shape,
                arg_type: s.arg.map(|t| t.name().to_string()),
                out_type: s.out.map(|t| t.name().to_string()),
            })
            .collect()
    }

    /// Describe this interface's event handlers, for remote bind checking.
    pub fn handler_descs(&self) -> Vec<EventDesc> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|h| EventDesc {
                name: h.name.clone(),
                shape: h.shape,
                payload_type: h.payload.map(|t| t.name().to_string()),
            })
            .collect()
    }

    /// Bind one slot to a remote call target. Shape checking against the
    /// remote descriptor happens in the proxy layer before this is called.
    pub fn bind_remote(
        &self,
        name: &str,
        target: Arc<dyn RemoteCall>,
    ) -> Result<(), RuntimeError> {
        let slots = self
            .inner
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| RuntimeError::UnknownCommand {
                interface: self.origin(),
                command: name.to_string(),
            })?;
        slot.bind(SlotTarget::Remote(target));
        Ok(())
    }

    /// Unbind one slot by name. Subsequent calls through its handle return
    /// `NotConnected`.
    pub fn unbind_command(&self, name: &str) {
        let slots = self
            .inner
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.iter().find(|s| s.name == name) {
            slot.unbind();
        }
    }

    /// Unbind every slot. Subsequent calls through the interface's handles
    /// return `NotConnected`.
    pub fn unbind_all(&self) {
        for slot in self.slots() {
            slot.unbind();
        }
    }

    /// Deliver an event arriving from a remote generator onto this
    /// interface's component mailbox.
    pub fn deliver_remote_event(&self, event: &str, payload: Option<&serde_json::Value>) {
        let handlers = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(reg) = handlers.iter().find(|h| h.name == event) else {
            warn!(
                "remote event '{}' has no handler on {}",
                event,
                self.origin()
            );
            return;
        };
        let payload = match (&reg.decode, payload) {
            (None, None) => None,
            (Some(decode), Some(json)) => match decode(json) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(
                        "remote event '{}' payload rejected by {}: {}",
                        event,
                        self.origin(),
                        e
                    );
                    return;
                }
            },
            _ => {
                warn!(
                    "remote event '{}' payload shape does not match handler on {}",
                    event,
                    self.origin()
                );
                return;
            }
        };
        self.inner.mailbox.deliver(crate::mailbox::QueuedCall {
            origin: format!("remote:{event}"),
            handler: reg.handler.clone(),
            payload,
        });
    }
}
