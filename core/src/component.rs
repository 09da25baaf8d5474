use crossbeam_channel::Receiver;
use std::sync::Arc;

use crate::interface::{ProvidedInterface, RequiredInterface};
use crate::mailbox::{self, MailboxSender, QueuedCall};
use crate::runtime::RuntimeError;
use crate::task::{SchedulingPolicy, TaskCore};

pub(crate) const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// User-supplied behavior of a component, driven by its task.
///
/// `startup` runs once when the task is created (on the task's own thread,
/// or inline on the foreign thread for callback-driven tasks); `step` runs
/// under the scheduling policy and is never invoked concurrently with
/// itself; `cleanup` runs once when the task ends.
pub trait ComponentLogic: Send + 'static {
    fn startup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn step(&mut self) {}

    fn cleanup(&mut self) {}
}

/// A no-op logic for components that only serve commands and never need a
/// step of their own.
pub struct PassiveLogic;

impl ComponentLogic for PassiveLogic {}

/// A named unit of behavior: interfaces plus the logic one task drives.
///
/// Build the component, declare its interfaces, hand the typed command and
/// event handles to the logic, then register the whole thing with a
/// [`crate::Runtime`].
pub struct Component {
    name: String,
    policy: SchedulingPolicy,
    provided: Vec<ProvidedInterface>,
    required: Vec<RequiredInterface>,
    mailbox_tx: MailboxSender,
    mailbox_rx: Option<Receiver<QueuedCall>>,
    logic: Option<Box<dyn ComponentLogic>>,
    core: Arc<TaskCore>,
}

impl Component {
    pub fn new(name: &str, policy: SchedulingPolicy) -> Self {
        Self::with_mailbox_capacity(name, policy, DEFAULT_MAILBOX_CAPACITY)
    }

    /// Like [`Component::new`] with an explicit event mailbox depth. Once
    /// the mailbox is full, further event deliveries to this component are
    /// dropped until its task drains the queue.
    pub fn with_mailbox_capacity(name: &str, policy: SchedulingPolicy, capacity: usize) -> Self {
        let (mailbox_tx, mailbox_rx) = mailbox::mailbox(name, capacity);
        Self {
            name: name.to_string(),
            policy,
            provided: Vec::new(),
            required: Vec::new(),
            mailbox_tx,
            mailbox_rx: Some(mailbox_rx),
            logic: None,
            core: Arc::new(TaskCore::new(name, policy)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.policy
    }

    /// Declare a provided interface. The returned handle stays valid after
    /// the component is registered; command registration goes through it.
    pub fn add_provided_interface(&mut self, name: &str) -> Result<ProvidedInterface, RuntimeError> {
        if self.provided.iter().any(|i| i.name() == name)
            || self.required.iter().any(|i| i.name() == name)
        {
            return Err(RuntimeError::DuplicateInterface {
                component: self.name.clone(),
                interface: name.to_string(),
            });
        }
        let interface = ProvidedInterface::new(&self.name, name);
        self.provided.push(interface.clone());
        Ok(interface)
    }

    /// Declare a required interface. Event handlers registered on it will
    /// be delivered through this component's mailbox.
    pub fn add_required_interface(&mut self, name: &str) -> Result<RequiredInterface, RuntimeError> {
        if self.provided.iter().any(|i| i.name() == name)
            || self.required.iter().any(|i| i.name() == name)
        {
            return Err(RuntimeError::DuplicateInterface {
                component: self.name.clone(),
                interface: name.to_string(),
            });
        }
        let interface = RequiredInterface::new(&self.name, name, self.mailbox_tx.clone());
        self.required.push(interface.clone());
        Ok(interface)
    }

    /// Attach the behavior the task will drive. Components without logic
    /// get [`PassiveLogic`] when registered.
    pub fn set_logic<L: ComponentLogic>(&mut self, logic: L) {
        self.logic = Some(Box::new(logic));
    }

    pub(crate) fn core(&self) -> &Arc<TaskCore> {
        &self.core
    }

    pub(crate) fn provided_interfaces(&self) -> &[ProvidedInterface] {
        &self.provided
    }

    pub(crate) fn required_interfaces(&self) -> &[RequiredInterface] {
        &self.required
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        String,
        SchedulingPolicy,
        Vec<ProvidedInterface>,
        Vec<RequiredInterface>,
        Receiver<QueuedCall>,
        Box<dyn ComponentLogic>,
        Arc<TaskCore>,
    ) {
        let logic = self.logic.unwrap_or_else(|| Box::new(PassiveLogic));
        let rx = self
            .mailbox_rx
            .expect("component mailbox receiver already taken");
        (
            self.name,
            self.policy,
            self.provided,
            self.required,
            rx,
            logic,
            self.core,
        )
    }
}
