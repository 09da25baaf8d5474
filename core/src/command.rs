use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use armature_values::{
    downcast_value, CommandError, CommandShape, ExecutionResult, Payload, TypeIdentity, Value,
};

pub(crate) type VoidKernel = Box<dyn Fn() -> ExecutionResult + Send + Sync>;
pub(crate) type ReadKernel = Box<dyn Fn() -> ExecutionResult<Box<dyn Value>> + Send + Sync>;
pub(crate) type WriteKernel = Box<dyn Fn(&dyn Value) -> ExecutionResult + Send + Sync>;
pub(crate) type QualifiedReadKernel =
    Box<dyn Fn(&dyn Value) -> ExecutionResult<Box<dyn Value>> + Send + Sync>;

/// Rebuilds a typed payload from its JSON wire form.
pub(crate) type ArgDecoder =
    Arc<dyn Fn(&serde_json::Value) -> Result<Box<dyn Value>, String> + Send + Sync>;

pub(crate) enum Kernel {
    Void(VoidKernel),
    Read(ReadKernel),
    Write(WriteKernel),
    QualifiedRead(QualifiedReadKernel),
}

/// A concrete command implementation registered on a provided interface.
pub(crate) struct ProvidedCommand {
    pub name: String,
    pub shape: CommandShape,
    pub arg: Option<TypeIdentity>,
    pub out: Option<TypeIdentity>,
    pub enabled: AtomicBool,
    pub kernel: Kernel,
    /// Present for the shapes that take an argument; used by the proxy path.
    pub decode_arg: Option<ArgDecoder>,
}

impl ProvidedCommand {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

pub(crate) type CommandTable = RwLock<Vec<Arc<ProvidedCommand>>>;

/// A call target forwarding to another process. Implemented by the proxy
/// layer; the core only knows how to hand it an argument and take back an
/// optional JSON output.
pub trait RemoteCall: Send + Sync {
    fn call(&self, arg: Option<&dyn Value>) -> ExecutionResult<Option<serde_json::Value>>;
}

/// What a required-side command slot currently points at. Local targets hold
/// a handle {table, index} into the provider's command table, never a direct
/// reference to the command, so disconnect can invalidate them wholesale.
#[derive(Clone)]
pub(crate) enum SlotTarget {
    Local {
        table: Weak<CommandTable>,
        index: usize,
    },
    Remote(Arc<dyn RemoteCall>),
}

/// A required-side command pointer: unbound, or bound to exactly one
/// provided command of matching name and shape.
pub(crate) struct CommandSlot {
    pub name: String,
    pub shape: CommandShape,
    pub arg: Option<TypeIdentity>,
    pub out: Option<TypeIdentity>,
    target: RwLock<Option<SlotTarget>>,
}

impl CommandSlot {
    pub fn new(
        name: String,
        shape: CommandShape,
        arg: Option<TypeIdentity>,
        out: Option<TypeIdentity>,
    ) -> Self {
        Self {
            name,
            shape,
            arg,
            out,
            target: RwLock::new(None),
        }
    }

    pub fn bind(&self, target: SlotTarget) {
        *self
            .target
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(target);
    }

    pub fn unbind(&self) {
        *self
            .target
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_bound(&self) -> bool {
        self.target
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn snapshot(&self) -> Option<SlotTarget> {
        self.target
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolve a local target to its command, or the error the caller should
    /// see. The table handle is resolved per call so a disconnected or
    /// removed provider turns into `NotConnected` instead of a stale call.
    fn resolve(&self) -> ExecutionResult<Resolved> {
        match self.snapshot() {
            None => Err(CommandError::NotConnected),
            Some(SlotTarget::Remote(call)) => Ok(Resolved::Remote(call)),
            Some(SlotTarget::Local { table, index }) => {
                let table = table.upgrade().ok_or(CommandError::NotConnected)?;
                let command = table
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(index)
                    .cloned()
                    .ok_or(CommandError::NotConnected)?;
                if !command.is_enabled() {
                    return Err(CommandError::Disabled);
                }
                Ok(Resolved::Local(command))
            }
        }
    }
}

enum Resolved {
    Local(Arc<ProvidedCommand>),
    Remote(Arc<dyn RemoteCall>),
}

fn wrong_shape(expected: CommandShape, command: &ProvidedCommand) -> CommandError {
    CommandError::InvalidInputType {
        expected: format!("{expected} command"),
        actual: format!("{} command", command.shape),
    }
}

/// Handle for calling a void command through a required interface.
#[derive(Clone)]
pub struct VoidFn {
    slot: Arc<CommandSlot>,
}

impl VoidFn {
    pub(crate) fn new(slot: Arc<CommandSlot>) -> Self {
        Self { slot }
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn is_bound(&self) -> bool {
        self.slot.is_bound()
    }

    pub fn call(&self) -> ExecutionResult {
        match self.slot.resolve()? {
            Resolved::Local(command) => match &command.kernel {
                Kernel::Void(f) => f(),
                _ => Err(wrong_shape(CommandShape::Void, &command)),
            },
            Resolved::Remote(call) => call.call(None).map(|_| ()),
        }
    }
}

/// Handle for a command producing one output value.
pub struct ReadFn<T> {
    slot: Arc<CommandSlot>,
    _out: PhantomData<fn() -> T>,
}

impl<T> Clone for ReadFn<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            _out: PhantomData,
        }
    }
}

impl<T: Payload> ReadFn<T> {
    pub(crate) fn new(slot: Arc<CommandSlot>) -> Self {
        Self {
            slot,
            _out: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn is_bound(&self) -> bool {
        self.slot.is_bound()
    }

    pub fn call(&self) -> ExecutionResult<T> {
        match self.slot.resolve()? {
            Resolved::Local(command) => match &command.kernel {
                Kernel::Read(f) => take_output::<T>(f()?),
                _ => Err(wrong_shape(CommandShape::Read, &command)),
            },
            Resolved::Remote(call) => take_remote_output::<T>(call.call(None)?),
        }
    }
}

/// Handle for a command consuming one input value.
pub struct WriteFn<T> {
    slot: Arc<CommandSlot>,
    _arg: PhantomData<fn(T)>,
}

impl<T> Clone for WriteFn<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            _arg: PhantomData,
        }
    }
}

impl<T: Payload> WriteFn<T> {
    pub(crate) fn new(slot: Arc<CommandSlot>) -> Self {
        Self {
            slot,
            _arg: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn is_bound(&self) -> bool {
        self.slot.is_bound()
    }

    pub fn call(&self, arg: &T) -> ExecutionResult {
        match self.slot.resolve()? {
            Resolved::Local(command) => match &command.kernel {
                Kernel::Write(f) => f(arg),
                _ => Err(wrong_shape(CommandShape::Write, &command)),
            },
            Resolved::Remote(call) => call.call(Some(arg)).map(|_| ()),
        }
    }
}

/// Handle for a command consuming one input and producing one output.
pub struct QualifiedReadFn<Q, T> {
    slot: Arc<CommandSlot>,
    _arg: PhantomData<fn(Q)>,
    _out: PhantomData<fn() -> T>,
}

impl<Q, T> Clone for QualifiedReadFn<Q, T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            _arg: PhantomData,
            _out: PhantomData,
        }
    }
}

impl<Q: Payload, T: Payload> QualifiedReadFn<Q, T> {
    pub(crate) fn new(slot: Arc<CommandSlot>) -> Self {
        Self {
            slot,
            _arg: PhantomData,
            _out: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn is_bound(&self) -> bool {
        self.slot.is_bound()
    }

    pub fn call(&self, arg: &Q) -> ExecutionResult<T> {
        match self.slot.resolve()? {
            Resolved::Local(command) => match &command.kernel {
                Kernel::QualifiedRead(f) => take_output::<T>(f(arg)?),
                _ => Err(wrong_shape(CommandShape::QualifiedRead, &command)),
            },
            Resolved::Remote(call) => take_remote_output::<T>(call.call(Some(arg))?),
        }
    }
}

fn take_output<T: Payload>(value: Box<dyn Value>) -> ExecutionResult<T> {
    match downcast_value::<T>(value.as_ref()) {
        Some(out) => Ok(out.clone()),
        None => Err(CommandError::InvalidInputType {
            expected: std::any::type_name::<T>().to_string(),
            actual: value.type_identity().name().to_string(),
        }),
    }
}

fn take_remote_output<T: Payload>(json: Option<serde_json::Value>) -> ExecutionResult<T> {
    let json = json.ok_or_else(|| CommandError::InvalidInputType {
        expected: std::any::type_name::<T>().to_string(),
        actual: "empty reply".to_string(),
    })?;
    armature_values::value_from_json::<T>(&json).map_err(|e| CommandError::InvalidInputType {
        expected: std::any::type_name::<T>().to_string(),
        actual: e.to_string(),
    })
}

/// Wrap a user closure as a callee, folding its error into the result code
/// the caller sees.
pub(crate) fn callee_failed(e: anyhow::Error) -> CommandError {
    CommandError::CalleeFailed(format!("{e:#}"))
}

pub(crate) fn decoder_for<T: Payload>() -> ArgDecoder {
    Arc::new(|json| {
        armature_values::value_from_json::<T>(json)
            .map(|v| Box::new(v) as Box<dyn Value>)
            .map_err(|e| e.to_string())
    })
}

/// Build the type-erased write kernel for a typed closure. The downcast can
/// only fail for a call-time mismatch on the type-erased proxy path; bound
/// local calls were already checked when the connection was made.
pub(crate) fn write_kernel<T, F>(f: F) -> WriteKernel
where
    T: Payload,
    F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Box::new(move |arg: &dyn Value| {
        let arg = downcast_value::<T>(arg).ok_or_else(|| CommandError::InvalidInputType {
            expected: std::any::type_name::<T>().to_string(),
            actual: arg.type_identity().name().to_string(),
        })?;
        f(arg).map_err(callee_failed)
    })
}

pub(crate) fn read_kernel<T, F>(f: F) -> ReadKernel
where
    T: Payload,
    F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
{
    Box::new(move || {
        f().map(|v| Box::new(v) as Box<dyn Value>)
            .map_err(callee_failed)
    })
}

pub(crate) fn void_kernel<F>(f: F) -> VoidKernel
where
    F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
{
    Box::new(move || f().map_err(callee_failed))
}

pub(crate) fn qualified_read_kernel<Q, T, F>(f: F) -> QualifiedReadKernel
where
    Q: Payload,
    T: Payload,
    F: Fn(&Q) -> anyhow::Result<T> + Send + Sync + 'static,
{
    Box::new(move |arg: &dyn Value| {
        let arg = downcast_value::<Q>(arg).ok_or_else(|| CommandError::InvalidInputType {
            expected: std::any::type_name::<Q>().to_string(),
            actual: arg.type_identity().name().to_string(),
        })?;
        f(arg).map(|v| Box::new(v) as Box<dyn Value>).map_err(callee_failed)
    })
}
