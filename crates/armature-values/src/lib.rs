//! Shared value vocabulary for the armature runtime.
//!
//! Command and event payloads cross the runtime as opaque, by-value objects.
//! The only things the runtime ever asks of a payload are captured by the
//! [`Value`] trait: deep copy, JSON form for the process boundary, and a type
//! identity for bind-time checking. Concrete payload types used with the typed
//! registration APIs additionally satisfy [`Payload`], which adds the ability
//! to come back from JSON on the receiving side.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt;
use thiserror::Error;

/// The four argument shapes a command or event can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandShape {
    /// No argument, no output.
    Void,
    /// Produces one output value.
    Read,
    /// Consumes one input value.
    Write,
    /// Consumes one input value and produces one output value.
    QualifiedRead,
}

impl CommandShape {
    pub fn takes_argument(&self) -> bool {
        matches!(self, CommandShape::Write | CommandShape::QualifiedRead)
    }

    pub fn produces_output(&self) -> bool {
        matches!(self, CommandShape::Read | CommandShape::QualifiedRead)
    }
}

impl fmt::Display for CommandShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandShape::Void => "void",
            CommandShape::Read => "read",
            CommandShape::Write => "write",
            CommandShape::QualifiedRead => "qualified-read",
        };
        f.write_str(s)
    }
}

/// Identity of a payload type, checked when a required command is bound to a
/// provided one. Inside one process the `TypeId` is authoritative; across a
/// process boundary only the name travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeIdentity {
    id: TypeId,
    name: &'static str,
}

impl TypeIdentity {
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Exact type equality, usable only within one process.
    pub fn matches(&self, other: &TypeIdentity) -> bool {
        self.id == other.id
    }
}

impl fmt::Display for TypeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Why a command execution did not succeed.
///
/// Failures travel as values, never as panics: a failing callee can not
/// unwind its caller's stack, and a remote failure arrives as the same enum
/// the local paths use.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CommandError {
    /// The required-side command was never bound, or its connection was
    /// removed.
    #[error("command is not connected")]
    NotConnected,

    /// Argument or output type disagreement, detected at bind time where
    /// possible and at call time otherwise.
    #[error("argument type mismatch: expected {expected}, got {actual}")]
    InvalidInputType { expected: String, actual: String },

    /// The bound implementation itself reported failure.
    #[error("command implementation failed: {0}")]
    CalleeFailed(String),

    /// The command was explicitly disabled by its owner.
    #[error("command is disabled")]
    Disabled,

    /// A cross-process call exceeded its deadline. The connection stays
    /// intact.
    #[error("remote call timed out")]
    Timeout,

    /// The remote peer or its transport is gone.
    #[error("remote peer disconnected")]
    ProxyDisconnected,
}

/// Result of executing a command. `Ok` carries the output for the shapes
/// that produce one.
pub type ExecutionResult<T = ()> = Result<T, CommandError>;

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("failed to serialize value of type {type_name}: {source}")]
    Serialize {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to deserialize into {type_name}: {source}")]
    Deserialize {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A type-erased command or event payload.
///
/// Implemented automatically for every `Clone + Send + Debug + Serialize`
/// type, so application payloads need no manual trait work.
pub trait Value: Any + Send + fmt::Debug {
    /// Deep copy. Event fan-out clones the payload once per subscriber.
    fn clone_value(&self) -> Box<dyn Value>;

    /// Self-describing JSON form, used when the payload crosses a process
    /// boundary.
    fn to_json(&self) -> Result<serde_json::Value, ValueError>;

    fn type_identity(&self) -> TypeIdentity;

    fn as_any(&self) -> &dyn Any;
}

impl<T> Value for T
where
    T: Any + Clone + Send + fmt::Debug + Serialize,
{
    fn clone_value(&self) -> Box<dyn Value> {
        Box::new(self.clone())
    }

    fn to_json(&self) -> Result<serde_json::Value, ValueError> {
        serde_json::to_value(self).map_err(|source| ValueError::Serialize {
            type_name: std::any::type_name::<T>(),
            source,
        })
    }

    fn type_identity(&self) -> TypeIdentity {
        TypeIdentity::of::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Concrete payload bound for the typed registration APIs. Everything a
/// [`Value`] is, plus the ability to come back from its JSON form.
pub trait Payload: Any + Clone + Send + fmt::Debug + Serialize + DeserializeOwned {}

impl<T> Payload for T where T: Any + Clone + Send + fmt::Debug + Serialize + DeserializeOwned {}

/// Borrow a type-erased payload as its concrete type.
pub fn downcast_value<T: Any>(value: &dyn Value) -> Option<&T> {
    value.as_any().downcast_ref::<T>()
}

/// Rebuild a concrete payload from its JSON form.
pub fn value_from_json<T: Payload>(json: &serde_json::Value) -> Result<T, ValueError> {
    serde_json::from_value(json.clone()).map_err(|source| ValueError::Deserialize {
        type_name: std::any::type_name::<T>(),
        source,
    })
}
