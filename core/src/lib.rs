//! armature core: a component-based concurrent runtime for control software.
//!
//! Components own provided and required interfaces of typed commands and
//! events. One task drives each component on its own thread (or on a
//! borrowed foreign thread); the [`Runtime`] wires components together at
//! run time by binding required command slots to provided implementations
//! and event handlers to generators. The [`triple_buffer`] cell carries the
//! latest value between two tasks without blocking either.

pub mod command;
pub use command::{QualifiedReadFn, ReadFn, RemoteCall, VoidFn, WriteFn};

pub mod component;
pub use component::{Component, ComponentLogic, PassiveLogic};

pub mod config;
pub use config::{ConfigError, RuntimeConfig};

pub mod event;
pub use event::{EventForwarder, EventVoidFn, EventWriteFn};

pub mod interface;
pub use interface::{
    CommandDesc, EventDesc, InterfaceDescriptor, ProvidedInterface, RequiredInterface,
};

mod mailbox;

pub mod runtime;
pub use runtime::{
    BindFailure, ConnectError, ConnectionId, ConnectionReport, Runtime, RuntimeError,
};

pub mod task;
pub use task::{CallbackEntry, SchedulingPolicy, TaskState};

pub mod triple_buffer;
pub use triple_buffer::{triple_buffer, TripleReader, TripleWriter};

// The payload vocabulary is part of this crate's public surface.
pub use armature_values::{
    downcast_value, value_from_json, CommandError, CommandShape, ExecutionResult, Payload,
    TypeIdentity, Value, ValueError,
};
