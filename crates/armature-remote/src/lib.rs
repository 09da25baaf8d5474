//! Cross-process connections for the armature runtime.
//!
//! A [`ProcessRegistry`] stands in for whatever would locate another process
//! on a real network: it holds one [`armature_core::Runtime`] handle per
//! process name and brokers connects between them. A connect stages a
//! session on the serving side, describes the provided interface for bind
//! checking, and only activates once the requesting side confirms; after
//! that a proxy pair makes the connection behave like a local one.
//! Everything crossing the link travels in its JSON wire form, with a
//! configurable simulated latency.
//!
//! Call semantics over the proxy pair: Void and Write commands return once
//! the frame is on the link (ordered per connection); Read and QualifiedRead
//! block the calling thread for the reply up to a timeout. Remote events are
//! still delivered onto the subscribing task's own mailbox.

mod proxy;

pub mod registry;
pub use registry::{ProcessRegistry, RemoteConnectSpec, RemoteConnection, RemoteError};

pub mod transport;
pub use transport::{duplex, Endpoint, FrameSender, TransportError};

pub mod wire;
pub use wire::{Frame, WireResult};
