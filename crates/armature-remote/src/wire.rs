use serde::{Deserialize, Serialize};

use armature_core::InterfaceDescriptor;
use armature_values::CommandError;

/// Outcome of a remote command invocation, as it travels back over the wire.
/// `Ok` carries the JSON output for the shapes that produce one.
pub type WireResult = Result<Option<serde_json::Value>, CommandError>;

/// Everything that crosses a process link. One serde-tagged vocabulary for
/// both directions; each frame names the session it belongs to, so one link
/// could in principle multiplex several connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Phase one of a connect: ask the serving process to describe one of
    /// its provided interfaces and stage a session for it.
    ResolveInterface {
        session: u64,
        component: String,
        interface: String,
    },
    /// The staged session's interface, described for bind checking.
    InterfaceResolved {
        session: u64,
        descriptor: InterfaceDescriptor,
    },
    /// The serving process could not stage the session.
    ResolveFailed { session: u64, reason: String },

    /// Phase two: the requesting side bound its slots and commits to the
    /// session. `events` are the generator names it subscribed to; only now
    /// does the server start forwarding them.
    ConfirmConnection { session: u64, events: Vec<String> },
    /// The requesting side gave up on a staged session before confirming.
    AbortConnection { session: u64 },
    /// Tear down a confirmed session.
    Disconnect { session: u64 },

    /// Invoke a provided command by its table index.
    Call {
        session: u64,
        request: u64,
        command: usize,
        arg: Option<serde_json::Value>,
    },
    /// Reply to exactly one [`Frame::Call`].
    CallReply { request: u64, result: WireResult },

    /// A fired event forwarded to the subscribing process.
    Event {
        session: u64,
        event: String,
        payload: Option<serde_json::Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_survive_the_wire_form() {
        let frame = Frame::Call {
            session: 7,
            request: 42,
            command: 3,
            arg: Some(serde_json::json!({ "temperature": 95.0 })),
        };
        let text = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&text).unwrap();
        match back {
            Frame::Call {
                session,
                request,
                command,
                arg,
            } => {
                assert_eq!(session, 7);
                assert_eq!(request, 42);
                assert_eq!(command, 3);
                assert_eq!(arg.unwrap()["temperature"], 95.0);
            }
            other => panic!("wrong frame after round trip: {other:?}"),
        }
    }

    #[test]
    fn error_replies_survive_the_wire_form() {
        let frame = Frame::CallReply {
            request: 1,
            result: Err(CommandError::Timeout),
        };
        let text = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&text).unwrap();
        match back {
            Frame::CallReply { result, .. } => assert_eq!(result, Err(CommandError::Timeout)),
            other => panic!("wrong frame after round trip: {other:?}"),
        }
    }
}
