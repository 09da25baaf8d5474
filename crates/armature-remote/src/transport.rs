use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::wire::Frame;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport peer is gone")]
    Disconnected,
    #[error("no frame arrived within the deadline")]
    Timeout,
    #[error("frame did not survive the wire form: {0}")]
    Codec(String),
}

struct Timed {
    deliver_at: Instant,
    text: String,
}

/// Sending half of an [`Endpoint`]. Cloneable, so event forwarders and call
/// targets on different threads can all feed the same link. Frames leave in
/// send order and arrive in that order; the simulated latency delays every
/// frame by the same amount, so it never reorders them.
#[derive(Clone)]
pub struct FrameSender {
    tx: Sender<Timed>,
    latency: Duration,
}

impl FrameSender {
    pub fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame).map_err(|e| TransportError::Codec(e.to_string()))?;
        self.tx
            .send(Timed {
                deliver_at: Instant::now() + self.latency,
                text,
            })
            .map_err(|_| TransportError::Disconnected)
    }
}

/// One end of an in-process duplex link.
///
/// Frames are serialized to their JSON wire form on send and parsed again on
/// receive, so everything crossing the link really does go through the same
/// (de)serialization a process boundary would force. A relay thread per
/// direction holds each frame back until its simulated network latency has
/// elapsed.
pub struct Endpoint {
    sender: FrameSender,
    rx: Receiver<String>,
}

impl Endpoint {
    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.sender.send(frame)
    }

    /// Block until the peer sends a frame or goes away.
    pub fn recv(&self) -> Result<Frame, TransportError> {
        let text = self.rx.recv().map_err(|_| TransportError::Disconnected)?;
        serde_json::from_str(&text).map_err(|e| TransportError::Codec(e.to_string()))
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Frame, TransportError> {
        let text = self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => TransportError::Timeout,
            RecvTimeoutError::Disconnected => TransportError::Disconnected,
        })?;
        serde_json::from_str(&text).map_err(|e| TransportError::Codec(e.to_string()))
    }
}

/// Build a connected pair of endpoints with the given one-way latency
/// applied to each direction. Dropping either endpoint (and every clone of
/// its sender) tears the link down; the peer then sees `Disconnected`.
pub fn duplex(latency: Duration) -> (Endpoint, Endpoint) {
    let (a_tx, a_relay) = unbounded::<Timed>();
    let (b_tx, b_relay) = unbounded::<Timed>();
    let (to_b, b_rx) = unbounded::<String>();
    let (to_a, a_rx) = unbounded::<String>();
    spawn_relay(a_relay, to_b);
    spawn_relay(b_relay, to_a);
    (
        Endpoint {
            sender: FrameSender {
                tx: a_tx,
                latency,
            },
            rx: a_rx,
        },
        Endpoint {
            sender: FrameSender {
                tx: b_tx,
                latency,
            },
            rx: b_rx,
        },
    )
}

fn spawn_relay(inbox: Receiver<Timed>, outbox: Sender<String>) {
    thread::spawn(move || {
        while let Ok(timed) = inbox.recv() {
            if let Some(wait) = timed.deliver_at.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
            if outbox.send(timed.text).is_err() {
                return;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_cross_in_order() {
        let (a, b) = duplex(Duration::ZERO);
        for session in 0..5 {
            a.send(&Frame::Disconnect { session }).unwrap();
        }
        for session in 0..5 {
            match b.recv_timeout(Duration::from_secs(1)).unwrap() {
                Frame::Disconnect { session: got } => assert_eq!(got, session),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[test]
    fn latency_delays_delivery() {
        let (a, b) = duplex(Duration::from_millis(20));
        let sent_at = Instant::now();
        a.send(&Frame::Disconnect { session: 0 }).unwrap();
        assert!(matches!(
            b.recv_timeout(Duration::from_millis(2)),
            Err(TransportError::Timeout)
        ));
        b.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(sent_at.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn dropped_peer_is_disconnected() {
        let (a, b) = duplex(Duration::ZERO);
        drop(b);
        // The relay notices the dead peer when it tries to deliver; the
        // sender sees it on the send after that.
        let mut saw_disconnect = false;
        for _ in 0..100 {
            if a.send(&Frame::Disconnect { session: 0 }).is_err() {
                saw_disconnect = true;
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(saw_disconnect);
        assert!(matches!(a.recv(), Err(TransportError::Disconnected)));
    }
}
