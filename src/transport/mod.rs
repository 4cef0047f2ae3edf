pub mod tcp;
pub mod udp;

use std::fmt::Debug;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::protocol::message::Message;

/// Outcome of one [Transport::receive] call.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Received {
    /// A complete inbound message.
    Message(Message),
    /// Nothing to deliver right now (datagram timeout, or a concurrent send
    /// currently owns the socket's reply channel). Not a failure.
    Idle,
    /// The peer closed the connection, or the transport was stopped. Ends the
    /// receive loop without alarming the operator.
    Closed,
}

/// Capability interface over the two wire transports. One implementation is
/// selected at session construction and owned by the session for its
/// lifetime; it is never re-selected mid-session.
///
/// Exactly one outbound message is in flight at a time per session. The
/// receive side runs on the session's background task; each implementation
/// guards its own socket against concurrent send/receive internally.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Sends one message. Errors are fatal to the in-progress operation and
    /// are not retried at this level (the datagram client's internal
    /// retransmission loop has already run by the time it reports an error).
    async fn send(&self, msg: Message) -> anyhow::Result<()>;

    /// Waits for the next inbound message, bounded by the transport's own
    /// timeout discipline. Decode failures of a received frame are returned
    /// as errors; the caller decides about escalation.
    async fn receive(&self) -> anyhow::Result<Received>;

    /// Idempotently shuts the transport down. Safe to call from a different
    /// task than the one blocked in [Transport::receive]; a blocked receive
    /// resolves to [Received::Closed].
    async fn stop(&self);
}
