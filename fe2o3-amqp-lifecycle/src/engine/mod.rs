//! Boundary with the protocol engine
//!
//! The protocol engine owns the wire: framing, encoding, transports, link credit and the AMQP
//! endpoint state machines. This crate only drives the engine through the traits below and
//! listens to the [`Event`](crate::event::Event)s the engine emits on each object's
//! [`EventEmitter`].
//!
//! # Contract
//!
//! - An action (`connect`, `begin`, `attach`, `close`) must not emit its outcome from within the
//!   call. The outcome is emitted later, ie. when the peer's frame is read from the transport.
//! - Every object emits on its own emitter only. Bubbling to the parent is done by the wrappers.
//! - The engine assigns delivery ids synchronously in [`EngineSender::send`]. The outcome of a
//!   delivery may be emitted from any thread as soon as the transfer is on the wire, even before
//!   `send` has returned to its caller.

use std::sync::Arc;

use bytes::Bytes;
use fe2o3_amqp_types::{
    definitions::{self, DeliveryNumber, DeliveryTag, MessageFormat},
    messaging::Outcome,
};

use crate::{
    connection::ConnectionOptions, error::ProtocolError, event::EventEmitter, link::LinkOptions,
};

pub mod mock;

/// An encoded message
pub type Payload = Bytes;

/// Handle to a transfer as reported by the engine
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Delivery id assigned by the engine
    pub id: DeliveryNumber,

    /// Delivery tag
    pub tag: DeliveryTag,

    /// Message format
    pub format: MessageFormat,

    /// Whether the delivery has been settled
    pub settled: bool,

    /// Outcome reported by the remote peer
    pub remote_state: Option<Outcome>,
}

/// Creates engine connections from options
pub trait Container: Send + Sync {
    /// Container id advertised in the open frame
    fn id(&self) -> &str;

    /// Creates a connection that is not yet connected
    fn create_connection(&self, options: &ConnectionOptions) -> Arc<dyn EngineConnection>;
}

/// Engine side of a connection
pub trait EngineConnection: Send + Sync + 'static {
    /// Connection id
    fn id(&self) -> &str;

    /// Container id
    fn container_id(&self) -> &str;

    /// Emitter of the connection events
    fn events(&self) -> &EventEmitter;

    /// Establishes the transport and sends the open frame
    fn connect(&self);

    /// Sends the close frame
    fn close(&self, error: Option<definitions::Error>);

    /// Whether both the local and the remote endpoint are open
    fn is_open(&self) -> bool;

    /// Whether the remote endpoint is open
    fn is_remote_open(&self) -> bool;

    /// Last error reported on the connection
    fn error(&self) -> Option<ProtocolError>;

    /// Creates a new session that has not yet begun
    fn create_session(&self) -> Arc<dyn EngineSession>;
}

/// Engine side of a session
pub trait EngineSession: Send + Sync + 'static {
    /// Emitter of the session events
    fn events(&self) -> &EventEmitter;

    /// Outgoing channel, assigned when the session begins
    fn local_channel(&self) -> Option<u16>;

    /// Incoming channel, assigned when the remote begin arrives
    fn remote_channel(&self) -> Option<u16>;

    /// Sends the begin frame
    fn begin(&self);

    /// Sends the end frame
    fn close(&self, error: Option<definitions::Error>);

    /// Drops the local session state without sending an end frame
    fn remove(&self);

    /// Whether both the local and the remote endpoint are open
    fn is_open(&self) -> bool;

    /// Whether the remote endpoint is open
    fn is_remote_open(&self) -> bool;

    /// Last error reported on the session
    fn error(&self) -> Option<ProtocolError>;

    /// Creates a sending link that has not yet been attached
    fn create_sender(&self, options: &LinkOptions) -> Arc<dyn EngineSender>;

    /// Creates a receiving link that has not yet been attached
    fn create_receiver(&self, options: &LinkOptions) -> Arc<dyn EngineReceiver>;
}

/// Common engine side of a link
pub trait EngineLink: Send + Sync + 'static {
    /// Link name
    fn name(&self) -> &str;

    /// Emitter of the link events
    fn events(&self) -> &EventEmitter;

    /// Sends the attach frame
    fn attach(&self);

    /// Sends a closing detach frame
    fn close(&self, error: Option<definitions::Error>);

    /// Drops the local link state without sending a detach frame
    fn remove(&self);

    /// Whether both the local and the remote endpoint are attached
    fn is_open(&self) -> bool;

    /// Whether the remote endpoint is attached
    fn is_remote_open(&self) -> bool;

    /// Whether the link has been closed locally or remotely
    fn is_closed(&self) -> bool;

    /// Last error reported on the link
    fn error(&self) -> Option<ProtocolError>;

    /// Current link credit
    fn credit(&self) -> u32;
}

/// Engine side of a sending link
pub trait EngineSender: EngineLink {
    /// Whether the link has credit and the outgoing queue has capacity
    fn sendable(&self) -> bool;

    /// Queues a transfer and returns its delivery. The delivery id is assigned synchronously
    fn send(&self, payload: Payload, tag: Option<DeliveryTag>, format: MessageFormat) -> Delivery;
}

/// Engine side of a receiving link
pub trait EngineReceiver: EngineLink {
    /// Issues additional credit
    fn add_credit(&self, credit: u32);

    /// Asks the sender to use up or give back all outstanding credit
    fn drain(&self);

    /// Settles an incoming delivery with an outcome
    fn settle(&self, delivery_id: DeliveryNumber, outcome: Outcome);
}
