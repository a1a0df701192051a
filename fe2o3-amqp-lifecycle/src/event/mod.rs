//! Lifecycle events emitted by the protocol engine and re-emitted by the wrappers

use std::fmt;

use crate::{
    engine::{Delivery, Payload},
    error::ProtocolError,
};

mod emitter;
pub use emitter::*;

/// Named lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Event {
    /// The remote peer opened the connection
    ConnectionOpen,

    /// The connection was closed
    ConnectionClose,

    /// The connection was closed with an error
    ConnectionError,

    /// The underlying transport was lost
    Disconnected,

    /// The remote peer began the session
    SessionOpen,

    /// The session was ended
    SessionClose,

    /// The session was ended with an error
    SessionError,

    /// The remote peer attached the sending link
    SenderOpen,

    /// The sending link has credit to send
    Sendable,

    /// The sending link was detached
    SenderClose,

    /// The sending link was detached with an error
    SenderError,

    /// A sent delivery was accepted
    Accepted,

    /// A sent delivery was rejected
    Rejected,

    /// A sent delivery was released
    Released,

    /// A sent delivery was modified
    Modified,

    /// A sent delivery was settled by the remote peer
    Settled,

    /// The remote peer attached the receiving link
    ReceiverOpen,

    /// The receiving link was detached
    ReceiverClose,

    /// The receiving link was detached with an error
    ReceiverError,

    /// A drain request was completed
    ReceiverDrained,

    /// A message arrived on the receiving link
    Message,
}

impl Event {
    /// Events emitted on a connection
    pub const CONNECTION: &'static [Event] = &[
        Event::ConnectionOpen,
        Event::ConnectionClose,
        Event::ConnectionError,
        Event::Disconnected,
    ];

    /// Events emitted on a session
    pub const SESSION: &'static [Event] = &[
        Event::SessionOpen,
        Event::SessionClose,
        Event::SessionError,
    ];

    /// Events emitted on a sending link
    pub const SENDER: &'static [Event] = &[
        Event::SenderOpen,
        Event::Sendable,
        Event::SenderClose,
        Event::SenderError,
        Event::Accepted,
        Event::Rejected,
        Event::Released,
        Event::Modified,
        Event::Settled,
    ];

    /// Events emitted on a receiving link
    pub const RECEIVER: &'static [Event] = &[
        Event::ReceiverOpen,
        Event::ReceiverClose,
        Event::ReceiverError,
        Event::ReceiverDrained,
        Event::Message,
        Event::Settled,
    ];

    /// Name of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ConnectionOpen => "connection_open",
            Event::ConnectionClose => "connection_close",
            Event::ConnectionError => "connection_error",
            Event::Disconnected => "disconnected",
            Event::SessionOpen => "session_open",
            Event::SessionClose => "session_close",
            Event::SessionError => "session_error",
            Event::SenderOpen => "sender_open",
            Event::Sendable => "sendable",
            Event::SenderClose => "sender_close",
            Event::SenderError => "sender_error",
            Event::Accepted => "accepted",
            Event::Rejected => "rejected",
            Event::Released => "released",
            Event::Modified => "modified",
            Event::Settled => "settled",
            Event::ReceiverOpen => "receiver_open",
            Event::ReceiverClose => "receiver_close",
            Event::ReceiverError => "receiver_error",
            Event::ReceiverDrained => "receiver_drained",
            Event::Message => "message",
        }
    }

    /// Whether this is one of the `*Error` events
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Event::ConnectionError | Event::SessionError | Event::SenderError | Event::ReceiverError
        )
    }

    /// Whether this is one of the `*Close` events
    pub fn is_close(&self) -> bool {
        matches!(
            self,
            Event::ConnectionClose | Event::SessionClose | Event::SenderClose | Event::ReceiverClose
        )
    }

    /// Error and close events propagate to the parent entity if nobody handles them
    pub fn bubbles(&self) -> bool {
        self.is_error() || self.is_close()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload accompanying an [`Event`]
#[derive(Debug, Clone)]
pub struct EventContext {
    /// The event
    pub event: Event,

    /// Id of the connection the event originated from
    pub connection_id: String,

    /// Id of the session the event originated from.
    ///
    /// The engine leaves this empty, the session wrapper fills it in when re-emitting.
    pub session_id: Option<String>,

    /// Name of the link the event originated from
    pub link_name: Option<String>,

    /// Error carried by the event
    pub error: Option<ProtocolError>,

    /// The delivery a disposition or message event refers to
    pub delivery: Option<Delivery>,

    /// Payload of a [`Event::Message`]
    pub message: Option<Payload>,
}

impl EventContext {
    /// Creates a context with only the event and the connection id set
    pub fn new(event: Event, connection_id: impl Into<String>) -> Self {
        Self {
            event,
            connection_id: connection_id.into(),
            session_id: None,
            link_name: None,
            error: None,
            delivery: None,
            message: None,
        }
    }

    /// Sets the link name
    pub fn link_name(mut self, name: impl Into<String>) -> Self {
        self.link_name = Some(name.into());
        self
    }

    /// Sets the error
    pub fn error(mut self, error: impl Into<Option<ProtocolError>>) -> Self {
        self.error = error.into();
        self
    }

    /// Sets the delivery
    pub fn delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Sets the message payload
    pub fn message(mut self, message: Payload) -> Self {
        self.message = Some(message);
        self
    }
}
