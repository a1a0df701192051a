#![deny(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Request/response lifecycle coordination on top of an event driven AMQP 1.0 protocol engine
//!
//! The protocol engine (framing, transports, credit and the endpoint state machines) is driven
//! through the traits in [`engine`] and reports everything as [`event::Event`]s. This crate turns
//! those events into operations that resolve exactly once:
//!
//! - [`Connection::open`], [`Connection::create_session`], [`Session::create_sender`],
//!   [`Session::create_receiver`] and every `close` resolve on the peer's answer, fail with the
//!   peer's error, or fail with [`Error::OperationTimeout`], [`Error::Cancelled`] or
//!   [`Error::Disconnected`].
//! - [`AwaitableSender::send`] resolves with the receiver's outcome for the delivery.
//!
//! Every operation takes an optional [`CancellationToken`](tokio_util::sync::CancellationToken).
//! Cancelling only stops waiting, it never takes back what has been handed to the engine.
//!
//! # Feature flags
//!
//! ```toml
//! default = []
//! ```
//!
//! | Feature | Description |
//! |---------|-------------|
//! |`"tracing"`| Logs with `tracing` |
//! |`"log"`| Logs with `log` |
//!
//! # Quick start
//!
//! ```rust
//! use fe2o3_amqp_lifecycle::{
//!     engine::mock::MockContainer, AwaitableSenderOptions, Connection, ConnectionOptions,
//!     LinkCloseOptions, SendOptions,
//! };
//!
//! # async fn example() -> Result<(), fe2o3_amqp_lifecycle::Error> {
//! let container = MockContainer::new("quick-start");
//! let options = ConnectionOptions::builder()
//!     .address("localhost", 5672)
//!     .credentials("guest", "guest")
//!     .build();
//! let connection = Connection::new(&container, options);
//! connection.open(None).await?;
//!
//! let sender = connection
//!     .create_awaitable_sender(AwaitableSenderOptions::default().target("q1"), None)
//!     .await?;
//! let delivery = sender.send("hello", SendOptions::default()).await?;
//! println!("accepted delivery {}", delivery.id);
//!
//! sender.close(LinkCloseOptions::default(), None).await?;
//! connection.close(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod engine;
pub mod error;
pub mod event;
pub mod link;
pub mod session;

mod entity;
mod util;

pub use connection::{Connection, ConnectionOptions};
pub use error::{Disposition, Error, ProtocolError, SendOperationFailedError};
pub use event::{Event, EventContext};
pub use link::{
    AwaitableSender, AwaitableSenderOptions, Link, LinkCloseOptions, LinkState, Receiver,
    ReceiverOptions, RequestResponseLink, SendOptions, Sender, SenderOptions,
};
pub use session::Session;
