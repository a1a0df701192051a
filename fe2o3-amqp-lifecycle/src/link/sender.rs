//! Fire and forget sender

use std::{fmt, ops::Deref};

use fe2o3_amqp_types::definitions::{DeliveryTag, MessageFormat};
use tokio_util::sync::CancellationToken;

use crate::{
    engine::{Delivery, EngineSender, Payload},
    error::Error,
    event::Event,
    session::Session,
    util::ensure_not_cancelled,
};

use super::{Link, Role, SenderOptions};

/// A sending link whose outcomes are observed through events
///
/// [`send`](Self::send) hands the message to the engine and returns. The dispositions are
/// re-emitted as [`Event::Accepted`], [`Event::Rejected`], [`Event::Released`] and
/// [`Event::Modified`]. Use an [`AwaitableSender`](super::AwaitableSender) to await them instead.
#[derive(Clone)]
pub struct Sender {
    link: Link<dyn EngineSender>,
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("credit", &self.credit())
            .finish()
    }
}

impl Deref for Sender {
    type Target = Link<dyn EngineSender>;

    fn deref(&self) -> &Self::Target {
        &self.link
    }
}

impl Sender {
    pub(crate) async fn attach(
        session: &Session,
        options: SenderOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<Self, Error> {
        ensure_not_cancelled(cancel, || {
            format!(
                "Request to create a sender on session {:?} has been cancelled",
                session.id()
            )
        })?;

        let engine = session.engine().create_sender(&options.link);
        let link = Link::wrap(session, engine, Role::Sender);
        link.install(&options.handlers);
        link.on_wrapper(Event::Sendable, &options.on_sendable);
        link.on_wrapper(Event::Accepted, &options.on_accepted);
        link.on_wrapper(Event::Rejected, &options.on_rejected);
        link.on_wrapper(Event::Released, &options.on_released);
        link.on_wrapper(Event::Modified, &options.on_modified);

        link.attach(cancel).await?;
        Ok(Self { link })
    }

    /// Whether the link has credit and the engine can take another transfer
    pub fn sendable(&self) -> bool {
        self.link.engine().sendable()
    }

    /// Hands a message to the engine and returns its delivery.
    ///
    /// The delivery id is assigned immediately. The outcome arrives later as an event.
    pub fn send(
        &self,
        payload: impl Into<Payload>,
        tag: Option<DeliveryTag>,
        format: MessageFormat,
    ) -> Delivery {
        self.link.engine().send(payload.into(), tag, format)
    }
}
