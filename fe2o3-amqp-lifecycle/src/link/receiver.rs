//! Receiving link

use std::{fmt, ops::Deref};

use fe2o3_amqp_types::{
    definitions,
    messaging::{Accepted, Modified, Outcome, Rejected, Released},
};
use tokio_util::sync::CancellationToken;

use crate::{
    engine::{Delivery, EngineReceiver},
    error::Error,
    event::Event,
    session::Session,
    util::ensure_not_cancelled,
};

use super::{Link, ReceiverOptions, Role};

/// A receiving link
///
/// Incoming messages are re-emitted as [`Event::Message`] with the payload and the delivery set
/// on the [`EventContext`](crate::event::EventContext). Settle them with [`accept`](Self::accept),
/// [`reject`](Self::reject), [`release`](Self::release) or [`modify`](Self::modify).
#[derive(Clone)]
pub struct Receiver {
    link: Link<dyn EngineReceiver>,
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("credit", &self.credit())
            .finish()
    }
}

impl Deref for Receiver {
    type Target = Link<dyn EngineReceiver>;

    fn deref(&self) -> &Self::Target {
        &self.link
    }
}

impl Receiver {
    pub(crate) async fn attach(
        session: &Session,
        options: ReceiverOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<Self, Error> {
        options.validate()?;
        ensure_not_cancelled(cancel, || {
            format!(
                "Request to create a receiver on session {:?} has been cancelled",
                session.id()
            )
        })?;

        let engine = session.engine().create_receiver(&options.link);
        let link = Link::wrap(session, engine, Role::Receiver);
        link.install(&options.handlers);
        link.on_wrapper(Event::Message, &options.on_message);
        link.on_wrapper(Event::Settled, &options.on_settled);
        link.on_wrapper(Event::ReceiverDrained, &options.on_drained);

        link.attach(cancel).await?;
        Ok(Self { link })
    }

    /// Issues `credit` additional credit to the sender
    pub fn add_credit(&self, credit: u32) {
        self.link.engine().add_credit(credit)
    }

    /// Asks the sender to use up or give back all outstanding credit.
    ///
    /// [`Event::ReceiverDrained`] is emitted once the sender has done so.
    pub fn drain_credit(&self) {
        self.link.engine().drain()
    }

    /// Settles a delivery with an arbitrary outcome
    pub fn settle(&self, delivery: &Delivery, outcome: Outcome) {
        #[cfg(feature = "tracing")]
        tracing::trace!(link = %self.name(), delivery_id = delivery.id, ?outcome, "settling");
        #[cfg(feature = "log")]
        log::trace!(
            "[{}] settling delivery {} with {:?}",
            self.name(),
            delivery.id,
            outcome
        );
        self.link.engine().settle(delivery.id, outcome)
    }

    /// Accepts a delivery
    pub fn accept(&self, delivery: &Delivery) {
        self.settle(delivery, Outcome::Accepted(Accepted {}))
    }

    /// Rejects a delivery, optionally telling the sender why
    pub fn reject(&self, delivery: &Delivery, error: Option<definitions::Error>) {
        self.settle(delivery, Outcome::Rejected(Rejected { error }))
    }

    /// Releases a delivery so it can be redelivered
    pub fn release(&self, delivery: &Delivery) {
        self.settle(delivery, Outcome::Released(Released {}))
    }

    /// Settles a delivery as modified
    pub fn modify(&self, delivery: &Delivery, delivery_failed: bool, undeliverable_here: bool) {
        let modified = Modified {
            delivery_failed: Some(delivery_failed),
            undeliverable_here: Some(undeliverable_here),
            message_annotations: None,
        };
        self.settle(delivery, Outcome::Modified(modified))
    }
}
