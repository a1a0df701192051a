//! A sender and a receiver sharing one session

use tokio_util::sync::CancellationToken;

use crate::{error::Error, session::Session};

use super::{LinkCloseOptions, Receiver, Sender};

/// A sender and a receiver attached on the same session, ie. for management style requests
///
/// Created by [`Connection::create_request_response_link`](crate::Connection::create_request_response_link).
#[derive(Debug, Clone)]
pub struct RequestResponseLink {
    session: Session,
    sender: Sender,
    receiver: Receiver,
}

impl RequestResponseLink {
    pub(crate) fn new(session: Session, sender: Sender, receiver: Receiver) -> Self {
        Self {
            session,
            sender,
            receiver,
        }
    }

    /// The session both links are attached on
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The sending half
    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    /// The receiving half
    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    /// Closes both links, then the session.
    ///
    /// The first error is returned, but every close is attempted.
    pub async fn close(&self, cancel: Option<&CancellationToken>) -> Result<(), Error> {
        let sender = self
            .sender
            .close(LinkCloseOptions::keep_session(), cancel)
            .await;
        let receiver = self
            .receiver
            .close(LinkCloseOptions::keep_session(), cancel)
            .await;
        let session = self.session.close(cancel).await;
        sender.and(receiver).and(session)
    }
}
