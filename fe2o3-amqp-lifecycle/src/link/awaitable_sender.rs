//! Sender whose sends resolve with the remote outcome

use std::{collections::HashMap, fmt, ops::Deref, sync::Arc, time::Duration};

use fe2o3_amqp_types::{
    definitions::{AmqpError, DeliveryNumber},
    messaging::Outcome,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    engine::{Delivery, EngineSender, Payload},
    error::{Disposition, Error, ProtocolError, SendOperationFailedError},
    event::{Event, EventContext},
    session::Session,
    util::{cancelled, disconnected, ensure_not_cancelled, remote_error, Interrupted},
};

use super::{AwaitableSenderOptions, Link, LinkCloseOptions, Role, SendOptions};

/// The settlement half of a send that is still waiting for its outcome
pub(crate) type PendingSend = oneshot::Sender<Result<Delivery, Error>>;

/// Sends waiting for their outcome, keyed by delivery id
///
/// An id is present if and only if a send is still waiting for it. Whoever removes the entry
/// settles the send. Everybody else finds nothing and does nothing.
///
/// The engine may report an outcome before `send` got to insert the entry. While a
/// [`SendWindow`] is open such outcomes are kept and handed over on insertion.
#[derive(Default)]
pub(crate) struct DeliveryDispositionMap {
    inner: Mutex<Entries>,
}

#[derive(Default)]
struct Entries {
    pending: HashMap<DeliveryNumber, PendingSend>,
    /// Number of open send windows
    sending: usize,
    /// Outcomes that arrived for ids not inserted yet
    early: HashMap<DeliveryNumber, Result<Delivery, Error>>,
    /// Bulk failure that arrived while a window was open
    failed: Option<Error>,
}

impl fmt::Debug for DeliveryDispositionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryDispositionMap")
            .field("len", &self.len())
            .finish()
    }
}

impl DeliveryDispositionMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Opens a window covering the hand-off of a transfer to the engine
    pub(crate) fn begin_send(&self) -> SendWindow<'_> {
        self.inner.lock().sending += 1;
        SendWindow { map: self }
    }

    /// Removes the entry without settling it. Returns `false` if there was none
    pub(crate) fn remove(&self, id: DeliveryNumber) -> bool {
        self.inner.lock().pending.remove(&id).is_some()
    }

    /// Settles the entry. Returns `false` if there was none
    pub(crate) fn settle(&self, id: DeliveryNumber, result: Result<Delivery, Error>) -> bool {
        let pending = {
            let mut inner = self.inner.lock();
            match inner.pending.remove(&id) {
                Some(pending) => pending,
                None => {
                    if inner.sending > 0 {
                        inner.early.entry(id).or_insert(result);
                    }
                    return false;
                }
            }
        };
        let _ = pending.send(result);
        true
    }

    /// Fails every entry with a clone of `error` and returns how many there were
    pub(crate) fn fail_all(&self, error: &Error) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            if inner.sending > 0 {
                inner.failed = Some(error.clone());
            }
            inner.pending.drain().collect()
        };
        let count = drained.len();
        for (_, pending) in drained {
            let _ = pending.send(Err(error.clone()));
        }
        count
    }

    /// Resolves a send whose wait was interrupted.
    ///
    /// If the entry is still there the interruption wins and the entry is removed. Otherwise
    /// the outcome took the entry first and is returned instead.
    pub(crate) fn interrupt(
        &self,
        id: DeliveryNumber,
        rx: &mut oneshot::Receiver<Result<Delivery, Error>>,
        error: impl FnOnce() -> Error,
    ) -> Result<Delivery, Error> {
        if self.remove(id) {
            return Err(error());
        }
        match rx.try_recv() {
            Ok(result) => result,
            Err(_) => Err(error()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

/// Open while a transfer is handed to the engine and its entry is not inserted yet
pub(crate) struct SendWindow<'a> {
    map: &'a DeliveryDispositionMap,
}

impl<'a> SendWindow<'a> {
    /// Inserts the entry, or settles it at once with an outcome that arrived in the window
    pub(crate) fn insert(self, id: DeliveryNumber, pending: PendingSend) {
        let early = {
            let mut inner = self.map.inner.lock();
            match inner.early.remove(&id) {
                Some(result) => Some(result),
                None => match &inner.failed {
                    Some(error) => Some(Err(error.clone())),
                    None => {
                        inner.pending.insert(id, pending);
                        return;
                    }
                },
            }
        };
        if let Some(result) = early {
            let _ = pending.send(result);
        }
    }
}

impl<'a> Drop for SendWindow<'a> {
    fn drop(&mut self) {
        let mut inner = self.map.inner.lock();
        inner.sending -= 1;
        if inner.sending == 0 {
            inner.early.clear();
            inner.failed = None;
        }
    }
}

/// Removes the entry of a send that stops waiting for any reason
struct PendingGuard<'a> {
    map: &'a DeliveryDispositionMap,
    id: DeliveryNumber,
}

impl<'a> Drop for PendingGuard<'a> {
    fn drop(&mut self) {
        self.map.remove(self.id);
    }
}

fn disposition_event(disposition: Disposition) -> Event {
    match disposition {
        Disposition::Accepted => Event::Accepted,
        Disposition::Rejected => Event::Rejected,
        Disposition::Released => Event::Released,
        Disposition::Modified => Event::Modified,
    }
}

fn send_failed(disposition: Disposition, context: &EventContext, delivery: &Delivery) -> Error {
    let remote_error = context.error.clone().or_else(|| match &delivery.remote_state {
        Some(Outcome::Rejected(rejected)) => rejected.error.clone().map(ProtocolError::from),
        _ => None,
    });
    SendOperationFailedError {
        disposition,
        message: format!(
            "Sent message with delivery id {} has been {} by the receiver",
            delivery.id, disposition
        ),
        remote_error,
        delivery: delivery.clone(),
    }
    .into()
}

/// A sender whose [`send`](Self::send) resolves once the receiver settles the delivery
///
/// | Outcome | Result of `send` |
/// |---------|------------------|
/// | accepted | `Ok(delivery)` |
/// | rejected, released, modified | [`Error::SendOperationFailed`] |
/// | no outcome within the timeout | [`Error::OperationTimeout`] |
/// | token cancelled | [`Error::Cancelled`] |
/// | link or session error | the error, for every pending send |
/// | disconnect | [`Error::Disconnected`], for every pending send |
/// | link detached or removed | [`Error::Protocol`], for every pending send |
///
/// Link errors and disconnects fail every pending send unless the options carry an `on_error`
/// handler, session errors unless they carry an `on_session_error` handler. A caller supplying
/// one of those decides when to call [`fail_pending`](Self::fail_pending).
#[derive(Clone)]
pub struct AwaitableSender {
    link: Link<dyn EngineSender>,
    pending: Arc<DeliveryDispositionMap>,
    send_timeout: Duration,
}

impl fmt::Debug for AwaitableSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwaitableSender")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("pending", &self.pending.len())
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

impl Deref for AwaitableSender {
    type Target = Link<dyn EngineSender>;

    fn deref(&self) -> &Self::Target {
        &self.link
    }
}

impl AwaitableSender {
    pub(crate) async fn attach(
        session: &Session,
        options: AwaitableSenderOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<Self, Error> {
        ensure_not_cancelled(cancel, || {
            format!(
                "Request to create an awaitable sender on session {:?} has been cancelled",
                session.id()
            )
        })?;

        let engine = session.engine().create_sender(&options.link);
        let link = Link::wrap(session, engine, Role::Sender);
        let pending = Arc::new(DeliveryDispositionMap::new());

        let events = link.engine().events();
        let p = pending.clone();
        link.track_listener(events, Event::Accepted, move |context| {
            if let Some(delivery) = &context.delivery {
                p.settle(delivery.id, Ok(delivery.clone()));
            }
        });
        for disposition in [
            Disposition::Rejected,
            Disposition::Released,
            Disposition::Modified,
        ] {
            let p = pending.clone();
            link.track_listener(events, disposition_event(disposition), move |context| {
                if let Some(delivery) = &context.delivery {
                    p.settle(delivery.id, Err(send_failed(disposition, context, delivery)));
                }
            });
        }

        if options.handlers.on_error.is_none() {
            let p = pending.clone();
            link.track_listener(events, Event::SenderError, move |context| {
                let error = remote_error(context, "sender link error");
                let _failed = p.fail_all(&error);
                #[cfg(feature = "tracing")]
                tracing::debug!(link = ?context.link_name, failed = _failed, "link error, failed pending sends");
                #[cfg(feature = "log")]
                log::debug!(
                    "link {:?} error, failed {} pending sends",
                    context.link_name,
                    _failed
                );
            });
        }
        if options.handlers.on_session_error.is_none() {
            let p = pending.clone();
            link.track_listener(
                session.engine().events(),
                Event::SessionError,
                move |context| {
                    let error = remote_error(context, "session error");
                    let _failed = p.fail_all(&error);
                    #[cfg(feature = "tracing")]
                    tracing::debug!(failed = _failed, "session error, failed pending sends");
                    #[cfg(feature = "log")]
                    log::debug!("session error, failed {} pending sends", _failed);
                },
            );
        }

        if options.handlers.on_error.is_none() {
            let p = pending.clone();
            link.track_disconnect(move |context| {
                let _failed = p.fail_all(&disconnected(context));
                #[cfg(feature = "tracing")]
                tracing::debug!(link = ?context.link_name, failed = _failed, "disconnected, failed pending sends");
                #[cfg(feature = "log")]
                log::debug!(
                    "link {:?} disconnected, failed {} pending sends",
                    context.link_name,
                    _failed
                );
            });
        }

        let p = pending.clone();
        let name = link.name().to_string();
        link.on_detached(move || {
            let error = ProtocolError::new(
                AmqpError::IllegalState,
                Some(format!("Sender {:?} has been closed", name)),
            );
            let _failed = p.fail_all(&Error::Protocol(error));
            #[cfg(feature = "tracing")]
            tracing::debug!(link = %name, failed = _failed, "closed, failed pending sends");
            #[cfg(feature = "log")]
            log::debug!("[{}] closed, failed {} pending sends", name, _failed);
        });

        link.install(&options.handlers);
        link.attach(cancel).await?;
        Ok(Self {
            link,
            pending,
            send_timeout: options.send_timeout,
        })
    }

    /// Whether the link has credit and the engine can take another transfer
    pub fn sendable(&self) -> bool {
        self.link.engine().sendable()
    }

    /// Default deadline of a send
    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Number of sends still waiting for their outcome
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Sends a message and waits for the receiver's outcome.
    ///
    /// Fails with [`Error::InsufficientCredit`] without sending anything if the link cannot take
    /// another transfer. The deadline is `options.timeout` if set, the sender's
    /// [`send_timeout`](Self::send_timeout) otherwise.
    ///
    /// Cancelling, or dropping the returned future, only stops waiting. The transfer has been
    /// handed to the engine already and the receiver may still accept it.
    pub async fn send(
        &self,
        payload: impl Into<Payload>,
        options: SendOptions,
    ) -> Result<Delivery, Error> {
        let SendOptions {
            tag,
            format,
            timeout,
            cancel,
        } = options;
        let cancel = cancel.as_ref();

        ensure_not_cancelled(cancel, || {
            format!(
                "Request to send a message on sender {:?} has been cancelled",
                self.name()
            )
        })?;
        if !self.sendable() {
            return Err(Error::InsufficientCredit(format!(
                "Sender {:?} has insufficient credit to send (credit: {})",
                self.name(),
                self.credit()
            )));
        }

        let window = self.pending.begin_send();
        let delivery = self.link.engine().send(payload.into(), tag, format);
        let id = delivery.id;
        let (tx, mut rx) = oneshot::channel();
        window.insert(id, tx);
        let _guard = PendingGuard {
            map: &self.pending,
            id,
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(link = %self.name(), delivery_id = id, "waiting for outcome");
        #[cfg(feature = "log")]
        log::trace!("[{}] waiting for outcome of delivery {}", self.name(), id);

        let timeout = timeout.unwrap_or(self.send_timeout);
        let reason = tokio::select! {
            biased;
            result = &mut rx => {
                return match result {
                    Ok(result) => result,
                    Err(_) => Err(Error::Protocol(ProtocolError::internal(format!(
                        "outcome of delivery {} was dropped",
                        id
                    )))),
                };
            }
            _ = cancelled(cancel) => Interrupted::Cancelled,
            _ = tokio::time::sleep(timeout) => Interrupted::Timeout,
        };

        self.pending.interrupt(id, &mut rx, || {
            let operation = format!("settle delivery {} on sender {:?}", id, self.name());
            reason.into_error(&operation, timeout)
        })
    }

    /// Fails every pending send with `error` and returns how many there were
    pub fn fail_pending(&self, error: Error) -> usize {
        self.pending.fail_all(&error)
    }

    /// Closes the link, and by default its session as well.
    ///
    /// Sends still waiting once the link is detached fail with a protocol error. This holds for
    /// [`Link::close`] and [`Link::remove`] as well.
    pub async fn close(
        &self,
        options: LinkCloseOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), Error> {
        self.link.close(options, cancel).await
    }
}
