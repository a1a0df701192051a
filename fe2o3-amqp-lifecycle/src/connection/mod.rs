//! Connection lifecycle

use std::{fmt, sync::Arc, time::Duration};

use fe2o3_amqp_types::definitions;
use futures_util::future::join;
use tokio_util::sync::CancellationToken;

use crate::{
    engine::{Container, EngineConnection},
    entity::Entity,
    error::{Error, ProtocolError},
    event::{Event, EventEmitter},
    link::{
        AwaitableSender, AwaitableSenderOptions, Receiver, ReceiverOptions, RequestResponseLink,
        Sender, SenderOptions,
    },
    session::Session,
    util::{disconnected, ensure_not_cancelled, remote_error, Guarded},
};

mod disconnect;
pub(crate) use disconnect::DisconnectAudience;

mod options;
pub use options::*;

/// Default AMQP port
pub const DEFAULT_PORT: u16 = 5672;

/// Default max-frame-size
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 256 * 1024;

/// Default channel-max
pub const DEFAULT_CHANNEL_MAX: u16 = 255;

/// Smallest max-frame-size allowed by the protocol
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

/// Default deadline of open, close, begin and attach
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

struct Inner {
    engine: Arc<dyn EngineConnection>,
    options: ConnectionOptions,
    entity: Arc<Entity>,
    audience: Arc<DisconnectAudience>,
}

/// A handle to an AMQP 1.0 connection
///
/// The handle is cheap to clone. Dropping the last handle does not close the connection, call
/// [`close`](Self::close) for that.
///
/// Every engine event of the connection is re-emitted on [`events`](Self::events). Error and
/// close events of sessions and links that nobody handles end up here as well.
///
/// # Example
///
/// ```rust
/// use fe2o3_amqp_lifecycle::{engine::mock::MockContainer, Connection, ConnectionOptions};
///
/// # async fn example() -> Result<(), fe2o3_amqp_lifecycle::Error> {
/// let container = MockContainer::new("example-container");
/// let connection = Connection::new(&container, ConnectionOptions::default());
/// connection.open(None).await?;
///
/// let session = connection.create_session(None).await?;
/// session.close(None).await?;
/// connection.close(None).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("is_open", &self.is_open())
            .field("options", &self.inner.options)
            .finish()
    }
}

/* ------------------------------- Public API ------------------------------- */
impl Connection {
    /// Creates a connection through the container. Nothing is sent until [`open`](Self::open)
    pub fn new<C>(container: &C, options: impl Into<ConnectionOptions>) -> Self
    where
        C: Container + ?Sized,
    {
        let options = options.into();
        let engine = container.create_connection(&options);
        Self::from_engine(engine, options)
    }

    /// Wraps an existing engine connection
    pub fn from_engine(
        engine: Arc<dyn EngineConnection>,
        options: impl Into<ConnectionOptions>,
    ) -> Self {
        let options = options.into();
        let entity = Entity::new("connection", None);
        let audience = Arc::new(DisconnectAudience::new());

        let events = engine.events();
        entity.forward(
            events,
            &[
                Event::ConnectionOpen,
                Event::ConnectionClose,
                Event::ConnectionError,
            ],
            |context| context,
        );

        // The only `Disconnected` listener this connection ever registers on the engine
        let e = entity.clone();
        let a = audience.clone();
        events.on(Event::Disconnected, move |context| {
            #[cfg(feature = "tracing")]
            tracing::debug!(connection = %context.connection_id, error = ?context.error, "disconnected");
            #[cfg(feature = "log")]
            log::debug!(
                "[{}] disconnected, error: {:?}",
                context.connection_id,
                context.error
            );

            e.dispatch(context.clone());
            let _notified = a.notify(context);

            #[cfg(feature = "tracing")]
            tracing::trace!(notified = _notified, "notified pending operations of disconnect");
            #[cfg(feature = "log")]
            log::trace!("notified {} pending operations of disconnect", _notified);
        });

        Self {
            inner: Arc::new(Inner {
                engine,
                options,
                entity,
                audience,
            }),
        }
    }

    /// Connection id assigned by the engine
    pub fn id(&self) -> &str {
        self.inner.engine.id()
    }

    /// Container id
    pub fn container_id(&self) -> &str {
        self.inner.engine.container_id()
    }

    /// Options the connection was created with
    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Emitter of the re-emitted connection events
    pub fn events(&self) -> &EventEmitter {
        self.inner.entity.events()
    }

    /// Number of open/close actions in flight
    pub fn action_initiated(&self) -> usize {
        self.inner.entity.action_initiated()
    }

    /// Whether both the local and the remote endpoint are open
    pub fn is_open(&self) -> bool {
        self.inner.engine.is_open()
    }

    /// Whether the remote endpoint is open
    pub fn is_remote_open(&self) -> bool {
        self.inner.engine.is_remote_open()
    }

    /// Last error reported on the connection
    pub fn error(&self) -> Option<ProtocolError> {
        self.inner.engine.error()
    }

    /// Opens the connection.
    ///
    /// Resolves once the peer has opened its side. Fails with the peer's error if the connection
    /// is closed instead, and with [`Error::Disconnected`] if the transport goes away first.
    /// Resolves at once if the connection is already open.
    ///
    /// Cancelling only stops waiting. The open frame may already be on the wire.
    pub async fn open(&self, cancel: Option<&CancellationToken>) -> Result<(), Error> {
        ensure_not_cancelled(cancel, || {
            format!(
                "Request to open connection {:?} has been cancelled",
                self.id()
            )
        })?;
        if self.is_open() {
            return Ok(());
        }

        let _action = self.inner.entity.begin_action();
        let events = self.inner.engine.events();
        let guarded = Guarded::new();
        guarded.on(events, Event::ConnectionOpen, |_| Some(Ok(())));
        guarded.on(events, Event::ConnectionError, |context| {
            Some(Err(remote_error(context, "connection error while opening")))
        });
        guarded.on(events, Event::ConnectionClose, |context| {
            Some(Err(remote_error(
                context,
                "connection closed by the peer while opening",
            )))
        });
        guarded.on_disconnect(&self.inner.audience, |context| {
            Some(Err(disconnected(context)))
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(connection = %self.id(), "opening");
        #[cfg(feature = "log")]
        log::debug!("[{}] opening", self.id());

        self.inner.engine.connect();
        guarded
            .outcome(self.operation_timeout(), cancel, || {
                format!("open connection {:?}", self.id())
            })
            .await
    }

    /// Closes the connection.
    ///
    /// Resolves at once if the connection is not open. A disconnect while waiting for the
    /// peer's close also resolves the close, there is nobody left to wait for.
    pub async fn close(&self, cancel: Option<&CancellationToken>) -> Result<(), Error> {
        self.close_with_error(None, cancel).await
    }

    /// Closes the connection with an error sent to the peer. See [`close`](Self::close)
    pub async fn close_with_error(
        &self,
        error: Option<definitions::Error>,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), Error> {
        ensure_not_cancelled(cancel, || {
            format!(
                "Request to close connection {:?} has been cancelled",
                self.id()
            )
        })?;
        if !self.is_open() {
            return Ok(());
        }

        let _action = self.inner.entity.begin_action();
        let events = self.inner.engine.events();
        let guarded = Guarded::new();
        guarded.on(events, Event::ConnectionClose, |_| Some(Ok(())));
        guarded.on(events, Event::ConnectionError, |context| {
            Some(Err(remote_error(context, "connection error while closing")))
        });
        guarded.on_disconnect(&self.inner.audience, |_context| {
            #[cfg(feature = "tracing")]
            tracing::info!(connection = %_context.connection_id, "disconnected while closing, resolving close");
            #[cfg(feature = "log")]
            log::info!(
                "[{}] disconnected while closing, resolving close",
                _context.connection_id
            );
            Some(Ok(()))
        });

        self.inner.engine.close(error);
        guarded
            .outcome(self.operation_timeout(), cancel, || {
                format!("close connection {:?}", self.id())
            })
            .await
    }

    /// Begins a new session on this connection
    pub async fn create_session(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<Session, Error> {
        Session::begin(self, cancel).await
    }

    /// Creates a sender on a new session of its own.
    ///
    /// The session is closed again if the sender cannot be attached.
    pub async fn create_sender(
        &self,
        options: SenderOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<Sender, Error> {
        let session = self.create_session(cancel).await?;
        let result = session.create_sender(options, cancel).await;
        close_session_on_error(session, result).await
    }

    /// Creates an [`AwaitableSender`] on a new session of its own.
    ///
    /// The session is closed again if the sender cannot be attached.
    pub async fn create_awaitable_sender(
        &self,
        options: AwaitableSenderOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<AwaitableSender, Error> {
        let session = self.create_session(cancel).await?;
        let result = session.create_awaitable_sender(options, cancel).await;
        close_session_on_error(session, result).await
    }

    /// Creates a receiver on a new session of its own.
    ///
    /// The handler combination is checked before the session is created. The session is closed
    /// again if the receiver cannot be attached.
    pub async fn create_receiver(
        &self,
        options: ReceiverOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<Receiver, Error> {
        options.validate()?;
        let session = self.create_session(cancel).await?;
        let result = session.create_receiver(options, cancel).await;
        close_session_on_error(session, result).await
    }

    /// Creates a sender and a receiver attached concurrently on one new session
    pub async fn create_request_response_link(
        &self,
        sender_options: SenderOptions,
        receiver_options: ReceiverOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<RequestResponseLink, Error> {
        receiver_options.validate()?;
        let session = self.create_session(cancel).await?;
        let (sender, receiver) = join(
            session.create_sender(sender_options, cancel),
            session.create_receiver(receiver_options, cancel),
        )
        .await;

        let error = match (sender, receiver) {
            (Ok(sender), Ok(receiver)) => {
                return Ok(RequestResponseLink::new(session, sender, receiver))
            }
            (Ok(sender), Err(error)) => {
                sender.remove();
                error
            }
            (Err(error), Ok(receiver)) => {
                receiver.remove();
                error
            }
            (Err(error), Err(_)) => error,
        };
        close_session_on_error(session, Err(error)).await
    }
}

impl Connection {
    pub(crate) fn engine(&self) -> &Arc<dyn EngineConnection> {
        &self.inner.engine
    }

    pub(crate) fn entity(&self) -> &Arc<Entity> {
        &self.inner.entity
    }

    pub(crate) fn audience(&self) -> &Arc<DisconnectAudience> {
        &self.inner.audience
    }

    pub(crate) fn operation_timeout(&self) -> Duration {
        self.inner.options.operation_timeout
    }
}

async fn close_session_on_error<T>(
    session: Session,
    result: Result<T, Error>,
) -> Result<T, Error> {
    if let Err(_error) = &result {
        #[cfg(feature = "tracing")]
        tracing::debug!(session = %session.id(), error = %_error, "link failed, closing its session");
        #[cfg(feature = "log")]
        log::debug!(
            "[{}] link failed ({}), closing its session",
            session.id(),
            _error
        );

        if let Err(_close_error) = session.close(None).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_close_error, "unable to close session");
            #[cfg(feature = "log")]
            log::warn!("unable to close session: {}", _close_error);
        }
    }
    result
}
