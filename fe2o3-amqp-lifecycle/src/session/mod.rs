//! Session lifecycle

use std::{
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{Connection, DisconnectAudience},
    engine::EngineSession,
    entity::Entity,
    error::{Error, ProtocolError},
    event::{Event, EventContext, EventEmitter, ListenerId},
    link::{
        AwaitableSender, AwaitableSenderOptions, Receiver, ReceiverOptions, Sender, SenderOptions,
    },
    util::{disconnected, ensure_not_cancelled, remote_error, Guarded},
};

/// Formats the id of a session, which is empty until both channels are known
pub(crate) fn format_session_id(
    local_channel: Option<u16>,
    remote_channel: Option<u16>,
    connection_id: &str,
) -> String {
    match (local_channel, remote_channel) {
        (Some(local), Some(remote)) => format!(
            "local-{}_remote-{}_connection-{}",
            local, remote, connection_id
        ),
        _ => String::new(),
    }
}

/// Computes the session id from inside engine listeners
///
/// Holds the engine session weakly. The engine session owns the listeners this is captured in.
#[derive(Clone)]
pub(crate) struct SessionIdResolver {
    engine: Weak<dyn EngineSession>,
    connection_id: String,
}

impl SessionIdResolver {
    pub(crate) fn resolve(&self) -> String {
        match self.engine.upgrade() {
            Some(engine) => format_session_id(
                engine.local_channel(),
                engine.remote_channel(),
                &self.connection_id,
            ),
            None => String::new(),
        }
    }

    pub(crate) fn fill(&self, mut context: EventContext) -> EventContext {
        context.session_id = Some(self.resolve());
        context
    }
}

struct Inner {
    connection: Connection,
    engine: Arc<dyn EngineSession>,
    entity: Arc<Entity>,
    forwarded: Mutex<Vec<ListenerId>>,
    /// Links of this session waiting to hear about a disconnect
    links: Arc<DisconnectAudience>,
    /// Membership in the connection's disconnect audience
    disconnect: Mutex<Option<u64>>,
}

/// A handle to an AMQP 1.0 session
///
/// Created by [`Connection::create_session`]. The handle is cheap to clone.
///
/// A disconnect of the connection is re-emitted as [`Event::Disconnected`] on
/// [`events`](Self::events) and then on the events of every link of the session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("is_open", &self.is_open())
            .finish()
    }
}

/* ------------------------------- Public API ------------------------------- */
impl Session {
    /// Session id, `local-{local}_remote-{remote}_connection-{connection id}`.
    ///
    /// Empty until both the local and the remote channel have been assigned.
    pub fn id(&self) -> String {
        format_session_id(
            self.inner.engine.local_channel(),
            self.inner.engine.remote_channel(),
            self.inner.connection.id(),
        )
    }

    /// The connection the session belongs to
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Emitter of the re-emitted session events
    pub fn events(&self) -> &EventEmitter {
        self.inner.entity.events()
    }

    /// Number of begin/close actions in flight
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

    /// Last error reported on the session
    pub fn error(&self) -> Option<ProtocolError> {
        self.inner.engine.error()
    }

    /// Ends the session.
    ///
    /// Listeners registered on [`events`](Self::events) are removed first. Resolves at once if
    /// the session is not open. A disconnect while waiting for the peer's end resolves the close
    /// as well.
    pub async fn close(&self, cancel: Option<&CancellationToken>) -> Result<(), Error> {
        ensure_not_cancelled(cancel, || {
            format!("Request to close session {:?} has been cancelled", self.id())
        })?;
        self.events().remove_all_listeners(None);

        let result = if self.is_open() {
            let _action = self.inner.entity.begin_action();
            let events = self.inner.engine.events();
            let guarded = Guarded::new();
            guarded.on(events, Event::SessionClose, |_| Some(Ok(())));
            guarded.on(events, Event::SessionError, |context| {
                Some(Err(remote_error(context, "session error while closing")))
            });
            guarded.on_disconnect(self.inner.connection.audience(), |_context| {
                #[cfg(feature = "tracing")]
                tracing::info!(connection = %_context.connection_id, "disconnected while ending session, resolving close");
                #[cfg(feature = "log")]
                log::info!(
                    "[{}] disconnected while ending session, resolving close",
                    _context.connection_id
                );
                Some(Ok(()))
            });

            self.inner.engine.close(None);
            guarded
                .outcome(self.inner.connection.operation_timeout(), cancel, || {
                    format!("close session {:?}", self.id())
                })
                .await
        } else {
            Ok(())
        };

        self.detach_listeners();
        self.inner.engine.remove();
        result
    }

    /// Removes the session without ending it on the wire.
    ///
    /// All listeners of the wrapper and the ones it installed on the engine are removed.
    pub fn remove(&self) {
        self.detach_listeners();
        self.events().remove_all_listeners(None);
        self.inner.engine.remove();
    }

    /// Attaches a new sender on this session
    pub async fn create_sender(
        &self,
        options: SenderOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<Sender, Error> {
        Sender::attach(self, options, cancel).await
    }

    /// Attaches a new [`AwaitableSender`] on this session
    pub async fn create_awaitable_sender(
        &self,
        options: AwaitableSenderOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<AwaitableSender, Error> {
        AwaitableSender::attach(self, options, cancel).await
    }

    /// Attaches a new receiver on this session.
    ///
    /// Fails with [`Error::Configuration`] before anything is attached if exactly one of
    /// `on_message` and `on_error` is set on a receiver with automatic credit.
    pub async fn create_receiver(
        &self,
        options: ReceiverOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<Receiver, Error> {
        Receiver::attach(self, options, cancel).await
    }
}

impl Session {
    /// Begins a new session on the connection
    pub(crate) async fn begin(
        connection: &Connection,
        cancel: Option<&CancellationToken>,
    ) -> Result<Self, Error> {
        ensure_not_cancelled(cancel, || {
            format!(
                "Request to create a session on connection {:?} has been cancelled",
                connection.id()
            )
        })?;

        let session = Self::wrap(connection.clone(), connection.engine().create_session());
        let result = {
            let _action = session.inner.entity.begin_action();
            let events = session.inner.engine.events();
            let guarded = Guarded::new();
            guarded.on(events, Event::SessionOpen, |_| Some(Ok(())));
            guarded.on(events, Event::SessionError, |context| {
                Some(Err(remote_error(context, "session error while beginning")))
            });
            guarded.on(events, Event::SessionClose, |context| {
                Some(Err(remote_error(
                    context,
                    "session ended by the peer while beginning",
                )))
            });
            guarded.on_disconnect(connection.audience(), |context| {
                Some(Err(disconnected(context)))
            });

            session.inner.engine.begin();
            guarded
                .outcome(connection.operation_timeout(), cancel, || {
                    format!("begin a session on connection {:?}", connection.id())
                })
                .await
        };

        match result {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(session = %session.id(), "session begun");
                #[cfg(feature = "log")]
                log::debug!("[{}] session begun", session.id());
                Ok(session)
            }
            Err(error) => {
                session.remove();
                Err(error)
            }
        }
    }

    fn wrap(connection: Connection, engine: Arc<dyn EngineSession>) -> Self {
        let entity = Entity::new("session", Some(connection.entity().clone()));
        let resolver = SessionIdResolver {
            engine: Arc::downgrade(&engine),
            connection_id: connection.id().to_string(),
        };
        let r = resolver.clone();
        let forwarded = entity.forward(engine.events(), Event::SESSION, move |context| {
            r.fill(context)
        });

        // Re-emits the connection's disconnect on the session, then on every link it owns
        let links = Arc::new(DisconnectAudience::new());
        let e = entity.clone();
        let l = links.clone();
        let disconnect = connection.audience().register(move |context| {
            let context = resolver.fill(context.clone());
            e.dispatch(context.clone());
            let _notified = l.notify(&context);

            #[cfg(feature = "tracing")]
            tracing::trace!(session = ?context.session_id, links = _notified, "propagated disconnect");
            #[cfg(feature = "log")]
            log::trace!(
                "[{:?}] propagated disconnect to {} links",
                context.session_id,
                _notified
            );
        });

        Self {
            inner: Arc::new(Inner {
                connection,
                engine,
                entity,
                forwarded: Mutex::new(forwarded),
                links,
                disconnect: Mutex::new(Some(disconnect)),
            }),
        }
    }

    fn detach_listeners(&self) {
        let events = self.inner.engine.events();
        let forwarded = std::mem::take(&mut *self.inner.forwarded.lock());
        for id in forwarded {
            events.remove_listener(id);
        }

        let disconnect = self.inner.disconnect.lock().take();
        if let Some(id) = disconnect {
            self.inner.connection.audience().unregister(id);
        }
    }

    pub(crate) fn engine(&self) -> &Arc<dyn EngineSession> {
        &self.inner.engine
    }

    pub(crate) fn entity(&self) -> &Arc<Entity> {
        &self.inner.entity
    }

    /// Links that are told about a disconnect of the connection
    pub(crate) fn link_audience(&self) -> &Arc<DisconnectAudience> {
        &self.inner.links
    }

    pub(crate) fn id_resolver(&self) -> SessionIdResolver {
        SessionIdResolver {
            engine: Arc::downgrade(&self.inner.engine),
            connection_id: self.inner.connection.id().to_string(),
        }
    }
}
