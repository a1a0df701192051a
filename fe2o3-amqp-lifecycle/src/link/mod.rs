//! Sending and receiving links

use std::{fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    engine::EngineLink,
    entity::Entity,
    error::{Error, ProtocolError},
    event::{Event, EventContext, EventEmitter, EventHandler},
    session::Session,
    util::{disconnected, ensure_not_cancelled, remote_error, Guarded, Subscription},
};

mod options;
pub use options::*;

mod sender;
pub use sender::*;

mod awaitable_sender;
pub use awaitable_sender::*;

mod receiver;
pub use receiver::*;

mod request_response;
pub use request_response::*;

/// Default deadline of [`AwaitableSender::send`]
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(20);

/// Credit window the engine is expected to use when none is configured
pub const DEFAULT_CREDIT_WINDOW: u32 = 100;

/// State of a link as seen by its wrapper
///
/// ```text
/// Unattached -> Attaching -> Open -> Closing -> Closed
///                   |          |
///                   +-> Error <+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// The link has not been attached yet
    Unattached,

    /// Waiting for the peer's attach
    Attaching,

    /// Both endpoints are attached
    Open,

    /// Waiting for the peer's detach
    Closing,

    /// The link has been closed or removed
    Closed,

    /// Attaching failed or the link reported an error
    Error,
}

/// Role of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }

    pub(crate) fn events(&self) -> &'static [Event] {
        match self {
            Role::Sender => Event::SENDER,
            Role::Receiver => Event::RECEIVER,
        }
    }

    pub(crate) fn open_event(&self) -> Event {
        match self {
            Role::Sender => Event::SenderOpen,
            Role::Receiver => Event::ReceiverOpen,
        }
    }

    pub(crate) fn close_event(&self) -> Event {
        match self {
            Role::Sender => Event::SenderClose,
            Role::Receiver => Event::ReceiverClose,
        }
    }

    pub(crate) fn error_event(&self) -> Event {
        match self {
            Role::Sender => Event::SenderError,
            Role::Receiver => Event::ReceiverError,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner<L: ?Sized> {
    role: Role,
    session: Session,
    entity: Arc<Entity>,
    state: Arc<Mutex<LinkState>>,
    subscriptions: Mutex<Vec<Subscription>>,
    on_detached: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    engine: Arc<L>,
}

/// Functionality shared by [`Sender`], [`AwaitableSender`] and [`Receiver`]
///
/// Every engine event of the link is re-emitted on [`events`](Self::events) with the session id
/// filled in. Error and close events that nobody handles bubble up to the session. A disconnect
/// of the connection is re-emitted as [`Event::Disconnected`] while the link is attached.
pub struct Link<L: ?Sized> {
    inner: Arc<Inner<L>>,
}

impl<L: ?Sized> Clone for Link<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: ?Sized + EngineLink> fmt::Debug for Link<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("role", &self.inner.role)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/* ------------------------------- Public API ------------------------------- */
impl<L: ?Sized + EngineLink> Link<L> {
    /// Link name
    pub fn name(&self) -> &str {
        self.inner.engine.name()
    }

    /// The session the link belongs to
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Emitter of the re-emitted link events
    pub fn events(&self) -> &EventEmitter {
        self.inner.entity.events()
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        *self.inner.state.lock()
    }

    /// Number of attach/close actions in flight
    pub fn action_initiated(&self) -> usize {
        self.inner.entity.action_initiated()
    }

    /// Whether both the local and the remote endpoint are attached
    pub fn is_open(&self) -> bool {
        self.inner.engine.is_open()
    }

    /// Whether the remote endpoint is attached
    pub fn is_remote_open(&self) -> bool {
        self.inner.engine.is_remote_open()
    }

    /// Whether the link has been closed locally or remotely
    pub fn is_closed(&self) -> bool {
        self.inner.engine.is_closed()
    }

    /// Last error reported on the link
    pub fn error(&self) -> Option<ProtocolError> {
        self.inner.engine.error()
    }

    /// Current link credit
    pub fn credit(&self) -> u32 {
        self.inner.engine.credit()
    }

    /// Closes the link, and by default its session as well.
    ///
    /// Listeners registered on [`events`](Self::events) are removed before the detach is sent.
    /// Resolves at once (apart from closing the session) if the link is not open. A disconnect
    /// while waiting for the peer's detach resolves the close.
    pub async fn close(
        &self,
        options: LinkCloseOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), Error> {
        self.detach(cancel).await?;
        if options.close_session {
            self.inner.session.close(cancel).await?;
        }
        Ok(())
    }

    /// Removes the link without detaching it on the wire.
    ///
    /// All listeners of the wrapper and the ones it installed on the engine are removed.
    pub fn remove(&self) {
        self.cancel_subscriptions();
        self.events().remove_all_listeners(None);
        self.inner.engine.remove();

        {
            let mut state = self.inner.state.lock();
            if *state != LinkState::Error {
                *state = LinkState::Closed;
            }
        }
        self.run_detached_hooks();
    }
}

impl<L: ?Sized + EngineLink> Link<L> {
    /// Wraps a not yet attached engine link and starts re-emitting its events
    pub(crate) fn wrap(session: &Session, engine: Arc<L>, role: Role) -> Self {
        let entity = Entity::new(role.as_str(), Some(session.entity().clone()));
        let state = Arc::new(Mutex::new(LinkState::Unattached));
        let events = engine.events();

        let resolver = session.id_resolver();
        let mut subscriptions: Vec<Subscription> = entity
            .forward(events, role.events(), move |context| resolver.fill(context))
            .into_iter()
            .map(|id| Subscription::Listener(events.clone(), id))
            .collect();

        let s = state.clone();
        let id = events.on(role.error_event(), move |_| {
            *s.lock() = LinkState::Error;
        });
        subscriptions.push(Subscription::Listener(events.clone(), id));

        let s = state.clone();
        let id = events.on(role.close_event(), move |_| {
            let mut state = s.lock();
            if *state != LinkState::Error {
                *state = LinkState::Closed;
            }
        });
        subscriptions.push(Subscription::Listener(events.clone(), id));

        let e = entity.clone();
        let name = engine.name().to_string();
        let audience = session.link_audience();
        let id = audience.register(move |context| {
            e.dispatch(context.clone().link_name(name.clone()));
        });
        subscriptions.push(Subscription::Disconnect(audience.clone(), id));

        Self {
            inner: Arc::new(Inner {
                role,
                session: session.clone(),
                entity,
                state,
                subscriptions: Mutex::new(subscriptions),
                on_detached: Mutex::new(Vec::new()),
                engine,
            }),
        }
    }

    pub(crate) fn engine(&self) -> &Arc<L> {
        &self.inner.engine
    }

    /// Registers a listener that is removed together with the link
    pub(crate) fn track_listener<F>(&self, emitter: &EventEmitter, event: Event, f: F)
    where
        F: Fn(&EventContext) + Send + Sync + 'static,
    {
        let id = emitter.on(event, f);
        self.inner
            .subscriptions
            .lock()
            .push(Subscription::Listener(emitter.clone(), id));
    }

    /// Registers a disconnect callback that is removed together with the link.
    ///
    /// Runs after the link has re-emitted the disconnect on [`events`](Self::events).
    pub(crate) fn track_disconnect<F>(&self, f: F)
    where
        F: Fn(&EventContext) + Send + Sync + 'static,
    {
        let audience = self.inner.session.link_audience();
        let id = audience.register(f);
        self.inner
            .subscriptions
            .lock()
            .push(Subscription::Disconnect(audience.clone(), id));
    }

    /// Runs `f` once the link has been detached or removed, however that was initiated
    pub(crate) fn on_detached<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.on_detached.lock().push(Box::new(f));
    }

    /// Installs the user supplied handlers shared by all roles
    pub(crate) fn install(&self, handlers: &LinkHandlers) {
        let role = self.inner.role;
        self.on_wrapper(role.error_event(), &handlers.on_error);
        self.on_wrapper(role.close_event(), &handlers.on_close);

        let session_events = self.inner.session.events();
        if let Some(handler) = &handlers.on_session_error {
            let handler = handler.clone();
            self.track_listener(session_events, Event::SessionError, move |context| {
                handler(context)
            });
        }
        if let Some(handler) = &handlers.on_session_close {
            let handler = handler.clone();
            self.track_listener(session_events, Event::SessionClose, move |context| {
                handler(context)
            });
        }
    }

    /// Registers an optional handler on the wrapper's own emitter
    pub(crate) fn on_wrapper(&self, event: Event, handler: &Option<EventHandler>) {
        if let Some(handler) = handler {
            self.events().on_handler(event, handler.clone());
        }
    }

    /// Sends the attach and waits for the peer's attach
    pub(crate) async fn attach(&self, cancel: Option<&CancellationToken>) -> Result<(), Error> {
        if self.is_open() {
            *self.inner.state.lock() = LinkState::Open;
            return Ok(());
        }
        *self.inner.state.lock() = LinkState::Attaching;

        let role = self.inner.role;
        let connection = self.inner.session.connection();
        let result = {
            let _action = self.inner.entity.begin_action();
            let events = self.inner.engine.events();
            let guarded = Guarded::new();
            guarded.on(events, role.open_event(), |_| Some(Ok(())));
            guarded.on(events, role.error_event(), |context| {
                Some(Err(remote_error(context, "link error while attaching")))
            });
            guarded.on(events, role.close_event(), |context| {
                Some(Err(remote_error(
                    context,
                    "link detached by the peer while attaching",
                )))
            });
            guarded.on_disconnect(connection.audience(), |context| {
                Some(Err(disconnected(context)))
            });

            #[cfg(feature = "tracing")]
            tracing::debug!(role = %role, name = %self.name(), "attaching");
            #[cfg(feature = "log")]
            log::debug!("attaching {} {:?}", role, self.name());

            self.inner.engine.attach();
            guarded
                .outcome(connection.operation_timeout(), cancel, || {
                    format!("attach {} {:?}", role, self.name())
                })
                .await
        };

        match result {
            Ok(()) => {
                *self.inner.state.lock() = LinkState::Open;
                Ok(())
            }
            Err(error) => {
                self.remove();
                *self.inner.state.lock() = LinkState::Error;
                Err(error)
            }
        }
    }

    /// Closes the link only, leaving the session alone
    pub(crate) async fn detach(&self, cancel: Option<&CancellationToken>) -> Result<(), Error> {
        let role = self.inner.role;
        ensure_not_cancelled(cancel, || {
            format!(
                "Request to close {} {:?} has been cancelled",
                role,
                self.name()
            )
        })?;
        self.events().remove_all_listeners(None);

        let result = if self.is_open() {
            *self.inner.state.lock() = LinkState::Closing;

            let connection = self.inner.session.connection();
            let _action = self.inner.entity.begin_action();
            let events = self.inner.engine.events();
            let guarded = Guarded::new();
            guarded.on(events, role.close_event(), |_| Some(Ok(())));
            guarded.on(events, role.error_event(), |context| {
                Some(Err(remote_error(context, "link error while closing")))
            });
            guarded.on_disconnect(connection.audience(), |_context| {
                #[cfg(feature = "tracing")]
                tracing::info!(connection = %_context.connection_id, "disconnected while closing link, resolving close");
                #[cfg(feature = "log")]
                log::info!(
                    "[{}] disconnected while closing link, resolving close",
                    _context.connection_id
                );
                Some(Ok(()))
            });

            self.inner.engine.close(None);
            guarded
                .outcome(connection.operation_timeout(), cancel, || {
                    format!("close {} {:?}", role, self.name())
                })
                .await
        } else {
            Ok(())
        };

        self.cancel_subscriptions();
        self.inner.engine.remove();
        *self.inner.state.lock() = match result {
            Ok(()) => LinkState::Closed,
            Err(_) => LinkState::Error,
        };
        self.run_detached_hooks();
        result
    }

    fn cancel_subscriptions(&self) {
        let subscriptions = std::mem::take(&mut *self.inner.subscriptions.lock());
        for subscription in subscriptions {
            subscription.cancel();
        }
    }

    fn run_detached_hooks(&self) {
        let hooks = std::mem::take(&mut *self.inner.on_detached.lock());
        for hook in hooks {
            hook();
        }
    }
}
