//! In-memory protocol engine
//!
//! Plays both the local engine and a scriptable remote peer. Actions issued through the engine
//! traits are answered according to a [`MockConfig`] on a later scheduling tick. The peer side
//! can also be driven directly, ie. [`MockLink::accept`] settles a sent delivery and
//! [`MockConnection::disconnect`] drops the transport.
//!
//! Answers are spawned on the current tokio runtime, so the engine must be used from within
//! one.
//!
//! ```rust
//! use fe2o3_amqp_lifecycle::{
//!     engine::mock::MockConnection, AwaitableSenderOptions, Connection, ConnectionOptions,
//!     SendOptions,
//! };
//!
//! # async fn example() -> Result<(), fe2o3_amqp_lifecycle::Error> {
//! let engine = MockConnection::new("connection-1");
//! let connection = Connection::from_engine(engine.clone(), ConnectionOptions::default());
//! connection.open(None).await?;
//!
//! let sender = connection
//!     .create_awaitable_sender(AwaitableSenderOptions::default(), None)
//!     .await?;
//! let peer = engine.find_link(sender.name()).expect("attached link");
//!
//! let send = sender.send("hello", SendOptions::default());
//! # let _ = peer;
//! # let _ = send;
//! # Ok(())
//! # }
//! ```

use std::sync::{
    atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering},
    Arc, Weak,
};

use fe2o3_amqp_types::{
    definitions::{self, DeliveryNumber, DeliveryTag, MessageFormat},
    messaging::{Accepted, Modified, Outcome, Rejected, Released},
};
use parking_lot::Mutex;

use crate::{
    connection::ConnectionOptions,
    error::{Disposition, ProtocolError},
    event::{Event, EventContext, EventEmitter},
    link::{LinkOptions, Role, DEFAULT_CREDIT_WINDOW},
};

use super::{
    Container, Delivery, EngineConnection, EngineLink, EngineReceiver, EngineSender,
    EngineSession, Payload,
};

/// How the mock peer answers an action
#[derive(Debug, Clone, Default)]
pub enum Reply {
    /// The peer answers as expected
    #[default]
    Accept,

    /// The peer never answers
    Ignore,

    /// The peer answers with a closing frame carrying the error
    Refuse(definitions::Error),
}

/// Behaviour of the mock peer
///
/// Shared by a connection and everything created on it. Changes apply to actions issued after
/// the change.
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Answer to an open
    pub open: Reply,

    /// Answer to a begin
    pub begin: Reply,

    /// Answer to an attach
    pub attach: Reply,

    /// Answer to a close, end or detach
    pub close: Reply,

    /// Credit granted to a sending link when it is attached
    pub credit: u32,

    /// Outcome every sent delivery is settled with. Deliveries stay unsettled if `None`
    pub outcome: Option<Outcome>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            open: Reply::Accept,
            begin: Reply::Accept,
            attach: Reply::Accept,
            close: Reply::Accept,
            credit: DEFAULT_CREDIT_WINDOW,
            outcome: None,
        }
    }
}

#[derive(Debug, Default)]
struct Endpoint {
    local_open: bool,
    remote_open: bool,
    closed: bool,
    error: Option<ProtocolError>,
}

impl Endpoint {
    fn is_open(&self) -> bool {
        self.local_open && self.remote_open && !self.closed
    }

    fn lose_transport(&mut self) {
        self.local_open = false;
        self.remote_open = false;
    }
}

/// Runs `f` on a later tick of the current runtime, or right away without one
fn defer<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::task::yield_now().await;
                f()
            });
        }
        Err(_) => f(),
    }
}

fn later<T, F>(me: &Weak<T>, f: F)
where
    T: Send + Sync + 'static,
    F: FnOnce(&T) + Send + 'static,
{
    let me = me.clone();
    defer(move || {
        if let Some(this) = me.upgrade() {
            f(&this)
        }
    });
}

/* -------------------------------------------------------------------------- */
/*                                  Container                                 */
/* -------------------------------------------------------------------------- */

/// Creates [`MockConnection`]s
#[derive(Debug)]
pub struct MockContainer {
    id: String,
    config: Mutex<MockConfig>,
    next_connection: AtomicU64,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockContainer {
    /// Creates a container with the default peer behaviour
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: Mutex::new(MockConfig::default()),
            next_connection: AtomicU64::new(0),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Peer behaviour of the connections created afterwards
    pub fn with_config(self, config: MockConfig) -> Self {
        *self.config.lock() = config;
        self
    }

    /// Every connection created so far
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }
}

impl Container for MockContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_connection(&self, options: &ConnectionOptions) -> Arc<dyn EngineConnection> {
        let id = match &options.connection_id {
            Some(id) => id.clone(),
            None => format!(
                "connection-{}",
                self.next_connection.fetch_add(1, Ordering::Relaxed)
            ),
        };
        let container_id = options
            .container_id
            .clone()
            .unwrap_or_else(|| self.id.clone());
        let config = self.config.lock().clone();

        let connection = MockConnection::with_config(id, container_id, config);
        self.connections.lock().push(connection.clone());
        connection
    }
}

/* -------------------------------------------------------------------------- */
/*                                 Connection                                 */
/* -------------------------------------------------------------------------- */

/// In-memory connection
#[derive(Debug)]
pub struct MockConnection {
    id: String,
    container_id: String,
    events: EventEmitter,
    endpoint: Mutex<Endpoint>,
    config: Arc<Mutex<MockConfig>>,
    next_channel: AtomicU16,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    me: Weak<MockConnection>,
}

impl MockConnection {
    /// Creates a connection with the default peer behaviour
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Self::with_config(id, "mock-container", MockConfig::default())
    }

    /// Creates a connection with the given peer behaviour
    pub fn with_config(
        id: impl Into<String>,
        container_id: impl Into<String>,
        config: MockConfig,
    ) -> Arc<Self> {
        let id = id.into();
        let container_id = container_id.into();
        Arc::new_cyclic(|me| Self {
            id,
            container_id,
            events: EventEmitter::new(),
            endpoint: Mutex::new(Endpoint::default()),
            config: Arc::new(Mutex::new(config)),
            next_channel: AtomicU16::new(0),
            sessions: Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }

    /// Current peer behaviour
    pub fn config(&self) -> MockConfig {
        self.config.lock().clone()
    }

    /// Changes the peer behaviour of this connection and everything created on it
    pub fn update_config(&self, f: impl FnOnce(&mut MockConfig)) {
        f(&mut self.config.lock())
    }

    /// Every session created so far
    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().clone()
    }

    /// Looks up a link by name on any session
    pub fn find_link(&self, name: &str) -> Option<Arc<MockLink>> {
        self.sessions()
            .iter()
            .find_map(|session| session.link(name))
    }

    /// The peer opens its side
    pub fn open_remote(&self) {
        {
            let mut endpoint = self.endpoint.lock();
            endpoint.remote_open = true;
            endpoint.closed = false;
        }
        self.events.emit(&self.context(Event::ConnectionOpen));
    }

    /// The peer closes the connection, with an error if one is given
    pub fn close_remote(&self, error: Option<definitions::Error>) {
        let error = error.map(ProtocolError::from);
        {
            let mut endpoint = self.endpoint.lock();
            endpoint.remote_open = false;
            endpoint.closed = true;
            if error.is_some() {
                endpoint.error = error.clone();
            }
        }
        if let Some(error) = &error {
            self.events
                .emit(&self.context(Event::ConnectionError).error(error.clone()));
        }
        self.events
            .emit(&self.context(Event::ConnectionClose).error(error));
    }

    /// The transport goes away
    pub fn disconnect(&self, error: Option<ProtocolError>) {
        {
            let mut endpoint = self.endpoint.lock();
            endpoint.lose_transport();
            if error.is_some() {
                endpoint.error = error.clone();
            }
        }
        for session in self.sessions() {
            session.lose_transport();
        }
        self.events
            .emit(&self.context(Event::Disconnected).error(error));
    }

    fn context(&self, event: Event) -> EventContext {
        EventContext::new(event, self.id.clone())
    }
}

impl EngineConnection for MockConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn container_id(&self) -> &str {
        &self.container_id
    }

    fn events(&self) -> &EventEmitter {
        &self.events
    }

    fn connect(&self) {
        {
            let mut endpoint = self.endpoint.lock();
            endpoint.local_open = true;
            endpoint.closed = false;
        }
        let reply = self.config.lock().open.clone();
        match reply {
            Reply::Accept => later(&self.me, |this| this.open_remote()),
            Reply::Ignore => {}
            Reply::Refuse(error) => later(&self.me, move |this| this.close_remote(Some(error))),
        }
    }

    fn close(&self, _error: Option<definitions::Error>) {
        self.endpoint.lock().local_open = false;
        let reply = self.config.lock().close.clone();
        match reply {
            Reply::Accept => later(&self.me, |this| this.close_remote(None)),
            Reply::Ignore => {}
            Reply::Refuse(error) => later(&self.me, move |this| this.close_remote(Some(error))),
        }
    }

    fn is_open(&self) -> bool {
        self.endpoint.lock().is_open()
    }

    fn is_remote_open(&self) -> bool {
        self.endpoint.lock().remote_open
    }

    fn error(&self) -> Option<ProtocolError> {
        self.endpoint.lock().error.clone()
    }

    fn create_session(&self) -> Arc<dyn EngineSession> {
        let channel = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let session = MockSession::new(self.id.clone(), channel, self.config.clone());
        self.sessions.lock().push(session.clone());
        session
    }
}

/* -------------------------------------------------------------------------- */
/*                                   Session                                  */
/* -------------------------------------------------------------------------- */

#[derive(Debug, Default)]
struct Channels {
    local: Option<u16>,
    remote: Option<u16>,
}

/// In-memory session
#[derive(Debug)]
pub struct MockSession {
    connection_id: String,
    channel: u16,
    events: EventEmitter,
    endpoint: Mutex<Endpoint>,
    channels: Mutex<Channels>,
    config: Arc<Mutex<MockConfig>>,
    links: Mutex<Vec<Arc<MockLink>>>,
    removed: AtomicBool,
    me: Weak<MockSession>,
}

impl MockSession {
    fn new(connection_id: String, channel: u16, config: Arc<Mutex<MockConfig>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            connection_id,
            channel,
            events: EventEmitter::new(),
            endpoint: Mutex::new(Endpoint::default()),
            channels: Mutex::new(Channels::default()),
            config,
            links: Mutex::new(Vec::new()),
            removed: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    /// Every link created so far
    pub fn links(&self) -> Vec<Arc<MockLink>> {
        self.links.lock().clone()
    }

    /// Looks up a link by name
    pub fn link(&self, name: &str) -> Option<Arc<MockLink>> {
        self.links
            .lock()
            .iter()
            .find(|link| link.name == name)
            .cloned()
    }

    /// Whether the local session state has been dropped
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// The peer begins its side
    pub fn open_remote(&self) {
        self.channels.lock().remote = Some(self.channel);
        {
            let mut endpoint = self.endpoint.lock();
            endpoint.remote_open = true;
            endpoint.closed = false;
        }
        self.events.emit(&self.context(Event::SessionOpen));
    }

    /// The peer ends the session, with an error if one is given
    pub fn close_remote(&self, error: Option<definitions::Error>) {
        let error = error.map(ProtocolError::from);
        {
            let mut endpoint = self.endpoint.lock();
            endpoint.remote_open = false;
            endpoint.closed = true;
            if error.is_some() {
                endpoint.error = error.clone();
            }
        }
        if let Some(error) = &error {
            self.events
                .emit(&self.context(Event::SessionError).error(error.clone()));
        }
        self.events
            .emit(&self.context(Event::SessionClose).error(error));
    }

    fn lose_transport(&self) {
        self.endpoint.lock().lose_transport();
        for link in self.links() {
            link.endpoint.lock().lose_transport();
        }
    }

    fn context(&self, event: Event) -> EventContext {
        EventContext::new(event, self.connection_id.clone())
    }

    fn create_link(&self, role: Role, options: &LinkOptions) -> Arc<MockLink> {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", role, uuid::Uuid::new_v4()));
        let link = MockLink::new(
            name,
            role,
            self.connection_id.clone(),
            options.clone(),
            self.config.clone(),
        );
        self.links.lock().push(link.clone());
        link
    }
}

impl EngineSession for MockSession {
    fn events(&self) -> &EventEmitter {
        &self.events
    }

    fn local_channel(&self) -> Option<u16> {
        self.channels.lock().local
    }

    fn remote_channel(&self) -> Option<u16> {
        self.channels.lock().remote
    }

    fn begin(&self) {
        self.channels.lock().local = Some(self.channel);
        self.endpoint.lock().local_open = true;
        let reply = self.config.lock().begin.clone();
        match reply {
            Reply::Accept => later(&self.me, |this| this.open_remote()),
            Reply::Ignore => {}
            Reply::Refuse(error) => later(&self.me, move |this| this.close_remote(Some(error))),
        }
    }

    fn close(&self, _error: Option<definitions::Error>) {
        self.endpoint.lock().local_open = false;
        let reply = self.config.lock().close.clone();
        match reply {
            Reply::Accept => later(&self.me, |this| this.close_remote(None)),
            Reply::Ignore => {}
            Reply::Refuse(error) => later(&self.me, move |this| this.close_remote(Some(error))),
        }
    }

    fn remove(&self) {
        self.removed.store(true, Ordering::Release);
        self.endpoint.lock().local_open = false;
    }

    fn is_open(&self) -> bool {
        self.endpoint.lock().is_open()
    }

    fn is_remote_open(&self) -> bool {
        self.endpoint.lock().remote_open
    }

    fn error(&self) -> Option<ProtocolError> {
        self.endpoint.lock().error.clone()
    }

    fn create_sender(&self, options: &LinkOptions) -> Arc<dyn EngineSender> {
        self.create_link(Role::Sender, options)
    }

    fn create_receiver(&self, options: &LinkOptions) -> Arc<dyn EngineReceiver> {
        self.create_link(Role::Receiver, options)
    }
}

/* -------------------------------------------------------------------------- */
/*                                    Link                                    */
/* -------------------------------------------------------------------------- */

/// In-memory link, either sending or receiving
#[derive(Debug)]
pub struct MockLink {
    name: String,
    role: Role,
    connection_id: String,
    options: LinkOptions,
    events: EventEmitter,
    endpoint: Mutex<Endpoint>,
    credit: AtomicU32,
    next_delivery_id: AtomicU32,
    deliveries: Mutex<Vec<(Delivery, Payload)>>,
    settlements: Mutex<Vec<(DeliveryNumber, Outcome)>>,
    removed: AtomicBool,
    config: Arc<Mutex<MockConfig>>,
    me: Weak<MockLink>,
}

impl MockLink {
    fn new(
        name: String,
        role: Role,
        connection_id: String,
        options: LinkOptions,
        config: Arc<Mutex<MockConfig>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name,
            role,
            connection_id,
            options,
            events: EventEmitter::new(),
            endpoint: Mutex::new(Endpoint::default()),
            credit: AtomicU32::new(0),
            next_delivery_id: AtomicU32::new(0),
            deliveries: Mutex::new(Vec::new()),
            settlements: Mutex::new(Vec::new()),
            removed: AtomicBool::new(false),
            config,
            me: me.clone(),
        })
    }

    /// Whether this is a sending link
    pub fn is_sender(&self) -> bool {
        self.role == Role::Sender
    }

    /// Options the link was created with
    pub fn options(&self) -> &LinkOptions {
        &self.options
    }

    /// Whether the local link state has been dropped
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Deliveries sent on a sending link or delivered to a receiving link, oldest first
    pub fn deliveries(&self) -> Vec<(Delivery, Payload)> {
        self.deliveries.lock().clone()
    }

    /// Outcomes a receiving link settled deliveries with, oldest first
    pub fn settlements(&self) -> Vec<(DeliveryNumber, Outcome)> {
        self.settlements.lock().clone()
    }

    /// The peer attaches its side
    pub fn open_remote(&self) {
        let credit = match self.role {
            Role::Sender => self.config.lock().credit,
            Role::Receiver => self.options.credit_window.unwrap_or(DEFAULT_CREDIT_WINDOW),
        };
        self.credit.store(credit, Ordering::Release);
        {
            let mut endpoint = self.endpoint.lock();
            endpoint.remote_open = true;
            endpoint.closed = false;
        }
        self.events.emit(&self.context(self.role.open_event()));
        if self.role == Role::Sender && credit > 0 {
            self.events.emit(&self.context(Event::Sendable));
        }
    }

    /// The peer detaches the link, with an error if one is given
    pub fn close_remote(&self, error: Option<definitions::Error>) {
        let error = error.map(ProtocolError::from);
        {
            let mut endpoint = self.endpoint.lock();
            endpoint.remote_open = false;
            endpoint.closed = true;
            if error.is_some() {
                endpoint.error = error.clone();
            }
        }
        if let Some(error) = &error {
            self.events
                .emit(&self.context(self.role.error_event()).error(error.clone()));
        }
        self.events
            .emit(&self.context(self.role.close_event()).error(error));
    }

    /// The peer grants `credit` to a sending link, replacing the current credit
    pub fn set_credit(&self, credit: u32) {
        self.credit.store(credit, Ordering::Release);
        if self.role == Role::Sender && credit > 0 && self.is_open() {
            self.events.emit(&self.context(Event::Sendable));
        }
    }

    /// The peer settles a sent delivery. Returns `false` if no such delivery was sent
    pub fn dispose(&self, delivery_id: DeliveryNumber, outcome: Outcome) -> bool {
        let delivery = {
            let mut deliveries = self.deliveries.lock();
            match deliveries
                .iter_mut()
                .find(|(delivery, _)| delivery.id == delivery_id)
            {
                Some((delivery, _)) => {
                    delivery.settled = true;
                    delivery.remote_state = Some(outcome.clone());
                    delivery.clone()
                }
                None => return false,
            }
        };

        let disposition = match Disposition::from_outcome(&outcome) {
            Some(disposition) => disposition,
            None => return false,
        };
        let event = match disposition {
            Disposition::Accepted => Event::Accepted,
            Disposition::Rejected => Event::Rejected,
            Disposition::Released => Event::Released,
            Disposition::Modified => Event::Modified,
        };
        let error = match &outcome {
            Outcome::Rejected(rejected) => rejected.error.clone().map(ProtocolError::from),
            _ => None,
        };

        self.events.emit(
            &self
                .context(event)
                .delivery(delivery.clone())
                .error(error),
        );
        self.events
            .emit(&self.context(Event::Settled).delivery(delivery));
        true
    }

    /// The peer accepts a sent delivery
    pub fn accept(&self, delivery_id: DeliveryNumber) -> bool {
        self.dispose(delivery_id, Outcome::Accepted(Accepted {}))
    }

    /// The peer rejects a sent delivery
    pub fn reject(&self, delivery_id: DeliveryNumber, error: Option<definitions::Error>) -> bool {
        self.dispose(delivery_id, Outcome::Rejected(Rejected { error }))
    }

    /// The peer releases a sent delivery
    pub fn release(&self, delivery_id: DeliveryNumber) -> bool {
        self.dispose(delivery_id, Outcome::Released(Released {}))
    }

    /// The peer modifies a sent delivery
    pub fn modify(&self, delivery_id: DeliveryNumber) -> bool {
        let modified = Modified {
            delivery_failed: Some(true),
            undeliverable_here: None,
            message_annotations: None,
        };
        self.dispose(delivery_id, Outcome::Modified(modified))
    }

    /// The peer delivers a message to a receiving link
    pub fn deliver(&self, payload: impl Into<Payload>) -> Delivery {
        let payload = payload.into();
        let delivery = self.next_delivery(None, 0);
        self.take_credit();
        self.deliveries
            .lock()
            .push((delivery.clone(), payload.clone()));
        self.events.emit(
            &self
                .context(Event::Message)
                .delivery(delivery.clone())
                .message(payload),
        );
        delivery
    }

    fn next_delivery(&self, tag: Option<DeliveryTag>, format: MessageFormat) -> Delivery {
        let id = self.next_delivery_id.fetch_add(1, Ordering::AcqRel);
        Delivery {
            id,
            tag: tag.unwrap_or_else(|| DeliveryTag::from(id.to_be_bytes().to_vec())),
            format,
            settled: false,
            remote_state: None,
        }
    }

    fn take_credit(&self) {
        let _ = self
            .credit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |credit| {
                credit.checked_sub(1)
            });
    }

    fn context(&self, event: Event) -> EventContext {
        EventContext::new(event, self.connection_id.clone()).link_name(self.name.clone())
    }
}

impl EngineLink for MockLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn events(&self) -> &EventEmitter {
        &self.events
    }

    fn attach(&self) {
        self.endpoint.lock().local_open = true;
        let reply = self.config.lock().attach.clone();
        match reply {
            Reply::Accept => later(&self.me, |this| this.open_remote()),
            Reply::Ignore => {}
            Reply::Refuse(error) => later(&self.me, move |this| this.close_remote(Some(error))),
        }
    }

    fn close(&self, _error: Option<definitions::Error>) {
        self.endpoint.lock().local_open = false;
        let reply = self.config.lock().close.clone();
        match reply {
            Reply::Accept => later(&self.me, |this| this.close_remote(None)),
            Reply::Ignore => {}
            Reply::Refuse(error) => later(&self.me, move |this| this.close_remote(Some(error))),
        }
    }

    fn remove(&self) {
        self.removed.store(true, Ordering::Release);
        self.endpoint.lock().local_open = false;
    }

    fn is_open(&self) -> bool {
        self.endpoint.lock().is_open()
    }

    fn is_remote_open(&self) -> bool {
        self.endpoint.lock().remote_open
    }

    fn is_closed(&self) -> bool {
        self.endpoint.lock().closed
    }

    fn error(&self) -> Option<ProtocolError> {
        self.endpoint.lock().error.clone()
    }

    fn credit(&self) -> u32 {
        self.credit.load(Ordering::Acquire)
    }
}

impl EngineSender for MockLink {
    fn sendable(&self) -> bool {
        self.role == Role::Sender && self.is_open() && self.credit() > 0
    }

    fn send(&self, payload: Payload, tag: Option<DeliveryTag>, format: MessageFormat) -> Delivery {
        let delivery = self.next_delivery(tag, format);
        self.take_credit();
        self.deliveries.lock().push((delivery.clone(), payload));

        let outcome = self.config.lock().outcome.clone();
        if let Some(outcome) = outcome {
            let id = delivery.id;
            later(&self.me, move |this| {
                this.dispose(id, outcome);
            });
        }
        delivery
    }
}

impl EngineReceiver for MockLink {
    fn add_credit(&self, credit: u32) {
        self.credit.fetch_add(credit, Ordering::AcqRel);
    }

    fn drain(&self) {
        self.credit.store(0, Ordering::Release);
        later(&self.me, |this| {
            this.events.emit(&this.context(Event::ReceiverDrained));
        });
    }

    fn settle(&self, delivery_id: DeliveryNumber, outcome: Outcome) {
        self.settlements.lock().push((delivery_id, outcome));
    }
}
