use std::{fmt, sync::Arc, time::Duration};

use fe2o3_amqp_types::definitions::{DeliveryTag, MessageFormat};
use tokio_util::sync::CancellationToken;

use crate::{
    error::Error,
    event::{EventContext, EventHandler},
};

use super::DEFAULT_SEND_TIMEOUT;

fn handler<F>(f: F) -> Option<EventHandler>
where
    F: Fn(&EventContext) + Send + Sync + 'static,
{
    Some(Arc::new(f))
}

fn fmt_handler(handler: &Option<EventHandler>) -> &'static str {
    match handler {
        Some(_) => "Some(..)",
        None => "None",
    }
}

/// Attach options handed to the engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkOptions {
    /// Link name. The engine generates a unique name if this is `None`
    pub name: Option<String>,

    /// Source address
    pub source: Option<String>,

    /// Target address
    pub target: Option<String>,

    /// Credit the engine keeps topped up on a receiving link.
    ///
    /// `None` leaves the engine default in place, `Some(0)` disables automatic credit.
    pub credit_window: Option<u32>,
}

/// Handlers shared by all link kinds
#[derive(Clone, Default)]
pub(crate) struct LinkHandlers {
    pub(crate) on_error: Option<EventHandler>,
    pub(crate) on_close: Option<EventHandler>,
    pub(crate) on_session_error: Option<EventHandler>,
    pub(crate) on_session_close: Option<EventHandler>,
}

impl fmt::Debug for LinkHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkHandlers")
            .field("on_error", &fmt_handler(&self.on_error))
            .field("on_close", &fmt_handler(&self.on_close))
            .field("on_session_error", &fmt_handler(&self.on_session_error))
            .field("on_session_close", &fmt_handler(&self.on_session_close))
            .finish()
    }
}

macro_rules! link_option_setters {
    () => {
        /// Link name
        pub fn name(mut self, name: impl Into<String>) -> Self {
            self.link.name = Some(name.into());
            self
        }

        /// Source address
        pub fn source(mut self, source: impl Into<String>) -> Self {
            self.link.source = Some(source.into());
            self
        }

        /// Target address
        pub fn target(mut self, target: impl Into<String>) -> Self {
            self.link.target = Some(target.into());
            self
        }

        /// Handler of the link's error event
        pub fn on_error(mut self, f: impl Fn(&EventContext) + Send + Sync + 'static) -> Self {
            self.handlers.on_error = handler(f);
            self
        }

        /// Handler of the link's close event
        pub fn on_close(mut self, f: impl Fn(&EventContext) + Send + Sync + 'static) -> Self {
            self.handlers.on_close = handler(f);
            self
        }

        /// Handler of the owning session's error event
        pub fn on_session_error(
            mut self,
            f: impl Fn(&EventContext) + Send + Sync + 'static,
        ) -> Self {
            self.handlers.on_session_error = handler(f);
            self
        }

        /// Handler of the owning session's close event
        pub fn on_session_close(
            mut self,
            f: impl Fn(&EventContext) + Send + Sync + 'static,
        ) -> Self {
            self.handlers.on_session_close = handler(f);
            self
        }
    };
}

/// Options of a [`Sender`](super::Sender)
#[derive(Clone, Default)]
pub struct SenderOptions {
    pub(crate) link: LinkOptions,
    pub(crate) handlers: LinkHandlers,
    pub(crate) on_sendable: Option<EventHandler>,
    pub(crate) on_accepted: Option<EventHandler>,
    pub(crate) on_rejected: Option<EventHandler>,
    pub(crate) on_released: Option<EventHandler>,
    pub(crate) on_modified: Option<EventHandler>,
}

impl fmt::Debug for SenderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderOptions")
            .field("link", &self.link)
            .field("handlers", &self.handlers)
            .field("on_sendable", &fmt_handler(&self.on_sendable))
            .field("on_accepted", &fmt_handler(&self.on_accepted))
            .field("on_rejected", &fmt_handler(&self.on_rejected))
            .field("on_released", &fmt_handler(&self.on_released))
            .field("on_modified", &fmt_handler(&self.on_modified))
            .finish()
    }
}

impl SenderOptions {
    link_option_setters!();

    /// Handler of the sendable event
    pub fn on_sendable(mut self, f: impl Fn(&EventContext) + Send + Sync + 'static) -> Self {
        self.on_sendable = handler(f);
        self
    }

    /// Handler of the accepted disposition
    pub fn on_accepted(mut self, f: impl Fn(&EventContext) + Send + Sync + 'static) -> Self {
        self.on_accepted = handler(f);
        self
    }

    /// Handler of the rejected disposition
    pub fn on_rejected(mut self, f: impl Fn(&EventContext) + Send + Sync + 'static) -> Self {
        self.on_rejected = handler(f);
        self
    }

    /// Handler of the released disposition
    pub fn on_released(mut self, f: impl Fn(&EventContext) + Send + Sync + 'static) -> Self {
        self.on_released = handler(f);
        self
    }

    /// Handler of the modified disposition
    pub fn on_modified(mut self, f: impl Fn(&EventContext) + Send + Sync + 'static) -> Self {
        self.on_modified = handler(f);
        self
    }
}

/// Options of an [`AwaitableSender`](super::AwaitableSender)
///
/// Dispositions are consumed by the sender to settle the pending sends, so there are no
/// disposition handlers here.
///
/// Unless `on_error` (or `on_session_error`) is set, the sender fails every pending send when the
/// link (or the session) reports an error. A caller that supplies its own handler takes over that
/// responsibility, see [`AwaitableSender::fail_pending`](super::AwaitableSender::fail_pending).
#[derive(Debug, Clone)]
pub struct AwaitableSenderOptions {
    pub(crate) link: LinkOptions,
    pub(crate) handlers: LinkHandlers,
    pub(crate) send_timeout: Duration,
}

impl Default for AwaitableSenderOptions {
    fn default() -> Self {
        Self {
            link: LinkOptions::default(),
            handlers: LinkHandlers::default(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl AwaitableSenderOptions {
    link_option_setters!();

    /// Default deadline of a send. Defaults to [`DEFAULT_SEND_TIMEOUT`]
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }
}

/// Options of a [`Receiver`](super::Receiver)
#[derive(Clone, Default)]
pub struct ReceiverOptions {
    pub(crate) link: LinkOptions,
    pub(crate) handlers: LinkHandlers,
    pub(crate) on_message: Option<EventHandler>,
    pub(crate) on_settled: Option<EventHandler>,
    pub(crate) on_drained: Option<EventHandler>,
}

impl fmt::Debug for ReceiverOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverOptions")
            .field("link", &self.link)
            .field("handlers", &self.handlers)
            .field("on_message", &fmt_handler(&self.on_message))
            .field("on_settled", &fmt_handler(&self.on_settled))
            .field("on_drained", &fmt_handler(&self.on_drained))
            .finish()
    }
}

impl ReceiverOptions {
    link_option_setters!();

    /// Credit window, see [`LinkOptions::credit_window`]
    pub fn credit_window(mut self, credit_window: u32) -> Self {
        self.link.credit_window = Some(credit_window);
        self
    }

    /// Handler of incoming messages
    pub fn on_message(mut self, f: impl Fn(&EventContext) + Send + Sync + 'static) -> Self {
        self.on_message = handler(f);
        self
    }

    /// Handler of the settled event
    pub fn on_settled(mut self, f: impl Fn(&EventContext) + Send + Sync + 'static) -> Self {
        self.on_settled = handler(f);
        self
    }

    /// Handler of the drained event
    pub fn on_drained(mut self, f: impl Fn(&EventContext) + Send + Sync + 'static) -> Self {
        self.on_drained = handler(f);
        self
    }

    /// Checks the handler combination.
    ///
    /// With a non-zero credit window messages start flowing as soon as the link is attached.
    /// Supplying only one of `on_message` and `on_error` would leave either the messages or the
    /// errors without a handler, so both or neither must be given.
    pub fn validate(&self) -> Result<(), Error> {
        let has_message = self.on_message.is_some();
        let has_error = self.handlers.on_error.is_some();
        if has_message != has_error && self.link.credit_window != Some(0) {
            return Err(Error::Configuration(String::from(
                "Either provide both 'on_message' and 'on_error' handlers, or neither of them. \
                 If only one of them is provided, set 'credit_window' to 0 and add credit manually",
            )));
        }
        Ok(())
    }
}

/// Per call options of [`AwaitableSender::send`](super::AwaitableSender::send)
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Delivery tag. The engine generates one if this is `None`
    pub tag: Option<DeliveryTag>,

    /// Message format
    pub format: MessageFormat,

    /// Deadline of this send. The sender's `send_timeout` is used if this is `None`
    pub timeout: Option<Duration>,

    /// Stops waiting for the outcome when cancelled.
    ///
    /// This only stops the local wait. The transfer has already been handed to the engine and
    /// may still be accepted by the peer.
    pub cancel: Option<CancellationToken>,
}

impl SendOptions {
    /// Deadline of this send
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cancellation token of this send
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Delivery tag
    pub fn tag(mut self, tag: impl Into<DeliveryTag>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Message format
    pub fn format(mut self, format: MessageFormat) -> Self {
        self.format = format;
        self
    }
}

/// Options of [`Link::close`](super::Link::close)
#[derive(Debug, Clone)]
pub struct LinkCloseOptions {
    /// Whether the session that owns the link is closed as well. Defaults to `true`
    pub close_session: bool,
}

impl Default for LinkCloseOptions {
    fn default() -> Self {
        Self {
            close_session: true,
        }
    }
}

impl LinkCloseOptions {
    /// Leaves the session open after the link is closed
    pub fn keep_session() -> Self {
        Self {
            close_session: false,
        }
    }
}
