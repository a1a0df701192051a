//! Exactly-once settlement of an engine action with a deadline and cancellation
//!
//! A [`Guarded`] collects the listeners an operation registers on the engine. The first listener
//! that produces a value settles the operation: it takes the one-shot sender and removes every
//! listener the operation registered. Later events find the slot empty and do nothing.
//!
//! The deadline and the cancellation token are raced against the one-shot receiver in
//! [`Guarded::wait`]. Whichever wins closes the slot, so a listener firing afterwards is a no-op.
//! Dropping the [`Guarded`] before it settles removes all its listeners as well.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::DisconnectAudience,
    error::Error,
    event::{Event, EventContext, EventEmitter, ListenerId},
};

use super::cancelled;

/// Why a guarded operation ended without a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupted {
    Timeout,
    Cancelled,
}

impl Interrupted {
    pub(crate) fn into_error(self, operation: &str, timeout: Duration) -> Error {
        match self {
            Interrupted::Timeout => Error::OperationTimeout(format!(
                "Unable to {} within {:?}",
                operation, timeout
            )),
            Interrupted::Cancelled => Error::Cancelled(format!(
                "Request to {} has been cancelled",
                operation
            )),
        }
    }
}

/// A registration made on behalf of an operation
pub(crate) enum Subscription {
    Listener(EventEmitter, ListenerId),
    Disconnect(Arc<DisconnectAudience>, u64),
}

impl Subscription {
    pub(crate) fn cancel(self) {
        match self {
            Subscription::Listener(emitter, id) => {
                emitter.remove_listener(id);
            }
            Subscription::Disconnect(audience, id) => {
                audience.unregister(id);
            }
        }
    }
}

struct Shared<T> {
    slot: Mutex<Option<oneshot::Sender<T>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl<T> Shared<T> {
    fn is_settled(&self) -> bool {
        self.slot.lock().is_none()
    }

    fn settle(&self, value: T) {
        let sender = self.slot.lock().take();
        if let Some(sender) = sender {
            self.unsubscribe();
            let _ = sender.send(value);
        }
    }

    /// Closes the slot without a value. Returns `false` if it was already settled
    fn close(&self) -> bool {
        let closed = self.slot.lock().take().is_some();
        self.unsubscribe();
        closed
    }

    fn track(&self, subscription: Subscription) {
        let mut subscriptions = self.subscriptions.lock();
        if self.is_settled() {
            drop(subscriptions);
            subscription.cancel();
        } else {
            subscriptions.push(subscription);
        }
    }

    fn unsubscribe(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions {
            subscription.cancel();
        }
    }
}

enum Wake<T> {
    Settled(Result<T, oneshot::error::RecvError>),
    Cancelled,
    Elapsed,
}

/// An engine action waiting for exactly one settling event
pub(crate) struct Guarded<T> {
    shared: Arc<Shared<T>>,
    outcome: oneshot::Receiver<T>,
}

impl<T> Drop for Guarded<T> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl<T: Send + 'static> Guarded<T> {
    pub(crate) fn new() -> Self {
        let (tx, outcome) = oneshot::channel();
        let shared = Shared {
            slot: Mutex::new(Some(tx)),
            subscriptions: Mutex::new(Vec::new()),
        };
        Self {
            shared: Arc::new(shared),
            outcome,
        }
    }

    /// Settles with the value returned by `f` the first time it returns `Some`
    pub(crate) fn on<F>(&self, emitter: &EventEmitter, event: Event, f: F)
    where
        F: Fn(&EventContext) -> Option<T> + Send + Sync + 'static,
    {
        let shared = self.shared.clone();
        let id = emitter.on(event, move |context| {
            if let Some(value) = f(context) {
                shared.settle(value);
            }
        });
        self.shared
            .track(Subscription::Listener(emitter.clone(), id));
    }

    /// Settles with the value returned by `f` when the connection is disconnected
    pub(crate) fn on_disconnect<F>(&self, audience: &Arc<DisconnectAudience>, f: F)
    where
        F: Fn(&EventContext) -> Option<T> + Send + Sync + 'static,
    {
        let shared = self.shared.clone();
        let id = audience.register(move |context| {
            if let Some(value) = f(context) {
                shared.settle(value);
            }
        });
        self.shared
            .track(Subscription::Disconnect(audience.clone(), id));
    }

    /// Waits for the first of settlement, `timeout` or cancellation
    ///
    /// A settlement that raced with the deadline or the token but took the slot first wins.
    pub(crate) async fn wait(
        mut self,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, Interrupted> {
        let wake = {
            let outcome = &mut self.outcome;
            tokio::select! {
                biased;
                result = outcome => Wake::Settled(result),
                _ = cancelled(cancel) => Wake::Cancelled,
                _ = tokio::time::sleep(timeout) => Wake::Elapsed,
            }
        };

        match wake {
            Wake::Settled(Ok(value)) => Ok(value),
            // The sender is only dropped by `close`, which is not reachable here
            Wake::Settled(Err(_)) => Err(Interrupted::Cancelled),
            Wake::Cancelled => self.interrupt(Interrupted::Cancelled),
            Wake::Elapsed => self.interrupt(Interrupted::Timeout),
        }
    }

    fn interrupt(&mut self, reason: Interrupted) -> Result<T, Interrupted> {
        if self.shared.close() {
            Err(reason)
        } else {
            self.outcome.try_recv().map_err(|_| reason)
        }
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        self.shared.subscriptions.lock().len()
    }
}

impl<T: Send + 'static> Guarded<Result<T, Error>> {
    /// Like [`wait`](Self::wait), but maps an interruption onto the matching [`Error`]
    pub(crate) async fn outcome(
        self,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
        operation: impl FnOnce() -> String,
    ) -> Result<T, Error> {
        match self.wait(timeout, cancel).await {
            Ok(result) => result,
            Err(reason) => {
                let operation = operation();
                #[cfg(feature = "tracing")]
                tracing::debug!(?reason, operation = %operation, "operation interrupted");
                #[cfg(feature = "log")]
                log::debug!("operation {} interrupted: {:?}", operation, reason);
                Err(reason.into_error(&operation, timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio_util::sync::CancellationToken;

    use super::{Guarded, Interrupted};
    use crate::{
        connection::DisconnectAudience,
        event::{Event, EventContext, EventEmitter},
    };

    fn context(event: Event) -> EventContext {
        EventContext::new(event, "connection-0")
    }

    #[tokio::test]
    async fn first_event_settles_and_unsubscribes() {
        let emitter = EventEmitter::new();
        let guarded = Guarded::new();
        guarded.on(&emitter, Event::SessionOpen, |_| Some(Ok::<_, ()>(())));
        guarded.on(&emitter, Event::SessionClose, |_| Some(Err(())));
        assert_eq!(guarded.subscription_count(), 2);

        emitter.emit(&context(Event::SessionOpen));
        assert_eq!(emitter.listener_count(Event::SessionOpen), 0);
        assert_eq!(emitter.listener_count(Event::SessionClose), 0);

        // Late events are not observed anymore
        assert!(!emitter.emit(&context(Event::SessionClose)));

        let result = guarded.wait(Duration::from_secs(1), None).await;
        assert_eq!(result, Ok(Ok(())));
    }

    #[tokio::test]
    async fn filter_returning_none_does_not_settle() {
        let emitter = EventEmitter::new();
        let guarded: Guarded<u32> = Guarded::new();
        guarded.on(&emitter, Event::Accepted, |ctx| {
            ctx.delivery.as_ref().map(|delivery| delivery.id)
        });

        emitter.emit(&context(Event::Accepted));
        assert_eq!(emitter.listener_count(Event::Accepted), 1);

        let result = guarded.wait(Duration::from_millis(10), None).await;
        assert_eq!(result, Err(Interrupted::Timeout));
        assert_eq!(emitter.listener_count(Event::Accepted), 0);
    }

    #[tokio::test]
    async fn timeout_removes_listeners() {
        let emitter = EventEmitter::new();
        let audience = Arc::new(DisconnectAudience::new());
        let guarded: Guarded<()> = Guarded::new();
        guarded.on(&emitter, Event::ConnectionOpen, |_| Some(()));
        guarded.on_disconnect(&audience, |_| Some(()));

        let started = tokio::time::Instant::now();
        let result = guarded.wait(Duration::from_millis(50), None).await;
        assert_eq!(result, Err(Interrupted::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(emitter.listener_count(Event::ConnectionOpen), 0);
        assert_eq!(audience.len(), 0);
    }

    #[tokio::test]
    async fn cancellation_wins_over_deadline() {
        let emitter = EventEmitter::new();
        let token = CancellationToken::new();
        let guarded: Guarded<()> = Guarded::new();
        guarded.on(&emitter, Event::ConnectionOpen, |_| Some(()));

        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });

        let result = guarded.wait(Duration::from_secs(5), Some(&token)).await;
        assert_eq!(result, Err(Interrupted::Cancelled));
        assert_eq!(emitter.listener_count(Event::ConnectionOpen), 0);
    }

    #[tokio::test]
    async fn settlement_before_wait_wins_over_cancelled_token() {
        let emitter = EventEmitter::new();
        let token = CancellationToken::new();
        let guarded = Guarded::new();
        guarded.on(&emitter, Event::SessionOpen, |_| Some(7u8));

        emitter.emit(&context(Event::SessionOpen));
        token.cancel();

        let result = guarded.wait(Duration::from_secs(1), Some(&token)).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn disconnect_settles_through_audience() {
        let audience = Arc::new(DisconnectAudience::new());
        let guarded = Guarded::new();
        guarded.on_disconnect(&audience, |_| Some("disconnected"));
        assert_eq!(audience.len(), 1);

        audience.notify(&context(Event::Disconnected));
        assert_eq!(audience.len(), 0);

        let result = guarded.wait(Duration::from_secs(1), None).await;
        assert_eq!(result, Ok("disconnected"));
    }

    #[tokio::test]
    async fn outcome_maps_interruption_to_error() {
        let emitter = EventEmitter::new();
        let guarded: Guarded<Result<(), crate::error::Error>> = Guarded::new();
        guarded.on(&emitter, Event::ReceiverOpen, |_| Some(Ok(())));

        let err = guarded
            .outcome(Duration::from_millis(5), None, || String::from("attach receiver"))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("attach receiver"));
    }

    #[test]
    fn dropping_unsettled_operation_removes_listeners() {
        let emitter = EventEmitter::new();
        let guarded: Guarded<()> = Guarded::new();
        guarded.on(&emitter, Event::SenderOpen, |_| Some(()));
        guarded.on(&emitter, Event::SenderClose, |_| Some(()));
        drop(guarded);

        assert_eq!(emitter.listener_count(Event::SenderOpen), 0);
        assert_eq!(emitter.listener_count(Event::SenderClose), 0);
    }
}
