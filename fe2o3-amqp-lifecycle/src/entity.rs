//! Capability shared by connections, sessions and links

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::event::{Event, EventContext, EventEmitter, ListenerId};

/// Counts an in-flight open/begin/attach/close for as long as it is alive
#[derive(Debug)]
pub(crate) struct ActionGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> Drop for ActionGuard<'a> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Event bookkeeping of a wrapper object
///
/// Every wrapper re-emits the events of its engine object on its own emitter. Error and close
/// events that no listener handles are handed to the parent entity (link to session, session to
/// connection).
#[derive(Debug)]
pub(crate) struct Entity {
    #[cfg_attr(not(any(feature = "tracing", feature = "log")), allow(dead_code))]
    kind: &'static str,
    events: EventEmitter,
    action_initiated: AtomicUsize,
    parent: Option<Arc<Entity>>,
}

impl Entity {
    pub(crate) fn new(kind: &'static str, parent: Option<Arc<Entity>>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            events: EventEmitter::new(),
            action_initiated: AtomicUsize::new(0),
            parent,
        })
    }

    pub(crate) fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub(crate) fn action_initiated(&self) -> usize {
        self.action_initiated.load(Ordering::Acquire)
    }

    /// Marks an action as in flight until the returned guard is dropped
    pub(crate) fn begin_action(&self) -> ActionGuard<'_> {
        self.action_initiated.fetch_add(1, Ordering::AcqRel);
        ActionGuard {
            counter: &self.action_initiated,
        }
    }

    /// Re-emits a translated engine event
    ///
    /// Error events that arrive while an action is in flight are re-emitted on the next
    /// scheduling tick. The listeners of the in-flight operation are registered on the engine
    /// object after the forwarding listeners, so by the time the deferred task runs the
    /// operation has already been settled by the same event.
    pub(crate) fn dispatch(self: &Arc<Self>, context: EventContext) {
        if context.event.is_error() && self.action_initiated() > 0 {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    kind = self.kind,
                    event = %context.event,
                    connection = %context.connection_id,
                    "event arrived while an action is in flight, re-emitting on the next tick"
                );
                #[cfg(feature = "log")]
                log::debug!(
                    "[{}] {} got event: {}, re-emitting on the next tick",
                    context.connection_id,
                    self.kind,
                    context.event
                );

                let this = self.clone();
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    this.emit(&context);
                });
                return;
            }
        }

        self.emit(&context);
    }

    /// Emits on this entity and bubbles unhandled error and close events to the parent
    pub(crate) fn emit(&self, context: &EventContext) -> bool {
        #[cfg(feature = "tracing")]
        tracing::trace!(kind = self.kind, event = %context.event, connection = %context.connection_id, "re-emitting");
        #[cfg(feature = "log")]
        log::trace!(
            "[{}] {} re-emitting event: {}",
            context.connection_id,
            self.kind,
            context.event
        );

        let handled = self.events.emit(context);
        if handled || !context.event.bubbles() {
            return handled;
        }
        match &self.parent {
            Some(parent) => parent.emit(context),
            None => false,
        }
    }

    /// Registers one listener per event on `source` that translates and re-emits on this entity
    pub(crate) fn forward<F>(
        self: &Arc<Self>,
        source: &EventEmitter,
        events: &[Event],
        translate: F,
    ) -> Vec<ListenerId>
    where
        F: Fn(EventContext) -> EventContext + Send + Sync + 'static,
    {
        let translate = Arc::new(translate);
        events
            .iter()
            .map(|event| {
                let entity = self.clone();
                let translate = translate.clone();
                source.on(*event, move |context| {
                    entity.dispatch(translate(context.clone()));
                })
            })
            .collect()
    }
}
