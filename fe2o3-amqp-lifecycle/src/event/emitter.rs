use std::{collections::BTreeMap, fmt, sync::Arc};

use parking_lot::Mutex;

use super::{Event, EventContext};

/// Callback invoked with the context of an event
pub type EventHandler = Arc<dyn Fn(&EventContext) + Send + Sync + 'static>;

/// Identifies a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId {
    event: Event,
    key: u64,
}

impl ListenerId {
    /// The event the listener is registered for
    pub fn event(&self) -> Event {
        self.event
    }
}

struct Entry {
    key: u64,
    once: bool,
    handler: EventHandler,
}

#[derive(Default)]
struct Registry {
    next_key: u64,
    listeners: BTreeMap<Event, Vec<Entry>>,
}

impl Registry {
    fn contains(&self, id: &ListenerId) -> bool {
        self.listeners
            .get(&id.event)
            .map(|entries| entries.iter().any(|entry| entry.key == id.key))
            .unwrap_or(false)
    }

    fn remove(&mut self, id: &ListenerId) -> bool {
        let Some(entries) = self.listeners.get_mut(&id.event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.key != id.key);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.listeners.remove(&id.event);
        }
        removed
    }
}

/// Dispatch table from [`Event`] to an ordered list of listeners
///
/// Listeners of an event are invoked in registration order. The table is never locked while a
/// listener runs, so listeners are free to register and remove listeners, including themselves.
/// A listener removed during an emission is not invoked for the rest of that emission.
///
/// Cloning the emitter produces another handle to the same table.
#[derive(Clone, Default)]
pub struct EventEmitter {
    registry: Arc<Mutex<Registry>>,
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        let counts: BTreeMap<_, _> = registry
            .listeners
            .iter()
            .map(|(event, entries)| (event.as_str(), entries.len()))
            .collect();
        f.debug_struct("EventEmitter")
            .field("listeners", &counts)
            .finish()
    }
}

impl EventEmitter {
    /// Creates an emitter with no listener
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, event: Event, once: bool, handler: EventHandler) -> ListenerId {
        let mut registry = self.registry.lock();
        let key = registry.next_key;
        registry.next_key += 1;
        registry
            .listeners
            .entry(event)
            .or_default()
            .push(Entry { key, once, handler });
        ListenerId { event, key }
    }

    /// Registers a listener for every occurrence of `event`
    pub fn on<F>(&self, event: Event, handler: F) -> ListenerId
    where
        F: Fn(&EventContext) + Send + Sync + 'static,
    {
        self.register(event, false, Arc::new(handler))
    }

    /// Registers an already shared handler for every occurrence of `event`
    pub fn on_handler(&self, event: Event, handler: EventHandler) -> ListenerId {
        self.register(event, false, handler)
    }

    /// Registers a listener that is removed before it is invoked for the first time
    pub fn once<F>(&self, event: Event, handler: F) -> ListenerId
    where
        F: Fn(&EventContext) + Send + Sync + 'static,
    {
        self.register(event, true, Arc::new(handler))
    }

    /// Removes a listener. Returns `false` if the listener was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.registry.lock().remove(&id)
    }

    /// Removes all listeners of `event`, or all listeners if `event` is `None`
    pub fn remove_all_listeners(&self, event: Option<Event>) {
        let mut registry = self.registry.lock();
        match event {
            Some(event) => {
                registry.listeners.remove(&event);
            }
            None => registry.listeners.clear(),
        }
    }

    /// Number of listeners registered for `event`
    pub fn listener_count(&self, event: Event) -> usize {
        self.registry
            .lock()
            .listeners
            .get(&event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Invokes the listeners of `context.event` in registration order
    ///
    /// Returns `true` if at least one listener was invoked
    pub fn emit(&self, context: &EventContext) -> bool {
        let snapshot: Vec<(ListenerId, bool, EventHandler)> = {
            let mut registry = self.registry.lock();
            let Some(entries) = registry.listeners.get_mut(&context.event) else {
                return false;
            };
            let snapshot = entries
                .iter()
                .map(|entry| {
                    let id = ListenerId {
                        event: context.event,
                        key: entry.key,
                    };
                    (id, entry.once, entry.handler.clone())
                })
                .collect();
            entries.retain(|entry| !entry.once);
            if entries.is_empty() {
                registry.listeners.remove(&context.event);
            }
            snapshot
        };

        let mut invoked = false;
        for (id, once, handler) in snapshot {
            // `once` listeners were taken out above
            if !once && !self.registry.lock().contains(&id) {
                continue;
            }
            handler(context);
            invoked = true;
        }
        invoked
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use parking_lot::Mutex;

    use super::EventEmitter;
    use crate::event::{Event, EventContext};

    fn context(event: Event) -> EventContext {
        EventContext::new(event, "connection-0")
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let emitter = EventEmitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            emitter.on(Event::SessionOpen, move |_| order.lock().push(i));
        }

        assert!(emitter.emit(&context(Event::SessionOpen)));
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn emit_without_listener_reports_unhandled() {
        let emitter = EventEmitter::new();
        emitter.on(Event::SessionOpen, |_| {});
        assert!(!emitter.emit(&context(Event::SessionClose)));
    }

    #[test]
    fn once_listener_fires_only_once() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        emitter.once(Event::ConnectionOpen, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(&context(Event::ConnectionOpen));
        emitter.emit(&context(Event::ConnectionOpen));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(Event::ConnectionOpen), 0);
    }

    #[test]
    fn listener_removed_during_emit_is_skipped() {
        let emitter = EventEmitter::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(Mutex::new(None));

        let em = emitter.clone();
        let second_id = second.clone();
        emitter.on(Event::SenderError, move |_| {
            if let Some(id) = second_id.lock().take() {
                em.remove_listener(id);
            }
        });
        let f = fired.clone();
        let id = emitter.on(Event::SenderError, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        *second.lock() = Some(id);

        emitter.emit(&context(Event::SenderError));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(emitter.listener_count(Event::SenderError), 1);
    }

    #[test]
    fn listener_can_register_listeners_while_emitting() {
        let emitter = EventEmitter::new();
        let em = emitter.clone();
        emitter.on(Event::Message, move |_| {
            em.on(Event::Message, |_| {});
        });

        emitter.emit(&context(Event::Message));
        assert_eq!(emitter.listener_count(Event::Message), 2);
    }

    #[test]
    fn remove_all_listeners() {
        let emitter = EventEmitter::new();
        emitter.on(Event::Accepted, |_| {});
        emitter.on(Event::Rejected, |_| {});
        emitter.remove_all_listeners(Some(Event::Accepted));
        assert_eq!(emitter.listener_count(Event::Accepted), 0);
        assert_eq!(emitter.listener_count(Event::Rejected), 1);

        emitter.remove_all_listeners(None);
        assert_eq!(emitter.listener_count(Event::Rejected), 0);
    }
}
