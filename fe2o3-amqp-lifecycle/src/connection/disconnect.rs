//! Multiplexing of the engine's single `disconnected` event

use std::{collections::BTreeMap, fmt, sync::Arc};

use parking_lot::Mutex;

use crate::event::{EventContext, EventHandler};

#[derive(Default)]
struct Audience {
    next_id: u64,
    members: BTreeMap<u64, EventHandler>,
}

/// Logical subscribers of the connection's `disconnected` event
///
/// The connection registers exactly one physical listener on the engine and fans each disconnect
/// out to the audience. Pending operations join the audience instead of adding a listener to the
/// engine connection, and leave it by id once they settle.
#[derive(Default)]
pub(crate) struct DisconnectAudience {
    inner: Mutex<Audience>,
}

impl fmt::Debug for DisconnectAudience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisconnectAudience")
            .field("len", &self.len())
            .finish()
    }
}

impl DisconnectAudience {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register<F>(&self, callback: F) -> u64
    where
        F: Fn(&EventContext) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.members.insert(id, Arc::new(callback));
        id
    }

    pub(crate) fn unregister(&self, id: u64) -> bool {
        self.inner.lock().members.remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().members.len()
    }

    /// Notifies every member in registration order.
    ///
    /// Members that leave the audience while others are being notified are skipped.
    pub(crate) fn notify(&self, context: &EventContext) -> usize {
        let snapshot: Vec<(u64, EventHandler)> = self
            .inner
            .lock()
            .members
            .iter()
            .map(|(id, callback)| (*id, callback.clone()))
            .collect();

        let mut notified = 0;
        for (id, callback) in snapshot {
            if !self.inner.lock().members.contains_key(&id) {
                continue;
            }
            callback(context);
            notified += 1;
        }
        notified
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::DisconnectAudience;
    use crate::event::{Event, EventContext};

    #[test]
    fn every_member_is_notified_individually() {
        let audience = DisconnectAudience::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = count.clone();
            audience.register(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        let notified = audience.notify(&EventContext::new(Event::Disconnected, "c"));
        assert_eq!(notified, 10);
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn unregistered_member_is_not_notified() {
        let audience = DisconnectAudience::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = audience.register(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(audience.unregister(id));
        assert!(!audience.unregister(id));
        audience.notify(&EventContext::new(Event::Disconnected, "c"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(audience.len(), 0);
    }
}
