//! Process-wide registry of running sessions.
//!
//! The table is created when the first session registers and torn down
//! when the last one leaves. It is only reachable through the functions
//! below.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Something that reacts to the network becoming reachable.
pub(crate) trait Reachability: Send + Sync {
    fn network_reachable(&self);
}

static SESSIONS: Mutex<Option<HashMap<u64, Weak<dyn Reachability>>>> =
    parking_lot::const_mutex(None);

pub(crate) fn register(id: u64, session: Weak<dyn Reachability>) {
    let mut sessions = SESSIONS.lock();
    let table = sessions.get_or_insert_with(|| {
        debug!("session registry initialized");
        HashMap::new()
    });
    table.insert(id, session);
}

pub(crate) fn deregister(id: u64) {
    let mut sessions = SESSIONS.lock();
    if let Some(table) = sessions.as_mut() {
        table.remove(&id);
        if table.is_empty() {
            *sessions = None;
            debug!("session registry torn down");
        }
    }
}

/// Returns the number of running sessions in this process.
#[must_use]
pub fn active_sessions() -> usize {
    SESSIONS.lock().as_ref().map_or(0, HashMap::len)
}

/// Tells every running session that the network may be reachable again.
/// Offline sessions reconnect immediately.
pub fn notify_network_reachable() {
    let targets: Vec<Arc<dyn Reachability>> = SESSIONS
        .lock()
        .as_ref()
        .map(|table| table.values().filter_map(Weak::upgrade).collect())
        .unwrap_or_default();
    info!(sessions = targets.len(), "network reachable");
    for session in targets {
        session.network_reachable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl Reachability for Counter {
        fn network_reachable(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fan_out_reaches_registered_sessions() {
        let a = Arc::new(Counter(AtomicUsize::new(0)));
        let b = Arc::new(Counter(AtomicUsize::new(0)));
        let weak_a: Weak<dyn Reachability> = Arc::downgrade(&a) as Weak<dyn Reachability>;
        let weak_b: Weak<dyn Reachability> = Arc::downgrade(&b) as Weak<dyn Reachability>;
        register(u64::MAX - 1, weak_a);
        register(u64::MAX - 2, weak_b);

        notify_network_reachable();
        deregister(u64::MAX - 2);
        notify_network_reachable();
        deregister(u64::MAX - 1);

        assert_eq!(a.0.load(Ordering::SeqCst), 2);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }
}
