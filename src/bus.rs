use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// Account-lifecycle events published by the pool (and the store import
/// path) and consumed by the queue and the pool itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountEvent {
    /// A credential became newly available (load growth or explicit add).
    Added,
    /// A single credential was reset back to usable.
    Reset,
    /// An operator reset the whole pool.
    ManualReset,
    /// A credential was deleted upstream; an empty account id means
    /// "unknown, reload everything".
    Deleted,
}

pub trait AccountListener: Send + Sync {
    fn on_account_event(&self, event: AccountEvent, account_id: &str);
}

pub trait IpChangeListener: Send + Sync {
    fn on_ip_change(&self, instance_id: &str, new_ip: &str);
}

/// Process-wide synchronous publish/subscribe.
///
/// Listeners run on the publisher's task, in registration order. There is no
/// queue behind the bus: delivery is best-effort, at-most-once per call. A
/// panicking listener is logged and must never stop later listeners or
/// propagate to the publisher.
#[derive(Default)]
pub struct EventBus {
    account_listeners: Mutex<Vec<Arc<dyn AccountListener>>>,
    ip_listeners: Mutex<Vec<Arc<dyn IpChangeListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_accounts(&self, listener: Arc<dyn AccountListener>) {
        self.account_listeners
            .lock()
            .expect("bus listener registry poisoned")
            .push(listener);
    }

    pub fn subscribe_ip_changes(&self, listener: Arc<dyn IpChangeListener>) {
        self.ip_listeners
            .lock()
            .expect("bus listener registry poisoned")
            .push(listener);
    }

    pub fn publish(&self, event: AccountEvent, account_id: &str) {
        // Snapshot outside the dispatch so a listener may publish or
        // subscribe without deadlocking the registry.
        let listeners = self
            .account_listeners
            .lock()
            .expect("bus listener registry poisoned")
            .clone();

        for (idx, listener) in listeners.iter().enumerate() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_account_event(event, account_id);
            }));
            if result.is_err() {
                tracing::error!(?event, account_id, listener = idx, "account listener panicked");
            }
        }
    }

    pub fn publish_ip_change(&self, instance_id: &str, new_ip: &str) {
        let listeners = self
            .ip_listeners
            .lock()
            .expect("bus listener registry poisoned")
            .clone();

        for (idx, listener) in listeners.iter().enumerate() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_ip_change(instance_id, new_ip);
            }));
            if result.is_err() {
                tracing::error!(instance_id, new_ip, listener = idx, "ip-change listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        tag: usize,
        seen: Arc<Mutex<Vec<(usize, AccountEvent, String)>>>,
    }

    impl AccountListener for Recorder {
        fn on_account_event(&self, event: AccountEvent, account_id: &str) {
            self.seen
                .lock()
                .unwrap()
                .push((self.tag, event, account_id.to_string()));
        }
    }

    struct Panicker;

    impl AccountListener for Panicker {
        fn on_account_event(&self, _event: AccountEvent, _account_id: &str) {
            panic!("listener blew up");
        }
    }

    struct IpCounter(AtomicUsize);

    impl IpChangeListener for IpCounter {
        fn on_ip_change(&self, _instance_id: &str, _new_ip: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatch_preserves_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            bus.subscribe_accounts(Arc::new(Recorder { tag, seen: seen.clone() }));
        }

        bus.publish(AccountEvent::Added, "17");

        let seen = seen.lock().unwrap();
        let tags: Vec<usize> = seen.iter().map(|(t, _, _)| *t).collect();
        assert_eq!(tags, vec![0, 1, 2]);
        assert!(seen.iter().all(|(_, e, id)| *e == AccountEvent::Added && id == "17"));
    }

    #[test]
    fn panicking_listener_does_not_stop_later_listeners() {
        // Silence the default panic backtrace for the intentional panic.
        let prev_hook = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));

        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_accounts(Arc::new(Panicker));
        bus.subscribe_accounts(Arc::new(Recorder { tag: 1, seen: seen.clone() }));

        bus.publish(AccountEvent::ManualReset, "");

        panic::set_hook(prev_hook);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn ip_changes_go_to_ip_listeners_only() {
        let bus = EventBus::new();
        let counter = Arc::new(IpCounter(AtomicUsize::new(0)));
        bus.subscribe_ip_changes(counter.clone());

        bus.publish_ip_change("i-1", "1.2.3.4");
        bus.publish(AccountEvent::Deleted, "9");

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
