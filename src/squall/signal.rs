// A token-keyed signal bus
//
// Subsystems attach events to their objects with these. A
// listener gets back a token it can use to unsubscribe, or it can
// return Delete from its callback to unsubscribe itself during
// dispatch.
//
// Austin Shafer - 2024
use std::collections::BTreeMap;

pub type SignalToken = u32;

/// What a listener wants to happen to itself after dispatch
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SignalAction {
    /// Keep this listener subscribed
    Ok,
    /// Remove this listener once emission finishes
    Delete,
}

/// An ordered multi-listener signal
///
/// Listeners are dispatched in insertion order. Signals are
/// move-only: copying one would duplicate listener ownership.
pub struct Signal<T> {
    /// The next token to mint. Monotonic, so tokens are never
    /// reused and iteration order matches insertion order.
    sig_next: SignalToken,
    sig_listeners: BTreeMap<SignalToken, Box<dyn FnMut(&mut T) -> SignalAction + Send>>,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            sig_next: 0,
            sig_listeners: BTreeMap::new(),
        }
    }

    pub fn connect<F>(&mut self, cb: F) -> SignalToken
    where
        F: FnMut(&mut T) -> SignalAction + Send + 'static,
    {
        let tok = self.sig_next;
        self.sig_next += 1;
        self.sig_listeners.insert(tok, Box::new(cb));
        tok
    }

    pub fn disconnect(&mut self, token: SignalToken) {
        self.sig_listeners.remove(&token);
    }

    /// Dispatch to every listener in insertion order
    ///
    /// Self-unsubscription is collected during iteration and
    /// applied after; the listener map is never mutated
    /// mid-iteration.
    pub fn emit(&mut self, arg: &mut T) {
        let mut dead = Vec::new();

        for (tok, cb) in self.sig_listeners.iter_mut() {
            if cb(arg) == SignalAction::Delete {
                dead.push(*tok);
            }
        }

        for tok in dead {
            self.sig_listeners.remove(&tok);
        }
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.sig_listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn dispatch_in_insertion_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut sig: Signal<u32> = Signal::new();

        for i in 0..3 {
            let order = order.clone();
            sig.connect(move |_| {
                order.lock().unwrap().push(i);
                SignalAction::Ok
            });
        }

        sig.emit(&mut 0);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn disconnect_by_token() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut sig: Signal<()> = Signal::new();

        let h = hits.clone();
        let tok = sig.connect(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            SignalAction::Ok
        });

        sig.emit(&mut ());
        sig.disconnect(tok);
        sig.emit(&mut ());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delete_unsubscribes_after_dispatch() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let mut sig: Signal<()> = Signal::new();

        let h = hits.clone();
        sig.connect(move |_| {
            h.lock().unwrap().push("once");
            SignalAction::Delete
        });
        let h = hits.clone();
        sig.connect(move |_| {
            h.lock().unwrap().push("always");
            SignalAction::Ok
        });

        sig.emit(&mut ());
        sig.emit(&mut ());
        // the one-shot fired once, the persistent listener twice,
        // and the deletion did not disturb the listener behind it
        assert_eq!(*hits.lock().unwrap(), vec!["once", "always", "always"]);
        assert!(!sig.is_empty());
    }

    #[test]
    fn listener_can_mutate_payload() {
        let mut sig: Signal<u32> = Signal::new();
        sig.connect(|v| {
            *v += 1;
            SignalAction::Ok
        });
        sig.connect(|v| {
            *v *= 10;
            SignalAction::Ok
        });

        let mut v = 1;
        sig.emit(&mut v);
        assert_eq!(v, 20);
    }
}
