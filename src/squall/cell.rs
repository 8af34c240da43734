// Shared handles tying protocol resources to compositor objects
//
// Every wayland resource we care about is backed by a compositor
// object with a well defined owner. The owner (and the protocol
// library's userdata slot) hold a `Shared`, everything else holds
// a `WeakRef` so that destruction stays deterministic: when the
// client library drops the last `Shared` the payload is freed and
// all weak handles stop upgrading.
//
// Austin Shafer - 2024
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// A strong handle to a compositor object
///
/// Cloning bumps the strong count. Equality is identity of the
/// underlying allocation, never of the payload.
#[derive(Debug)]
pub struct Shared<T>(Arc<Mutex<T>>);

impl<T> Shared<T> {
    pub fn new(data: T) -> Self {
        Self(Arc::new(Mutex::new(data)))
    }

    /// Get exclusive access to the payload.
    ///
    /// A poisoned lock means another path panicked while mutating
    /// compositor state, which is already fatal for us.
    pub fn lock(&self) -> MutexGuard<T> {
        self.0.lock().unwrap()
    }

    pub fn downgrade(&self) -> WeakRef<T> {
        WeakRef(Arc::downgrade(&self.0))
    }

    /// Identity comparison of the control block
    pub fn ptr_eq(&self, other: &Shared<T>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// A weak handle which may upgrade iff a strong handle is still
/// live somewhere
#[derive(Debug)]
pub struct WeakRef<T>(Weak<Mutex<T>>);

impl<T> WeakRef<T> {
    /// An empty ref that will never upgrade
    pub fn empty() -> Self {
        Self(Weak::new())
    }

    /// Try to get a strong handle back
    ///
    /// Returns None once the payload has been released.
    pub fn upgrade(&self) -> Option<Shared<T>> {
        self.0.upgrade().map(Shared)
    }

    /// Does this weak handle point at the same object as `other`?
    #[allow(dead_code)]
    pub fn ptr_eq(&self, other: &WeakRef<T>) -> bool {
        self.0.ptr_eq(&other.0)
    }

    /// Does this weak handle point at this shared handle?
    pub fn is(&self, other: &Shared<T>) -> bool {
        self.0.ptr_eq(&Arc::downgrade(&other.0))
    }
}

impl<T> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Default for WeakRef<T> {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_fails_after_release() {
        let strong = Shared::new(17);
        let weak = strong.downgrade();
        assert_eq!(*weak.upgrade().unwrap().lock(), 17);

        drop(strong);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn equality_is_identity() {
        let a = Shared::new(5);
        let b = Shared::new(5);
        let c = a.clone();
        assert!(!a.ptr_eq(&b));
        assert!(a.ptr_eq(&c));
        assert!(a.downgrade().is(&c));
        assert!(!a.downgrade().is(&b));
    }

    #[test]
    fn empty_ref_never_upgrades() {
        let weak: WeakRef<u32> = WeakRef::empty();
        assert!(weak.upgrade().is_none());
        assert!(weak.ptr_eq(&WeakRef::empty()));
    }

    #[test]
    fn weak_does_not_keep_payload_alive() {
        let strong = Shared::new(String::from("storm"));
        let w1 = strong.downgrade();
        let w2 = w1.clone();
        drop(strong);
        assert!(w1.upgrade().is_none());
        assert!(w2.upgrade().is_none());
    }
}
