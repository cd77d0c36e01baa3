use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering;

use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use parking_lot::RwLockWriteGuard;

/// Whole-table structural state, as seen by [`ResizeCoordinator::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// Ordinary operations may run.
    Stable,
    /// A grower holds exclusive access and is relocating entries.
    Resizing,
}

/// Shared/exclusive gate between mutators and structural growth.
///
/// Any number of mutators may hold shared access at once. A grower takes
/// exclusive access, which waits for the current mutators to leave and blocks
/// new ones from entering while it waits, so growth cannot be starved.
///
/// Lock-free readers never touch the coordinator.
pub(crate) struct ResizeCoordinator {
    lock: RwLock<()>,
    resizing: AtomicBool,
}

/// Exclusive access held by a grower. The table is reported as
/// [`TableState::Resizing`] for as long as this guard is alive.
pub(crate) struct ExclusiveAccess<'a> {
    coordinator: &'a ResizeCoordinator,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl ResizeCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            lock: RwLock::new(()),
            resizing: AtomicBool::new(false),
        }
    }

    /// Enters as a mutator.
    ///
    /// Not reentrant: calling back into a mutating map operation while this
    /// guard is held deadlocks as soon as a grower is waiting.
    #[inline]
    pub(crate) fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Enters as the sole grower.
    pub(crate) fn exclusive(&self) -> ExclusiveAccess<'_> {
        let guard = self.lock.write();
        self.resizing.store(true, Ordering::Release);
        ExclusiveAccess {
            coordinator: self,
            _guard: guard,
        }
    }

    pub(crate) fn state(&self) -> TableState {
        if self.resizing.load(Ordering::Acquire) {
            TableState::Resizing
        } else {
            TableState::Stable
        }
    }
}

impl Drop for ExclusiveAccess<'_> {
    fn drop(&mut self) {
        self.coordinator.resizing.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn state_follows_exclusive_access() {
        let coordinator = ResizeCoordinator::new();
        assert_eq!(coordinator.state(), TableState::Stable);
        {
            let _exclusive = coordinator.exclusive();
            assert_eq!(coordinator.state(), TableState::Resizing);
        }
        assert_eq!(coordinator.state(), TableState::Stable);
    }

    #[test]
    fn many_shared_holders() {
        let coordinator = ResizeCoordinator::new();
        let a = coordinator.shared();
        let b = coordinator.shared();
        assert_eq!(coordinator.state(), TableState::Stable);
        drop(a);
        drop(b);
        let _exclusive = coordinator.exclusive();
    }

    #[test]
    fn exclusive_waits_for_shared_holders() {
        let coordinator = Arc::new(ResizeCoordinator::new());
        let observed = Arc::new(AtomicUsize::new(0));

        let shared = coordinator.shared();
        let grower = {
            let coordinator = Arc::clone(&coordinator);
            let observed = Arc::clone(&observed);
            thread::spawn(move || {
                let _exclusive = coordinator.exclusive();
                observed.store(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(observed.load(Ordering::SeqCst), 0);
        drop(shared);

        grower.join().unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.state(), TableState::Stable);
    }
}
