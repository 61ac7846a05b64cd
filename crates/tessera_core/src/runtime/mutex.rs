use std::cell::RefCell;
use std::fmt;

use parking_lot::ReentrantMutex;

/// Reentrant lock around some shared state.
///
/// The same thread may take the lock again while already holding it, for
/// example when an observer notified during an update reads the state back.
/// Mutably borrowing the state while an outer `locked` call on the same thread
/// still holds it is a contract violation and panics.
pub struct Mutex<T> {
    inner: ReentrantMutex<RefCell<T>>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            inner: ReentrantMutex::new(RefCell::new(value)),
        }
    }

    /// Run `f` with exclusive access to the protected value.
    pub fn locked<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let guard = self.inner.lock();
        let mut value = guard.borrow_mut();
        f(&mut value)
    }

    /// Run `f` with shared access. Nested reads on the same thread are fine.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.inner.lock();
        let value = guard.borrow();
        f(&value)
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner().into_inner()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

impl<T> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn nested_reads() {
        let m = Mutex::new(vec![1, 2, 3]);
        let sum = m.read(|outer| outer.iter().sum::<i32>() + m.read(|inner| inner.len() as i32));
        assert_eq!(9, sum);
    }

    #[test]
    fn read_inside_locked_after_release() {
        let m = Mutex::new(4);
        m.locked(|v| *v += 1);
        assert_eq!(5, m.read(|v| *v));
    }

    #[test]
    #[should_panic]
    fn reentrant_mutable_borrow_panics() {
        let m = Mutex::new(0);
        m.locked(|_| m.locked(|v| *v += 1));
    }

    #[test]
    fn shared_across_threads() {
        let m = Arc::new(Mutex::new(0_u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.locked(|v| *v += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(8000, m.read(|v| *v));
    }
}
