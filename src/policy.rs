//! Exclusive-execution policies
//!
//! A connection's entry points must never run concurrently. The registry
//! stores each connection behind an [`Exclusive`] cell chosen by the
//! embedding: [`Unsync`] for single-threaded event loops, [`Locked`] when
//! connections are driven from several threads.

use std::cell::RefCell;

use parking_lot::Mutex;

/// Serializes access to a value
pub trait Exclusive<T> {
    /// Wrap a value
    fn new(value: T) -> Self
    where
        Self: Sized;

    /// Run `f` with exclusive access
    ///
    /// Calls must not nest for the same cell. [`Unsync`] panics and
    /// [`Locked`] deadlocks.
    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R;
}

/// No synchronization; the cell is `!Sync`
#[derive(Debug, Default)]
pub struct Unsync<T>(RefCell<T>);

impl<T> Exclusive<T> for Unsync<T> {
    fn new(value: T) -> Self {
        Self(RefCell::new(value))
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

/// Mutual exclusion with `parking_lot::Mutex`
#[derive(Debug, Default)]
pub struct Locked<T>(Mutex<T>);

impl<T> Exclusive<T> for Locked<T> {
    fn new(value: T) -> Self {
        Self(Mutex::new(value))
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.0.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn bump<E: Exclusive<u32>>(cell: &E) -> u32 {
        cell.with(|n| {
            *n += 1;
            *n
        })
    }

    #[test]
    fn test_unsync() {
        let cell = Unsync::new(0);
        bump(&cell);
        assert_eq!(bump(&cell), 2);
    }

    #[test]
    fn test_locked_across_threads() {
        let cell = Arc::new(Locked::new(0u32));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        bump(&*cell);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(cell.with(|n| *n), 4000);
    }
}
