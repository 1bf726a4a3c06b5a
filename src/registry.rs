//! Connection registry
//!
//! Connections live in an arena and are addressed by [`ConnectionHandle`],
//! an index plus a generation. Timers, transports and callbacks hold handles,
//! never references; a handle whose slot has been reused or emptied simply
//! resolves to nothing. Connections are removed as soon as they reach
//! `Closed`.

use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::connection::{Connection, Handler, State};
use crate::policy::{Exclusive, Unsync};
use crate::timer::TimerId;

/// Opaque, generation-checked connection id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle {
    index: u32,
    generation: u32,
}

impl ConnectionHandle {
    /// Build a handle from its parts
    pub const fn from_raw(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

struct Slot<E> {
    generation: u32,
    entry: Option<Arc<E>>,
}

/// Arena of connections keyed by handle
///
/// `E` is the exclusive-execution policy wrapping each connection.
pub struct Registry<H, E = Unsync<Connection<H>>> {
    slots: Vec<Slot<E>>,
    free: Vec<u32>,
    len: usize,
    _handler: PhantomData<fn() -> H>,
}

impl<H, E> Default for Registry<H, E> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            _handler: PhantomData,
        }
    }
}

impl<H, E> fmt::Debug for Registry<H, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.len)
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl<H, E> Registry<H, E>
where
    H: Handler,
    E: Exclusive<Connection<H>>,
{
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no connection is live
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a connection built for its handle, then start it
    ///
    /// A connection that fails during start is reaped immediately.
    pub fn insert_with(
        &mut self,
        build: impl FnOnce(ConnectionHandle) -> Connection<H>,
    ) -> ConnectionHandle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let handle = ConnectionHandle::from_raw(index, slot.generation);
        slot.entry = Some(Arc::new(E::new(build(handle))));
        self.len += 1;

        // start() only fails when called twice
        let _ = self.with(handle, Connection::start);
        handle
    }

    /// Shared reference to a live connection cell
    ///
    /// Lets a multi-threaded embedding drive a connection without holding
    /// the registry. Reap it later with [`Registry::reap`].
    pub fn get(&self, handle: ConnectionHandle) -> Option<Arc<E>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.clone()
    }

    /// True if the handle refers to a live connection
    pub fn contains(&self, handle: ConnectionHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Handles of all live connections
    pub fn handles(&self) -> impl Iterator<Item = ConnectionHandle> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.entry
                .as_ref()
                .map(|_| ConnectionHandle::from_raw(i as u32, slot.generation))
        })
    }

    /// Remove a connection regardless of its state
    pub fn remove(&mut self, handle: ConnectionHandle) -> Option<Arc<E>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(entry)
    }

    /// Remove the connection if it has reached `Closed`
    pub fn reap(&mut self, handle: ConnectionHandle) -> bool {
        let closed = self
            .get(handle)
            .is_some_and(|cell| cell.with(|conn| conn.state() == State::Closed));
        if closed {
            self.remove(handle);
        }
        closed
    }

    /// Run `f` on a live connection, reaping it if it ends up closed
    ///
    /// Returns `None` for a stale handle.
    pub fn with<R>(
        &mut self,
        handle: ConnectionHandle,
        f: impl FnOnce(&mut Connection<H>) -> R,
    ) -> Option<R> {
        let cell = self.get(handle)?;
        let (result, closed) = cell.with(|conn| {
            let result = f(conn);
            (result, conn.state() == State::Closed)
        });
        if closed {
            self.remove(handle);
        }
        Some(result)
    }

    /// Deliver received bytes
    pub fn on_read(&mut self, handle: ConnectionHandle, data: &[u8]) -> Option<State> {
        self.with(handle, |conn| {
            conn.on_read(data);
            conn.state()
        })
    }

    /// Deliver a write completion
    pub fn on_write_complete(
        &mut self,
        handle: ConnectionHandle,
        result: io::Result<()>,
    ) -> Option<State> {
        self.with(handle, |conn| {
            conn.on_write_complete(result);
            conn.state()
        })
    }

    /// Deliver a timer expiration
    pub fn on_timer(&mut self, handle: ConnectionHandle, id: TimerId) -> Option<State> {
        self.with(handle, |conn| {
            conn.on_timer(id);
            conn.state()
        })
    }

    /// Deliver a transport disconnect
    pub fn on_disconnect(&mut self, handle: ConnectionHandle) -> Option<State> {
        self.with(handle, |conn| {
            conn.on_disconnect();
            conn.state()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use crate::connection::Services;
    use crate::connection::tests::{REQUEST, Recorder, Seen, Wire};
    use crate::log::NullSink;
    use crate::policy::Locked;
    use crate::timer::ManualTimers;
    use std::time::Duration;

    fn insert<E: Exclusive<Connection<Recorder>>>(
        registry: &mut Registry<Recorder, E>,
        timers: &Arc<ManualTimers>,
    ) -> (ConnectionHandle, Wire) {
        let wire = Wire::default();
        let services = Services::new(wire.clone(), timers.clone()).with_log(Arc::new(NullSink));
        let config = Config::builder()
            .handshake_timeout(Duration::from_secs(1))
            .build();
        let handle = registry
            .insert_with(|handle| Connection::server(handle, config, services, Recorder::default()));
        (handle, wire)
    }

    #[test]
    fn test_insert_and_open() {
        let timers = Arc::new(ManualTimers::new());
        let mut registry: Registry<Recorder> = Registry::new();
        let (handle, _wire) = insert(&mut registry, &timers);

        assert_eq!(registry.len(), 1);
        assert_eq!(timers.pending(), 1);
        assert_eq!(registry.on_read(handle, REQUEST), Some(State::Open));
        let seen = registry.with(handle, |conn| conn.handler().seen.clone());
        assert_eq!(seen, Some(vec![Seen::Open]));
    }

    #[test]
    fn test_closed_connection_removed_and_handle_goes_stale() {
        let timers = Arc::new(ManualTimers::new());
        let mut registry: Registry<Recorder> = Registry::new();
        let (handle, wire) = insert(&mut registry, &timers);

        assert_eq!(registry.on_disconnect(handle), Some(State::Closed));
        assert!(wire.closed());
        assert!(registry.is_empty());
        assert!(!registry.contains(handle));
        assert_eq!(registry.on_read(handle, REQUEST), None);
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let timers = Arc::new(ManualTimers::new());
        let mut registry: Registry<Recorder> = Registry::new();
        let (first, _) = insert(&mut registry, &timers);
        registry.remove(first);

        let (second, _) = insert(&mut registry, &timers);
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert!(registry.contains(second));
        assert!(!registry.contains(first));
        assert_eq!(registry.handles().collect::<Vec<_>>(), vec![second]);
    }

    #[test]
    fn test_timer_for_removed_connection_is_noop() {
        let timers = Arc::new(ManualTimers::new());
        let mut registry: Registry<Recorder> = Registry::new();
        let (handle, _) = insert(&mut registry, &timers);
        registry.remove(handle);

        for expired in timers.advance(Duration::from_secs(1)) {
            assert_eq!(expired.handle, handle);
            assert_eq!(registry.on_timer(expired.handle, expired.id), None);
        }
    }

    #[test]
    fn test_handshake_timeout_reaps() {
        let timers = Arc::new(ManualTimers::new());
        let mut registry: Registry<Recorder, Locked<Connection<Recorder>>> = Registry::new();
        let (handle, _) = insert(&mut registry, &timers);
        let (other, _) = insert(&mut registry, &timers);
        registry.on_read(other, REQUEST);

        let expired = timers.advance(Duration::from_secs(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(registry.on_timer(handle, expired[0].id), Some(State::Closed));
        assert_eq!(registry.handles().collect::<Vec<_>>(), vec![other]);
    }

    #[test]
    fn test_reap_via_shared_cell() {
        let timers = Arc::new(ManualTimers::new());
        let mut registry: Registry<Recorder, Locked<Connection<Recorder>>> = Registry::new();
        let (handle, _) = insert(&mut registry, &timers);

        let cell = registry.get(handle).unwrap();
        assert!(!registry.reap(handle));
        cell.with(|conn| conn.on_disconnect());
        assert!(registry.reap(handle));
        assert!(registry.is_empty());
    }
}
