//! Transport contract
//!
//! The engine hands encoded bytes to a [`Transport`] and expects the
//! embedding to report completion through `Connection::on_write_complete`.
//! At most one write is outstanding per connection, so a transport never
//! needs its own queue.

use std::io;

use bytes::Bytes;

/// Byte stream underneath one connection
pub trait Transport: Send {
    /// Start writing `data`
    ///
    /// An `Err` means the write never started and is treated like a failed
    /// completion. Otherwise exactly one `on_write_complete` must follow.
    fn write(&mut self, data: Bytes) -> io::Result<()>;

    /// Close the stream once the write already handed over has finished
    fn close(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: Bytes) -> io::Result<()> {
        (**self).write(data)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
