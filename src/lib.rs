//! # sockudo-ws-core: sans-I/O WebSocket protocol engine
//!
//! RFC 6455 framing, message reassembly, the HTTP/1.1 upgrade handshake,
//! extension negotiation and the connection lifecycle, without owning a
//! socket, an event loop or a clock. The embedding pushes bytes, write
//! completions and timer expirations in; the engine pushes frames out through
//! a [`Transport`] and events up to a [`Handler`].
//!
//! ## Building blocks
//!
//! - [`frame`]: incremental frame parser and encoder with role-aware masking
//! - [`assembler`]: fragment reassembly, size limits and UTF-8 checks
//! - [`handshake`]: upgrade request/response parsing and validation
//! - [`extension`]: `Sec-WebSocket-Extensions` negotiation and transforms
//! - [`connection`]: the per-connection state machine
//! - [`registry`]: generation-checked arena of connections
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sockudo_ws_core::prelude::*;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&mut self, ctx: &mut Context<'_>, message: Message) {
//!         let _ = ctx.send(message);
//!     }
//! }
//!
//! let timers = Arc::new(ManualTimers::new());
//! let mut registry: Registry<Echo> = Registry::new();
//! let handle = registry.insert_with(|handle| {
//!     Connection::server(handle, Config::default(), Services::new(socket, timers.clone()), Echo)
//! });
//!
//! // In the event loop:
//! registry.on_read(handle, &bytes_from_socket);
//! registry.on_write_complete(handle, Ok(()));
//! ```

pub mod assembler;
pub mod connection;
pub mod error;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod log;
pub mod mask;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod timer;
pub mod transport;
pub mod utf8;

#[cfg(feature = "permessage-deflate")]
pub mod deflate;

use std::time::Duration;

pub use assembler::Message;
pub use connection::{Connection, Context, Handler, Services, State};
pub use error::{CloseReason, Error, ExtensionError, HandshakeError, ProtocolError, Result};
pub use extension::{Extension, ExtensionNegotiator, Granularity, NegotiatedExtensions, Transform};
pub use frame::{Frame, OpCode, Role};
pub use handshake::{ClientHandshake, ServerHandshake};
pub use log::{LogSink, TracingSink};
pub use policy::{Exclusive, Locked, Unsync};
pub use registry::{ConnectionHandle, Registry};
pub use timer::{ManualTimers, TimerId, TimerKind, TimerService};
pub use transport::Transport;

#[cfg(feature = "permessage-deflate")]
pub use deflate::{DeflateConfig, PerMessageDeflate};

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Small message threshold (< 126 bytes uses 2-byte header)
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Medium message threshold (< 64KB uses 4-byte header)
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Largest control frame payload
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default limit for the opening handshake header block
pub const DEFAULT_MAX_HANDSHAKE_SIZE: usize = 8192;

/// Frames up to this size are coalesced in the send queue
pub const COALESCE_BUFFER_SIZE: usize = 16 * 1024;

/// Configuration for WebSocket connections
///
/// Timeouts have no default: a timeout left as `None` arms no timer.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sockudo_ws_core::Config;
///
/// let config = Config::builder()
///     .max_message_size(16 * 1024)
///     .fragment_size(4096)
///     .close_timeout(Duration::from_secs(5))
///     .subprotocol("chat")
///     .build();
/// assert_eq!(config.pong_timeout, None);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum reassembled message size (default: 64MB)
    pub max_message_size: usize,
    /// Maximum single frame size (default: 16MB)
    pub max_frame_size: usize,
    /// Split outgoing messages into frames of at most this many bytes
    /// (default: no fragmentation)
    pub fragment_size: Option<usize>,
    /// Queued bytes above which `send` fails with `BufferFull` (default: 1MB)
    pub max_backpressure: usize,
    /// Maximum handshake header block (default: 8KB)
    pub max_handshake_size: usize,
    /// Time allowed for the opening handshake
    pub handshake_timeout: Option<Duration>,
    /// Time allowed for the close handshake
    pub close_timeout: Option<Duration>,
    /// Time allowed for a pong after `ping`
    pub pong_timeout: Option<Duration>,
    /// Subprotocols the server supports
    pub subprotocols: Vec<String>,
    /// Supported extensions
    pub extensions: ExtensionNegotiator,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            fragment_size: None,
            max_backpressure: 1024 * 1024,
            max_handshake_size: DEFAULT_MAX_HANDSHAKE_SIZE,
            handshake_timeout: None,
            close_timeout: None,
            pong_timeout: None,
            subprotocols: Vec::new(),
            extensions: ExtensionNegotiator::new(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for WebSocket configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum payload length for both messages and frames
    pub fn max_payload_length(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self.config.max_frame_size = size;
        self
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Fragment outgoing messages
    pub fn fragment_size(mut self, size: usize) -> Self {
        self.config.fragment_size = Some(size.max(1));
        self
    }

    /// Set maximum backpressure
    pub fn max_backpressure(mut self, bytes: usize) -> Self {
        self.config.max_backpressure = bytes;
        self
    }

    /// Set maximum handshake size
    pub fn max_handshake_size(mut self, bytes: usize) -> Self {
        self.config.max_handshake_size = bytes;
        self
    }

    /// Set the opening handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = Some(timeout);
        self
    }

    /// Set the close handshake timeout
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = Some(timeout);
        self
    }

    /// Set the pong timeout
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.config.pong_timeout = Some(timeout);
        self
    }

    /// Add a supported subprotocol
    pub fn subprotocol(mut self, protocol: impl Into<String>) -> Self {
        self.config.subprotocols.push(protocol.into());
        self
    }

    /// Add a supported extension
    pub fn extension(mut self, ext: impl Extension + 'static) -> Self {
        self.config.extensions = self.config.extensions.with(ext);
        self
    }

    /// Enable permessage-deflate with the given preferences
    #[cfg(feature = "permessage-deflate")]
    pub fn permessage_deflate(self, config: DeflateConfig) -> Self {
        self.extension(PerMessageDeflate::new(config))
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::assembler::Message;
    pub use crate::connection::{Connection, Context, Handler, Services, State};
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::{OpCode, Role};
    pub use crate::handshake::ClientHandshake;
    pub use crate::registry::{ConnectionHandle, Registry};
    pub use crate::timer::{ManualTimers, TimerId, TimerKind, TimerService};
    pub use crate::transport::Transport;
    pub use crate::{Config, ConfigBuilder};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.max_message_size, 64 * 1024 * 1024);
        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.max_backpressure, 1024 * 1024);
        assert_eq!(config.fragment_size, None);
        assert_eq!(config.handshake_timeout, None);
        assert_eq!(config.close_timeout, None);
        assert_eq!(config.pong_timeout, None);
        assert!(config.extensions.is_empty());
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder()
            .max_payload_length(1024)
            .fragment_size(0)
            .handshake_timeout(Duration::from_secs(3))
            .subprotocol("chat")
            .subprotocol("superchat")
            .build();

        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.fragment_size, Some(1));
        assert_eq!(config.handshake_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.subprotocols, vec!["chat", "superchat"]);
    }

    #[cfg(feature = "permessage-deflate")]
    #[test]
    fn test_builder_enables_deflate() {
        let config = Config::builder()
            .permessage_deflate(DeflateConfig::default())
            .build();
        assert_eq!(
            config.extensions.offer_header().as_deref(),
            Some("permessage-deflate")
        );
    }
}
