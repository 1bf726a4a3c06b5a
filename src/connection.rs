//! Connection state machine
//!
//! A [`Connection`] owns everything about one WebSocket: the handshake in
//! progress, the frame codec, the message assembler, the negotiated
//! extensions and the send queue. It is driven entirely from outside:
//!
//! - [`Connection::on_read`] with bytes from the socket
//! - [`Connection::on_write_complete`] when the transport finishes a write
//! - [`Connection::on_timer`] when a guard timer fires
//! - [`Connection::on_disconnect`] when the transport goes away
//!
//! Protocol events are queued while the engine works and delivered to the
//! [`Handler`] once the entry point is done, so handlers may send, ping or
//! close through their [`Context`] without re-entering the engine.
//!
//! States only move forward: `Connecting -> Open -> Closing -> Closed`, with
//! a jump to `Closed` from anywhere on a fatal transport or handshake error.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use crate::assembler::{Message, MessageAssembler, encode_message};
use crate::error::{CloseReason, Error, HandshakeError, ProtocolError, Result};
use crate::extension::NegotiatedExtensions;
use crate::frame::{Frame, FrameCodec, OpCode, Role};
use crate::handshake::{ClientHandshake, Negotiated, ServerHandshake, parse_request};
use crate::log::{LogSink, TracingSink, ws_log};
use crate::queue::SendQueue;
use crate::registry::ConnectionHandle;
use crate::timer::{TimerId, TimerKind, TimerService};
use crate::transport::Transport;
use crate::{Config, MAX_CONTROL_PAYLOAD};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Opening handshake in progress
    Connecting,
    /// Handshake done, data may flow
    Open,
    /// A close frame has been sent or received
    Closing,
    /// Terminal; buffers released
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Connecting => "connecting",
            State::Open => "open",
            State::Closing => "closing",
            State::Closed => "closed",
        })
    }
}

/// Collaborators injected into a connection
pub struct Services {
    /// Byte stream to the peer
    pub transport: Box<dyn Transport>,
    /// Guard timer scheduling
    pub timers: Arc<dyn TimerService>,
    /// Log destination
    pub log: Arc<dyn LogSink>,
}

impl Services {
    /// Services logging through [`TracingSink`]
    pub fn new(transport: impl Transport + 'static, timers: Arc<dyn TimerService>) -> Self {
        Self {
            transport: Box::new(transport),
            timers,
            log: Arc::new(TracingSink),
        }
    }

    /// Replace the log sink
    pub fn with_log(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = log;
        self
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

/// Application callbacks
///
/// Every callback receives a [`Context`] for the same connection.
pub trait Handler {
    /// The handshake completed
    fn on_open(&mut self, ctx: &mut Context<'_>) {
        let _ = ctx;
    }

    /// A complete message arrived
    fn on_message(&mut self, ctx: &mut Context<'_>, message: Message);

    /// A ping arrived (the pong is sent automatically)
    fn on_ping(&mut self, ctx: &mut Context<'_>, payload: &[u8]) {
        let _ = (ctx, payload);
    }

    /// A pong arrived
    fn on_pong(&mut self, ctx: &mut Context<'_>, payload: &[u8]) {
        let _ = (ctx, payload);
    }

    /// The connection reached `Closed`; called exactly once
    fn on_close(&mut self, ctx: &mut Context<'_>, code: u16, reason: &str) {
        let _ = (ctx, code, reason);
    }

    /// A fatal error occurred; `on_close` follows
    fn on_fail(&mut self, ctx: &mut Context<'_>, error: &Error) {
        let _ = (ctx, error);
    }
}

enum Event {
    Open,
    Message(Message),
    Ping(Bytes),
    Pong(Bytes),
    Fail(Error),
    Close(CloseReason),
}

enum Pending {
    Server(ServerHandshake),
    Client(ClientHandshake),
}

#[derive(Debug, Default)]
struct Guards {
    handshake: Option<TimerId>,
    close: Option<TimerId>,
    pong: Option<TimerId>,
}

impl Guards {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<TimerId> {
        match kind {
            TimerKind::Handshake => &mut self.handshake,
            TimerKind::Close => &mut self.close,
            TimerKind::Pong => &mut self.pong,
        }
    }

    fn take_fired(&mut self, id: TimerId) -> Option<TimerKind> {
        [TimerKind::Handshake, TimerKind::Close, TimerKind::Pong]
            .into_iter()
            .find(|&kind| {
                let slot = self.slot(kind);
                if *slot == Some(id) {
                    *slot = None;
                    true
                } else {
                    false
                }
            })
    }
}

struct Core {
    handle: ConnectionHandle,
    role: Role,
    state: State,
    config: Config,
    services: Services,
    pending: Option<Pending>,
    started: bool,
    recv: BytesMut,
    scratch: BytesMut,
    codec: FrameCodec,
    assembler: MessageAssembler,
    extensions: NegotiatedExtensions,
    subprotocol: Option<String>,
    path: Option<String>,
    queue: SendQueue,
    close_sent: bool,
    close_received: bool,
    failed: bool,
    close_reason: Option<CloseReason>,
    guards: Guards,
    events: VecDeque<Event>,
}

impl Core {
    fn new(
        handle: ConnectionHandle,
        role: Role,
        config: Config,
        services: Services,
        pending: Pending,
    ) -> Self {
        Self {
            handle,
            role,
            state: State::Connecting,
            codec: FrameCodec::new(role, config.max_frame_size.min(config.max_message_size)),
            assembler: MessageAssembler::new(config.max_message_size),
            config,
            services,
            pending: Some(pending),
            started: false,
            recv: BytesMut::new(),
            scratch: BytesMut::new(),
            extensions: NegotiatedExtensions::none(),
            subprotocol: None,
            path: None,
            queue: SendQueue::default(),
            close_sent: false,
            close_received: false,
            failed: false,
            close_reason: None,
            guards: Guards::default(),
            events: VecDeque::new(),
        }
    }

    // Timers

    fn arm(&mut self, kind: TimerKind) {
        let after = match kind {
            TimerKind::Handshake => self.config.handshake_timeout,
            TimerKind::Close => self.config.close_timeout,
            TimerKind::Pong => self.config.pong_timeout,
        };
        let Some(after) = after else {
            return;
        };
        if self.state == State::Closed {
            return;
        }
        let slot = self.guards.slot(kind);
        if slot.is_none() {
            *slot = Some(self.services.timers.schedule(self.handle, kind, after));
        }
    }

    fn disarm(&mut self, kind: TimerKind) {
        if let Some(id) = self.guards.slot(kind).take() {
            self.services.timers.cancel(id);
        }
    }

    // Output

    fn flush(&mut self) {
        if self.state == State::Closed {
            return;
        }
        if let Some(chunk) = self.queue.next_write() {
            if let Err(e) = self.services.transport.write(chunk) {
                self.queue.complete();
                self.abort(Error::Transport(e));
            }
        }
    }

    fn queue_frame(&mut self, opcode: OpCode, payload: &[u8]) {
        self.codec.encode(opcode, payload, true, &mut self.scratch);
        self.queue.push(self.scratch.split().freeze());
        self.flush();
    }

    fn queue_close(&mut self, payload: &[u8]) {
        self.close_sent = true;
        self.queue_frame(OpCode::Close, payload);
    }

    // Lifecycle

    fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::InvalidState("connection already started"));
        }
        self.started = true;
        ws_log!(self.services.log, DEBUG, "{} starting as {:?}", self.handle, self.role);

        self.arm(TimerKind::Handshake);
        if let Some(Pending::Client(handshake)) = &self.pending {
            let request = handshake.request();
            self.queue.push(request);
            self.flush();
        }
        Ok(())
    }

    fn advance_handshake(&mut self) {
        let max = self.config.max_handshake_size;
        let outcome = match &self.pending {
            Some(Pending::Server(handshake)) => match parse_request(&self.recv, max) {
                Ok(Some((request, len))) => handshake.accept(&request).map(|n| Some((n, len))),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            },
            Some(Pending::Client(handshake)) => handshake.verify_response(&self.recv, max),
            None => return,
        };

        match outcome {
            Ok(None) => {}
            Ok(Some((negotiated, len))) => {
                self.recv.advance(len);
                self.open(negotiated);
            }
            Err(e) => self.fail_handshake(e),
        }
    }

    fn open(&mut self, negotiated: Negotiated) {
        if let Some(Pending::Server(_)) = self.pending.take() {
            self.queue.push(ServerHandshake::build_response(&negotiated));
        }

        self.codec.set_reserved_bits(negotiated.extensions.reserved_bits());
        self.extensions = negotiated.extensions;
        self.subprotocol = negotiated.subprotocol;
        self.path = Some(negotiated.path);
        self.disarm(TimerKind::Handshake);
        self.state = State::Open;

        ws_log!(
            self.services.log,
            INFO,
            "{} open path={} subprotocol={:?} extensions={:?}",
            self.handle,
            self.path.as_deref().unwrap_or("/"),
            self.subprotocol,
            self.extensions.header_value()
        );
        self.events.push_back(Event::Open);
        self.flush();
    }

    fn fail_handshake(&mut self, error: HandshakeError) {
        ws_log!(self.services.log, WARN, "{} handshake failed: {}", self.handle, error);
        let reject = matches!(self.pending, Some(Pending::Server(_)))
            .then(|| ServerHandshake::reject_response(&error));
        self.events.push_back(Event::Fail(Error::Handshake(error)));
        if let Some(response) = reject {
            self.queue.push(response);
            self.flush();
        }
        self.finish();
    }

    fn read_frames(&mut self) {
        while self.state != State::Closed && !self.failed && !self.close_received {
            match self.codec.decode(&mut self.recv) {
                Ok(Some(frame)) => self.on_frame(frame),
                Ok(None) => {
                    if self.announced_too_big() {
                        self.fail(ProtocolError::MessageTooBig);
                    }
                    break;
                }
                Err(e) => self.fail(e),
            }
        }
    }

    /// A data frame header already promises more than the message limit
    fn announced_too_big(&self) -> bool {
        self.codec.pending_header().is_some_and(|header| {
            let announced = header
                .payload_len
                .saturating_add(self.assembler.buffered() as u64);
            header.opcode.is_data() && announced > self.config.max_message_size as u64
        })
    }

    fn on_frame(&mut self, frame: Frame) {
        match frame.header.opcode {
            OpCode::Ping => {
                if self.state == State::Open {
                    self.queue_frame(OpCode::Pong, &frame.payload);
                }
                self.events.push_back(Event::Ping(frame.payload));
            }
            OpCode::Pong => {
                self.disarm(TimerKind::Pong);
                self.events.push_back(Event::Pong(frame.payload));
            }
            OpCode::Close => match frame.parse_close() {
                Ok(reason) => self.on_close_frame(reason),
                Err(e) => self.fail(e),
            },
            _ => match self.assembler.push(frame, &mut self.extensions) {
                // Data after our close frame is checked but not delivered
                Ok(Some(message)) if !self.close_sent => {
                    self.events.push_back(Event::Message(message));
                }
                Ok(_) => {}
                Err(e) => self.fail(e),
            },
        }
    }

    fn on_close_frame(&mut self, reason: Option<CloseReason>) {
        ws_log!(
            self.services.log,
            DEBUG,
            "{} close frame received: {:?}",
            self.handle,
            reason
        );
        self.close_received = true;
        self.assembler.reset();

        let echo = reason.as_ref().map(|r| r.code.to_be_bytes());
        if self.close_reason.is_none() {
            self.close_reason =
                Some(reason.unwrap_or_else(|| CloseReason::new(CloseReason::NO_STATUS, "")));
        }

        if !self.close_sent {
            self.state = State::Closing;
            self.arm(TimerKind::Close);
            self.queue_close(echo.as_ref().map_or(&[][..], |code| &code[..]));
        }
        self.maybe_finish();
    }

    /// Fail the connection for a protocol violation
    fn fail(&mut self, error: ProtocolError) {
        ws_log!(self.services.log, WARN, "{} protocol error: {}", self.handle, error);
        let code = error.close_code();
        let text = error.to_string();
        let reason = if text.len() <= CloseReason::MAX_REASON_LEN {
            CloseReason::new(code, text)
        } else {
            CloseReason::new(code, "")
        };

        self.failed = true;
        self.assembler.reset();
        self.recv = BytesMut::new();
        self.close_reason = Some(reason.clone());
        self.events.push_back(Event::Fail(Error::Protocol(error)));

        self.state = State::Closing;
        self.arm(TimerKind::Close);
        if !self.close_sent {
            self.queue_close(&reason.to_payload());
        }
        self.maybe_finish();
    }

    /// Tear down without a close handshake
    fn abort(&mut self, error: Error) {
        if self.state == State::Closed {
            return;
        }
        ws_log!(self.services.log, WARN, "{} aborted: {}", self.handle, error);
        self.close_reason = Some(CloseReason::new(CloseReason::ABNORMAL, ""));
        self.events.push_back(Event::Fail(error));
        self.finish();
    }

    fn maybe_finish(&mut self) {
        if self.state == State::Closing
            && (self.close_received || self.failed)
            && self.queue.is_idle()
        {
            self.finish();
        }
    }

    fn finish(&mut self) {
        if self.state == State::Closed {
            return;
        }
        let reason = self
            .close_reason
            .get_or_insert_with(|| CloseReason::new(CloseReason::ABNORMAL, ""))
            .clone();

        self.state = State::Closed;
        for kind in [TimerKind::Handshake, TimerKind::Close, TimerKind::Pong] {
            self.disarm(kind);
        }
        self.pending = None;
        self.queue.clear();
        self.assembler.reset();
        self.recv = BytesMut::new();
        self.scratch = BytesMut::new();
        self.services.transport.close();

        ws_log!(
            self.services.log,
            DEBUG,
            "{} closed code={} reason={:?}",
            self.handle,
            reason.code,
            reason.reason
        );
        self.events.push_back(Event::Close(reason));
    }

    // Entry points

    fn on_read(&mut self, data: &[u8]) {
        if self.state == State::Closed || self.failed || self.close_received {
            return;
        }
        self.recv.extend_from_slice(data);

        if self.state == State::Connecting {
            self.advance_handshake();
            if self.state != State::Open {
                return;
            }
        }
        self.read_frames();
    }

    fn on_write_complete(&mut self, result: io::Result<()>) {
        if self.state == State::Closed {
            return;
        }
        self.queue.complete();
        match result {
            Ok(()) => {
                self.flush();
                self.maybe_finish();
            }
            Err(e) => self.abort(Error::Transport(e)),
        }
    }

    fn on_timer(&mut self, id: TimerId) {
        let Some(kind) = self.guards.take_fired(id) else {
            return;
        };
        ws_log!(self.services.log, DEBUG, "{} {} timer fired", self.handle, kind);

        match kind {
            TimerKind::Handshake => {
                if self.state == State::Connecting {
                    self.events.push_back(Event::Fail(Error::Timeout(kind)));
                    self.finish();
                }
            }
            TimerKind::Close => {
                if !self.failed {
                    self.events.push_back(Event::Fail(Error::Timeout(kind)));
                }
                self.finish();
            }
            TimerKind::Pong => self.abort(Error::Timeout(kind)),
        }
    }

    fn on_disconnect(&mut self) {
        if self.state == State::Closed {
            return;
        }
        if self.close_received || self.failed {
            self.finish();
        } else {
            self.abort(Error::ConnectionClosed);
        }
    }

    // Application operations

    fn check_open(&self) -> Result<()> {
        match self.state {
            State::Connecting => Err(Error::InvalidState("handshake not complete")),
            State::Open => Ok(()),
            State::Closing | State::Closed => Err(Error::ConnectionClosed),
        }
    }

    fn send(&mut self, message: Message) -> Result<()> {
        self.check_open()?;
        let buffered = self.queue.buffered_amount();
        if buffered > 0 && buffered + message.len() > self.config.max_backpressure {
            return Err(Error::BufferFull);
        }

        let frames = encode_message(&message, &mut self.extensions, self.config.fragment_size)?;
        for frame in frames {
            self.codec
                .encode_with_rsv(frame.opcode, &frame.payload, frame.fin, frame.rsv, &mut self.scratch);
            self.queue.push(self.scratch.split().freeze());
        }
        self.flush();
        Ok(())
    }

    fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.check_open()?;
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlFrameTooLarge.into());
        }
        self.queue_frame(OpCode::Ping, payload);
        self.arm(TimerKind::Pong);
        Ok(())
    }

    fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        if !CloseReason::is_valid_code(code) {
            return Err(ProtocolError::InvalidCloseCode(code).into());
        }
        if reason.len() > CloseReason::MAX_REASON_LEN {
            return Err(ProtocolError::ControlFrameTooLarge.into());
        }
        self.check_open()?;

        ws_log!(self.services.log, DEBUG, "{} closing with {}", self.handle, code);
        self.state = State::Closing;
        self.arm(TimerKind::Close);
        self.queue_close(&CloseReason::new(code, reason).to_payload());
        Ok(())
    }
}

/// Handle on a connection passed to [`Handler`] callbacks
pub struct Context<'a> {
    core: &'a mut Core,
}

impl Context<'_> {
    /// Send a message
    pub fn send(&mut self, message: Message) -> Result<()> {
        self.core.send(message)
    }

    /// Send a text message
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.core.send(Message::text(text))
    }

    /// Send a binary message
    pub fn send_binary(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.core.send(Message::binary(data))
    }

    /// Send a ping
    pub fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.core.ping(payload)
    }

    /// Start the close handshake
    pub fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        self.core.close(code, reason)
    }

    /// Current state
    pub fn state(&self) -> State {
        self.core.state
    }

    /// Endpoint role
    pub fn role(&self) -> Role {
        self.core.role
    }

    /// Registry handle
    pub fn handle(&self) -> ConnectionHandle {
        self.core.handle
    }

    /// Negotiated subprotocol
    pub fn subprotocol(&self) -> Option<&str> {
        self.core.subprotocol.as_deref()
    }

    /// Target resource of the upgrade request
    pub fn path(&self) -> Option<&str> {
        self.core.path.as_deref()
    }

    /// Bytes queued or in flight
    pub fn buffered_amount(&self) -> usize {
        self.core.queue.buffered_amount()
    }
}

/// A WebSocket connection bound to its handler
pub struct Connection<H> {
    core: Core,
    handler: H,
}

impl<H> fmt::Debug for Connection<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.core.handle)
            .field("role", &self.core.role)
            .field("state", &self.core.state)
            .field("buffered", &self.core.queue.buffered_amount())
            .finish_non_exhaustive()
    }
}

impl<H: Handler> Connection<H> {
    /// Server endpoint awaiting an upgrade request
    pub fn server(handle: ConnectionHandle, config: Config, services: Services, handler: H) -> Self {
        let handshake = ServerHandshake::new(config.subprotocols.clone(), config.extensions.clone());
        Self {
            core: Core::new(handle, Role::Server, config, services, Pending::Server(handshake)),
            handler,
        }
    }

    /// Client endpoint that will send `handshake` on start
    pub fn client(
        handle: ConnectionHandle,
        config: Config,
        services: Services,
        handler: H,
        handshake: ClientHandshake,
    ) -> Self {
        Self {
            core: Core::new(handle, Role::Client, config, services, Pending::Client(handshake)),
            handler,
        }
    }

    fn dispatch(&mut self) {
        while let Some(event) = self.core.events.pop_front() {
            let ctx = &mut Context {
                core: &mut self.core,
            };
            match event {
                Event::Open => self.handler.on_open(ctx),
                Event::Message(message) => self.handler.on_message(ctx, message),
                Event::Ping(payload) => self.handler.on_ping(ctx, &payload),
                Event::Pong(payload) => self.handler.on_pong(ctx, &payload),
                Event::Fail(error) => self.handler.on_fail(ctx, &error),
                Event::Close(reason) => self.handler.on_close(ctx, reason.code, &reason.reason),
            }
        }
    }

    /// Arm the handshake timer and, for clients, send the upgrade request
    pub fn start(&mut self) -> Result<()> {
        let result = self.core.start();
        self.dispatch();
        result
    }

    /// Feed bytes received from the transport
    pub fn on_read(&mut self, data: &[u8]) {
        self.core.on_read(data);
        self.dispatch();
    }

    /// Report completion of the write in flight
    pub fn on_write_complete(&mut self, result: io::Result<()>) {
        self.core.on_write_complete(result);
        self.dispatch();
    }

    /// Report a fired timer; unknown ids are ignored
    pub fn on_timer(&mut self, id: TimerId) {
        self.core.on_timer(id);
        self.dispatch();
    }

    /// Report that the transport disconnected
    pub fn on_disconnect(&mut self) {
        self.core.on_disconnect();
        self.dispatch();
    }

    /// Send a message
    ///
    /// Fails with [`Error::BufferFull`] when queued bytes would exceed
    /// `max_backpressure`.
    pub fn send(&mut self, message: Message) -> Result<()> {
        let result = self.core.send(message);
        self.dispatch();
        result
    }

    /// Send a text message
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(Message::text(text))
    }

    /// Send a binary message
    pub fn send_binary(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::binary(data))
    }

    /// Send a ping and arm the pong timer
    pub fn ping(&mut self, payload: &[u8]) -> Result<()> {
        let result = self.core.ping(payload);
        self.dispatch();
        result
    }

    /// Start the close handshake
    ///
    /// The code must be sendable on the wire and the reason at most 123 bytes.
    pub fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let result = self.core.close(code, reason);
        self.dispatch();
        result
    }

    /// Current state
    pub fn state(&self) -> State {
        self.core.state
    }

    /// Endpoint role
    pub fn role(&self) -> Role {
        self.core.role
    }

    /// Registry handle
    pub fn handle(&self) -> ConnectionHandle {
        self.core.handle
    }

    /// Negotiated subprotocol
    pub fn subprotocol(&self) -> Option<&str> {
        self.core.subprotocol.as_deref()
    }

    /// Target resource of the upgrade request
    pub fn path(&self) -> Option<&str> {
        self.core.path.as_deref()
    }

    /// Extensions in effect
    pub fn extensions(&self) -> &NegotiatedExtensions {
        &self.core.extensions
    }

    /// Close status, known once a close frame was exchanged or the connection failed
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.core.close_reason.as_ref()
    }

    /// Bytes queued or in flight
    pub fn buffered_amount(&self) -> usize {
        self.core.queue.buffered_amount()
    }

    /// The application handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The application handler, mutably
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}
