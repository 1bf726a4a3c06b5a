//! Client and server engines wired back to back through in-memory transports

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use proptest::prelude::*;

use sockudo_ws_core::frame::FrameCodec;
use sockudo_ws_core::log::NullSink;
use sockudo_ws_core::{
    ClientHandshake, Config, Connection, ConnectionHandle, Context, DeflateConfig, Error, Handler,
    ManualTimers, Message, OpCode, Role, Services, State, TimerKind, Transport,
};

#[derive(Debug, Default)]
struct Outbox {
    writes: Vec<Bytes>,
    sent: usize,
    closed: bool,
}

#[derive(Debug, Clone, Default)]
struct Pipe(Arc<Mutex<Outbox>>);

impl Transport for Pipe {
    fn write(&mut self, data: Bytes) -> io::Result<()> {
        let mut outbox = self.0.lock();
        outbox.sent += data.len();
        outbox.writes.push(data);
        Ok(())
    }

    fn close(&mut self) {
        self.0.lock().closed = true;
    }
}

impl Pipe {
    fn take(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.0.lock().writes)
    }
}

#[derive(Debug, Default)]
struct Peer {
    opened: bool,
    echo: bool,
    messages: Vec<Message>,
    pongs: Vec<Vec<u8>>,
    closed: Option<(u16, String)>,
    failures: Vec<String>,
}

impl Handler for Peer {
    fn on_open(&mut self, _ctx: &mut Context<'_>) {
        self.opened = true;
    }

    fn on_message(&mut self, ctx: &mut Context<'_>, message: Message) {
        if self.echo {
            ctx.send(message.clone()).unwrap();
        }
        self.messages.push(message);
    }

    fn on_pong(&mut self, _ctx: &mut Context<'_>, payload: &[u8]) {
        self.pongs.push(payload.to_vec());
    }

    fn on_close(&mut self, _ctx: &mut Context<'_>, code: u16, reason: &str) {
        assert!(self.closed.is_none(), "on_close delivered twice");
        self.closed = Some((code, reason.to_string()));
    }

    fn on_fail(&mut self, _ctx: &mut Context<'_>, error: &Error) {
        self.failures.push(error.to_string());
    }
}

struct Pair {
    client: Connection<Peer>,
    server: Connection<Peer>,
    client_out: Pipe,
    server_out: Pipe,
    timers: Arc<ManualTimers>,
}

impl Pair {
    fn new(client_config: Config, server_config: Config, protocols: &[&str]) -> Self {
        let timers = Arc::new(ManualTimers::new());
        let client_out = Pipe::default();
        let server_out = Pipe::default();

        let handshake = ClientHandshake::new(
            "example.com",
            "/socket",
            protocols.iter().map(|p| p.to_string()).collect(),
            client_config.extensions.clone(),
        );
        let mut client = Connection::client(
            ConnectionHandle::from_raw(0, 0),
            client_config,
            Services::new(client_out.clone(), timers.clone()).with_log(Arc::new(NullSink)),
            Peer::default(),
            handshake,
        );
        let mut server = Connection::server(
            ConnectionHandle::from_raw(1, 0),
            server_config,
            Services::new(server_out.clone(), timers.clone()).with_log(Arc::new(NullSink)),
            Peer::default(),
        );
        server.start().unwrap();
        client.start().unwrap();

        let mut pair = Self {
            client,
            server,
            client_out,
            server_out,
            timers,
        };
        pair.pump();
        pair
    }

    fn open(client_config: Config, server_config: Config) -> Self {
        let pair = Self::new(client_config, server_config, &[]);
        assert_eq!(pair.client.state(), State::Open);
        assert_eq!(pair.server.state(), State::Open);
        pair
    }

    /// Move bytes both ways until neither side has anything to write
    fn pump(&mut self) {
        loop {
            let upstream = self.client_out.take();
            let downstream = self.server_out.take();
            if upstream.is_empty() && downstream.is_empty() {
                return;
            }
            for chunk in upstream {
                self.server.on_read(&chunk);
                self.client.on_write_complete(Ok(()));
            }
            for chunk in downstream {
                self.client.on_read(&chunk);
                self.server.on_write_complete(Ok(()));
            }
        }
    }

    fn bytes_upstream(&self) -> usize {
        self.client_out.0.lock().sent
    }
}

#[test]
fn handshake_then_echo() {
    let mut pair = Pair::open(Config::default(), Config::default());
    assert!(pair.client.handler().opened);
    assert!(pair.server.handler().opened);
    assert_eq!(pair.server.path(), Some("/socket"));

    pair.server.handler_mut().echo = true;
    pair.client.send_text("hello").unwrap();
    pair.client.send_binary(vec![1u8, 2, 3]).unwrap();
    pair.pump();

    assert_eq!(
        pair.client.handler().messages,
        vec![Message::text("hello"), Message::binary(vec![1u8, 2, 3])]
    );
}

#[test]
fn subprotocol_follows_client_preference() {
    let server = Config::builder()
        .subprotocol("superchat")
        .subprotocol("chat")
        .build();
    let pair = Pair::new(Config::default(), server, &["chat", "superchat"]);

    assert_eq!(pair.server.subprotocol(), Some("chat"));
    assert_eq!(pair.client.subprotocol(), Some("chat"));
}

#[test]
fn no_common_subprotocol_still_opens() {
    let server = Config::builder().subprotocol("mqtt").build();
    let pair = Pair::new(Config::default(), server, &["chat"]);

    assert_eq!(pair.server.state(), State::Open);
    assert_eq!(pair.client.subprotocol(), None);
}

#[test]
fn permessage_deflate_end_to_end() {
    let config = Config::builder()
        .permessage_deflate(DeflateConfig::default())
        .build();
    let mut pair = Pair::open(config.clone(), config);

    let header = pair.server.extensions().header_value();
    assert!(header.is_some_and(|h| h.starts_with("permessage-deflate")));
    assert!(!pair.client.extensions().is_empty());

    let before = pair.bytes_upstream();
    let text = "the quick brown fox jumps over the lazy dog ".repeat(250);
    pair.client.send_text(&text).unwrap();
    pair.client.send_text(&text).unwrap();
    pair.pump();

    assert!(pair.bytes_upstream() - before < text.len());
    assert_eq!(
        pair.server.handler().messages,
        vec![Message::text(text.as_str()), Message::text(text.as_str())]
    );
}

#[test]
fn deflate_only_on_one_side_is_not_negotiated() {
    let server = Config::builder()
        .permessage_deflate(DeflateConfig::default())
        .build();
    let mut pair = Pair::open(Config::default(), server);

    assert!(pair.server.extensions().is_empty());
    pair.client.send_text("plain").unwrap();
    pair.pump();
    assert_eq!(pair.server.handler().messages, vec![Message::text("plain")]);
}

#[test]
fn ping_answered_by_engine() {
    let mut pair = Pair::open(Config::default(), Config::default());
    pair.client.ping(b"tick").unwrap();
    pair.pump();

    assert_eq!(pair.client.handler().pongs, vec![b"tick".to_vec()]);
}

#[test]
fn close_handshake_completes_on_both_sides() {
    let mut pair = Pair::open(Config::default(), Config::default());
    pair.client.close(1000, "done").unwrap();
    assert_eq!(pair.client.state(), State::Closing);
    pair.pump();

    assert_eq!(pair.client.state(), State::Closed);
    assert_eq!(pair.server.state(), State::Closed);
    assert_eq!(pair.server.handler().closed, Some((1000, "done".into())));
    assert_eq!(pair.client.handler().closed, Some((1000, String::new())));
    assert!(pair.client_out.0.lock().closed);
    assert!(pair.server_out.0.lock().closed);
    assert!(pair.client.handler().failures.is_empty());
}

#[test]
fn oversized_message_fails_receiver_with_1009() {
    let server = Config::builder().max_message_size(100).build();
    let mut pair = Pair::open(Config::default(), server);
    pair.client.send_binary(vec![0u8; 101]).unwrap();
    pair.pump();

    assert!(pair.server.handler().messages.is_empty());
    assert_eq!(pair.server.handler().closed.as_ref().map(|c| c.0), Some(1009));
    assert_eq!(pair.client.handler().closed.as_ref().map(|c| c.0), Some(1009));
    assert_eq!(pair.client.state(), State::Closed);
}

#[test]
fn close_timeout_when_peer_is_silent() {
    let client = Config::builder()
        .close_timeout(Duration::from_secs(3))
        .build();
    let mut pair = Pair::open(client, Config::default());
    pair.client.close(1001, "").unwrap();

    // Write completes but the close frame never reaches the server
    pair.client_out.take();
    pair.client.on_write_complete(Ok(()));
    assert_eq!(pair.client.state(), State::Closing);

    for expired in pair.timers.advance(Duration::from_secs(3)) {
        assert_eq!(expired.kind, TimerKind::Close);
        pair.client.on_timer(expired.id);
    }
    assert_eq!(pair.client.state(), State::Closed);
    assert_eq!(pair.client.handler().closed, Some((1006, String::new())));
}

fn frame_len() -> impl Strategy<Value = usize> {
    prop_oneof![
        0..=125usize,
        126..=130usize,
        65_530..=65_540usize,
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn fragmented_binary_reassembles(
        payload in proptest::collection::vec(any::<u8>(), 0..2048),
        fragment in 1..300usize,
    ) {
        let client = Config::builder().fragment_size(fragment).build();
        let mut pair = Pair::open(client, Config::default());
        pair.client.send_binary(payload.clone()).unwrap();
        pair.pump();

        prop_assert_eq!(&pair.server.handler().messages, &vec![Message::binary(payload)]);
    }

    #[test]
    fn fragmented_text_survives_split_code_points(
        text in "\\PC{0,200}",
        fragment in 1..16usize,
    ) {
        let client = Config::builder().fragment_size(fragment).build();
        let mut pair = Pair::open(client, Config::default());
        pair.client.send_text(&text).unwrap();
        pair.pump();

        prop_assert_eq!(&pair.server.handler().messages, &vec![Message::text(text.as_str())]);
        prop_assert!(pair.server.handler().failures.is_empty());
    }

    #[test]
    fn codec_handles_length_tiers_in_any_chunking(
        len in frame_len(),
        chunk in 1..4096usize,
    ) {
        let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let mut wire = BytesMut::new();
        FrameCodec::new(Role::Client, usize::MAX).encode(OpCode::Binary, &payload, true, &mut wire);

        let header = match len {
            0..=125 => 2,
            126..=65_535 => 4,
            _ => 10,
        };
        prop_assert_eq!(wire.len(), header + 4 + len);

        let mut server = FrameCodec::new(Role::Server, usize::MAX);
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for piece in wire.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(frame) = server.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
        }

        prop_assert_eq!(frames.len(), 1);
        prop_assert_eq!(&frames[0].payload[..], &payload[..]);
        prop_assert!(server.is_idle());
    }
}
