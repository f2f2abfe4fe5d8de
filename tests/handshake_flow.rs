//! End-to-end flows against a rustls server.

use tls_client_proxy::stream::{Flags, Frame};

mod common;

use common::{route, Harness, APP, APP_CORRELATION, APP_STREAM, HOSTNAME, NET, NETWORK_REPLY};

fn established(protocol: Option<&str>, route_protocol: Option<&str>, server_alpn: &[&str]) -> Harness {
    let mut harness = Harness::tls(vec![route(Some(HOSTNAME), route_protocol)], server_alpn);
    harness.open(Some(HOSTNAME), protocol);
    assert!(harness.reply_begin.is_some(), "handshake did not finish: {:#?}", harness.log);
    harness
}

#[test]
fn test_hostname_without_alpn_opens_application_reply() {
    let harness = established(None, None, &[]);

    let network = harness.network_begin.as_ref().unwrap();
    assert_eq!(network.source, "tls");
    assert_eq!(network.source_ref, 443);
    assert!(network.extension.is_none());

    let reply = harness.reply_begin.as_ref().unwrap();
    assert_eq!(reply.source, "tls");
    assert_eq!(reply.source_ref, 0);
    assert_eq!(reply.correlation_id, APP_CORRELATION);
    let extension = reply.extension.as_ref().unwrap();
    assert_eq!(extension.hostname.as_deref(), Some(HOSTNAME));
    assert_eq!(extension.application_protocol, None);

    // Both sides live, handshake claimed.
    assert!(harness.factory.has_stream(APP_STREAM));
    assert!(harness.factory.has_stream(NETWORK_REPLY));
    assert!(harness.factory.correlations().is_empty());
    assert_eq!(harness.factory.tracker().active_count(), 1);
}

#[test]
fn test_alpn_h2_is_negotiated() {
    let harness = established(Some("h2"), Some("h2"), &["h2"]);
    let extension = harness.reply_begin.as_ref().unwrap().extension.clone().unwrap();
    assert_eq!(extension.application_protocol.as_deref(), Some("h2"));
}

#[test]
fn test_route_hostname_is_used_when_request_has_none() {
    let mut harness = Harness::tls(vec![route(Some(HOSTNAME), None)], &[]);
    harness.open(None, None);

    let extension = harness.reply_begin.as_ref().unwrap().extension.clone().unwrap();
    assert_eq!(extension.hostname.as_deref(), Some(HOSTNAME));
    assert_eq!(extension.application_protocol, None);
}

#[test]
fn test_payload_round_trip_releases_all_memory() {
    let mut harness = established(None, None, &[]);

    let request: Vec<u8> = (0..30_000u32).map(|i| (i % 251) as u8).collect();
    for chunk in request.chunks(10_000) {
        harness.app_send(chunk, Flags::EMPTY);
    }
    assert_eq!(harness.server_plaintext, request);

    let response: Vec<u8> = (0..40_000u32).map(|i| (i % 239) as u8).collect();
    harness.server_send(&response);
    assert_eq!(harness.app_plaintext, response);

    // Every region we allocated came back and was released, and the
    // application got its own regions back.
    assert_eq!(harness.arena.used(), 0);
    let credited: usize = harness
        .acks_to(APP, APP_STREAM)
        .iter()
        .flat_map(|ack| ack.regions.iter())
        .map(|region| region.length)
        .sum();
    assert_eq!(credited, request.len());
}

#[test]
fn test_ciphertext_on_the_wire_is_not_plaintext() {
    let mut harness = established(None, None, &[]);
    let before = harness.network_bytes.len();
    harness.app_send(b"attack at dawn", Flags::EMPTY);

    let sent = &harness.network_bytes[before..];
    assert!(!sent.is_empty());
    assert!(!sent.windows(6).any(|w| w == b"attack"));
    assert_eq!(harness.server_plaintext, b"attack at dawn");
}

#[test]
fn test_application_fin_sends_close_notify_and_network_fin() {
    let mut harness = established(None, None, &[]);
    harness.app_send(b"bye", Flags::FIN);

    assert_eq!(harness.server_plaintext, b"bye");
    assert!(harness.server_saw_close);
    let network_id = harness.network_id();
    assert!(harness.transfer_flagged(NET, network_id, Flags::FIN));

    // The network acked our FIN, which closed the accept side.
    assert!(harness
        .acks_to(APP, APP_STREAM)
        .iter()
        .any(|ack| ack.flags.is_fin()));
    assert!(!harness.factory.has_stream(APP_STREAM));
    assert!(harness.factory.has_stream(NETWORK_REPLY));

    // The server's close finishes the reply direction.
    harness.server_close();
    let reply_id = harness.reply_id();
    assert!(harness.transfer_flagged(APP, reply_id, Flags::FIN));
    assert!(harness
        .acks_to(NET, NETWORK_REPLY)
        .iter()
        .any(|ack| ack.flags.is_fin()));
    assert_eq!(harness.factory.stream_count(), 0);
    assert_eq!(harness.factory.tracker().active_count(), 0);
    assert_eq!(harness.arena.used(), 0);
}

#[test]
fn test_server_close_notify_ends_both_directions() {
    let mut harness = established(None, None, &[]);
    harness.server_send(b"last words");
    harness.server_close();

    assert_eq!(harness.app_plaintext, b"last words");
    let reply_id = harness.reply_id();
    assert!(harness.transfer_flagged(APP, reply_id, Flags::FIN));

    // Our close_notify answered the server's, then the network stream ended.
    assert!(harness.server_saw_close);
    let network_id = harness.network_id();
    assert!(harness.transfer_flagged(NET, network_id, Flags::FIN));
    assert_eq!(harness.factory.stream_count(), 0);
    assert_eq!(harness.arena.used(), 0);
}

#[test]
fn test_network_fin_without_close_notify_is_truncation() {
    let mut harness = established(None, None, &[]);
    harness.network_send(&[], Flags::FIN);

    let reply_id = harness.reply_id();
    assert!(harness.transfer_flagged(APP, reply_id, Flags::RST));
    assert!(harness.was_reset(NET, NETWORK_REPLY));
    assert!(!harness.factory.has_stream(NETWORK_REPLY));
}

#[test]
fn test_garbage_records_reset_the_pair() {
    let mut harness = established(None, None, &[]);
    harness.network_send(&[0x17, 0x03, 0x03, 0x00, 0x05, 1, 2, 3, 4, 5], Flags::EMPTY);

    let reply_id = harness.reply_id();
    assert!(harness.was_reset(NET, NETWORK_REPLY));
    assert!(harness.transfer_flagged(APP, reply_id, Flags::RST));
    assert!(!harness.factory.has_stream(NETWORK_REPLY));
}

#[test]
fn test_untrusted_server_fails_handshake() {
    // Client trusts one CA, server presents a leaf from another.
    let trusted = common::pki(&[]);
    let untrusted = common::pki(&[]);
    let engines = tls_client_proxy::tls::RustlsEngineFactory::with_roots(trusted.roots).unwrap();
    let mut harness = Harness::new(
        vec![route(Some(HOSTNAME), None)],
        std::sync::Arc::new(engines),
        1 << 20,
        1 << 16,
    );
    harness.server = Some(rustls::ServerConnection::new(untrusted.server).unwrap());
    harness.open(Some(HOSTNAME), None);

    assert!(harness.reply_begin.is_none());
    assert!(harness.was_reset(NET, NETWORK_REPLY));
    assert!(harness.was_reset(APP, APP_STREAM));
    assert!(harness
        .sent_to(APP)
        .iter()
        .all(|frame| !matches!(frame, Frame::Begin(_))));
    assert_eq!(harness.factory.stream_count(), 0);
}
