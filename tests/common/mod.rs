//! Shared harness for the integration tests.
//!
//! `Harness` wraps a `ClientStreamFactory` and plays both peers: the
//! application on one side and the network (optionally backed by a rustls
//! `ServerConnection`) on the other. Frames the factory emits are answered
//! the way a well-behaved peer would, until the exchange goes quiet.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{RootCertStore, ServerConfig, ServerConnection};

use tls_client_proxy::client::ClientStreamFactory;
use tls_client_proxy::memory::{HeapArena, MemoryManager};
use tls_client_proxy::routing::{Route, StaticRouteTable, TlsRouteEx};
use tls_client_proxy::stream::{Ack, Begin, Flags, Frame, Region, StreamId, TlsBeginEx, Transfer};
use tls_client_proxy::tls::engine::DelegatedTask;
use tls_client_proxy::tls::{
    EngineResult, EngineStatus, HandshakeStatus, RustlsEngineFactory, TlsEngine, TlsEngineFactory,
    TlsError,
};

pub const APP: &str = "app";
pub const NET: &str = "net";
pub const APP_STREAM: StreamId = 1000;
pub const APP_CORRELATION: u64 = 77;
pub const NETWORK_REPLY: StreamId = 2000;
pub const HOSTNAME: &str = "a.example";

pub fn route(hostname: Option<&str>, protocol: Option<&str>) -> Route {
    Route {
        source: APP.into(),
        source_ref: 1,
        target: NET.into(),
        target_ref: 443,
        authorization: 0,
        extension: TlsRouteEx {
            hostname: hostname.map(Into::into),
            application_protocol: protocol.map(Into::into),
        },
    }
}

pub fn app_begin(hostname: Option<&str>, protocol: Option<&str>) -> Begin {
    Begin {
        stream_id: APP_STREAM,
        source: APP.into(),
        source_ref: 1,
        correlation_id: APP_CORRELATION,
        authorization: 0,
        extension: Some(TlsBeginEx {
            hostname: hostname.map(Into::into),
            application_protocol: protocol.map(Into::into),
        }),
    }
}

/// Copy `bytes` into a fresh arena block owned by `owner`.
pub fn write_region(memory: &dyn MemoryManager, owner: StreamId, bytes: &[u8]) -> Region {
    let address = memory.acquire(bytes.len()).unwrap();
    memory.write(address, bytes).unwrap();
    Region::new(address, bytes.len(), owner)
}

/// Concatenate the bytes of the regions owned by `owner`.
pub fn read_regions(memory: &dyn MemoryManager, owner: StreamId, regions: &[Region]) -> Vec<u8> {
    let mut out = Vec::new();
    for region in regions.iter().filter(|r| r.stream_id == owner) {
        memory.read(region, &mut out).unwrap();
    }
    out
}

pub fn release_regions(memory: &dyn MemoryManager, owner: StreamId, regions: &[Region]) {
    for region in regions.iter().filter(|r| r.stream_id == owner) {
        memory.release(region.address, region.length);
    }
}

// ---------------------------------------------------------------------------
// Certificates and the peer
// ---------------------------------------------------------------------------

pub struct Pki {
    pub roots: RootCertStore,
    pub server: Arc<ServerConfig>,
}

/// CA plus a leaf for `a.example`, generated per test.
pub fn pki(server_alpn: &[&str]) -> Pki {
    let ca_key = rcgen::KeyPair::generate().unwrap();
    let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = rcgen::KeyPair::generate().unwrap();
    let leaf_params = rcgen::CertificateParams::new(vec![HOSTNAME.to_string()]).unwrap();
    let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(ca.der().clone()).unwrap();

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
    let mut server = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![leaf.der().clone()], key)
    .unwrap();
    server.alpn_protocols = server_alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

    Pki {
        roots,
        server: Arc::new(server),
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub factory: ClientStreamFactory,
    pub arena: Arc<HeapArena>,
    /// Every frame the factory emitted, in order.
    pub log: Vec<(String, Frame)>,
    pub server: Option<ServerConnection>,
    /// Answer the network Begin with a reply Begin.
    pub auto_reply: bool,
    pub network_begin: Option<Begin>,
    pub reply_begin: Option<Begin>,
    /// Ciphertext (or scripted bytes) seen on the network stream.
    pub network_bytes: Vec<u8>,
    /// Plaintext the server read.
    pub server_plaintext: Vec<u8>,
    /// The server saw our close_notify.
    pub server_saw_close: bool,
    /// Plaintext delivered on the application-reply stream.
    pub app_plaintext: Vec<u8>,
    /// Keep application-reply acks back instead of answering at once.
    pub hold_app_acks: bool,
    pub held_app_acks: Vec<Ack>,
}

impl Harness {
    pub fn new(
        routes: Vec<Route>,
        engines: Arc<dyn TlsEngineFactory>,
        arena_capacity: usize,
        transfer_capacity: usize,
    ) -> Self {
        let arena = Arc::new(HeapArena::new(arena_capacity));
        Self::with_memory(routes, engines, arena.clone(), arena, transfer_capacity)
    }

    /// Factory over `memory`, which must hand out regions from `arena`.
    pub fn with_memory(
        routes: Vec<Route>,
        engines: Arc<dyn TlsEngineFactory>,
        arena: Arc<HeapArena>,
        memory: Arc<dyn MemoryManager>,
        transfer_capacity: usize,
    ) -> Self {
        let factory = ClientStreamFactory::new(
            Arc::new(StaticRouteTable::new(routes)),
            engines,
            memory,
            transfer_capacity,
        );
        Self {
            factory,
            arena,
            log: Vec::new(),
            server: None,
            auto_reply: true,
            network_begin: None,
            reply_begin: None,
            network_bytes: Vec::new(),
            server_plaintext: Vec::new(),
            server_saw_close: false,
            app_plaintext: Vec::new(),
            hold_app_acks: false,
            held_app_acks: Vec::new(),
        }
    }

    /// Real TLS on both sides: rustls client engines against a rustls server.
    pub fn tls(routes: Vec<Route>, server_alpn: &[&str]) -> Self {
        let pki = pki(server_alpn);
        let engines = RustlsEngineFactory::with_roots(pki.roots).unwrap();
        let mut harness = Self::new(routes, Arc::new(engines), 1 << 20, 1 << 16);
        harness.server = Some(ServerConnection::new(pki.server).unwrap());
        harness
    }

    pub fn memory(&self) -> &dyn MemoryManager {
        self.arena.as_ref()
    }

    pub fn network_id(&self) -> StreamId {
        self.network_begin.as_ref().expect("network stream opened").stream_id
    }

    pub fn reply_id(&self) -> StreamId {
        self.reply_begin.as_ref().expect("application reply opened").stream_id
    }

    /// Frames the factory sent to `target`.
    pub fn sent_to(&self, target: &str) -> Vec<&Frame> {
        self.log
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, frame)| frame)
            .collect()
    }

    pub fn acks_to(&self, target: &str, stream_id: StreamId) -> Vec<&Ack> {
        self.sent_to(target)
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Ack(ack) if ack.stream_id == stream_id => Some(ack),
                _ => None,
            })
            .collect()
    }

    pub fn transfers_to(&self, target: &str, stream_id: StreamId) -> Vec<&Transfer> {
        self.sent_to(target)
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Transfer(transfer) if transfer.stream_id == stream_id => Some(transfer),
                _ => None,
            })
            .collect()
    }

    pub fn was_reset(&self, target: &str, stream_id: StreamId) -> bool {
        self.acks_to(target, stream_id).iter().any(|ack| ack.flags.is_reset())
    }

    pub fn transfer_flagged(&self, target: &str, stream_id: StreamId, flags: Flags) -> bool {
        self.transfers_to(target, stream_id)
            .iter()
            .any(|transfer| transfer.flags == flags)
    }

    pub fn open(&mut self, hostname: Option<&str>, protocol: Option<&str>) {
        self.deliver(Frame::Begin(app_begin(hostname, protocol)));
    }

    /// Application payload on the accept stream.
    pub fn app_send(&mut self, bytes: &[u8], flags: Flags) {
        let regions = if bytes.is_empty() {
            Vec::new()
        } else {
            vec![write_region(self.arena.as_ref(), APP_STREAM, bytes)]
        };
        self.deliver(Frame::Transfer(Transfer {
            stream_id: APP_STREAM,
            authorization: 0,
            flags,
            regions,
        }));
    }

    /// Answer the withheld application-reply acks and stop holding new ones.
    pub fn release_app_acks(&mut self) {
        self.hold_app_acks = false;
        for ack in std::mem::take(&mut self.held_app_acks) {
            self.deliver(Frame::Ack(ack));
        }
    }

    /// Network regions acked back on the network reply stream.
    pub fn credited_network_regions(&self) -> usize {
        self.acks_to(NET, NETWORK_REPLY)
            .iter()
            .map(|ack| ack.regions.len())
            .sum()
    }

    /// Raw bytes on the network reply stream.
    pub fn network_send(&mut self, bytes: &[u8], flags: Flags) {
        let mut frames = Vec::new();
        for chunk in bytes.chunks(16 * 1024) {
            frames.push(self.network_transfer(chunk, Flags::EMPTY));
        }
        if !flags.is_empty() {
            frames.push(self.network_transfer(&[], flags));
        }
        for frame in frames {
            self.deliver(frame);
        }
    }

    /// Plaintext written by the server.
    pub fn server_send(&mut self, bytes: &[u8]) {
        let server = self.server.as_mut().expect("tls harness");
        server.writer().write_all(bytes).unwrap();
        self.flush_server();
    }

    pub fn server_close(&mut self) {
        self.server.as_mut().expect("tls harness").send_close_notify();
        self.flush_server();
    }

    fn flush_server(&mut self) {
        let frames = self.server_output();
        for frame in frames {
            self.deliver(frame);
        }
    }

    /// Feed one frame to the factory and answer until nothing is left.
    pub fn deliver(&mut self, frame: Frame) {
        let mut queue = VecDeque::from([frame]);
        let mut rounds = 0;
        while let Some(frame) = queue.pop_front() {
            rounds += 1;
            assert!(rounds < 10_000, "frame exchange did not settle");

            let mut emitted: Vec<(String, Frame)> = Vec::new();
            self.factory.handle(frame, &mut emitted);
            for (target, frame) in emitted {
                self.log.push((target.clone(), frame.clone()));
                queue.extend(self.respond(&target, frame));
            }
        }
    }

    fn respond(&mut self, target: &str, frame: Frame) -> Vec<Frame> {
        match (target, frame) {
            (NET, Frame::Begin(begin)) => self.on_network_begin(begin),
            (NET, Frame::Transfer(transfer)) => self.on_network_transfer(transfer),
            (NET, Frame::Ack(ack)) => {
                release_regions(self.arena.as_ref(), NETWORK_REPLY, &ack.regions);
                Vec::new()
            }
            (APP, Frame::Begin(begin)) => {
                self.reply_begin = Some(begin);
                Vec::new()
            }
            (APP, Frame::Transfer(transfer)) => self.on_app_transfer(transfer),
            (APP, Frame::Ack(ack)) => self.on_app_ack(ack),
            (other, frame) => panic!("frame for unexpected target {other}: {frame:?}"),
        }
    }

    fn on_network_begin(&mut self, begin: Begin) -> Vec<Frame> {
        let reply = Begin {
            stream_id: NETWORK_REPLY,
            source: NET.into(),
            source_ref: 0,
            correlation_id: begin.correlation_id,
            authorization: begin.authorization,
            extension: None,
        };
        self.network_begin = Some(begin);
        if self.auto_reply {
            vec![Frame::Begin(reply)]
        } else {
            Vec::new()
        }
    }

    fn on_network_transfer(&mut self, transfer: Transfer) -> Vec<Frame> {
        let mut frames = Vec::new();
        if transfer.flags.is_reset() {
            // A reset connection loses its reply direction too.
            if self.reply_opened_by_peer() {
                frames.push(self.network_transfer(&[], Flags::RST));
            }
            return frames;
        }

        let bytes = read_regions(self.arena.as_ref(), transfer.stream_id, &transfer.regions);
        self.network_bytes.extend_from_slice(&bytes);
        if !transfer.regions.is_empty() || transfer.flags.is_fin() {
            frames.push(Frame::Ack(Ack {
                stream_id: transfer.stream_id,
                flags: transfer.flags,
                regions: transfer.regions,
            }));
        }

        if self.server.is_some() && !bytes.is_empty() {
            self.feed_server(&bytes);
            frames.extend(self.server_output());
        }
        frames
    }

    fn reply_opened_by_peer(&self) -> bool {
        self.auto_reply && self.network_begin.is_some()
    }

    fn feed_server(&mut self, mut bytes: &[u8]) {
        let Some(server) = self.server.as_mut() else {
            return;
        };
        while !bytes.is_empty() {
            server.read_tls(&mut bytes).unwrap();
            server.process_new_packets().unwrap();
        }
        let mut buf = [0u8; 4096];
        loop {
            match server.reader().read(&mut buf) {
                Ok(0) => {
                    self.server_saw_close = true;
                    break;
                }
                Ok(n) => self.server_plaintext.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => panic!("server read failed: {err}"),
            }
        }
    }

    fn server_output(&mut self) -> Vec<Frame> {
        let Some(server) = self.server.as_mut() else {
            return Vec::new();
        };
        let mut records = Vec::new();
        while server.wants_write() {
            server.write_tls(&mut records).unwrap();
        }
        records
            .chunks(16 * 1024)
            .map(|chunk| self.network_transfer(chunk, Flags::EMPTY))
            .collect()
    }

    fn network_transfer(&self, bytes: &[u8], flags: Flags) -> Frame {
        let regions = if bytes.is_empty() {
            Vec::new()
        } else {
            vec![write_region(self.arena.as_ref(), NETWORK_REPLY, bytes)]
        };
        Frame::Transfer(Transfer {
            stream_id: NETWORK_REPLY,
            authorization: 0,
            flags,
            regions,
        })
    }

    fn on_app_transfer(&mut self, transfer: Transfer) -> Vec<Frame> {
        if transfer.flags.is_reset() {
            return Vec::new();
        }
        let bytes = read_regions(self.arena.as_ref(), transfer.stream_id, &transfer.regions);
        self.app_plaintext.extend_from_slice(&bytes);
        if transfer.regions.is_empty() && !transfer.flags.is_fin() {
            return Vec::new();
        }
        let ack = Ack {
            stream_id: transfer.stream_id,
            flags: transfer.flags,
            regions: transfer.regions,
        };
        if self.hold_app_acks {
            self.held_app_acks.push(ack);
            return Vec::new();
        }
        vec![Frame::Ack(ack)]
    }

    fn on_app_ack(&mut self, ack: Ack) -> Vec<Frame> {
        release_regions(self.arena.as_ref(), APP_STREAM, &ack.regions);
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Scripted engine
// ---------------------------------------------------------------------------

/// Shared knobs and observations for `ScriptedEngine`.
#[derive(Default)]
pub struct Script {
    /// Statuses reported in order; `NotHandshaking` once exhausted.
    pub statuses: VecDeque<HandshakeStatus>,
    pub negotiated: Option<String>,
    /// Delegated tasks still to hand out.
    pub tasks: usize,
    pub tasks_run: Arc<AtomicUsize>,
    /// Bytes produced by the next wrap with empty input.
    pub handshake_output: Vec<u8>,
    pub fail_wrap: bool,
    pub fail_construction: bool,
    pub wraps: usize,
    pub outbound_closed: bool,
    pub inbound_closed: bool,
    /// (hostname, protocol) pairs engines were created with.
    pub requested: Vec<(Option<String>, Option<String>)>,
}

impl Script {
    pub fn shared(statuses: &[HandshakeStatus]) -> Arc<Mutex<Script>> {
        Arc::new(Mutex::new(Script {
            statuses: statuses.iter().copied().collect(),
            ..Script::default()
        }))
    }
}

/// Identity "cipher" driven by a `Script`.
pub struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
}

impl ScriptedEngine {
    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }
}

impl TlsEngine for ScriptedEngine {
    fn handshake_status(&mut self) -> HandshakeStatus {
        self.script()
            .statuses
            .pop_front()
            .unwrap_or(HandshakeStatus::NotHandshaking)
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        let mut script = self.script();
        if script.tasks == 0 {
            return None;
        }
        script.tasks -= 1;
        let counter = Arc::clone(&script.tasks_run);
        Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn begin_handshake(&mut self) -> Result<(), TlsError> {
        Ok(())
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError> {
        let mut script = self.script();
        script.wraps += 1;
        if script.fail_wrap {
            return Err(TlsError::RecordTransformFailed("scripted failure".into()));
        }
        if script.outbound_closed && !src.is_empty() {
            return Err(TlsError::EngineClosed);
        }
        if src.is_empty() {
            let output = std::mem::take(&mut script.handshake_output);
            dst[..output.len()].copy_from_slice(&output);
            return Ok(EngineResult::new(EngineStatus::Ok, 0, output.len()));
        }
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        Ok(EngineResult::new(EngineStatus::Ok, n, n))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError> {
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        Ok(EngineResult::new(EngineStatus::Ok, n, n))
    }

    fn close_outbound(&mut self) {
        self.script().outbound_closed = true;
    }

    fn close_inbound(&mut self) -> Result<(), TlsError> {
        self.script().inbound_closed = true;
        Ok(())
    }

    fn is_outbound_done(&self) -> bool {
        self.script().outbound_closed
    }

    fn is_inbound_done(&self) -> bool {
        self.script().inbound_closed
    }

    fn wants_wrap(&self) -> bool {
        false
    }

    fn application_protocol(&self) -> Option<String> {
        self.script().negotiated.clone()
    }

    fn peer_host(&self) -> Option<String> {
        self.script().requested.last().and_then(|(host, _)| host.clone())
    }
}

#[derive(Clone)]
pub struct ScriptedEngineFactory {
    pub script: Arc<Mutex<Script>>,
}

impl std::fmt::Debug for ScriptedEngineFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedEngineFactory").finish()
    }
}

impl TlsEngineFactory for ScriptedEngineFactory {
    fn new_client_engine(
        &self,
        hostname: Option<&str>,
        application_protocol: Option<&str>,
    ) -> Result<Box<dyn TlsEngine>, TlsError> {
        let mut script = self.script.lock().unwrap();
        if script.fail_construction {
            return Err(TlsError::Configuration("scripted construction failure".into()));
        }
        script
            .requested
            .push((hostname.map(Into::into), application_protocol.map(Into::into)));
        Ok(Box::new(ScriptedEngine {
            script: Arc::clone(&self.script),
        }))
    }
}

/// Harness over a scripted engine with a 64 KiB transfer capacity.
pub fn scripted(routes: Vec<Route>, script: &Arc<Mutex<Script>>) -> Harness {
    scripted_with(routes, script, 1 << 20, 1 << 16)
}

pub fn scripted_with(
    routes: Vec<Route>,
    script: &Arc<Mutex<Script>>,
    arena_capacity: usize,
    transfer_capacity: usize,
) -> Harness {
    let engines = ScriptedEngineFactory {
        script: Arc::clone(script),
    };
    Harness::new(routes, Arc::new(engines), arena_capacity, transfer_capacity)
}
