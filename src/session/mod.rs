//! Per-client session engine.
//!
//! A session owns the pair of connections for one client: the downstream
//! transport (via the `Recv` queue and the `Signals` stream) and the upstream
//! IRC server (via the send queues and the reader task). One selector task
//! multiplexes the internal queues; an upstream byte-reader and a one-line
//! decoupler between the two send queues are the only helpers. The decoupler
//! exists so the inbound processor can never block on a slow upstream write.
//!
//! Shutdown is a write-once latch: whichever side fails first flips it, the
//! signal stream is closed exactly once inside it, and every other task
//! observes a queue closure and exits.

mod inbound;
mod outbound;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};

use crate::config::{make_client_replacements, UpstreamConfig};
use crate::gateway::{ConnInfo, Gateway};
use crate::hooks;
use crate::irc::Prefix;
use crate::state::IrcState;
use crate::throttle::{self, ThrottleHandle, QUEUE_CAPACITY};
use crate::upstream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Registering,
    Connected,
    Ending,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Registering => "registering",
            SessionState::Connected => "connected",
            SessionState::Ending => "ending",
        }
    }
}

/// What the transport reads off the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// One line to deliver downstream.
    Data(String),
    /// Lifecycle marker: `connected`, or `closed` with an optional error code.
    State {
        kind: &'static str,
        code: Option<String>,
    },
}

impl Signal {
    pub fn closed(code: Option<String>) -> Signal {
        Signal::State {
            kind: "closed",
            code,
        }
    }

    pub fn connected() -> Signal {
        Signal::State {
            kind: "connected",
            code: None,
        }
    }
}

/// Feature emulation toggles, negotiated during CAP handling.
#[derive(Debug, Default)]
pub struct Features {
    pub message_tags: AtomicBool,
    pub metadata: AtomicBool,
    pub ext_jwt: AtomicBool,
}

impl Features {
    pub fn message_tags(&self) -> bool {
        self.message_tags.load(Ordering::SeqCst)
    }

    pub fn set_message_tags(&self, enabled: bool) {
        self.message_tags.store(enabled, Ordering::SeqCst);
    }

    pub fn ext_jwt(&self) -> bool {
        self.ext_jwt.load(Ordering::SeqCst)
    }

    pub fn set_ext_jwt(&self, enabled: bool) {
        self.ext_jwt.store(enabled, Ordering::SeqCst);
    }
}

/// Client-picked destination from the HOST command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dest {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

struct ShutdownLatch {
    shutting_down: bool,
    signals: Option<mpsc::Sender<Signal>>,
}

pub struct ClientSession {
    pub id: u64,
    pub gateway: Arc<Gateway>,
    pub info: ConnInfo,
    pub irc_state: IrcState,
    pub features: Features,
    encoding: Mutex<String>,
    state: Mutex<SessionState>,
    verified: AtomicBool,
    requires_verification: bool,
    upstream_started: AtomicBool,
    seen_quit: AtomicBool,
    dest: Mutex<Option<Dest>>,
    upstream_config: Mutex<Option<UpstreamConfig>>,
    server_prefix: Mutex<Option<Prefix>>,
    requested_message_tags_cap: Mutex<Option<String>>,
    pending_quit: Mutex<Option<String>>,
    throttle: ThrottleHandle,
    recv_tx: mpsc::Sender<String>,
    upstream_send_in_tx: mpsc::Sender<String>,
    upstream_recv_tx: mpsc::Sender<String>,
    writer_tx: mpsc::Sender<Box<dyn AsyncWrite + Send + Unpin>>,
    latch: tokio::sync::Mutex<ShutdownLatch>,
    shutdown_tx: watch::Sender<bool>,
}

impl ClientSession {
    /// Create the session, register it, and start its tasks. The returned
    /// receiver is the transport's signal stream.
    pub fn spawn(
        gateway: Arc<Gateway>,
        info: ConnInfo,
        requires_verification: bool,
    ) -> (Arc<ClientSession>, mpsc::Receiver<Signal>) {
        let id = gateway.next_client_id();

        let (recv_tx, recv_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (throttled_rx, throttle) = throttle::throttled(recv_rx);
        let (upstream_send_in_tx, mut upstream_send_in_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (upstream_send_out_tx, upstream_send_out_rx) = mpsc::channel::<String>(QUEUE_CAPACITY);
        let (upstream_recv_tx, upstream_recv_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (signals_tx, signals_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (writer_tx, writer_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session = Arc::new(ClientSession {
            id,
            gateway: gateway.clone(),
            info,
            irc_state: IrcState::default(),
            features: Features {
                message_tags: AtomicBool::new(false),
                metadata: AtomicBool::new(false),
                ext_jwt: AtomicBool::new(true),
            },
            encoding: Mutex::new("UTF-8".to_string()),
            state: Mutex::new(SessionState::Idle),
            verified: AtomicBool::new(!requires_verification),
            requires_verification,
            upstream_started: AtomicBool::new(false),
            seen_quit: AtomicBool::new(false),
            dest: Mutex::new(None),
            upstream_config: Mutex::new(None),
            server_prefix: Mutex::new(None),
            requested_message_tags_cap: Mutex::new(None),
            pending_quit: Mutex::new(None),
            throttle,
            recv_tx,
            upstream_send_in_tx,
            upstream_recv_tx,
            writer_tx,
            latch: tokio::sync::Mutex::new(ShutdownLatch {
                shutting_down: false,
                signals: Some(signals_tx),
            }),
            shutdown_tx,
        });

        gateway.clients.insert(id, session.clone());
        tracing::info!(
            session = id,
            addr = %session.info.remote_addr,
            host = %session.info.remote_hostname,
            "new client"
        );

        // One-line decoupler between the two send queues.
        tokio::spawn(async move {
            while let Some(line) = upstream_send_in_rx.recv().await {
                if upstream_send_out_tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(run_selector(
            session.clone(),
            throttled_rx,
            upstream_send_out_rx,
            upstream_recv_rx,
            writer_rx,
            shutdown_rx,
        ));

        (session, signals_rx)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn state_name(&self) -> &'static str {
        self.state().name()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        tracing::debug!(session = self.id, from = state.name(), to = next.name(), "state");
        *state = next;
    }

    pub fn verified(&self) -> bool {
        self.verified.load(Ordering::SeqCst)
    }

    pub fn set_verified(&self) {
        self.verified.store(true, Ordering::SeqCst);
    }

    pub fn requires_verification(&self) -> bool {
        self.requires_verification
    }

    pub fn encoding(&self) -> String {
        self.encoding.lock().clone()
    }

    pub fn set_encoding(&self, label: &str) {
        *self.encoding.lock() = label.to_string();
    }

    pub fn dest(&self) -> Option<Dest> {
        self.dest.lock().clone()
    }

    pub fn set_dest(&self, dest: Dest) {
        *self.dest.lock() = Some(dest);
    }

    pub fn upstream_hostname(&self) -> Option<String> {
        self.upstream_config.lock().as_ref().map(|u| u.hostname.clone())
    }

    pub(crate) fn upstream_config_snapshot(&self) -> Option<UpstreamConfig> {
        self.upstream_config.lock().clone()
    }

    pub(crate) fn server_prefix(&self) -> Option<Prefix> {
        self.server_prefix.lock().clone()
    }

    pub(crate) fn set_server_prefix(&self, prefix: Prefix) {
        *self.server_prefix.lock() = Some(prefix);
    }

    pub(crate) fn take_requested_message_tags_cap(&self) -> Option<String> {
        self.requested_message_tags_cap.lock().take()
    }

    pub(crate) fn peek_requested_message_tags_cap(&self) -> Option<String> {
        self.requested_message_tags_cap.lock().clone()
    }

    pub(crate) fn set_requested_message_tags_cap(&self, cap: &str) {
        *self.requested_message_tags_cap.lock() = Some(cap.to_string());
    }

    pub(crate) fn throttle_handle(&self) -> &ThrottleHandle {
        &self.throttle
    }

    /// Non-blocking push from the transport. Slow clients must not pin
    /// gateway memory, so a full queue drops the line.
    pub fn deliver_from_transport(&self, line: String) {
        match self.recv_tx.try_send(line) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session = self.id, "recv queue full, dropping line");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Enqueue a signal for the transport. Serialized through the shutdown
    /// latch: nothing is enqueued once shutdown has begun, and a send in
    /// flight completes before the latch can flip.
    pub async fn send_signal(&self, signal: Signal) {
        let latch = self.latch.lock().await;
        if latch.shutting_down {
            return;
        }
        if let Some(signals) = &latch.signals {
            let _ = signals.send(signal).await;
        }
    }

    pub async fn send_irc_error(&self, text: &str) {
        self.send_signal(Signal::Data(format!("ERROR :{text}"))).await;
    }

    pub async fn send_irc_fail(&self, command: &str, code: &str, description: &str) {
        self.send_signal(Signal::Data(format!("FAIL {command} {code} :{description}")))
            .await;
    }

    /// Idempotent shutdown. The first caller wins: it decides the synthetic
    /// QUIT, flips the state to `ending`, closes the signal stream, and
    /// removes the session from the registry.
    pub async fn start_shutdown(&self, reason: &str) {
        let mut latch = self.latch.lock().await;
        if latch.shutting_down {
            return;
        }
        latch.shutting_down = true;

        // Only a client-initiated close earns the synthetic QUIT; when the
        // upstream is the side that died there is nobody left to tell.
        let quit_message = &self.gateway.config.send_quit_on_client_close;
        if reason == "client_closed"
            && self.state() == SessionState::Connected
            && !self.seen_quit.load(Ordering::SeqCst)
            && !quit_message.is_empty()
        {
            *self.pending_quit.lock() = Some(quit_message.clone());
        }

        self.set_state(SessionState::Ending);

        match reason {
            "upstream_closed" => tracing::info!(session = self.id, "upstream closed the connection"),
            "client_closed" => tracing::info!(session = self.id, "client disconnected"),
            "err_connecting_upstream" | "err_no_upstream" => {}
            other => tracing::info!(session = self.id, "closed: {other}"),
        }

        latch.signals = None;
        drop(latch);

        let _ = self.shutdown_tx.send(true);
        self.gateway.clients.remove(&self.id);
        self.gateway
            .hooks
            .dispatch_client_state(&mut hooks::ClientState {
                session_id: self.id,
                connected: false,
            });
    }

    /// Start the upstream connection once NICK, USER, and verification are
    /// all in place. The swap guarantees at most one dial per session.
    pub(crate) fn maybe_connect_upstream(self: &Arc<Self>) {
        if self.irc_state.nick().is_empty()
            || self.irc_state.username().is_empty()
            || !self.verified()
        {
            return;
        }
        if self.upstream_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.clone();
        tokio::spawn(async move {
            connect_upstream(session).await;
        });
    }

    pub(crate) fn mark_seen_quit(&self) {
        self.seen_quit.store(true, Ordering::SeqCst);
    }

    pub(crate) fn upstream_started(&self) -> bool {
        self.upstream_started.load(Ordering::SeqCst)
    }
}

async fn connect_upstream(session: Arc<ClientSession>) {
    let gateway = &session.gateway;

    let upstream_config = match session.dest() {
        None => match gateway.config.choose_upstream() {
            Some(upstream) => {
                tracing::debug!(session = session.id, "using pre-set upstream");
                upstream
            }
            None => {
                tracing::warn!(session = session.id, "no upstreams available");
                session.send_irc_error("The server has not been configured").await;
                session.start_shutdown("err_no_upstream").await;
                return;
            }
        },
        Some(dest) => {
            if !gateway.config.is_irc_address_allowed(&dest.host) {
                tracing::info!(session = session.id, host = %dest.host, "destination not allowed");
                session
                    .send_irc_error(&format!("Not allowed to connect to {}", dest.host))
                    .await;
                session
                    .send_signal(Signal::closed(Some("err_forbidden".to_string())))
                    .await;
                session.start_shutdown("err_no_upstream").await;
                return;
            }
            tracing::debug!(session = session.id, host = %dest.host, "using client given upstream");
            gateway.config.upstream_for_dest(&dest.host, dest.port, dest.tls)
        }
    };

    let mut event = hooks::IrcConnectionPre {
        session_id: session.id,
        upstream: upstream_config,
        halt: false,
    };
    gateway.hooks.dispatch_connection_pre(&mut event);
    if event.halt {
        session
            .send_signal(Signal::closed(Some("err_forbidden".to_string())))
            .await;
        session.start_shutdown("err_connecting_upstream").await;
        return;
    }
    let upstream_config = event.upstream;

    session.set_state(SessionState::Connecting);

    let stream = match upstream::connect(&upstream_config).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(session = session.id, host = %upstream_config.hostname, "upstream dial failed: {e}");
            let code = e.code();
            let code = if code.is_empty() {
                None
            } else {
                Some(format!("err_{code}"))
            };
            session.send_signal(Signal::closed(code)).await;
            session.start_shutdown("err_connecting_upstream").await;
            return;
        }
    };

    session.set_state(SessionState::Registering);
    session.irc_state.set_ports(stream.local_port, stream.remote_port);

    // Register with identd before any TLS-delayed traffic reaches the
    // server; its lookup tends to race the registration burst.
    if gateway.config.identd && stream.remote_port > 0 {
        gateway.identd.add_ident(
            stream.local_port,
            stream.remote_port,
            &session.irc_state.username(),
        );
    }

    *session.upstream_config.lock() = Some(upstream_config.clone());

    let mut writer = stream.writer;
    if let Err(e) = write_registration_prelude(&session, &upstream_config, &mut writer).await {
        tracing::warn!(session = session.id, "failed writing registration prelude: {e}");
        session
            .send_signal(Signal::closed(Some("err_connecting_upstream".to_string())))
            .await;
        session.start_shutdown("err_connecting_upstream").await;
        return;
    }

    session.send_signal(Signal::connected()).await;
    gateway.hooks.dispatch_client_state(&mut hooks::ClientState {
        session_id: session.id,
        connected: true,
    });

    tokio::spawn(run_upstream_reader(session.clone(), stream.reader));
    let _ = session.writer_tx.send(writer).await;
}

/// WEBIRC and PASS lines sent before any client traffic.
async fn write_registration_prelude(
    session: &Arc<ClientSession>,
    upstream_config: &UpstreamConfig,
    writer: &mut (impl AsyncWrite + Send + Unpin),
) -> std::io::Result<()> {
    if !upstream_config.webirc_password.is_empty() {
        let line = build_webirc_line(
            &session.info,
            &session.gateway.config,
            upstream_config,
            &session.irc_state.nick(),
        );
        tracing::debug!(session = session.id, "->upstream: WEBIRC");
        writer.write_all(line.as_bytes()).await?;
    } else {
        tracing::debug!(session = session.id, "no webirc to send");
    }

    if !upstream_config.server_password.is_empty() {
        writer
            .write_all(format!("PASS {}\r\n", upstream_config.server_password).as_bytes())
            .await?;
        session.irc_state.sent_pass.store(true, Ordering::SeqCst);
    }

    writer.flush().await
}

/// `WEBIRC <password> <gateway> <hostname> <ip> <tags>`, always exactly five
/// parameters. IPv6 addresses starting with `:` get a `0` prefix so they
/// survive IRC parameter parsing; tags are colon-prefixed when spaced or
/// empty.
pub(crate) fn build_webirc_line(
    info: &ConnInfo,
    config: &crate::config::Config,
    upstream_config: &UpstreamConfig,
    nick: &str,
) -> String {
    let mut gateway_name = config.gateway_name.clone();
    if gateway_name.is_empty() {
        gateway_name = "webircgateway".to_string();
    }
    if !upstream_config.gateway_name.is_empty() {
        gateway_name = upstream_config.gateway_name.clone();
    }

    let mut client_hostname = info.remote_hostname.clone();
    if !config.client_hostname.is_empty() {
        client_hostname = make_client_replacements(
            &config.client_hostname,
            &info.remote_addr,
            &info.remote_hostname,
            nick,
        );
    }

    let mut remote_addr = info.remote_addr.clone();
    if remote_addr.starts_with(':') {
        remote_addr.insert(0, '0');
    }

    let tags = build_webirc_tags(&info.tags);
    let tags_param = if tags.is_empty() || tags.contains(' ') {
        format!(":{tags}")
    } else {
        tags
    };

    format!(
        "WEBIRC {} {} {} {} {}\n",
        upstream_config.webirc_password, gateway_name, client_hostname, remote_addr, tags_param
    )
}

fn build_webirc_tags(tags: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = tags.keys().collect();
    keys.sort();

    let mut out = String::new();
    for key in keys {
        if !out.is_empty() {
            out.push(' ');
        }
        let value = &tags[key];
        if value.is_empty() {
            out.push_str(key);
        } else {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
    }
    out
}

/// The selector: one task per session multiplexing client input, the
/// upstream write queue, upstream output, and shutdown.
async fn run_selector(
    session: Arc<ClientSession>,
    mut throttled_rx: mpsc::Receiver<String>,
    mut upstream_send_out_rx: mpsc::Receiver<String>,
    mut upstream_recv_rx: mpsc::Receiver<String>,
    mut writer_rx: mpsc::Receiver<Box<dyn AsyncWrite + Send + Unpin>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut writer: Option<Box<dyn AsyncWrite + Send + Unpin>> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,

            handed_off = writer_rx.recv() => {
                if let Some(w) = handed_off {
                    writer = Some(w);
                }
            }

            line = throttled_rx.recv() => match line {
                Some(line) => {
                    let processed = std::panic::AssertUnwindSafe(
                        inbound::process_line_from_client(&session, line)
                    )
                    .catch_unwind()
                    .await;
                    match processed {
                        Ok(Some(forward)) if !forward.is_empty() => {
                            let _ = session.upstream_send_in_tx.send(forward).await;
                        }
                        Ok(_) => {}
                        Err(_) => {
                            tracing::error!(session = session.id, "inbound line processor panicked, line dropped");
                        }
                    }
                }
                None => {
                    session.start_shutdown("client_closed").await;
                    break;
                }
            },

            line = upstream_send_out_rx.recv(), if writer.is_some() => match line {
                Some(line) => {
                    let Some(w) = writer.as_mut() else { continue };
                    if write_line_upstream(&session, w, line).await.is_err() {
                        session.send_signal(Signal::closed(None)).await;
                        session.start_shutdown("upstream_closed").await;
                        break;
                    }
                }
                None => break,
            },

            line = upstream_recv_rx.recv() => match line {
                Some(line) => {
                    let processed = std::panic::AssertUnwindSafe(
                        outbound::process_line_from_upstream(&session, line)
                    )
                    .catch_unwind()
                    .await;
                    match processed {
                        Ok(Some(deliver)) if !deliver.is_empty() => {
                            session.send_signal(Signal::Data(deliver)).await;
                        }
                        Ok(_) => {}
                        Err(_) => {
                            tracing::error!(session = session.id, "outbound line processor panicked, line dropped");
                        }
                    }
                }
                None => break,
            },
        }
    }

    // Teardown: inject the synthetic QUIT if the shutdown decided on one,
    // then close our write direction so the upstream reader unblocks. The
    // writer may still be sitting in the handoff channel if shutdown raced
    // the dial.
    let writer = writer.or_else(|| writer_rx.try_recv().ok());
    if let Some(mut w) = writer {
        let pending_quit = session.pending_quit.lock().take();
        if let Some(quit) = pending_quit {
            let _ = w
                .write_all(format!("QUIT :{quit}\r\n").as_bytes())
                .await;
            let _ = w.flush().await;
        }
        let _ = w.shutdown().await;
    }
}

/// Last-minute hijacks and the actual upstream write. PASS is suppressed
/// once one has been sent, USER carries the gateway's username/realname, and
/// a client QUIT disarms the synthetic one.
async fn write_line_upstream(
    session: &Arc<ClientSession>,
    writer: &mut Box<dyn AsyncWrite + Send + Unpin>,
    mut line: String,
) -> std::io::Result<()> {
    let command = line
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();

    match command.as_str() {
        "PASS" => {
            if session.irc_state.sent_pass.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
        }
        "USER" => {
            line = format!(
                "USER {} 0 * :{}",
                session.irc_state.username(),
                session.irc_state.realname()
            );
        }
        "QUIT" => session.mark_seen_quit(),
        _ => {}
    }

    let mut event = hooks::IrcLine {
        session_id: session.id,
        line,
        to_server: true,
        halt: false,
    };
    session.gateway.hooks.dispatch_irc_line(&mut event);
    if event.halt {
        return Ok(());
    }
    let line = event.line;

    tracing::trace!(session = session.id, "->upstream: {line}");

    let encoding = session.encoding();
    let Some(mut bytes) = utf8_to_other(&line, &encoding) else {
        tracing::debug!(session = session.id, "failed to encode into {encoding:?}, dropping line");
        return Ok(());
    };
    bytes.extend_from_slice(b"\r\n");

    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Upstream byte reader: one task blocked on the socket, emitting decoded
/// lines into the session's `UpstreamRecv` queue.
async fn run_upstream_reader(session: Arc<ClientSession>, reader: Box<dyn AsyncRead + Send + Unpin>) {
    let mut reader = BufReader::new(reader);
    let mut buf: Vec<u8> = Vec::with_capacity(512);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        while matches!(buf.last(), Some(b'\r') | Some(b'\n')) {
            buf.pop();
        }
        if buf.is_empty() {
            continue;
        }

        let encoding = session.encoding();
        let Some(line) = ensure_utf8(&buf, &encoding) else {
            tracing::debug!(session = session.id, "failed to decode from {encoding:?}, dropping line");
            continue;
        };

        let mut event = hooks::IrcLine {
            session_id: session.id,
            line,
            to_server: false,
            halt: false,
        };
        session.gateway.hooks.dispatch_irc_line(&mut event);
        if event.halt {
            continue;
        }

        tracing::trace!(session = session.id, "upstream->: {}", event.line);

        if session.upstream_recv_tx.send(event.line).await.is_err() {
            break;
        }
    }

    session.send_signal(Signal::closed(None)).await;
    session.start_shutdown("upstream_closed").await;

    let (local_port, remote_port) = session.irc_state.ports();
    if remote_port > 0 {
        session.gateway.identd.remove_ident(local_port, remote_port);
    }
}

/// Decode upstream bytes into UTF-8 according to the session encoding.
/// Returns `None` (drop the line) when the label is unknown.
fn ensure_utf8(bytes: &[u8], from_encoding: &str) -> Option<String> {
    if let Ok(s) = std::str::from_utf8(bytes) {
        return Some(s.to_string());
    }
    let encoding = encoding_rs::Encoding::for_label(from_encoding.as_bytes())?;
    let (decoded, _, _) = encoding.decode(bytes);
    Some(decoded.into_owned())
}

/// Encode a UTF-8 line into the session encoding for the upstream socket.
/// Returns `None` (drop the line) on unknown labels or unmappable content.
fn utf8_to_other(line: &str, to_encoding: &str) -> Option<Vec<u8>> {
    if to_encoding.eq_ignore_ascii_case("utf-8") {
        return Some(line.as_bytes().to_vec());
    }
    let encoding = encoding_rs::Encoding::for_label(to_encoding.as_bytes())?;
    let (encoded, _, had_unmappable) = encoding.encode(line);
    if had_unmappable {
        return None;
    }
    Some(encoded.into_owned())
}
