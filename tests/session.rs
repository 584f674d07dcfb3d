//! End-to-end session engine tests.
//!
//! A loopback `TcpListener` stands in for the upstream IRCd and the tests
//! drive sessions directly through the transport contract: push lines with
//! `deliver_from_transport`, pull signals from the session's stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use webirc_gateway::config::{Config, UpstreamConfig};
use webirc_gateway::gateway::{ConnInfo, Gateway};
use webirc_gateway::irc::Message;
use webirc_gateway::session::{Dest, SessionState, Signal};

const WAIT: Duration = Duration::from_secs(5);

struct MockConn {
    lines: mpsc::Receiver<String>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl MockConn {
    async fn expect_line(&mut self) -> String {
        timeout(WAIT, self.lines.recv())
            .await
            .expect("timed out waiting for an upstream line")
            .expect("upstream connection closed")
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("mock upstream write failed");
    }
}

/// Loopback IRCd stand-in. Yields one `MockConn` per accepted connection.
async fn mock_upstream() -> (SocketAddr, mpsc::Receiver<MockConn>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn_tx, conn_rx) = mpsc::channel(8);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let (read_half, write_half) = stream.into_split();
            let (line_tx, line_rx) = mpsc::channel(200);

            tokio::spawn(async move {
                let mut reader = BufReader::new(read_half);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let line = String::from_utf8_lossy(&buf)
                                .trim_end_matches(['\r', '\n'])
                                .to_string();
                            if line_tx.send(line).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            if conn_tx
                .send(MockConn {
                    lines: line_rx,
                    writer: write_half,
                })
                .await
                .is_err()
            {
                break;
            }
        }
    });

    (addr, conn_rx)
}

fn config_for(addr: SocketAddr) -> Config {
    Config {
        upstreams: vec![UpstreamConfig {
            hostname: "127.0.0.1".to_string(),
            port: addr.port(),
            network: "tcp".to_string(),
            timeout_secs: 5,
            webirc_password: "pw".to_string(),
            ..UpstreamConfig::default()
        }],
        secret: "test-signing-secret".to_string(),
        ..Config::default()
    }
}

fn conn_info() -> ConnInfo {
    ConnInfo {
        origin: String::new(),
        remote_addr: "10.1.2.3".to_string(),
        remote_hostname: "client.example.net".to_string(),
        tags: HashMap::new(),
        secure: true,
    }
}

async fn next_signal(signals: &mut mpsc::Receiver<Signal>) -> Signal {
    timeout(WAIT, signals.recv())
        .await
        .expect("timed out waiting for a signal")
        .expect("signal stream closed")
}

/// Next `data` signal, skipping lifecycle markers.
async fn next_data(signals: &mut mpsc::Receiver<Signal>) -> String {
    loop {
        if let Signal::Data(line) = next_signal(signals).await {
            return line;
        }
    }
}

async fn expect_stream_end(signals: &mut mpsc::Receiver<Signal>) {
    loop {
        match timeout(WAIT, signals.recv())
            .await
            .expect("timed out waiting for the signal stream to end")
        {
            Some(_) => continue,
            None => return,
        }
    }
}

/// Drive a fresh session through NICK/USER and the upstream 001.
async fn register(
    gateway: &Arc<Gateway>,
    conns: &mut mpsc::Receiver<MockConn>,
    nick: &str,
) -> (
    Arc<webirc_gateway::session::ClientSession>,
    mpsc::Receiver<Signal>,
    MockConn,
) {
    let (session, mut signals) = gateway.new_client(conn_info()).await.unwrap();
    session.deliver_from_transport(format!("NICK {nick}"));
    session.deliver_from_transport(format!("USER {nick} 0 * :Test User"));

    let mut upstream = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    assert!(upstream.expect_line().await.starts_with("WEBIRC "));
    assert_eq!(upstream.expect_line().await, format!("NICK {nick}"));
    assert_eq!(upstream.expect_line().await, format!("USER {nick} 0 * :Test User"));
    assert_eq!(next_signal(&mut signals).await, Signal::connected());

    upstream.send(&format!(":srv 001 {nick} :Welcome")).await;
    assert_eq!(next_data(&mut signals).await, format!(":srv 001 {nick} :Welcome"));
    assert_eq!(session.state(), SessionState::Connected);

    (session, signals, upstream)
}

// ── S1: happy path ──────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_registration_and_isupport_injection() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));

    let (session, mut signals) = gateway.new_client(conn_info()).await.unwrap();
    assert_eq!(session.state(), SessionState::Idle);

    session.deliver_from_transport("NICK alice".to_string());
    session.deliver_from_transport("USER alice 0 * :Alice".to_string());

    let mut upstream = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    assert_eq!(
        upstream.expect_line().await,
        "WEBIRC pw webircgateway client.example.net 10.1.2.3 :"
    );
    assert_eq!(upstream.expect_line().await, "NICK alice");
    assert_eq!(upstream.expect_line().await, "USER alice 0 * :Alice");

    assert_eq!(next_signal(&mut signals).await, Signal::connected());

    upstream.send(":srv 001 alice :Welcome").await;
    upstream
        .send(":srv 005 alice CHANTYPES=# NETWORK=Example :are supported by this server")
        .await;
    upstream.send(":srv 375 alice :- message of the day").await;

    assert_eq!(next_data(&mut signals).await, ":srv 001 alice :Welcome");
    assert_eq!(
        next_data(&mut signals).await,
        ":srv 005 alice CHANTYPES=# NETWORK=Example :are supported by this server"
    );
    // The synthetic 005 carries our injected tokens, before the first
    // non-005 line.
    assert_eq!(
        next_data(&mut signals).await,
        ":srv 005 alice EXTJWT=1 :are supported by this server"
    );
    assert_eq!(next_data(&mut signals).await, ":srv 375 alice :- message of the day");

    assert_eq!(session.state(), SessionState::Connected);
    assert!(session.irc_state.isupport.has_token("EXTJWT"));
}

#[tokio::test]
async fn isupport_injection_happens_exactly_once() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));
    let (_session, mut signals, mut upstream) = register(&gateway, &mut conns, "alice").await;

    upstream.send(":srv 005 alice A=1 :are supported by this server").await;
    upstream.send(":srv 005 alice B=2 :are supported by this server").await;
    upstream.send(":srv 375 alice :- motd").await;
    upstream.send(":srv 372 alice :- line").await;
    upstream.send(":srv 376 alice :End of MOTD").await;

    let mut synthetic_count = 0;
    for _ in 0..6 {
        let line = next_data(&mut signals).await;
        if line.contains("EXTJWT=1") {
            synthetic_count += 1;
            // Strictly before the first non-005: the previous data line was
            // still a 005 and the next one is the 375.
            assert_eq!(next_data(&mut signals).await, ":srv 375 alice :- motd");
            break;
        }
    }
    assert_eq!(synthetic_count, 1);

    // No further synthetic 005s after the remaining lines.
    assert_eq!(next_data(&mut signals).await, ":srv 372 alice :- line");
    assert_eq!(next_data(&mut signals).await, ":srv 376 alice :End of MOTD");
}

#[tokio::test]
async fn native_extjwt_disables_emulation() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));
    let (session, mut signals, mut upstream) = register(&gateway, &mut conns, "alice").await;

    upstream
        .send(":srv 005 alice EXTJWT=1 :are supported by this server")
        .await;
    upstream.send(":srv 375 alice :- motd").await;

    assert_eq!(
        next_data(&mut signals).await,
        ":srv 005 alice EXTJWT=1 :are supported by this server"
    );
    // No synthetic 005; the 375 comes straight through.
    assert_eq!(next_data(&mut signals).await, ":srv 375 alice :- motd");

    // With the feature off, EXTJWT belongs to the server.
    session.deliver_from_transport("EXTJWT *".to_string());
    assert_eq!(upstream.expect_line().await, "EXTJWT *");
}

// ── S2: HOST redirection ────────────────────────────────────────────────

#[tokio::test]
async fn host_command_sets_destination_and_is_absorbed() {
    let (addr, mut conns) = mock_upstream().await;
    let mut config = config_for(addr);
    config.gateway = true;
    let gateway = Gateway::new(config);

    let (session, _signals) = gateway.new_client(conn_info()).await.unwrap();
    session.deliver_from_transport("HOST irc.example.net:+6697".to_string());

    // Absorbed, and no dial yet: NICK/USER haven't arrived.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        session.dest(),
        Some(Dest {
            host: "irc.example.net".to_string(),
            port: 6697,
            tls: true,
        })
    );
    assert!(conns.try_recv().is_err());
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn host_destination_outside_whitelist_is_refused() {
    let (addr, mut conns) = mock_upstream().await;
    let mut config = config_for(addr);
    config.gateway = true;
    config.gateway_whitelist = vec!["*.example.net".to_string()];
    let gateway = Gateway::new(config);

    let (session, mut signals) = gateway.new_client(conn_info()).await.unwrap();
    session.deliver_from_transport("HOST irc.evil.org:6667".to_string());
    session.deliver_from_transport("NICK alice".to_string());
    session.deliver_from_transport("USER alice 0 * :Alice".to_string());

    assert_eq!(
        next_signal(&mut signals).await,
        Signal::Data("ERROR :Not allowed to connect to irc.evil.org".to_string())
    );
    assert_eq!(
        next_signal(&mut signals).await,
        Signal::closed(Some("err_forbidden".to_string()))
    );
    expect_stream_end(&mut signals).await;

    assert!(conns.try_recv().is_err());
    assert_eq!(gateway.clients.len(), 0);
}

// ── S3: CAPTCHA gating ──────────────────────────────────────────────────

/// Minimal HTTP endpoint answering every POST with a captcha success.
async fn mock_captcha_endpoint() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let body = br#"{"success":true}"#;
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(body).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn captcha_failure_closes_with_bad_captcha() {
    let (addr, mut conns) = mock_upstream().await;
    let mut config = config_for(addr);
    config.requires_verification = true;
    // Nothing listens here, so verification fails closed.
    config.recaptcha_url = "http://127.0.0.1:1/verify".to_string();
    let gateway = Gateway::new(config);

    let (session, mut signals) = gateway.new_client(conn_info()).await.unwrap();
    session.deliver_from_transport("NICK alice".to_string());
    session.deliver_from_transport("USER alice 0 * :Alice".to_string());

    // Unverified: no dial happens.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(conns.try_recv().is_err());

    session.deliver_from_transport("CAPTCHA bad-token".to_string());
    assert_eq!(
        next_signal(&mut signals).await,
        Signal::Data("ERROR :Invalid captcha".to_string())
    );
    assert_eq!(
        next_signal(&mut signals).await,
        Signal::closed(Some("bad_captcha".to_string()))
    );
    expect_stream_end(&mut signals).await;
    assert_eq!(gateway.clients.len(), 0);
}

#[tokio::test]
async fn captcha_success_dials_exactly_once() {
    let (addr, mut conns) = mock_upstream().await;
    let captcha_addr = mock_captcha_endpoint().await;
    let mut config = config_for(addr);
    config.requires_verification = true;
    config.recaptcha_url = format!("http://{captcha_addr}/verify");
    config.recaptcha_secret = "s".to_string();
    let gateway = Gateway::new(config);

    let (session, mut signals) = gateway.new_client(conn_info()).await.unwrap();
    session.deliver_from_transport("NICK alice".to_string());
    session.deliver_from_transport("USER alice 0 * :Alice".to_string());
    session.deliver_from_transport("CAPTCHA good-token".to_string());

    let mut upstream = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    assert!(upstream.expect_line().await.starts_with("WEBIRC "));
    assert_eq!(next_signal(&mut signals).await, Signal::connected());

    // Further registration traffic must not trigger a second dial.
    session.deliver_from_transport("NICK alice2".to_string());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(conns.try_recv().is_err());
}

// ── No double connect across NICK/USER replays ──────────────────────────

#[tokio::test]
async fn at_most_one_upstream_dial() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));

    let (session, _signals) = gateway.new_client(conn_info()).await.unwrap();
    session.deliver_from_transport("NICK alice".to_string());
    session.deliver_from_transport("USER alice 0 * :Alice".to_string());
    session.deliver_from_transport("NICK bob".to_string());
    session.deliver_from_transport("USER bob 0 * :Bob".to_string());

    assert!(timeout(WAIT, conns.recv()).await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(conns.try_recv().is_err(), "second upstream dial observed");
}

// ── S4: message-tags emulation ──────────────────────────────────────────

#[tokio::test]
async fn cap_ls_injection_and_synthesized_ack() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));

    let (session, mut signals) = gateway.new_client(conn_info()).await.unwrap();
    session.deliver_from_transport("CAP LS 302".to_string());
    session.deliver_from_transport("NICK alice".to_string());
    session.deliver_from_transport("USER alice 0 * :Alice".to_string());

    let mut upstream = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    assert!(upstream.expect_line().await.starts_with("WEBIRC "));
    assert_eq!(upstream.expect_line().await, "CAP LS 302");
    assert_eq!(upstream.expect_line().await, "NICK alice");
    assert_eq!(upstream.expect_line().await, "USER alice 0 * :Alice");
    assert_eq!(next_signal(&mut signals).await, Signal::connected());

    // The server doesn't advertise message-tags; the gateway injects it.
    upstream.send(":srv CAP * LS :sasl account-tag").await;
    assert_eq!(
        next_data(&mut signals).await,
        ":srv CAP * LS :sasl account-tag message-tags"
    );

    // message-tags alone: absorbed and acknowledged by the gateway itself.
    session.deliver_from_transport("CAP REQ :message-tags".to_string());
    assert_eq!(next_data(&mut signals).await, "CAP * ACK :message-tags");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(upstream.lines.try_recv().is_err(), "REQ leaked upstream");
}

#[tokio::test]
async fn cap_req_strips_message_tags_and_rewrites_ack() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));

    let (session, mut signals) = gateway.new_client(conn_info()).await.unwrap();
    session.deliver_from_transport("CAP LS 302".to_string());
    session.deliver_from_transport("NICK alice".to_string());
    session.deliver_from_transport("USER alice 0 * :Alice".to_string());

    let mut upstream = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    for _ in 0..4 {
        upstream.expect_line().await; // WEBIRC, CAP LS, NICK, USER
    }

    session.deliver_from_transport("CAP REQ :server-time message-tags".to_string());
    // The rebuilt REQ is serialized canonically; a single remaining cap
    // needs no trailing colon.
    assert_eq!(upstream.expect_line().await, "CAP REQ server-time");

    upstream.send(":srv CAP * ACK :server-time").await;
    assert_eq!(
        next_data(&mut signals).await,
        ":srv CAP * ACK :server-time message-tags"
    );
}

#[tokio::test]
async fn client_tags_round_trip_to_other_session() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));

    // Both clients negotiate CAP, so both have tag emulation on.
    let (alice, mut alice_signals) = gateway.new_client(conn_info()).await.unwrap();
    alice.deliver_from_transport("CAP LS 302".to_string());
    alice.deliver_from_transport("NICK alice".to_string());
    alice.deliver_from_transport("USER alice 0 * :Alice".to_string());
    let mut alice_upstream = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    for _ in 0..4 {
        alice_upstream.expect_line().await;
    }
    assert_eq!(next_signal(&mut alice_signals).await, Signal::connected());

    let (bob, mut bob_signals) = gateway.new_client(conn_info()).await.unwrap();
    bob.deliver_from_transport("CAP LS 302".to_string());
    bob.deliver_from_transport("NICK bob".to_string());
    bob.deliver_from_transport("USER bob 0 * :Bob".to_string());
    let mut bob_upstream = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    for _ in 0..4 {
        bob_upstream.expect_line().await;
    }
    assert_eq!(next_signal(&mut bob_signals).await, Signal::connected());

    // Alice sends a tagged PRIVMSG; the wire copy is stripped.
    alice.deliver_from_transport("@+draft/reply=abc123 PRIVMSG #chan :hello".to_string());
    assert_eq!(alice_upstream.expect_line().await, "PRIVMSG #chan :hello");

    // The server's copy reaches bob with the tags re-attached.
    bob_upstream.send(":alice!u@h PRIVMSG #chan :hello").await;
    assert_eq!(
        next_data(&mut bob_signals).await,
        "@+draft/reply=abc123 :alice!u@h PRIVMSG #chan :hello"
    );
}

#[tokio::test]
async fn tagmsg_fans_out_to_local_channel_members() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));

    let (alice, mut alice_signals, mut alice_upstream) =
        register(&gateway, &mut conns, "alice").await;
    alice.deliver_from_transport("CAP LS 302".to_string());
    assert_eq!(alice_upstream.expect_line().await, "CAP LS 302");

    let (bob, mut bob_signals, mut bob_upstream) = register(&gateway, &mut conns, "bob").await;
    bob.deliver_from_transport("CAP LS 302".to_string());
    assert_eq!(bob_upstream.expect_line().await, "CAP LS 302");

    // Bob joins #kiwi (as seen from his upstream).
    bob_upstream.send(":bob!u@h JOIN #kiwi").await;
    assert_eq!(next_data(&mut bob_signals).await, ":bob!u@h JOIN #kiwi");
    assert!(bob.irc_state.has_channel("#kiwi"));

    // Alice's TAGMSG to #kiwi is absorbed and delivered to bob directly.
    alice.deliver_from_transport("@+typing=active TAGMSG #kiwi".to_string());
    assert_eq!(
        next_data(&mut bob_signals).await,
        "@+typing=active :alice TAGMSG #kiwi"
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(alice_upstream.lines.try_recv().is_err(), "TAGMSG leaked upstream");
    drop(alice_signals);
}

// ── S5 / EXTJWT ─────────────────────────────────────────────────────────

#[tokio::test]
async fn extjwt_unknown_channel_gets_403() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));
    let (session, mut signals, _upstream) = register(&gateway, &mut conns, "alice").await;

    session.deliver_from_transport("EXTJWT #nosuch".to_string());
    assert_eq!(
        next_data(&mut signals).await,
        ":srv 403 alice #nosuch :No such channel"
    );
}

#[tokio::test]
async fn extjwt_unknown_service_fails() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));
    let (session, mut signals, _upstream) = register(&gateway, &mut conns, "alice").await;

    session.deliver_from_transport("EXTJWT * some-service".to_string());
    assert_eq!(
        next_data(&mut signals).await,
        "FAIL EXTJWT NO_SUCH_SERVICE :No such service"
    );
}

#[tokio::test]
async fn extjwt_token_chunks_reassemble_into_a_signed_jwt() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));
    let (session, mut signals, mut upstream) = register(&gateway, &mut conns, "alice").await;

    upstream.send(":alice!u@h JOIN #averylongchannelname").await;
    assert_eq!(
        next_data(&mut signals).await,
        ":alice!u@h JOIN #averylongchannelname"
    );

    session.deliver_from_transport("EXTJWT #averylongchannelname".to_string());

    let mut token = String::new();
    loop {
        let line = next_data(&mut signals).await;
        let message = Message::parse(&line).unwrap();
        assert_eq!(message.command, "EXTJWT");
        assert_eq!(message.params[0], "#averylongchannelname");
        assert_eq!(message.params[1], "*");

        if message.params.len() == 4 {
            assert_eq!(message.params[2], "*", "continuation marker missing");
            token.push_str(&message.params[3]);
        } else {
            token.push_str(&message.params[2]);
            break;
        }
    }

    // Compact JWT: three non-empty base64url segments.
    let segments: Vec<&str> = token.split('.').collect();
    assert_eq!(segments.len(), 3);
    assert!(segments.iter().all(|s| !s.is_empty()));

    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    let claims: serde_json::Value =
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segments[1]).unwrap()).unwrap();
    assert_eq!(claims["sub"], "alice");
    assert_eq!(claims["channel"], "#averylongchannelname");
    assert_eq!(claims["iss"], "127.0.0.1");
    assert!(claims["exp"].as_u64().unwrap() > 0);
}

// ── S6: upstream dies mid-session ───────────────────────────────────────

#[tokio::test]
async fn upstream_death_closes_cleanly_without_synthetic_quit() {
    let (addr, mut conns) = mock_upstream().await;
    let mut config = config_for(addr);
    config.send_quit_on_client_close = "Connection closed".to_string();
    let gateway = Gateway::new(config);

    let (session, mut signals, mut upstream) = register(&gateway, &mut conns, "alice").await;

    upstream.send(":alice!u@h JOIN #kiwi").await;
    assert_eq!(next_data(&mut signals).await, ":alice!u@h JOIN #kiwi");

    // Server goes away.
    drop(upstream.writer);
    let mut saw_closed = false;
    loop {
        match timeout(WAIT, signals.recv()).await.unwrap() {
            Some(Signal::State { kind: "closed", code }) => {
                assert_eq!(code, None);
                saw_closed = true;
            }
            Some(_) => continue,
            None => break,
        }
    }
    assert!(saw_closed);
    assert_eq!(gateway.clients.len(), 0);
    assert_eq!(session.state(), SessionState::Ending);

    // The upstream is gone; nothing more arrives on its reader, in
    // particular no synthetic QUIT.
    assert!(upstream.lines.try_recv().is_err());
}

// ── Shutdown discipline ─────────────────────────────────────────────────

#[tokio::test]
async fn client_close_sends_configured_quit() {
    let (addr, mut conns) = mock_upstream().await;
    let mut config = config_for(addr);
    config.send_quit_on_client_close = "Client disconnected".to_string();
    let gateway = Gateway::new(config);

    let (session, signals, mut upstream) = register(&gateway, &mut conns, "alice").await;

    drop(signals);
    session.start_shutdown("client_closed").await;

    assert_eq!(upstream.expect_line().await, "QUIT :Client disconnected");
    assert_eq!(gateway.clients.len(), 0);
}

#[tokio::test]
async fn explicit_client_quit_suppresses_synthetic_quit() {
    let (addr, mut conns) = mock_upstream().await;
    let mut config = config_for(addr);
    config.send_quit_on_client_close = "Client disconnected".to_string();
    let gateway = Gateway::new(config);

    let (session, signals, mut upstream) = register(&gateway, &mut conns, "alice").await;

    session.deliver_from_transport("QUIT :bye".to_string());
    assert_eq!(upstream.expect_line().await, "QUIT :bye");

    drop(signals);
    session.start_shutdown("client_closed").await;

    // The write direction closes without another QUIT.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(upstream.lines.try_recv().is_err());
}

#[tokio::test]
async fn shutdown_is_idempotent_and_registry_balances() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));

    let (first, first_signals, _first_upstream) = register(&gateway, &mut conns, "alice").await;
    let (second, second_signals) = gateway.new_client(conn_info()).await.unwrap();
    assert_eq!(gateway.clients.len(), 2);

    drop(first_signals);
    first.start_shutdown("client_closed").await;
    first.start_shutdown("client_closed").await;
    first.start_shutdown("upstream_closed").await;
    assert_eq!(gateway.clients.len(), 1);

    drop(second_signals);
    second.start_shutdown("client_closed").await;
    assert_eq!(gateway.clients.len(), 0);
    assert_eq!(first.state(), SessionState::Ending);
    assert_eq!(second.state(), SessionState::Ending);
}

#[tokio::test]
async fn signals_after_shutdown_are_silent_noops() {
    let (addr, _conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));

    let (session, mut signals) = gateway.new_client(conn_info()).await.unwrap();
    session.start_shutdown("client_closed").await;

    // The stream ends; later sends go nowhere and don't panic.
    expect_stream_end(&mut signals).await;
    session.send_irc_error("too late").await;
}

// ── Channel tracking ────────────────────────────────────────────────────

#[tokio::test]
async fn channel_membership_tracks_join_part_quit() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));
    let (session, mut signals, mut upstream) = register(&gateway, &mut conns, "alice").await;

    upstream.send(":alice!u@h JOIN #Kiwi").await;
    next_data(&mut signals).await;
    assert!(session.irc_state.has_channel("#kiwi"));
    assert!(session.irc_state.has_channel("#KIWI"));

    // Someone else's JOIN is not ours.
    upstream.send(":carol!u@h JOIN #other").await;
    next_data(&mut signals).await;
    assert!(!session.irc_state.has_channel("#other"));

    upstream.send(":alice!u@h PART #kiwi").await;
    next_data(&mut signals).await;
    assert!(!session.irc_state.has_channel("#Kiwi"));

    upstream.send(":alice!u@h JOIN #a").await;
    upstream.send(":alice!u@h JOIN #b").await;
    next_data(&mut signals).await;
    next_data(&mut signals).await;
    upstream.send(":alice!u@h QUIT :bye").await;
    next_data(&mut signals).await;
    assert!(!session.irc_state.has_channel("#a"));
    assert!(!session.irc_state.has_channel("#b"));
}

#[tokio::test]
async fn mode_changes_on_own_nick_are_tracked() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));
    let (session, mut signals, mut upstream) = register(&gateway, &mut conns, "alice").await;

    upstream.send(":alice!u@h JOIN #kiwi").await;
    next_data(&mut signals).await;

    upstream.send(":op!u@h MODE #kiwi +ov alice carol").await;
    next_data(&mut signals).await;
    let channel = session.irc_state.get_channel("#kiwi").unwrap();
    assert!(channel.modes.contains_key("o"));
    assert!(!channel.modes.contains_key("v"));

    upstream.send(":op!u@h MODE #kiwi -o alice").await;
    next_data(&mut signals).await;
    let channel = session.irc_state.get_channel("#kiwi").unwrap();
    assert!(!channel.modes.contains_key("o"));
}

// ── Nick and account tracking ───────────────────────────────────────────

#[tokio::test]
async fn server_forced_nick_change_and_account_numerics() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));
    let (session, mut signals, mut upstream) = register(&gateway, &mut conns, "alice").await;

    upstream.send(":alice!u@h NICK alice2").await;
    next_data(&mut signals).await;
    assert_eq!(session.irc_state.nick(), "alice2");

    upstream
        .send(":srv 900 alice2 alice2!u@h acct :You are now logged in as acct")
        .await;
    next_data(&mut signals).await;
    assert_eq!(session.irc_state.account(), "acct");

    upstream.send(":srv 901 alice2 alice2!u@h :You are now logged out").await;
    next_data(&mut signals).await;
    assert_eq!(session.irc_state.account(), "");
}

// ── ENCODING ────────────────────────────────────────────────────────────

#[tokio::test]
async fn encoding_command_is_absorbed() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));
    let (session, _signals, mut upstream) = register(&gateway, &mut conns, "alice").await;

    session.deliver_from_transport("ENCODING ISO-8859-1".to_string());
    session.deliver_from_transport("PING :x".to_string());
    // The PING arrives, the ENCODING never does.
    assert_eq!(upstream.expect_line().await, "PING :x");
    assert_eq!(session.encoding(), "ISO-8859-1");
}

// ── Throttling ──────────────────────────────────────────────────────────

#[tokio::test]
async fn post_registration_throttle_paces_client_lines() {
    let (addr, mut conns) = mock_upstream().await;
    let mut config = config_for(addr);
    config.upstreams[0].throttle = 50;
    let gateway = Gateway::new(config);

    let (session, _signals, mut upstream) = register(&gateway, &mut conns, "alice").await;

    let start = Instant::now();
    for i in 0..6 {
        session.deliver_from_transport(format!("PRIVMSG #chan :line {i}"));
    }
    for i in 0..6 {
        assert_eq!(upstream.expect_line().await, format!("PRIVMSG #chan :line {i}"));
    }
    // Burst of 1, then 50/s: six lines need at least ~100ms.
    assert!(
        start.elapsed() >= Duration::from_millis(80),
        "lines were not throttled: {:?}",
        start.elapsed()
    );
}

// ── PASS handling ───────────────────────────────────────────────────────

#[tokio::test]
async fn server_password_wins_over_client_pass() {
    let (addr, mut conns) = mock_upstream().await;
    let mut config = config_for(addr);
    config.upstreams[0].server_password = "server-pw".to_string();
    let gateway = Gateway::new(config);

    let (session, _signals) = gateway.new_client(conn_info()).await.unwrap();
    session.deliver_from_transport("PASS client-pw".to_string());
    session.deliver_from_transport("NICK alice".to_string());
    session.deliver_from_transport("USER alice 0 * :Alice".to_string());

    let mut upstream = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    assert!(upstream.expect_line().await.starts_with("WEBIRC "));
    assert_eq!(upstream.expect_line().await, "PASS server-pw");
    // The client's own PASS was suppressed; next line is the NICK.
    assert_eq!(upstream.expect_line().await, "NICK alice");
    assert_eq!(session.irc_state.password(), "client-pw");
}

#[tokio::test]
async fn client_pass_flows_when_no_server_password() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));

    let (session, _signals) = gateway.new_client(conn_info()).await.unwrap();
    session.deliver_from_transport("PASS client-pw".to_string());
    session.deliver_from_transport("NICK alice".to_string());
    session.deliver_from_transport("USER alice 0 * :Alice".to_string());

    let mut upstream = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    assert!(upstream.expect_line().await.starts_with("WEBIRC "));
    assert_eq!(upstream.expect_line().await, "PASS client-pw");
    assert_eq!(upstream.expect_line().await, "NICK alice");
}

// ── Templates and WEBIRC details ────────────────────────────────────────

#[tokio::test]
async fn username_and_realname_templates_apply() {
    let (addr, mut conns) = mock_upstream().await;
    let mut config = config_for(addr);
    config.client_username = "%i".to_string();
    config.client_realname = "%h".to_string();
    let gateway = Gateway::new(config);

    let (session, _signals) = gateway.new_client(conn_info()).await.unwrap();
    session.deliver_from_transport("NICK alice".to_string());
    session.deliver_from_transport("USER ignored 0 * :Ignored".to_string());

    let mut upstream = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    assert!(upstream.expect_line().await.starts_with("WEBIRC "));
    assert_eq!(upstream.expect_line().await, "NICK alice");
    // 10.1.2.3 → 0a010203; realname is the reverse hostname.
    assert_eq!(
        upstream.expect_line().await,
        "USER 0a010203 0 * :client.example.net"
    );
}

#[tokio::test]
async fn webirc_tags_and_ipv6_prefix() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));

    let mut info = conn_info();
    info.remote_addr = "::1".to_string();
    info.tags.insert("secure".to_string(), String::new());
    info.tags.insert("local-port".to_string(), "443".to_string());

    let (session, _signals) = gateway.new_client(info).await.unwrap();
    session.deliver_from_transport("NICK alice".to_string());
    session.deliver_from_transport("USER alice 0 * :Alice".to_string());

    let mut upstream = timeout(WAIT, conns.recv()).await.unwrap().unwrap();
    assert_eq!(
        upstream.expect_line().await,
        "WEBIRC pw webircgateway client.example.net 0::1 :local-port=443 secure"
    );
}

// ── Tolerance: unparseable lines pass through ───────────────────────────

#[tokio::test]
async fn garbage_lines_are_forwarded_verbatim() {
    let (addr, mut conns) = mock_upstream().await;
    let gateway = Gateway::new(config_for(addr));
    let (session, mut signals, mut upstream) = register(&gateway, &mut conns, "alice").await;

    session.deliver_from_transport("  ".to_string());
    session.deliver_from_transport("PING :ok".to_string());
    // Whitespace doesn't parse as a message; the tolerance rule forwards it
    // raw rather than eating it.
    assert_eq!(upstream.expect_line().await, "  ");
    assert_eq!(upstream.expect_line().await, "PING :ok");

    upstream.send(":srv 999 alice :some unknown numeric").await;
    assert_eq!(next_data(&mut signals).await, ":srv 999 alice :some unknown numeric");
}
