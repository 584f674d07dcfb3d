//! Processing for lines sent by the downstream client.
//!
//! Each line is rewritten or absorbed before it is allowed upstream:
//! registration commands feed the connect-when-ready logic, gateway-local
//! commands (CAPTCHA, ENCODING, HOST, EXTJWT) never leave the gateway, and
//! the message-tags emulation strips client tags the server would reject.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

use crate::config::make_client_replacements;
use crate::extjwt;
use crate::irc::{self, Message, Prefix};
use crate::tags;

use super::{ClientSession, Dest, Signal};

/// Caps whose emulation rides on the upstream CAP machinery; a REQ naming
/// none of these means the client isn't using tags at all.
const CAPS_THAT_ENABLE_MESSAGE_TAGS: [&str; 4] =
    ["message-tags", "account-tag", "server-time", "batch"];

/// Returns the line to forward upstream, or `None` when the gateway absorbed
/// it. Unparseable lines pass through untouched.
pub(super) async fn process_line_from_client(
    session: &Arc<ClientSession>,
    line: String,
) -> Option<String> {
    let Ok(mut message) = Message::parse(&line) else {
        return Some(line);
    };
    let mut line = line;
    let command = message.command_upper();

    if !session.verified() && command == "CAPTCHA" {
        let mut verified = false;
        if let Some(response) = message.params.first() {
            verified = session
                .gateway
                .captcha
                .verify_response(response, &session.info.remote_addr)
                .await;
        }

        if verified {
            session.set_verified();
            session.maybe_connect_upstream();
        } else {
            session.send_irc_error("Invalid captcha").await;
            session
                .send_signal(Signal::closed(Some("bad_captcha".to_string())))
                .await;
            session.start_shutdown("unverified").await;
        }
        return None;
    }

    if command == "NICK" && !session.upstream_started() {
        if let Some(nick) = message.params.first() {
            session.irc_state.set_nick(nick);
        }
        session.maybe_connect_upstream();
    }

    // USER <username> <hostname> <servername> <realname>
    if command == "USER" && !session.upstream_started() {
        if message.params.len() < 4 {
            tracing::debug!(session = session.id, "short USER line, forwarding as-is");
            return Some(line);
        }

        let config = &session.gateway.config;
        if !config.client_username.is_empty() {
            message.params[0] = make_client_replacements(
                &config.client_username,
                &session.info.remote_addr,
                &session.info.remote_hostname,
                &session.irc_state.nick(),
            );
        }
        if !config.client_realname.is_empty() {
            message.params[3] = make_client_replacements(
                &config.client_realname,
                &session.info.remote_addr,
                &session.info.remote_hostname,
                &session.irc_state.nick(),
            );
        }

        line = message.to_line();
        session.irc_state.set_username(&message.params[0]);
        session.irc_state.set_realname(&message.params[3]);
        session.maybe_connect_upstream();
    }

    if command == "PASS" && !session.upstream_started() {
        if let Some(password) = message.params.first() {
            session.irc_state.set_password(password);
        }
    }

    if command == "ENCODING" {
        if let Some(label) = message.params.first() {
            if encoding_rs::Encoding::for_label(label.as_bytes()).is_some() {
                tracing::debug!(session = session.id, "set encoding to {label}");
                session.set_encoding(label);
            } else {
                tracing::debug!(session = session.id, "requested unknown encoding {label:?}");
            }
        }
        return None;
    }

    // HOST irc.network.net:6667 / HOST irc.network.net:+6697
    if command == "HOST" && !session.upstream_started() {
        if !session.gateway.config.gateway {
            return None;
        }
        let Some(addr) = message.params.first() else {
            return None;
        };
        if addr.is_empty() {
            session.send_irc_error("Missing host").await;
            session.start_shutdown("missing_host").await;
            return None;
        }
        session.set_dest(parse_host_param(addr));
        return None;
    }

    // A client that negotiates CAP can parse message tags; assume so until
    // the upstream's CAP LS tells us the server handles them natively.
    if command == "CAP" && message.get_param_upper(0) == "LS" {
        tracing::debug!(session = session.id, "enabling message-tags emulation");
        session.features.set_message_tags(true);
    }

    if session.features.message_tags() && command == "CAP" && message.get_param_upper(0) == "REQ" {
        let requested = message.get_param(1, "").to_lowercase();

        if requested.contains("message-tags") {
            // Rebuild the requested list without our emulated cap.
            let mut forwarded_caps = Vec::new();
            for cap in requested.split(' ').filter(|c| !c.is_empty()) {
                if cap.contains("message-tags") {
                    session.set_requested_message_tags_cap(cap);
                } else {
                    forwarded_caps.push(cap.to_string());
                }
            }

            if forwarded_caps.is_empty() {
                // Nothing left for the server, so no ACK will arrive; answer
                // the client ourselves.
                if let Some(cap) = session.take_requested_message_tags_cap() {
                    session.send_signal(Signal::Data(format!("CAP * ACK :{cap}"))).await;
                }
                return None;
            }
            message.params[1] = forwarded_caps.join(" ");
            line = message.to_line();
        } else if !CAPS_THAT_ENABLE_MESSAGE_TAGS.iter().any(|c| requested.contains(c)) {
            session.features.set_message_tags(false);
        }
    }

    if session.features.message_tags() && command == "TAGMSG" {
        fan_out_tagmsg(session, message).await;
        return None;
    }

    if session.features.message_tags() && tags::can_message_contain_client_tags(&message) {
        session.gateway.message_tags.add_tags_from_message(
            session.id,
            &session.irc_state.nick(),
            &message,
        );
        // Client tags never head upstream.
        if message.tags.keys().any(|k| k.starts_with('+')) {
            message.tags.retain(|key, _| !key.starts_with('+'));
            line = message.to_line();
        }
    }

    if session.features.ext_jwt() && command == "EXTJWT" {
        handle_extjwt(session, &message).await;
        return None;
    }

    Some(line)
}

/// TAGMSG never goes upstream; it is delivered directly to every other local
/// session on the same upstream network that is the target or shares the
/// target channel.
async fn fan_out_tagmsg(session: &Arc<ClientSession>, mut message: Message) {
    if message.params.is_empty() {
        return;
    }

    // We can't know the client's full mask, so the synthetic prefix carries
    // the bare nick only.
    message.prefix = Some(Prefix {
        nick: session.irc_state.nick(),
        user: String::new(),
        host: String::new(),
    });

    let Some(this_host) = session.upstream_hostname().map(|h| h.to_lowercase()) else {
        return;
    };
    let target = message.params[0].clone();
    let line = message.to_line();

    let peers: Vec<Arc<ClientSession>> = session
        .gateway
        .clients
        .iter()
        .map(|entry| entry.value().clone())
        .collect();

    for peer in peers {
        if peer.id == session.id {
            continue;
        }
        let same_host = peer
            .upstream_hostname()
            .map(|h| h.to_lowercase() == this_host)
            .unwrap_or(false);
        if !same_host {
            continue;
        }
        if !target.eq_ignore_ascii_case(&peer.irc_state.nick())
            && !peer.irc_state.has_channel(&target)
        {
            continue;
        }
        peer.send_signal(Signal::Data(line.clone())).await;
    }
}

async fn handle_extjwt(session: &Arc<ClientSession>, message: &Message) {
    let token_target = message.get_param(0, "").to_string();
    let token_service = message.get_param(1, "").to_string();

    let issuer = session
        .upstream_config_snapshot()
        .map(|upstream| {
            if upstream.network_common_address.is_empty() {
                upstream.hostname
            } else {
                // Plugins may group several upstream hosts into one network.
                upstream.network_common_address
            }
        })
        .unwrap_or_default();

    let expires = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        + 60;

    let mut claims = json!({
        "exp": expires,
        "iss": issuer,
        "sub": session.irc_state.nick(),
        "account": session.irc_state.account(),
        "umodes": [],
        "channel": "",
        "joined": 0,
        "cmodes": [],
    });

    let mut reply_params: Vec<String> = Vec::new();

    if token_target.is_empty() || token_target == "*" {
        reply_params.push("*".to_string());
    } else {
        let Some(channel) = session.irc_state.get_channel(&token_target) else {
            let nick = session.irc_state.nick();
            let mut fail = Message::new(
                irc::ERR_NOSUCHCHANNEL,
                vec![nick.as_str(), token_target.as_str(), "No such channel"],
            );
            fail.prefix = session.server_prefix();
            session.send_signal(Signal::Data(fail.to_line())).await;
            return;
        };

        reply_params.push(token_target.clone());
        claims["channel"] = json!(channel.name);
        claims["joined"] = json!(channel
            .joined_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0));
        let mut modes: Vec<&String> = channel.modes.keys().collect();
        modes.sort();
        claims["cmodes"] = json!(modes);
    }

    if token_service.is_empty() || token_service == "*" {
        reply_params.push("*".to_string());
    } else {
        session
            .send_irc_fail("EXTJWT", "NO_SUCH_SERVICE", "No such service")
            .await;
        return;
    }

    let token = match extjwt::sign_hs256(&claims, &session.gateway.config.secret) {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!(session = session.id, "error creating EXTJWT token: {e}");
            session
                .send_irc_fail("EXTJWT", "UNKNOWN_ERROR", "Failed to generate token")
                .await;
            return;
        }
    };

    let parts = extjwt::chunk_token(&token);
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        let mut reply = Message {
            tags: Default::default(),
            prefix: session.server_prefix(),
            command: "EXTJWT".to_string(),
            params: reply_params.clone(),
        };
        if i < last {
            reply.params.push("*".to_string());
        }
        reply.params.push(part.to_string());
        session.send_signal(Signal::Data(reply.to_line())).await;
    }
}

/// `host[:port]` with a `+` port prefix meaning TLS. Unparseable ports fall
/// back to the scheme default.
fn parse_host_param(addr: &str) -> Dest {
    match addr.rfind(':') {
        None => Dest {
            host: addr.to_string(),
            port: 6667,
            tls: false,
        },
        Some(idx) => {
            let host = addr[..idx].to_string();
            let port_param = &addr[idx + 1..];
            match port_param.strip_prefix('+') {
                Some(port) => Dest {
                    host,
                    port: port.parse().unwrap_or(6697),
                    tls: true,
                },
                None => Dest {
                    host,
                    port: port_param.parse().unwrap_or(6667),
                    tls: false,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_param_parsing() {
        assert_eq!(
            parse_host_param("irc.example.net"),
            Dest {
                host: "irc.example.net".to_string(),
                port: 6667,
                tls: false
            }
        );
        assert_eq!(
            parse_host_param("irc.example.net:7000"),
            Dest {
                host: "irc.example.net".to_string(),
                port: 7000,
                tls: false
            }
        );
        assert_eq!(
            parse_host_param("irc.example.net:+6697"),
            Dest {
                host: "irc.example.net".to_string(),
                port: 6697,
                tls: true
            }
        );
        // A bare + still means TLS, on the TLS default port.
        assert_eq!(
            parse_host_param("irc.example.net:+"),
            Dest {
                host: "irc.example.net".to_string(),
                port: 6697,
                tls: true
            }
        );
        assert_eq!(
            parse_host_param("irc.example.net:junk"),
            Dest {
                host: "irc.example.net".to_string(),
                port: 6667,
                tls: false
            }
        );
    }
}
