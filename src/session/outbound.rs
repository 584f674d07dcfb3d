//! Processing for lines received from the upstream server.
//!
//! Tracks the registration and membership state the gateway needs (nick,
//! 001, ISUPPORT, channels, account, modes), injects the synthesized
//! ISUPPORT tokens exactly once, keeps the CAP listing honest about the
//! emulated message-tags capability, and re-attaches stored client tags to
//! server echoes.

use std::sync::Arc;

use crate::hooks;
use crate::irc::{self, Message};
use crate::state::Channel;
use crate::tags;

use super::{ClientSession, SessionState, Signal};

/// Returns the line to deliver downstream, or `None` when absorbed.
/// Unparseable lines pass through untouched.
pub(super) async fn process_line_from_upstream(
    session: &Arc<ClientSession>,
    line: String,
) -> Option<String> {
    let Ok(mut message) = Message::parse(&line) else {
        return Some(line);
    };
    let mut line = line;
    let p_len = message.params.len();
    let command = message.command_upper();
    let prefix_nick = message
        .prefix
        .as_ref()
        .map(|prefix| prefix.nick.clone())
        .unwrap_or_default();
    let from_self = !prefix_nick.is_empty() && prefix_nick == session.irc_state.nick();

    if p_len > 0 && command == "NICK" && from_self {
        session.irc_state.set_nick(&message.params[0]);
    }

    if p_len > 0 && command == irc::RPL_WELCOME {
        session.irc_state.set_nick(&message.params[0]);
        session.set_state(SessionState::Connected);
        if let Some(prefix) = &message.prefix {
            session.set_server_prefix(prefix.clone());
        }

        // Typical IRCd behavior is to never throttle the registration burst,
        // so the limiter only goes in once registration completes.
        let throttle_rate = session
            .upstream_config_snapshot()
            .map(|upstream| upstream.throttle)
            .unwrap_or(0);
        session.throttle_handle().set_rate(throttle_rate);

        session
            .gateway
            .hooks
            .dispatch_client_ready(&mut hooks::ClientReady {
                session_id: session.id,
            });
    }

    if p_len > 1 && command == irc::RPL_ISUPPORT {
        let token_pairs = &message.params[1..p_len - 1];
        session.irc_state.isupport.add_tokens(token_pairs);
        session.irc_state.isupport.set_tags(message.tags.clone());
        session.irc_state.isupport.mark_received();
    }

    // First non-005 after the ISUPPORT burst: inject our own tokens, once,
    // strictly before the current line goes out.
    if session.irc_state.isupport.received()
        && !session.irc_state.isupport.injected()
        && command != irc::RPL_ISUPPORT
    {
        session.irc_state.isupport.mark_injected();

        let mut synthetic = Message {
            tags: Default::default(),
            prefix: session.server_prefix(),
            command: irc::RPL_ISUPPORT.to_string(),
            params: vec![session.irc_state.nick()],
        };

        if session.irc_state.isupport.has_token("EXTJWT") {
            tracing::debug!(session = session.id, "upstream already supports EXTJWT, disabling feature");
            session.features.set_ext_jwt(false);
        } else {
            synthetic.params.push("EXTJWT=1".to_string());
            session.irc_state.isupport.add_token("EXTJWT=1");
        }

        synthetic.params.push("are supported by this server".to_string());
        if let Some(time_tag) = session.irc_state.isupport.get_tag("time") {
            synthetic.tags.insert("time".to_string(), time_tag);
        }

        if synthetic.params.len() > 2 {
            session.send_signal(Signal::Data(synthetic.to_line())).await;
        }
    }

    if p_len > 0 && command == "JOIN" && from_self {
        session
            .irc_state
            .set_channel(Channel::new(message.get_param(0, "")));
    }
    if p_len > 0 && command == "PART" && from_self {
        session.irc_state.remove_channel(message.get_param(0, ""));
    }
    if command == "QUIT" && from_self {
        session.irc_state.clear_channels();
    }

    // :server 900 nick nick!user@host account :You are now logged in as ...
    if p_len > 0 && command == irc::RPL_LOGGEDIN {
        session.irc_state.set_account(message.get_param(2, ""));
    }
    if command == irc::RPL_LOGGEDOUT {
        session.irc_state.set_account("");
    }

    // :nick!user@host MODE #chan +oo alice bob
    if p_len > 0 && command == "MODE" && message.get_param(0, "").starts_with('#') {
        let channel_name = message.get_param(0, "").to_string();
        let modes = message.get_param(1, "").to_string();
        let own_nick = session.irc_state.nick();

        let mut adding = false;
        let mut param_idx = 1;
        for mode in modes.chars() {
            match mode {
                '+' => adding = true,
                '-' => adding = false,
                mode => {
                    param_idx += 1;
                    let param = message.get_param(param_idx, "");
                    if !own_nick.is_empty() && param.eq_ignore_ascii_case(&own_nick) {
                        session
                            .irc_state
                            .set_channel_mode(&channel_name, &mode.to_string(), adding);
                    }
                }
            }
        }
    }

    // CAP * LS [*] :caps. A server with native message-tags turns our
    // emulation off; otherwise the final LS line advertises it for us.
    if p_len >= 3 && command == "CAP" && message.get_param_upper(1) == "LS" {
        let caps = if p_len >= 4 && message.params[2] == "*" {
            message.get_param_upper(3)
        } else {
            message.get_param_upper(2)
        };

        if caps.contains("DRAFT/MESSAGE-TAGS-0.2") || caps.contains("MESSAGE-TAGS") {
            tracing::debug!(session = session.id, "upstream already supports message-tags, disabling feature");
            session.features.set_message_tags(false);
        }

        if session.features.message_tags() && message.params[2] != "*" {
            message.params[2] = format!("{} message-tags", message.params[2]);
            line = message.to_line();
        }
    }

    // If we stripped message-tags out of the client's REQ, fold it back into
    // the server's ACK so the client sees what it asked for.
    if let Some(requested_cap) = session.peek_requested_message_tags_cap() {
        if p_len >= 3
            && command == "CAP"
            && message.get_param_upper(1) == "ACK"
            && !message.get_param_upper(2).contains("MESSAGE-TAGS")
        {
            message.params[2] = format!("{} {}", message.params[2], requested_cap);
            line = message.to_line();
            session.take_requested_message_tags_cap();
        }
    }

    if session.features.message_tags() && tags::can_message_contain_client_tags(&message) {
        if let Some(stored) =
            session
                .gateway
                .message_tags
                .get_tags_from_message(session.id, &prefix_nick, &message)
        {
            for (key, value) in stored {
                message.tags.insert(key, value);
            }
            line = message.to_line();
        }
    }

    Some(line)
}
