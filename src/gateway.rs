//! Process-wide gateway state.
//!
//! Owns the session registry, the configuration snapshot, and the helpers
//! shared by every session: the message-tag store, the hook registry, the
//! identd registry, the CAPTCHA verifier, and the DNS resolver. Sessions hold
//! an `Arc` back to the gateway and unregister themselves inside their
//! shutdown latch.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::{Config, DnsblAction};
use crate::dnsbl;
use crate::hooks::{GatewayClosing, HookRegistry, NewClientError, StatusClient};
use crate::identd::IdentdRegistry;
use crate::recaptcha::Verifier;
use crate::session::{ClientSession, Signal};
use crate::tags::MessageTagStore;

/// Immutable snapshot of where a client connection came from.
#[derive(Debug, Clone, Default)]
pub struct ConnInfo {
    pub origin: String,
    pub remote_addr: String,
    pub remote_hostname: String,
    /// Extra key/value pairs passed upstream via WEBIRC.
    pub tags: HashMap<String, String>,
    pub secure: bool,
}

#[derive(Debug, Error)]
pub enum RefuseReason {
    #[error("origin not allowed")]
    OriginNotAllowed,
}

pub struct Gateway {
    pub config: Config,
    pub clients: DashMap<u64, Arc<ClientSession>>,
    pub message_tags: MessageTagStore,
    pub hooks: HookRegistry,
    pub identd: Arc<IdentdRegistry>,
    pub captcha: Verifier,
    pub resolver: TokioAsyncResolver,
    next_client_id: AtomicU64,
}

impl Gateway {
    pub fn new(config: Config) -> Arc<Gateway> {
        let captcha = Verifier::new(&config.recaptcha_url, &config.recaptcha_secret);
        Arc::new(Gateway {
            config,
            clients: DashMap::new(),
            message_tags: MessageTagStore::new(),
            hooks: HookRegistry::new(),
            identd: Arc::new(IdentdRegistry::new()),
            captcha,
            resolver: dnsbl::resolver(),
            next_client_id: AtomicU64::new(1),
        })
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Build the connection snapshot for a freshly accepted transport,
    /// resolving the client's reverse-DNS hostname.
    pub async fn build_conn_info(&self, origin: &str, remote_ip: IpAddr, secure: bool) -> ConnInfo {
        let remote_hostname = dnsbl::reverse_hostname(&self.resolver, remote_ip).await;
        ConnInfo {
            origin: origin.to_string(),
            remote_addr: remote_ip.to_string(),
            remote_hostname,
            tags: HashMap::new(),
            secure,
        }
    }

    /// Admit a new client: origin allow-list, then DNSBL policy, then session
    /// construction. The returned receiver is the transport's signal stream.
    pub async fn new_client(
        self: &Arc<Gateway>,
        info: ConnInfo,
    ) -> Result<(Arc<ClientSession>, mpsc::Receiver<Signal>), RefuseReason> {
        if !self.config.is_origin_allowed(&info.origin) {
            tracing::info!(origin = %info.origin, addr = %info.remote_addr, "origin not allowed");
            self.hooks.dispatch_new_client_error(&mut NewClientError {
                remote_addr: info.remote_addr.clone(),
                reason: "origin_not_allowed".to_string(),
            });
            return Err(RefuseReason::OriginNotAllowed);
        }

        let mut requires_verification = self.config.requires_verification;

        if !self.config.dnsbl_servers.is_empty() {
            if let Ok(ip) = info.remote_addr.parse::<IpAddr>() {
                if dnsbl::is_listed(&self.resolver, &self.config.dnsbl_servers, ip).await {
                    match self.config.dnsbl_action {
                        DnsblAction::Deny => {
                            // The session exists just long enough to tell the
                            // client why it is being closed.
                            let (session, signals) =
                                ClientSession::spawn(self.clone(), info, requires_verification);
                            session
                                .send_signal(Signal::closed(Some("dnsbl_listed".to_string())))
                                .await;
                            session.start_shutdown("dnsbl_listed").await;
                            return Ok((session, signals));
                        }
                        DnsblAction::Verify => requires_verification = true,
                    }
                }
            }
        }

        Ok(ClientSession::spawn(self.clone(), info, requires_verification))
    }

    /// Tell every session to wind down. Dispatched once, when the process is
    /// asked to stop.
    pub async fn begin_shutdown(&self) {
        self.hooks
            .dispatch_gateway_closing(&mut GatewayClosing { halt: false });
        let sessions: Vec<Arc<ClientSession>> = self
            .clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            session.start_shutdown("gateway_closing").await;
        }
    }

    /// One line per live session, for the status endpoint. Hooks may append.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for entry in self.clients.iter() {
            let session = entry.value();
            lines.push(format!(
                "{} {} {} {}!{}",
                session.info.remote_addr,
                session.info.remote_hostname,
                session.state_name(),
                session.irc_state.nick(),
                session.irc_state.username(),
            ));

            let mut event = StatusClient {
                session_id: session.id,
                extra_lines: Vec::new(),
            };
            self.hooks.dispatch_status_client(&mut event);
            lines.extend(event.extra_lines);
        }
        lines
    }
}
