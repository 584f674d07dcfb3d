//! Ident (RFC 1413) responder for upstream connections.
//!
//! IRC servers commonly look up the connecting port pair on the gateway's
//! ident port. Each session registers its upstream (local, remote) port pair
//! while the connection is alive.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

#[derive(Default)]
pub struct IdentdRegistry {
    entries: Mutex<HashMap<(u16, u16), String>>,
}

impl IdentdRegistry {
    pub fn new() -> IdentdRegistry {
        IdentdRegistry::default()
    }

    pub fn add_ident(&self, local_port: u16, remote_port: u16, ident: &str) {
        self.entries
            .lock()
            .insert((local_port, remote_port), ident.to_string());
    }

    pub fn remove_ident(&self, local_port: u16, remote_port: u16) {
        self.entries.lock().remove(&(local_port, remote_port));
    }

    pub fn lookup(&self, local_port: u16, remote_port: u16) -> Option<String> {
        self.entries.lock().get(&(local_port, remote_port)).cloned()
    }
}

/// Accept loop for the ident port. Each query is a single
/// `local-port, remote-port` line answered with a USERID or ERROR reply.
pub async fn run(registry: Arc<IdentdRegistry>, listen_addr: &str) -> Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "identd listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let registry = registry.clone();
        tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(stream);
            let mut line = String::new();
            if BufReader::new(reader).read_line(&mut line).await.is_err() {
                return;
            }

            let Some((local_port, remote_port)) = parse_query(&line) else {
                return;
            };

            let reply = match registry.lookup(local_port, remote_port) {
                Some(ident) => {
                    format!("{local_port}, {remote_port} : USERID : UNIX : {ident}\r\n")
                }
                None => format!("{local_port}, {remote_port} : ERROR : NO-USER\r\n"),
            };
            if let Err(e) = writer.write_all(reply.as_bytes()).await {
                tracing::debug!(%peer, "identd write failed: {e}");
            }
        });
    }
}

fn parse_query(line: &str) -> Option<(u16, u16)> {
    let (local, remote) = line.split_once(',')?;
    let local_port: u16 = local.trim().parse().ok()?;
    let remote_port: u16 = remote.trim().parse().ok()?;
    if local_port == 0 || remote_port == 0 {
        return None;
    }
    Some((local_port, remote_port))
}
