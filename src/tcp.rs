//! Raw TCP transport: newline-framed IRC lines both ways.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::gateway::Gateway;
use crate::session::Signal;

pub async fn serve(gateway: Arc<Gateway>, listen_addr: &str) -> Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "tcp listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let gateway = gateway.clone();
        tokio::spawn(async move {
            handle_conn(gateway, stream, peer).await;
        });
    }
}

async fn handle_conn(gateway: Arc<Gateway>, stream: TcpStream, peer: SocketAddr) {
    let info = gateway.build_conn_info("", peer.ip(), false).await;
    let (session, mut signals) = match gateway.new_client(info).await {
        Ok(admitted) => admitted,
        Err(e) => {
            tracing::info!(%peer, "client refused: {e}");
            return;
        }
    };
    tracing::debug!(session = session.id, %peer, "new tcp client");

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        tokio::select! {
            read = reader.read_line(&mut line) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
                    session.deliver_from_transport(trimmed);
                    line.clear();
                }
            },

            signal = signals.recv() => match signal {
                Some(Signal::Data(out)) => {
                    if writer.write_all(format!("{out}\r\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
                Some(Signal::State { .. }) => {}
                None => break,
            },
        }
    }

    drop(signals);
    session.start_shutdown("client_closed").await;
}
