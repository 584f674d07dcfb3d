use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use webirc_gateway::config::Config;
use webirc_gateway::gateway::Gateway;
use webirc_gateway::{identd, tcp, web};

#[tokio::main]
async fn main() -> Result<()> {
    // rustls needs an explicit provider selection before any TLS usage.
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    // JSON logs in production (WEBIRC_GATEWAY_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("WEBIRC_GATEWAY_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("webirc_gateway=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = Config::parse();
    if config.upstreams.is_empty() && !config.gateway {
        tracing::warn!("no upstreams configured and HOST disabled; clients will have nowhere to go");
    }

    let gateway = Gateway::new(config);

    if gateway.config.identd {
        let registry = gateway.identd.clone();
        let listen_addr = gateway.config.identd_listen_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = identd::run(registry, &listen_addr).await {
                tracing::warn!("identd server failed: {e}");
            }
        });
    }

    if let Some(tcp_addr) = gateway.config.tcp_listen_addr.clone() {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = tcp::serve(gateway, &tcp_addr).await {
                tracing::error!("tcp listener failed: {e}");
            }
        });
    }

    let listen_addr = gateway.config.listen_addr.clone();
    tokio::select! {
        result = web::serve(gateway.clone(), &listen_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            gateway.begin_shutdown().await;
            Ok(())
        }
    }
}
