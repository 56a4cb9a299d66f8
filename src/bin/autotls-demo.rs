//! Binary entry point: parses CLI flags, loads layered configuration, bootstraps
//! [`AutoTls`] (directory discovery, account load-or-register, renewal scheduling),
//! starts the port-80 front door, and accepts TLS connections on 443. Grounded in
//! `aicers-bootroot/src/bin/bootroot-agent.rs`'s parse-args → load-settings →
//! spawn-daemon → await-shutdown-signal shape.

use std::sync::Arc;

use acme_autotls::{AutoTls, Args, HttpFrontDoor, Settings};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut settings = Settings::load(args.config.clone())?;
    settings.merge_with_args(&args);
    settings.validate()?;

    info!(server = ?settings.server, domains = ?settings.domains, "starting autotls-demo");

    let auto_tls = AutoTls::bootstrap(settings.clone()).await?;
    let front_door = HttpFrontDoor::start(settings.acme.http_challenge_port, auto_tls.challenges());

    let tls_listener = TcpListener::bind(("0.0.0.0", 443)).await?;
    let acceptor = TlsAcceptor::from(auto_tls.server_config());
    info!("listening for TLS connections on 0.0.0.0:443");

    loop {
        tokio::select! {
            accepted = tls_listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "failed to accept tcp connection");
                        continue;
                    }
                };

                front_door.set_challenge_mode(!auto_tls.has_certificate());

                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(_tls_stream) => info!(%peer, "tls handshake completed"),
                        Err(err) => warn!(%peer, %err, "tls handshake failed"),
                    }
                });
            }
            () = shutdown_signal() => {
                info!("shutdown signal received, draining");
                break;
            }
        }
    }

    front_door.shutdown().await;
    auto_tls.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => {}
        Err(err) => error!(%err, "failed to install ctrl-c handler"),
    }
}
