//! proxychain - Main entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use proxychain::cli::{Cli, Command};
use proxychain::config::ServerConfig;
use proxychain::redact::redact_url;
use proxychain::server::{Server, ServerOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Command::RedactUrl { url, replacement }) => {
            println!("{}", redact_url(&url, &replacement));
            Ok(())
        }
        Some(Command::Tunnel { proxy_url, target }) => {
            let addr = proxychain::helpers::create_tunnel(&proxy_url, &target).await?;
            println!("tunnel listening on {addr}, forwarding to {target} via {proxy_url}");
            tokio::signal::ctrl_c().await?;
            Ok(())
        }
        Some(Command::Serve { host, port, upstream }) => {
            run_serve(cli.config.as_deref(), host, port, upstream).await
        }
        None => run_serve(cli.config.as_deref(), None, None, None).await,
    }
}

async fn run_serve(
    config_path: Option<&std::path::Path>,
    host: Option<String>,
    port: Option<u16>,
    upstream: Option<String>,
) -> anyhow::Result<()> {
    let mut config = ServerConfig::resolve(config_path)?;
    if let Some(host) = host {
        config.listen_host = host;
    }
    if let Some(port) = port {
        config.listen_port = port;
    }

    let options = ServerOptions {
        host: config.listen_host.clone(),
        port: config.listen_port,
        auth_realm: config.auth_realm.clone(),
    };

    let prepare: Option<proxychain::prepare::PrepareRequestFn> = upstream.map(|upstream| {
        let ignore_cert = config.ignore_upstream_proxy_certificate;
        let hook: proxychain::prepare::PrepareRequestFn = std::sync::Arc::new(move |_input| {
            let upstream = upstream.clone();
            Box::pin(async move {
                Ok(proxychain::prepare::PrepareRequestResult {
                    upstream_proxy_url: Some(upstream),
                    ignore_upstream_proxy_certificate: ignore_cert,
                    ..Default::default()
                })
            })
        });
        hook
    });

    let server = Server::new(options, prepare);
    let addr = server.listen().await?;
    tracing::info!(%addr, "proxychain listening");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.close(true).await;
    Ok(())
}
