//! fastllm API server launcher
//!
//! Parses the launcher flags, loads the engine (and the optional
//! embedding model), binds the listen address, and serves the API.

use std::net::{SocketAddr, ToSocketAddrs};

use clap::Parser;

use fastllm_server::api::{create_router, AppState};
use fastllm_server::config::{Cli, ServerConfig};
use fastllm_server::{engine, Result, ServerError};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = ServerConfig::from_cli(cli)?;

    tracing::info!(
        model = %config.model_name,
        path = %config.path,
        host = %config.host,
        port = config.port,
        max_active = config.max_active,
        api_key = config.api_key.is_some(),
        dev_mode = config.dev_mode,
        "starting fastllm api server"
    );

    let engine = engine::load_engine(&config)?;
    let embedding = match &config.embedding_path {
        Some(path) => Some(engine::load_embedding_engine(path)?),
        None => None,
    };

    let addr = resolve_bind_addr(&config.host, config.port)?;
    let state = AppState::new(engine, embedding, config);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Startup(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(%addr, "fastllm api server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| ServerError::Startup(format!("server error: {e}")))
}

/// Resolve the configured host to a bind address. `localhost` maps to
/// 127.0.0.1; other hostnames go through the resolver.
fn resolve_bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let host = if host == "localhost" { "127.0.0.1" } else { host };
    format!("{host}:{port}")
        .to_socket_addrs()
        .map_err(|e| ServerError::Startup(format!("invalid host {host}: {e}")))?
        .next()
        .ok_or_else(|| ServerError::Startup(format!("invalid host {host}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ipv4() {
        let addr = resolve_bind_addr("127.0.0.1", 8080).unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_resolve_localhost_alias() {
        let addr = resolve_bind_addr("localhost", 9000).unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn test_resolve_wildcard() {
        let addr = resolve_bind_addr("0.0.0.0", 8080).unwrap();
        assert!(addr.ip().is_unspecified());
    }
}
