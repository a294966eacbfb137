//! Mindoo sync server.
//!
//! Hosts one tenant's databases over the REST sync protocol.
//!
//! Configuration (environment variables):
//!   MINDOO_PORT               - Listen port (default: 3000)
//!   MINDOO_DATA_DIR           - Persistent data directory (default: ./mindoo-data)
//!   MINDOO_JWT_SECRET         - Secret for data-plane tokens (required)
//!   MINDOO_USER_PASSWORD      - Password unlocking the hosting user's keys (required)
//!   MINDOO_CHALLENGE_TTL_SECS - Auth nonce lifetime (default: 60)
//!   MINDOO_LOG_FORMAT         - "json" for structured logging, "pretty" for dev
//!
//! The data directory must contain the hosting identity, produced at tenant
//! creation time:
//!   tenant.json   - the tenant identity
//!   user.json     - the hosting user's private identity
//!   keybag.bin    - the sealed key bag

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mindoo_core::{open_tenant_from_dir, LwwProvider, TenantConfig};
use mindoo_store::FileStoreFactory;
use mindoo_sync::{ServerConfig, ServerState};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn required_env(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| {
        eprintln!("{} must be set", name);
        std::process::exit(1);
    })
}

#[tokio::main]
async fn main() {
    init_tracing();

    let port: u16 = env_or("MINDOO_PORT", "3000").parse().unwrap_or_else(|_| {
        eprintln!("MINDOO_PORT must be a port number");
        std::process::exit(1);
    });
    let data_dir = PathBuf::from(env_or("MINDOO_DATA_DIR", "./mindoo-data"));
    let jwt_secret = required_env("MINDOO_JWT_SECRET");
    let password = required_env("MINDOO_USER_PASSWORD");
    let challenge_ttl: u64 = env_or("MINDOO_CHALLENGE_TTL_SECS", "60")
        .parse()
        .unwrap_or(60);

    let config = TenantConfig {
        store_factory: Arc::new(FileStoreFactory::new(data_dir.join("stores"))),
        crdt: Arc::new(LwwProvider::new()),
    };
    let tenant = open_tenant_from_dir(&data_dir, &password, config).unwrap_or_else(|e| {
        eprintln!("cannot open tenant from {}: {}", data_dir.display(), e);
        std::process::exit(1);
    });

    let mut server_config = ServerConfig::new(jwt_secret.into_bytes());
    server_config.challenge_ttl = Duration::from_secs(challenge_ttl);
    let state = ServerState::new(tenant.clone(), server_config);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("cannot bind {}: {}", addr, e);
        std::process::exit(1);
    });
    tracing::info!(tenant = %tenant.tenant_id(), %addr, "mindoo sync server listening");

    if let Err(e) = mindoo_sync::serve(listener, state).await {
        tracing::error!(error = %e, "server exited");
        std::process::exit(1);
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env_or("MINDOO_LOG_FORMAT", "pretty") == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
