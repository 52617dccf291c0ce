use anyhow::Result;
use clap::Parser;
use doc_hub::api::{self, AppState};
use doc_hub_core::auth::Hs256Verifier;
use doc_hub_core::crypt::AesFieldCipher;
use doc_hub_core::db::MemoryDatabase;
use doc_hub_core::transport::ConnectionRegistry;
use doc_hub_core::watch::{ChangeWatcher, NoopHooks};
use doc_hub_core::{housekeeping, DocumentStore, StoreConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "doc-hub")]
#[command(about = "Permission-aware document store with versioned history and live change feeds")]
struct Cli {
    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1:3000")]
    addr: SocketAddr,

    /// HS256 secret used to verify signin tokens
    #[arg(long, env = "DOCHUB_JWT_SECRET")]
    jwt_secret: String,

    /// 32-byte key enabling field encryption
    #[arg(long, env = "DOCHUB_MASTER_KEY")]
    master_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = StoreConfig::from_env()?;

    let mut store = DocumentStore::new(Arc::new(MemoryDatabase::new()), config);
    if let Some(key) = &cli.master_key {
        store = store.with_cipher(Arc::new(AesFieldCipher::new(key.as_bytes())?));
    }
    let store = Arc::new(store);
    if let Err(e) = store.cache().refresh(store.db().as_ref()).await {
        warn!(error = %e, "initial metadata refresh failed");
    }

    let registry = Arc::new(ConnectionRegistry::new());
    let watcher = Arc::new(ChangeWatcher::new(
        store.clone(),
        registry.clone(),
        Arc::new(NoopHooks),
    ));
    watcher.spawn();
    housekeeping::spawn(store.clone(), registry.clone());

    let app = api::router(AppState {
        store,
        registry,
        verifier: Arc::new(Hs256Verifier::new(cli.jwt_secret)),
    })
    .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(cli.addr).await?;
    info!(addr = %cli.addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
