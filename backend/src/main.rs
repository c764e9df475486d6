use std::net::SocketAddr;
use std::sync::Arc;

use mitra_bargain::bus::UpdateBus;
use mitra_bargain::config::AppConfig;
use mitra_bargain::handlers::{self, AppState};
use mitra_bargain::pricing::CartPriceBook;
use mitra_bargain::service::BargainService;
use mitra_bargain::store::{BargainStore, MemoryStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let config = AppConfig::load()?;
    log::info!("Loaded config for {}:{}", config.host, config.port);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let store = build_store(&config)?;
    let service = BargainService::new(store, UpdateBus::new(), Arc::new(CartPriceBook::new()));

    log::info!("Starting server on {}", addr);

    let app = handlers::router(AppState::new(config, service));
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app.into_make_service()).await?;

    Ok(())
}

fn build_store(config: &AppConfig) -> Result<Arc<dyn BargainStore>, Box<dyn std::error::Error>> {
    #[cfg(feature = "postgres")]
    {
        if let Some(url) = &config.database_url {
            let store = mitra_bargain::store::postgres::PgBargainStore::connect(url, config.db_pool_size)?;
            log::info!("Using Postgres bargain store");
            return Ok(Arc::new(store));
        }
    }
    if config.database_url.is_some() {
        log::warn!("DATABASE_URL is set but the postgres feature is off; using the in-memory store");
    } else {
        log::info!("Using in-memory bargain store");
    }
    Ok(Arc::new(MemoryStore::new()))
}
