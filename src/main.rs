use std::sync::Arc;
use tracing::{info, warn};

use dscan::config::Config;
use dscan::routes::{AppState, routes};
use dscan::store::{MemoryStore, RedisStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;

  let store: Arc<dyn Store> = match config.redis_url.as_deref() {
    Some(url) => Arc::new(RedisStore::connect(url).await?),
    None => {
      warn!("REDIS_URL not set, using a process-local store; workers cannot join");
      Arc::new(MemoryStore::new())
    }
  };

  let api = routes(AppState::new(store, &config));
  info!("API listening on port {} (namespace {})", config.server_port, config.namespace);

  let (_, server) = warp::serve(api).bind_with_graceful_shutdown(([0, 0, 0, 0], config.server_port), async {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutting down API");
  });
  server.await;
  Ok(())
}
