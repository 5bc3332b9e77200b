use std::sync::Arc;
use tracing::info;

use dscan::config::Config;
use dscan::control::ControlPlane;
use dscan::keys::Keys;
use dscan::registry::WorkerRegistry;
use dscan::results::ResultStore;
use dscan::scanner::ConnectScanner;
use dscan::store::{RedisStore, Store};
use dscan::task_queue::TaskQueue;
use dscan::worker_agent::{WorkerAgent, detect_local_ip};
use dscan::worker_processing::TaskProcessor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let store: Arc<dyn Store> = Arc::new(RedisStore::connect(config.require_redis_url()?).await?);

  let keys = Keys::new(config.namespace.clone());
  let control = ControlPlane::new(store.clone(), keys.clone());
  let registry = WorkerRegistry::new(store.clone(), control.clone(), config.registry());
  let queue = TaskQueue::new(store.clone(), &keys);
  let results = ResultStore::new(store, keys);
  let processor = TaskProcessor::new(Arc::new(ConnectScanner), results, control.clone(), config.flag_poll_interval);

  let ip = detect_local_ip().await;
  let agent = WorkerAgent::new(config.worker(ip), queue, registry, control, processor);

  let signal_agent = agent.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      info!("Interrupt received, finishing in-flight tasks");
      signal_agent.shutdown();
    }
  });

  agent.run().await?;
  Ok(())
}
