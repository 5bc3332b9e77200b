//! Long running worker process: heartbeats, control handling and task
//! dispatch under bounded concurrency.

use chrono::Utc;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::System;
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, Semaphore, watch};
use tracing::{debug, error, info, warn};

use crate::control::ControlPlane;
use crate::error::Result;
use crate::keys::Keys;
use crate::models::{ControlCommand, Task, WorkerStatus};
use crate::registry::WorkerRegistry;
use crate::task_queue::TaskQueue;
use crate::worker_processing::TaskProcessor;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub name: String,
  pub ip: String,
  pub concurrency: usize,
  pub heartbeat_interval: Duration,
  pub task_poll_interval: Duration,
  pub flag_poll_interval: Duration,
}

#[derive(Debug, Default)]
struct Counters {
  started: AtomicU64,
  executed: AtomicU64,
}

#[derive(Clone)]
pub struct WorkerAgent {
  name: Arc<RwLock<String>>,
  config: WorkerConfig,
  queue: TaskQueue,
  registry: WorkerRegistry,
  control: ControlPlane,
  processor: TaskProcessor,
  counters: Arc<Counters>,
  system: Arc<Mutex<System>>,
  shutdown: Arc<watch::Sender<bool>>,
}

impl WorkerAgent {
  pub fn new(
    config: WorkerConfig,
    queue: TaskQueue,
    registry: WorkerRegistry,
    control: ControlPlane,
    processor: TaskProcessor,
  ) -> Self {
    let (shutdown, _) = watch::channel(false);
    Self {
      name: Arc::new(RwLock::new(config.name.clone())),
      config,
      queue,
      registry,
      control,
      processor,
      counters: Arc::new(Counters::default()),
      system: Arc::new(Mutex::new(System::new())),
      shutdown: Arc::new(shutdown),
    }
  }

  pub async fn name(&self) -> String {
    self.name.read().await.clone()
  }

  pub fn shutdown(&self) {
    self.shutdown.send_replace(true);
  }

  pub fn is_shutting_down(&self) -> bool {
    *self.shutdown.borrow()
  }

  fn sample_load(&self) -> (f64, f64) {
    let mut system = self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    system.refresh_cpu_usage();
    system.refresh_memory();
    let total = system.total_memory();
    let mem_used = if total == 0 { 0.0 } else { system.used_memory() as f64 * 100.0 / total as f64 };
    (system.global_cpu_usage() as f64, mem_used)
  }

  pub async fn status(&self) -> WorkerStatus {
    let (cpu_load, mem_used) = self.sample_load();
    WorkerStatus {
      worker_name: self.name().await,
      ip: self.config.ip.clone(),
      cpu_load,
      mem_used,
      tasks_started: self.counters.started.load(Ordering::Relaxed),
      tasks_executed: self.counters.executed.load(Ordering::Relaxed),
      update_time: Some(Utc::now()),
    }
  }

  pub async fn heartbeat(&self) {
    let status = self.status().await;
    if let Err(e) = self.registry.publish_heartbeat(&status).await {
      warn!("Worker {}: heartbeat failed: {}", status.worker_name, e);
    }
  }

  /// Runs until a stop command, the worker stop flag or `shutdown` ends it.
  /// In-flight tasks are allowed to finish before this returns.
  pub async fn run(&self) -> Result<()> {
    let mut commands = self.control.subscribe_commands().await?;
    let mut refresh = self.control.subscribe_refresh().await?;
    let mut shutdown = self.shutdown.subscribe();

    info!("Worker {} starting ({} slots)", self.name().await, self.config.concurrency);
    self.heartbeat().await;
    let dispatcher = tokio::spawn(self.clone().dispatch(self.shutdown.subscribe()));

    let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
    heartbeat.tick().await;
    let mut flag_poll = tokio::time::interval(self.config.flag_poll_interval);

    loop {
      if *shutdown.borrow_and_update() {
        break;
      }
      tokio::select! {
        _ = shutdown.changed() => {}
        _ = heartbeat.tick() => self.heartbeat().await,
        Some(_) = refresh.next() => {
          debug!("Refresh requested");
          self.heartbeat().await;
        }
        Some(command) = commands.next() => self.handle_command(command).await,
        _ = flag_poll.tick() => self.check_stop_flag().await,
      }
    }

    if let Err(e) = dispatcher.await {
      error!("Dispatcher exited abnormally: {:?}", e);
    }
    info!("Worker {} stopped", self.name().await);
    Ok(())
  }

  async fn handle_command(&self, command: ControlCommand) {
    let current = self.name().await;
    if command.worker_name() != current {
      return;
    }
    match command {
      ControlCommand::Stop { .. } => {
        info!("Worker {} received stop command", current);
        self.consume_stop_flag(&current).await;
        self.shutdown();
      }
      ControlCommand::Rename { new_name, .. } => {
        *self.name.write().await = new_name.clone();
        info!("Worker {} renamed to {}", current, new_name);
        self.heartbeat().await;
      }
    }
  }

  async fn consume_stop_flag(&self, name: &str) {
    if let Err(e) = self.control.clear_flag(&Keys::worker_ctrl(name)).await {
      warn!("Worker {}: could not consume stop flag: {}", name, e);
    }
  }

  async fn check_stop_flag(&self) {
    let name = self.name().await;
    match self.control.check_flag(&Keys::worker_ctrl(&name)).await {
      Ok(true) => {
        info!("Worker {} found its stop flag", name);
        self.consume_stop_flag(&name).await;
        self.shutdown();
      }
      Ok(false) => {}
      Err(e) => warn!("Worker {}: checking stop flag failed: {}", name, e),
    }
  }

  async fn dispatch(self, mut shutdown: watch::Receiver<bool>) {
    let slots = self.config.concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(slots));

    loop {
      if *shutdown.borrow_and_update() {
        break;
      }
      let permit = tokio::select! {
        _ = shutdown.changed() => continue,
        permit = semaphore.clone().acquire_owned() => match permit {
          Ok(permit) => permit,
          Err(_) => break,
        },
      };

      match self.queue.pop_next().await {
        Ok(Some(task)) => {
          let agent = self.clone();
          tokio::spawn(async move {
            agent.execute(task).await;
            drop(permit);
          });
          continue;
        }
        Ok(None) => drop(permit),
        Err(e) => {
          error!("Failed to pop task: {}", e);
          drop(permit);
        }
      }

      tokio::select! {
        _ = shutdown.changed() => {}
        _ = tokio::time::sleep(self.config.task_poll_interval) => {}
      }
    }

    debug!("Dispatcher draining {} slots", slots);
    let _ = semaphore.acquire_many(slots as u32).await;
  }

  async fn execute(&self, task: Task) {
    self.counters.started.fetch_add(1, Ordering::Relaxed);
    let name = self.name().await;
    match self.processor.process(&name, &task).await {
      Ok(status) => info!("Task {} finished with {}", task.task_id, status),
      Err(e) => error!("Task {} could not be recorded: {}", task.task_id, e),
    }
    self.counters.executed.fetch_add(1, Ordering::Relaxed);
  }
}

/// Address of the interface that routes outwards; nothing is sent.
pub async fn detect_local_ip() -> String {
  let probe = async {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await?;
    socket.local_addr()
  };
  match probe.await {
    Ok(addr) => addr.ip().to_string(),
    Err(e) => {
      warn!("Could not determine local address: {}", e);
      "127.0.0.1".to_string()
    }
  }
}
