pub mod audit;
pub mod config;
pub mod control;
pub mod error;
pub mod keys;
pub mod models;
pub mod registry;
pub mod results;
pub mod routes;
pub mod scanner;
pub mod splitter;
pub mod store;
pub mod submit;
pub mod task_queue;
pub mod worker_agent;
pub mod worker_processing;
