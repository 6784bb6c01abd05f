pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod processors;
pub mod quality;
pub mod schema;

mod graph;
mod metrics_consts;
