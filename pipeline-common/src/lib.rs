pub mod ack;
pub mod cache;
pub mod duration_ms;
pub mod message;
pub mod metrics;
pub mod retry;
pub mod sink;
pub mod source;
