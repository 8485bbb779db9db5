//! inferflow: a fault-aware inference-serving middle tier that spreads
//! each request across either a CDC stripe (k data queries + 1 parity
//! query, tolerant of 1 loss) or a Backup group (1 data query + B
//! replicas, tolerant of B losses), steered by a per-zone vulnerability
//! monitor and a Bernoulli class filter.

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod filter;
pub mod message;
pub mod monitor;
pub mod pipeline;
pub mod queue;
pub mod stripe;
pub mod wire;
