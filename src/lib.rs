//! Flow telemetry agent: kernel flow-table polling, RoCE/InfiniBand
//! classification and batched metrics export.

pub mod agent;
pub mod config;
pub mod export;
pub mod flow;
pub mod rdma;
pub mod sink;
pub mod tracer;
