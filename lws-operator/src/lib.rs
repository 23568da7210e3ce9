//! The LeaderWorkerSet pod controller and revision history.

pub mod app;
pub mod config;
pub mod k8s;
pub mod server;
