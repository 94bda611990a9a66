//! Webpage screenshot service
//!
//! This library provides the job lifecycle behind the url-capture server:
//! a durable job store with time-based eviction, per-client token-bucket
//! admission control, a bounded render worker pool, and the periodic sync
//! loop that keeps both stores trimmed.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod util;
