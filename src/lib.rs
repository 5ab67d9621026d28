//! Browser-driven generation farm
//!
//! This library provides the core functionality for the genfarm system,
//! which orchestrates image and video generation jobs by driving a remote
//! web UI through embedded browser sessions: a persisted job queue, a
//! quota-aware account pool, per-kind task executors and a worker-pool
//! scheduler that correlates results out of intercepted network traffic.

pub mod config;
pub mod db;
pub mod models;
pub mod scripts;
pub mod services;
