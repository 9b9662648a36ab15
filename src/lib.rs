//! peerloop - leaderless coordination for autonomous coding workers
//!
//! Workers share nothing but a work store. They claim items, open changes,
//! review each other's changes and merge them once enough peers approve.

pub mod agent;
pub mod commands;
pub mod config;
pub mod error;
pub mod protocol;
pub mod store;
pub mod subprocess;
pub mod telemetry;
pub mod template;
pub mod worker;
