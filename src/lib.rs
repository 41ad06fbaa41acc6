//! Telegram bot that stores files in Wasabi object storage and hands out
//! presigned links, with a small HTTP server for health, stats and streaming.

/// Runtime allow-list
pub mod access;
/// Shared application state
pub mod app;
/// Telegram bot surface
pub mod bot;
/// Settings and constants
pub mod config;
/// Per-user request limiting
pub mod rate_limit;
/// Upload registry
pub mod registry;
/// Signed stream links
pub mod signing;
/// Process-wide counters
pub mod stats;
/// Object storage
pub mod storage;
/// Transfer progress accounting
pub mod transfer;
/// Helpers for names, sizes and retries
pub mod utils;
/// Auxiliary HTTP server
pub mod web;
