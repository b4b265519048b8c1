//! Shared types, errors and configuration for the pushgate daemon.

pub mod config;
pub mod db;
pub mod error;
pub mod redis_pool;
pub mod types;
