//! sienge-sync - Rate-limited synchronization engine for the Sienge ERP API
//!
//! This crate pulls entity data from the Sienge public API into a local
//! SQLite store. It loads encrypted tenant credentials, validates them
//! through a short-lived cache, walks paginated endpoints under a shared
//! rate budget and orders entities so parents land before dependents.

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod otel;
pub mod server;
pub mod sync;
pub mod vault;
