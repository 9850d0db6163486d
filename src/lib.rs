//! # permsync
//!
//! Repository permission syncing: code host clients, authorization providers,
//! the permission sync job queue, its worker and scheduler, and the admin API.

pub mod auth;
pub mod authz;
pub mod config;
pub mod cursor;
pub mod db;
pub mod error;
pub mod extsvc;
pub mod handlers;
pub mod models;
pub mod rcache;
pub mod repositories;
pub mod scheduler;
pub mod server;
pub mod telemetry;
pub mod worker;
pub use migration;
