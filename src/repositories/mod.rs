//! # Repository Layer
//!
//! Thin wrappers around SeaORM for the tables this service owns.

pub mod external_account;
pub mod permission_sync_job;
pub mod perms;
pub mod repo;
pub mod user;

pub use external_account::ExternalAccountRepository;
pub use permission_sync_job::{JobStoreError, PermissionSyncJobStore};
pub use perms::PermsStore;
pub use repo::RepoRepository;
pub use user::UserRepository;
