//! Shared fixtures for integration tests: an in-memory SQLite database with
//! migrations applied, and helpers that insert users, repositories and
//! external accounts.

#![allow(dead_code)]

use anyhow::Result;
use chrono::Utc;
use permsync::config::AppConfig;
use permsync::db;
use permsync::extsvc::{SERVICE_TYPE_GITHUB, SERVICE_TYPE_GITLAB};
use permsync::models::{external_account, repo, user};
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};

pub const GITHUB_SERVICE_ID: &str = "https://github.com/";
pub const GITLAB_SERVICE_ID: &str = "https://gitlab.example.com/";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let config = AppConfig {
        profile: "test".to_string(),
        database_url: "sqlite::memory:".to_string(),
        ..AppConfig::default()
    };
    let db = db::init_pool(&config).await?;
    db::migrate(&db).await?;
    Ok(db)
}

pub async fn create_user(db: &DatabaseConnection, username: &str, site_admin: bool) -> user::Model {
    user::ActiveModel {
        username: Set(username.to_string()),
        display_name: Set(Some(format!("{username} display"))),
        site_admin: Set(site_admin),
        created_at: Set(Utc::now().fixed_offset()),
        perms_synced_at: Set(None),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("insert user")
}

pub async fn create_repo(
    db: &DatabaseConnection,
    name: &str,
    private: bool,
    service_type: &str,
    service_id: &str,
    external_id: &str,
) -> repo::Model {
    repo::ActiveModel {
        name: Set(name.to_string()),
        private: Set(private),
        external_service_type: Set(service_type.to_string()),
        external_service_id: Set(service_id.to_string()),
        external_id: Set(external_id.to_string()),
        created_at: Set(Utc::now().fixed_offset()),
        perms_synced_at: Set(None),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("insert repo")
}

pub async fn create_github_repo(db: &DatabaseConnection, name: &str, node_id: &str) -> repo::Model {
    create_repo(
        db,
        &format!("github.com/{name}"),
        true,
        SERVICE_TYPE_GITHUB,
        GITHUB_SERVICE_ID,
        node_id,
    )
    .await
}

pub async fn create_gitlab_repo(db: &DatabaseConnection, name: &str, project_id: i64) -> repo::Model {
    create_repo(
        db,
        &format!("gitlab.example.com/{name}"),
        true,
        SERVICE_TYPE_GITLAB,
        GITLAB_SERVICE_ID,
        &project_id.to_string(),
    )
    .await
}

pub async fn create_external_account(
    db: &DatabaseConnection,
    user_id: i32,
    service_type: &str,
    service_id: &str,
    account_id: &str,
    token: Option<&str>,
) -> external_account::Model {
    external_account::ActiveModel {
        user_id: Set(user_id),
        service_type: Set(service_type.to_string()),
        service_id: Set(service_id.to_string()),
        account_id: Set(account_id.to_string()),
        access_token: Set(token.map(str::to_string)),
        created_at: Set(Utc::now().fixed_offset()),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("insert external account")
}
