//! End-to-end tests for the admin permissions API, driven through the
//! router with `tower::ServiceExt::oneshot`.

mod test_utils;

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use permsync::authz::Providers;
use permsync::config::AppConfig;
use permsync::cursor::{NodeKind, marshal_node_id};
use permsync::models::permission_sync_job::{JobPriority, JobState, reasons};
use permsync::rcache::Rcache;
use permsync::repositories::perms::{SOURCE_API, SOURCE_SYNC};
use permsync::repositories::permission_sync_job::{CreateJobOptions, ListJobsOptions};
use permsync::repositories::{PermissionSyncJobStore, PermsStore};
use permsync::server::{AppState, create_app};
use sea_orm::DatabaseConnection;
use serde_json::{Value, json};
use test_utils::{create_github_repo, create_user, setup_test_db};
use tower::ServiceExt;

const TOKEN: &str = "test-operator-token";

struct TestApp {
    app: Router,
    db: DatabaseConnection,
    admin_id: i32,
    alice_id: i32,
    repo_id: i32,
}

async fn test_app() -> TestApp {
    let db = setup_test_db().await.expect("test db");
    let admin = create_user(&db, "admin", true).await;
    let alice = create_user(&db, "alice", false).await;
    let repo = create_github_repo(&db, "acme/api", "R_1").await;

    let config = AppConfig {
        profile: "test".to_string(),
        database_url: "sqlite::memory:".to_string(),
        operator_tokens: vec![TOKEN.to_string()],
        ..AppConfig::default()
    };
    let state = AppState {
        config: Arc::new(config),
        db: db.clone(),
        providers: Arc::new(Providers::new()),
        rcache: Rcache::in_memory("api-test"),
    };

    TestApp {
        app: create_app(state),
        db,
        admin_id: admin.id,
        alice_id: alice.id,
        repo_id: repo.id,
    }
}

impl TestApp {
    async fn send(&self, method: Method, uri: &str, actor: i32, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Authorization", format!("Bearer {TOKEN}"))
            .header("X-Actor-User-Id", actor.to_string());
        let body = match body {
            Some(body) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn jobs(&self) -> PermissionSyncJobStore {
        PermissionSyncJobStore::new(self.db.clone())
    }
}

fn user_node(id: i32) -> String {
    marshal_node_id(NodeKind::User, id)
}

fn repo_node(id: i32) -> String {
    marshal_node_id(NodeKind::Repository, id)
}

#[tokio::test]
async fn requests_without_operator_token_are_rejected() {
    let t = test_app().await;
    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/permissions-syncing-stats")
                .header("X-Actor-User-Id", t.admin_id.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (status, _) = t.send(Method::GET, "/permissions-syncing-stats", 999, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED, "unknown actor");
}

#[tokio::test]
async fn schedule_user_sync_creates_high_priority_job() {
    let t = test_app().await;
    let uri = format!("/users/{}/permissions-sync", user_node(t.alice_id));

    let (status, body) = t
        .send(Method::POST, &uri, t.alice_id, Some(json!({ "options": { "invalidateCaches": true } })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "alwaysNil": null }));

    let listed = t
        .jobs()
        .list(&ListJobsOptions {
            user_id: Some(t.alice_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    let job = &listed[0].job;
    assert_eq!(job.job_priority(), JobPriority::High);
    assert_eq!(job.reason, reasons::REASON_MANUAL_USER_SYNC);
    assert_eq!(job.triggered_by_user_id, Some(t.alice_id));
    assert!(job.invalidate_caches);

    // A second request while the first is queued is a no-op.
    let (status, _) = t.send(Method::POST, &uri, t.admin_id, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        t.jobs()
            .count(&ListJobsOptions {
                user_id: Some(t.alice_id),
                ..Default::default()
            })
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn schedule_checks_access_and_existence() {
    let t = test_app().await;

    let other_user = format!("/users/{}/permissions-sync", user_node(t.admin_id));
    let (status, body) = t.send(Method::POST, &other_user, t.alice_id, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "must be site admin or the same user");

    let missing_user = format!("/users/{}/permissions-sync", user_node(4242));
    let (status, _) = t.send(Method::POST, &missing_user, t.admin_id, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let repo_uri = format!("/repositories/{}/permissions-sync", repo_node(t.repo_id));
    let (status, body) = t.send(Method::POST, &repo_uri, t.alice_id, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "must be site admin");

    let (status, _) = t.send(Method::POST, &repo_uri, t.admin_id, None).await;
    assert_eq!(status, StatusCode::OK);

    let missing_repo = format!("/repositories/{}/permissions-sync", repo_node(4242));
    let (status, _) = t.send(Method::POST, &missing_repo, t.admin_id, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let wrong_kind = format!("/repositories/{}/permissions-sync", user_node(t.alice_id));
    let (status, body) = t.send(Method::POST, &wrong_kind, t.admin_id, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn cancel_reports_result_messages() {
    let t = test_app().await;
    let job = t
        .jobs()
        .create_repo_sync_job(
            t.repo_id,
            CreateJobOptions {
                priority: JobPriority::Low,
                reason: reasons::REASON_REPO_NO_PERMS.to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
    let uri = format!(
        "/permissions-sync-jobs/{}/cancel",
        marshal_node_id(NodeKind::PermissionsSyncJob, job.id)
    );

    let (status, _) = t.send(Method::POST, &uri, t.alice_id, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = t
        .send(Method::POST, &uri, t.admin_id, Some(json!({ "reason": "operator request" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "result": "SUCCESS" }));
    let canceled = t.jobs().find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(canceled.job_state(), JobState::Canceled);
    assert_eq!(canceled.cancellation_reason.as_deref(), Some("operator request"));

    let (status, body) = t.send(Method::POST, &uri, t.admin_id, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "result": "NOT_FOUND", "message": "No job that can be canceled found." })
    );
}

#[tokio::test]
async fn list_paginates_with_cursor_and_total_count() {
    let t = test_app().await;
    let bob = create_user(&t.db, "bob", false).await;
    for user_id in [t.admin_id, t.alice_id, bob.id] {
        t.jobs()
            .create_user_sync_job(
                user_id,
                CreateJobOptions {
                    priority: JobPriority::Low,
                    reason: reasons::REASON_USER_NO_PERMS.to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let (status, page) = t
        .send(Method::GET, "/permissions-sync-jobs?first=2", t.admin_id, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["totalCount"], 3);
    assert_eq!(page["pageInfo"]["hasNextPage"], true);
    let nodes = page["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0]["subject"]["__typename"], "User");
    assert_eq!(nodes[0]["subject"]["username"], "admin");
    assert_eq!(nodes[0]["placeInQueue"], 1);
    assert_eq!(nodes[0]["reason"]["group"], "SCHEDULE");

    let cursor = page["pageInfo"]["endCursor"].as_str().unwrap();
    let (status, next) = t
        .send(
            Method::GET,
            &format!("/permissions-sync-jobs?first=2&after={cursor}"),
            t.admin_id,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(next["totalCount"], 3);
    assert_eq!(next["pageInfo"]["hasNextPage"], false);
    assert_eq!(next["nodes"].as_array().unwrap().len(), 1);
    assert_eq!(next["nodes"][0]["subject"]["username"], "bob");

    let (status, _) = t
        .send(Method::GET, "/permissions-sync-jobs?first=101", t.admin_id, None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = t
        .send(Method::GET, "/permissions-sync-jobs?after=bm90LWEtY3Vyc29y", t.admin_id, None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn non_admins_may_list_only_their_own_jobs() {
    let t = test_app().await;
    t.jobs()
        .create_user_sync_job(
            t.alice_id,
            CreateJobOptions {
                priority: JobPriority::Low,
                reason: reasons::REASON_USER_NO_PERMS.to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (status, _) = t.send(Method::GET, "/permissions-sync-jobs", t.alice_id, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let own = format!("/permissions-sync-jobs?userID={}", user_node(t.alice_id));
    let (status, page) = t.send(Method::GET, &own, t.alice_id, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["totalCount"], 1);

    let others = format!("/permissions-sync-jobs?userID={}", user_node(t.admin_id));
    let (status, _) = t.send(Method::GET, &others, t.alice_id, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn set_repository_permissions_replaces_explicit_grants() {
    let t = test_app().await;
    let bob = create_user(&t.db, "bob", false).await;
    let perms = PermsStore::new(t.db.clone());
    perms
        .set_repo_permissions(t.repo_id, &[bob.id], SOURCE_SYNC)
        .await
        .unwrap();
    let uri = format!("/repositories/{}/permissions", repo_node(t.repo_id));

    let (status, body) = t
        .send(
            Method::PUT,
            &uri,
            t.admin_id,
            Some(json!({ "userPermissions": [
                { "bindID": "alice", "permission": "READ" },
                { "bindID": "alice", "permission": "read" },
            ]})),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(perms.user_ids_for_repo(t.repo_id, SOURCE_API).await.unwrap(), vec![t.alice_id]);
    assert_eq!(perms.user_ids_for_repo(t.repo_id, SOURCE_SYNC).await.unwrap(), vec![bob.id]);

    let (status, body) = t
        .send(
            Method::PUT,
            &uri,
            t.admin_id,
            Some(json!({ "userPermissions": [
                { "bindID": "alice", "permission": "READ" },
                { "bindID": "ghost", "permission": "READ" },
            ]})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"]["bindID"], json!(["ghost"]));

    let (status, _) = t
        .send(
            Method::PUT,
            &uri,
            t.admin_id,
            Some(json!({ "userPermissions": [{ "bindID": "alice", "permission": "WRITE" }] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = t
        .send(Method::PUT, &uri, t.alice_id, Some(json!({ "userPermissions": [] })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = t
        .send(Method::PUT, &uri, t.admin_id, Some(json!({ "userPermissions": [] })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(perms.user_ids_for_repo(t.repo_id, SOURCE_API).await.unwrap().is_empty());
}

#[tokio::test]
async fn stats_reflect_queue_and_sync_state() {
    let t = test_app().await;
    t.jobs()
        .create_repo_sync_job(
            t.repo_id,
            CreateJobOptions {
                priority: JobPriority::Low,
                reason: reasons::REASON_REPO_NO_PERMS.to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    PermsStore::new(t.db.clone())
        .set_user_repo_permissions(t.alice_id, &[t.repo_id], SOURCE_SYNC)
        .await
        .unwrap();

    let (status, stats) = t
        .send(Method::GET, "/permissions-syncing-stats", t.admin_id, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        stats,
        json!({
            "queueSize": 1,
            "usersWithLatestJobFailing": 0,
            "reposWithLatestJobFailing": 0,
            "usersWithNoPermissions": 1,
            "reposWithNoPermissions": 1,
            "usersWithStalePermissions": 0,
            "reposWithStalePermissions": 0,
        })
    );

    let (status, _) = t
        .send(Method::GET, "/permissions-syncing-stats", t.alice_id, None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn malformed_input_is_reported_as_validation_failure() {
    let t = test_app().await;

    let (status, body) = t
        .send(Method::GET, "/permissions-sync-jobs?first=lots", t.admin_id, None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");

    let uri = format!("/repositories/{}/permissions", repo_node(t.repo_id));
    let (status, body) = t
        .send(Method::PUT, &uri, t.admin_id, Some(json!({ "users": [] })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");

    // Access is decided before the body is looked at.
    let (status, body) = t
        .send(Method::PUT, &uri, t.alice_id, Some(json!({ "users": [] })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "must be site admin");
}
