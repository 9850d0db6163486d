//! # Server Configuration
//!
//! Router assembly, shared state and the HTTP server lifecycle.

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post, put},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::authz::Providers;
use crate::config::AppConfig;
use crate::handlers::{self, permissions};
use crate::rcache::Rcache;
use crate::telemetry::trace_context_middleware;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub providers: Arc<Providers>,
    pub rcache: Rcache,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/permissions-sync-jobs",
            get(permissions::list_permissions_sync_jobs),
        )
        .route(
            "/permissions-sync-jobs/{job_id}/cancel",
            post(permissions::cancel_permissions_sync_job),
        )
        .route(
            "/users/{user_id}/permissions-sync",
            post(permissions::schedule_user_permissions_sync),
        )
        .route(
            "/repositories/{repo_id}/permissions-sync",
            post(permissions::schedule_repository_permissions_sync),
        )
        .route(
            "/repositories/{repo_id}/permissions",
            put(permissions::set_repository_permissions_for_users),
        )
        .route(
            "/permissions-syncing-stats",
            get(permissions::permissions_syncing_stats),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until `shutdown` fires.
pub async fn run_server(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = state
        .config
        .bind_addr()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {e}"))?;
    let profile = state.config.profile.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, %profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::permissions::list_permissions_sync_jobs,
        crate::handlers::permissions::cancel_permissions_sync_job,
        crate::handlers::permissions::schedule_user_permissions_sync,
        crate::handlers::permissions::schedule_repository_permissions_sync,
        crate::handlers::permissions::set_repository_permissions_for_users,
        crate::handlers::permissions::permissions_syncing_stats,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::error::ApiError,
            crate::handlers::permissions::PermissionsSyncJobsConnection,
            crate::handlers::permissions::PermissionsSyncJobNode,
            crate::handlers::permissions::JobSubject,
            crate::handlers::permissions::CancelPermissionsSyncJobRequest,
            crate::handlers::permissions::CancelPermissionsSyncJobResponse,
            crate::handlers::permissions::ScheduleSyncRequest,
            crate::handlers::permissions::SetRepositoryPermissionsRequest,
            crate::handlers::permissions::EmptyResponse,
            crate::handlers::permissions::PermissionsSyncingStats,
        )
    ),
    modifiers(&SecurityAddon),
    info(
        title = "permsync API",
        description = "Admin API for repository permission syncing",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
