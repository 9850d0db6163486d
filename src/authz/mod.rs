//! Authorization providers: per-code-host permission lookups used by the
//! sync worker and by repository read checks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use utoipa::ToSchema;

use crate::config::{AppConfig, ConfigError, parse_url};
use crate::extsvc::{
    CodeHostError, ExternalAccount, ExternalRepoSpec, GitHubClient, GitLabClient,
    normalize_base_url,
};
use crate::rcache::{CacheError, Rcache};

pub mod github;
pub mod gitlab;

pub use github::GitHubProvider;
pub use gitlab::GitLabProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Perms {
    None,
    Read,
}

/// A repository as the providers see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub id: i32,
    /// Full name including the host, e.g. `github.com/owner/name`.
    pub name: String,
    pub external_repo: ExternalRepoSpec,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchPermsOptions {
    pub invalidate_caches: bool,
}

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("no account provided")]
    NoAccount,

    #[error("not a code host of the account: want {want:?} but have {have:?}")]
    WrongCodeHost { want: String, have: String },

    #[error("no token found in the external account data")]
    MissingToken,

    #[error("repository {0:?} does not belong to this code host")]
    ForeignRepo(String),

    #[error("cannot derive code host coordinates for repository {0:?}")]
    InvalidRepo(String),

    #[error(transparent)]
    CodeHost(#[from] CodeHostError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl AuthzError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AuthzError::CodeHost(err) if err.is_not_found())
    }
}

/// A code host that can enumerate permissions in both directions.
#[async_trait]
pub trait AuthzProvider: Send + Sync {
    fn service_type(&self) -> &str;

    fn service_id(&self) -> &str;

    /// External ids of the repositories `account` can read.
    async fn fetch_user_perms(
        &self,
        account: Option<&ExternalAccount>,
        opts: FetchPermsOptions,
    ) -> Result<Vec<String>, AuthzError>;

    /// External account ids of the users who can read `repo`.
    async fn fetch_repo_perms(
        &self,
        repo: &Repo,
        opts: FetchPermsOptions,
    ) -> Result<Vec<String>, AuthzError>;
}

/// Check that `account` belongs to the provider's code host and carries a token.
pub(crate) fn account_token<'a>(
    service_type: &str,
    service_id: &str,
    account: Option<&'a ExternalAccount>,
) -> Result<&'a str, AuthzError> {
    let account = account.ok_or(AuthzError::NoAccount)?;
    if account.service_type != service_type || account.service_id != service_id {
        return Err(AuthzError::WrongCodeHost {
            want: account.service_id.clone(),
            have: service_id.to_string(),
        });
    }
    account
        .access_token
        .as_deref()
        .filter(|token| !token.is_empty())
        .ok_or(AuthzError::MissingToken)
}

pub(crate) fn ensure_own_repo(
    service_type: &str,
    service_id: &str,
    repo: &Repo,
) -> Result<(), AuthzError> {
    if repo.external_repo.service_type == service_type
        && repo.external_repo.service_id == service_id
    {
        Ok(())
    } else {
        Err(AuthzError::ForeignRepo(repo.name.clone()))
    }
}

/// Configured providers indexed by service id.
#[derive(Clone, Default)]
pub struct Providers {
    by_service_id: HashMap<String, Arc<dyn AuthzProvider>>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn AuthzProvider>) {
        self.by_service_id
            .insert(provider.service_id().to_string(), provider);
    }

    pub fn get(&self, service_id: &str) -> Option<Arc<dyn AuthzProvider>> {
        self.by_service_id.get(service_id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn AuthzProvider>> {
        self.by_service_id.values()
    }

    pub fn is_empty(&self) -> bool {
        self.by_service_id.is_empty()
    }

    /// Build the providers enabled in `config`.
    pub fn from_config(config: &AppConfig, rcache: &Rcache) -> Result<Self, ConfigError> {
        let mut providers = Self::new();

        if let (Some(url), Some(api_url)) =
            (config.github.url.as_deref(), config.github.resolved_api_url()?)
        {
            let base_url = normalize_base_url(&parse_url("GITHUB_URL", url)?);
            let client = GitHubClient::new(&api_url, config.github.token.clone(), Some(rcache.clone()));
            info!(service_id = %base_url, "GitHub authz provider enabled");
            providers.register(Arc::new(GitHubProvider::new(
                &base_url,
                client,
                rcache,
                config.github.cache_ttl(),
            )));
        }

        if let Some(url) = config.gitlab.url.as_deref() {
            let base_url = normalize_base_url(&parse_url("GITLAB_URL", url)?);
            let client = GitLabClient::new(&base_url, config.gitlab.token.clone()).map_err(
                |source| ConfigError::InvalidUrl {
                    field: "GITLAB_URL",
                    value: url.to_string(),
                    source,
                },
            )?;
            info!(service_id = %base_url, "GitLab authz provider enabled");
            providers.register(Arc::new(GitLabProvider::new(&base_url, client)));
        }

        Ok(providers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extsvc::SERVICE_TYPE_GITHUB;

    fn account(token: Option<&str>) -> ExternalAccount {
        ExternalAccount {
            id: 1,
            user_id: 1,
            service_type: SERVICE_TYPE_GITHUB.into(),
            service_id: "https://github.com/".into(),
            account_id: "42".into(),
            access_token: token.map(Into::into),
        }
    }

    #[test]
    fn account_checks_report_exact_messages() {
        let err = account_token(SERVICE_TYPE_GITHUB, "https://github.com/", None).unwrap_err();
        assert_eq!(err.to_string(), "no account provided");

        let acct = account(Some("t"));
        let err =
            account_token(SERVICE_TYPE_GITHUB, "https://ghe.example.com/", Some(&acct)).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"not a code host of the account: want "https://github.com/" but have "https://ghe.example.com/""#
        );

        let acct = account(None);
        let err = account_token(SERVICE_TYPE_GITHUB, "https://github.com/", Some(&acct)).unwrap_err();
        assert_eq!(err.to_string(), "no token found in the external account data");

        let acct = account(Some("t"));
        assert_eq!(
            account_token(SERVICE_TYPE_GITHUB, "https://github.com/", Some(&acct)).unwrap(),
            "t"
        );
    }

    #[test]
    fn providers_follow_config() {
        let mut config = AppConfig::default();
        config.github.url = Some("https://github.com".into());
        config.gitlab.url = Some("https://gitlab.example.com".into());

        let providers = Providers::from_config(&config, &Rcache::in_memory("test")).unwrap();
        assert!(providers.get("https://github.com/").is_some());
        let gitlab = providers.get("https://gitlab.example.com/").unwrap();
        assert_eq!(gitlab.service_type(), "gitlab");

        assert!(
            Providers::from_config(&AppConfig::default(), &Rcache::in_memory("test"))
                .unwrap()
                .is_empty()
        );
    }
}
