//! GitHub authorization provider.
//!
//! Read checks go through two cache tiers. The public tier records whether a
//! repository is public and is shared by all users. The user tier records
//! whether one account can read one repository. Both entries embed the TTL
//! they were written with; entries written under a different TTL are ignored.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use url::Url;

use super::{
    AuthzError, AuthzProvider, FetchPermsOptions, Perms, Repo, account_token, ensure_own_repo,
};
use crate::extsvc::github::split_repository_name;
use crate::extsvc::{ExternalAccount, GitHubClient, SERVICE_TYPE_GITHUB};
use crate::rcache::{Cache, Rcache};

pub const PUBLIC_REPOS_CACHE: &str = "gh_public_repos";
pub const USER_REPOS_CACHE: &str = "gh_user_repos";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CachedPublic {
    public: bool,
    ttl: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CachedUserRepo {
    read: bool,
    ttl: u64,
}

pub struct GitHubProvider {
    service_id: String,
    client: GitHubClient,
    public_cache: Cache,
    user_cache: Cache,
    cache_ttl: Duration,
}

impl GitHubProvider {
    /// `base_url` must already be normalized; `client` carries the site token.
    pub fn new(base_url: &Url, client: GitHubClient, rcache: &Rcache, cache_ttl: Duration) -> Self {
        Self {
            service_id: base_url.to_string(),
            client,
            public_cache: rcache.cache_with_ttl(PUBLIC_REPOS_CACHE, cache_ttl),
            user_cache: rcache.cache_with_ttl(USER_REPOS_CACHE, cache_ttl),
            cache_ttl,
        }
    }

    fn ttl_secs(&self) -> u64 {
        self.cache_ttl.as_secs()
    }

    fn owner_and_name(repo: &Repo) -> Result<(&str, &str), AuthzError> {
        split_repository_name(&repo.name).ok_or_else(|| AuthzError::InvalidRepo(repo.name.clone()))
    }

    /// Permissions of `account` on each of `repos` that lives on this code host.
    ///
    /// Public repositories are readable by anyone. Without an account for this
    /// code host only the public results are returned. Meant for read-time
    /// checks by callers embedding this crate; the sync paths do not use it.
    #[instrument(skip_all, fields(provider = "github", repos = repos.len()))]
    pub async fn repo_perms(
        &self,
        account: Option<&ExternalAccount>,
        repos: &[Repo],
    ) -> Result<HashMap<i32, Perms>, AuthzError> {
        let own: Vec<&Repo> = repos
            .iter()
            .filter(|repo| ensure_own_repo(SERVICE_TYPE_GITHUB, &self.service_id, repo).is_ok())
            .collect();
        let mut perms = HashMap::with_capacity(own.len());
        if own.is_empty() {
            return Ok(perms);
        }

        let public = self.public_flags(&own).await?;
        let mut private = Vec::new();
        for (repo, is_public) in own.into_iter().zip(public) {
            if is_public {
                perms.insert(repo.id, Perms::Read);
            } else {
                private.push(repo);
            }
        }

        let Some(account) = account.filter(|account| {
            account.service_type == SERVICE_TYPE_GITHUB && account.service_id == self.service_id
        }) else {
            return Ok(perms);
        };
        if private.is_empty() {
            return Ok(perms);
        }

        let readable = self.user_read_flags(account, &private).await?;
        for (repo, read) in private.into_iter().zip(readable) {
            if read {
                perms.insert(repo.id, Perms::Read);
            }
        }
        Ok(perms)
    }

    async fn public_flags(&self, repos: &[&Repo]) -> Result<Vec<bool>, AuthzError> {
        let keys: Vec<String> = repos.iter().map(|r| r.external_repo.id.clone()).collect();
        let cached: Vec<Option<CachedPublic>> = self.public_cache.get_multi_json(&keys).await?;

        let mut flags = Vec::with_capacity(repos.len());
        let mut fresh = Vec::new();
        for (repo, entry) in repos.iter().zip(cached) {
            match entry.filter(|entry| entry.ttl == self.ttl_secs()) {
                Some(entry) => flags.push(entry.public),
                None => {
                    let (owner, name) = Self::owner_and_name(repo)?;
                    let public = match self.client.get_repository(owner, name, false).await {
                        Ok(found) => !found.private,
                        Err(err) if err.is_not_found() => false,
                        Err(err) => return Err(err.into()),
                    };
                    fresh.push((
                        repo.external_repo.id.clone(),
                        CachedPublic {
                            public,
                            ttl: self.ttl_secs(),
                        },
                    ));
                    flags.push(public);
                }
            }
        }

        if !fresh.is_empty() {
            debug!(misses = fresh.len(), "filled public repository cache");
            self.public_cache.set_multi_json(&fresh).await?;
        }
        Ok(flags)
    }

    async fn user_read_flags(
        &self,
        account: &ExternalAccount,
        repos: &[&Repo],
    ) -> Result<Vec<bool>, AuthzError> {
        let keys: Vec<String> = repos
            .iter()
            .map(|repo| user_repo_key(&account.account_id, &repo.external_repo.id))
            .collect();
        let cached: Vec<Option<CachedUserRepo>> = self.user_cache.get_multi_json(&keys).await?;
        let mut flags: Vec<Option<bool>> = cached
            .into_iter()
            .map(|entry| {
                entry
                    .filter(|entry| entry.ttl == self.ttl_secs())
                    .map(|entry| entry.read)
            })
            .collect();
        if flags.iter().all(Option::is_some) {
            return Ok(flags.into_iter().map(|flag| flag.unwrap_or(false)).collect());
        }

        let token = account_token(SERVICE_TYPE_GITHUB, &self.service_id, Some(account))?;
        let client = self.client.with_token(token);
        let mut fresh = Vec::new();
        for ((repo, key), flag) in repos.iter().zip(keys).zip(flags.iter_mut()) {
            if flag.is_some() {
                continue;
            }
            let (owner, name) = Self::owner_and_name(repo)?;
            let read = match client.get_repository(owner, name, false).await {
                Ok(_) => true,
                Err(err) if err.is_not_found() => false,
                Err(err) => return Err(err.into()),
            };
            fresh.push((
                key,
                CachedUserRepo {
                    read,
                    ttl: self.ttl_secs(),
                },
            ));
            *flag = Some(read);
        }

        debug!(misses = fresh.len(), "filled user repository cache");
        self.user_cache.set_multi_json(&fresh).await?;
        Ok(flags.into_iter().map(|flag| flag.unwrap_or(false)).collect())
    }
}

fn user_repo_key(account_id: &str, external_repo_id: &str) -> String {
    format!("{account_id}:{external_repo_id}")
}

#[async_trait]
impl AuthzProvider for GitHubProvider {
    fn service_type(&self) -> &str {
        SERVICE_TYPE_GITHUB
    }

    fn service_id(&self) -> &str {
        &self.service_id
    }

    #[instrument(skip_all, fields(provider = "github", account_id = tracing::field::Empty))]
    async fn fetch_user_perms(
        &self,
        account: Option<&ExternalAccount>,
        _opts: FetchPermsOptions,
    ) -> Result<Vec<String>, AuthzError> {
        let token = account_token(SERVICE_TYPE_GITHUB, &self.service_id, account)?;
        let account_id = account.map(|a| a.account_id.as_str()).unwrap_or_default();
        tracing::Span::current().record("account_id", account_id);

        let client = self.client.with_token(token);
        let mut repo_ids = Vec::new();
        let mut page = 1;
        loop {
            let listing = client.list_affiliated_repositories(page).await?;
            repo_ids.extend(listing.items.into_iter().map(|repo| repo.node_id));
            if !listing.has_next_page {
                break;
            }
            page += 1;
        }

        let entries: Vec<(String, CachedUserRepo)> = repo_ids
            .iter()
            .map(|id| {
                (
                    user_repo_key(account_id, id),
                    CachedUserRepo {
                        read: true,
                        ttl: self.ttl_secs(),
                    },
                )
            })
            .collect();
        if let Err(err) = self.user_cache.set_multi_json(&entries).await {
            warn!(error = %err, "failed to record user repository cache entries");
        }

        Ok(repo_ids)
    }

    #[instrument(skip_all, fields(provider = "github", repo_id = repo.id))]
    async fn fetch_repo_perms(
        &self,
        repo: &Repo,
        opts: FetchPermsOptions,
    ) -> Result<Vec<String>, AuthzError> {
        ensure_own_repo(SERVICE_TYPE_GITHUB, &self.service_id, repo)?;
        let (owner, name) = Self::owner_and_name(repo)?;

        if opts.invalidate_caches {
            self.public_cache.delete(&repo.external_repo.id).await?;
        }

        let mut account_ids = Vec::new();
        let mut page = 1;
        loop {
            let listing = self
                .client
                .list_repository_collaborators(owner, name, page)
                .await?;
            account_ids.extend(listing.items.into_iter().map(|user| user.id.to_string()));
            if !listing.has_next_page {
                break;
            }
            page += 1;
        }
        Ok(account_ids)
    }
}
