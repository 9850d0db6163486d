//! GitHub REST v3 client
//!
//! Covers the calls permission syncing needs: the authenticated user, single
//! repositories (with an rcache-backed metadata cache) and the paginated
//! affiliated-repository and collaborator listings.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use super::ratelimit::GITHUB_HEADERS;
use super::{CodeHostError, Page, RateLimitMonitor, header_str, record_request, retry_after};
use crate::rcache::{Cache, Rcache};

const CLIENT: &str = "github";
const USER_AGENT: &str = "permsync/0.1";
const ACCEPT: &str = "application/vnd.github+json";
const PER_PAGE: u32 = 100;

const REPO_CACHE_TTL: Duration = Duration::from_secs(10 * 60);
const REPO_NOT_FOUND_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub node_id: String,
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Database id.
    pub id: i64,
    pub node_id: String,
    pub full_name: String,
    pub private: bool,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub id: i64,
    pub node_id: String,
    pub login: String,
}

/// Repository cache entry. `None` remembers a 404 for a short while.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedRepository {
    repository: Option<Repository>,
    cached_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// GitHub REST v3 client bound to one API URL and token.
///
/// Clones share the HTTP connection pool and the rate-limit monitor.
#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: Url,
    token: Option<String>,
    rate_limit: Arc<RateLimitMonitor>,
    rcache: Option<Rcache>,
    repo_cache: Option<Cache>,
}

impl GitHubClient {
    /// `api_url` is the REST root (`https://api.github.com/` or `<ghe>/api/v3/`).
    pub fn new(api_url: &Url, token: Option<String>, rcache: Option<Rcache>) -> Self {
        let mut api_url = api_url.clone();
        if !api_url.path().ends_with('/') {
            let path = format!("{}/", api_url.path());
            api_url.set_path(&path);
        }
        let repo_cache = rcache
            .as_ref()
            .map(|rcache| repo_cache_for(rcache, &api_url, token.as_deref()));

        Self {
            http: reqwest::Client::new(),
            api_url,
            token,
            rate_limit: Arc::new(RateLimitMonitor::new(CLIENT, GITHUB_HEADERS)),
            rcache,
            repo_cache,
        }
    }

    /// Same client authenticating with `token` instead.
    ///
    /// The repository cache is re-keyed so callers never read entries fetched
    /// with another token.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        let token = Some(token.into());
        let repo_cache = self
            .rcache
            .as_ref()
            .map(|rcache| repo_cache_for(rcache, &self.api_url, token.as_deref()));
        Self {
            token,
            repo_cache,
            ..self.clone()
        }
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    pub fn rate_limit(&self) -> &RateLimitMonitor {
        &self.rate_limit
    }

    pub async fn get_authenticated_user(&self) -> Result<User, CodeHostError> {
        let (user, _) = self.get::<User>("user", "user").await?;
        Ok(user)
    }

    /// Fetch one repository, consulting the repository cache unless `bypass_cache` is set.
    pub async fn get_repository(
        &self,
        owner: &str,
        name: &str,
        bypass_cache: bool,
    ) -> Result<Repository, CodeHostError> {
        let key = format!("{}/{}", owner.to_lowercase(), name.to_lowercase());

        if !bypass_cache && let Some(cached) = self.cached_repository(&key).await {
            return match cached {
                Some(repository) => Ok(repository),
                None => Err(CodeHostError::NotFound {
                    url: format!("repos/{owner}/{name}"),
                }),
            };
        }

        let result = self
            .get::<Repository>("repository", &format!("repos/{owner}/{name}"))
            .await
            .map(|(repository, _)| repository);

        match &result {
            Ok(repository) => self.store_repository(&key, Some(repository.clone())).await,
            Err(err) if err.is_not_found() => self.store_repository(&key, None).await,
            Err(_) => {}
        }
        result
    }

    /// Repositories the token's user owns, collaborates on, or reaches through an organization.
    /// Pages start at 1.
    pub async fn list_affiliated_repositories(
        &self,
        page: u32,
    ) -> Result<Page<Repository>, CodeHostError> {
        let path = format!(
            "user/repos?sort=created&visibility=all&affiliation=owner,collaborator,organization_member&page={page}&per_page={PER_PAGE}"
        );
        let (items, has_next_page) = self.get::<Vec<Repository>>("repositories", &path).await?;
        Ok(Page {
            items,
            has_next_page,
        })
    }

    /// Everyone with access to the repository, direct or inherited. Pages start at 1.
    pub async fn list_repository_collaborators(
        &self,
        owner: &str,
        name: &str,
        page: u32,
    ) -> Result<Page<Collaborator>, CodeHostError> {
        let path = format!(
            "repos/{owner}/{name}/collaborators?affiliation=all&page={page}&per_page={PER_PAGE}"
        );
        let (items, has_next_page) = self
            .get::<Vec<Collaborator>>("collaborators", &path)
            .await?;
        Ok(Page {
            items,
            has_next_page,
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        category: &'static str,
        path: &str,
    ) -> Result<(T, bool), CodeHostError> {
        let url = self.api_url.join(path.trim_start_matches('/'))?;
        let mut request = self
            .http
            .get(url.clone())
            .header("Accept", ACCEPT)
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                record_request(CLIENT, category, None, started);
                return Err(err.into());
            }
        };
        record_request(CLIENT, category, Some(response.status().as_u16()), started);
        self.rate_limit.update(response.headers());

        if !response.status().is_success() {
            return Err(self.map_error(url, response).await);
        }

        let has_next_page = header_str(response.headers(), "Link").is_some_and(has_next_link);
        let body = response.bytes().await?;
        Ok((serde_json::from_slice(&body)?, has_next_page))
    }

    async fn map_error(&self, url: Url, response: Response) -> CodeHostError {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|parsed| parsed.message)
            .unwrap_or(body);

        match status {
            StatusCode::NOT_FOUND => CodeHostError::NotFound {
                url: url.to_string(),
            },
            StatusCode::UNAUTHORIZED => CodeHostError::Unauthorized { message },
            StatusCode::TOO_MANY_REQUESTS => CodeHostError::RateLimited {
                retry_after: retry_after(&headers).or_else(|| self.until_reset()),
            },
            StatusCode::FORBIDDEN
                if header_str(&headers, GITHUB_HEADERS.remaining) == Some("0") =>
            {
                warn!(%url, "GitHub rate limit exhausted");
                CodeHostError::RateLimited {
                    retry_after: retry_after(&headers).or_else(|| self.until_reset()),
                }
            }
            StatusCode::FORBIDDEN => CodeHostError::Forbidden { message },
            _ => CodeHostError::Api {
                url: url.to_string(),
                status: status.as_u16(),
                message,
            },
        }
    }

    fn until_reset(&self) -> Option<Duration> {
        self.rate_limit
            .get()
            .and_then(|state| (state.reset - Utc::now()).to_std().ok())
    }

    async fn cached_repository(&self, key: &str) -> Option<Option<Repository>> {
        let cache = self.repo_cache.as_ref()?;
        let cached = match cache.get_json::<CachedRepository>(key).await {
            Ok(cached) => cached?,
            Err(err) => {
                warn!(error = %err, "failed to read GitHub repository cache");
                return None;
            }
        };
        if cached.repository.is_none() {
            let age = (Utc::now() - cached.cached_at).to_std().unwrap_or_default();
            if age > REPO_NOT_FOUND_TTL {
                return None;
            }
        }
        debug!(key, "GitHub repository cache hit");
        Some(cached.repository)
    }

    async fn store_repository(&self, key: &str, repository: Option<Repository>) {
        let Some(cache) = &self.repo_cache else {
            return;
        };
        let entry = CachedRepository {
            repository,
            cached_at: Utc::now(),
        };
        if let Err(err) = cache.set_json(key, &entry).await {
            warn!(error = %err, "failed to write GitHub repository cache");
        }
    }
}

fn repo_cache_for(rcache: &Rcache, api_url: &Url, token: Option<&str>) -> Cache {
    let host = api_url.host_str().unwrap_or_default().to_lowercase();
    let token_hash = hex::encode(Sha256::digest(token.unwrap_or_default().as_bytes()));
    rcache.cache_with_ttl(&format!("gh_repo:{host}:{token_hash}"), REPO_CACHE_TTL)
}

/// Whether a `Link` header advertises a `rel="next"` page.
fn has_next_link(link_header: &str) -> bool {
    link_header.split(',').any(|link| {
        let mut parts = link.split(';');
        let target = parts.next().map(str::trim).unwrap_or_default();
        target.starts_with('<')
            && target.ends_with('>')
            && parts.any(|param| param.trim() == "rel=\"next\"")
    })
}

/// Split `host/owner/name` (or `owner/name`) into owner and name.
pub fn split_repository_name(repo_name: &str) -> Option<(&str, &str)> {
    let mut segments = repo_name.trim_matches('/').rsplit('/');
    let name = segments.next().filter(|s| !s.is_empty())?;
    let owner = segments.next().filter(|s| !s.is_empty())?;
    Some((owner, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn repo_json(node_id: &str, full_name: &str, private: bool) -> serde_json::Value {
        serde_json::json!({
            "id": 1296269,
            "node_id": node_id,
            "full_name": full_name,
            "private": private,
            "html_url": format!("https://github.com/{full_name}"),
        })
    }

    async fn client_for(server: &MockServer, rcache: Option<Rcache>) -> GitHubClient {
        let api_url = Url::parse(&server.uri()).unwrap();
        GitHubClient::new(&api_url, Some("site-token".into()), rcache)
    }

    #[test]
    fn link_header_next_detection() {
        assert!(has_next_link(
            r#"<https://api.github.com/user/repos?page=2>; rel="next", <https://api.github.com/user/repos?page=5>; rel="last""#
        ));
        assert!(!has_next_link(
            r#"<https://api.github.com/user/repos?page=1>; rel="prev", <https://api.github.com/user/repos?page=1>; rel="first""#
        ));
    }

    #[test]
    fn repository_names_split_into_owner_and_name() {
        assert_eq!(
            split_repository_name("github.com/sourcegraph/sourcegraph"),
            Some(("sourcegraph", "sourcegraph"))
        );
        assert_eq!(split_repository_name("owner/name"), Some(("owner", "name")));
        assert_eq!(split_repository_name("name"), None);
    }

    #[tokio::test]
    async fn lists_affiliated_repositories_with_pagination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/repos"))
            .and(query_param("page", "1"))
            .and(query_param(
                "affiliation",
                "owner,collaborator,organization_member",
            ))
            .and(header("authorization", "Bearer user-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(
                        "Link",
                        format!("<{}/user/repos?page=2>; rel=\"next\"", server.uri()).as_str(),
                    )
                    .insert_header("X-RateLimit-Limit", "5000")
                    .insert_header("X-RateLimit-Remaining", "4999")
                    .insert_header("X-RateLimit-Reset", "4102444800")
                    .set_body_json(serde_json::json!([repo_json(
                        "MDEwOlJlcG9zaXRvcnkx",
                        "octo/one",
                        true
                    )])),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, None).await.with_token("user-token");
        let page = client.list_affiliated_repositories(1).await.unwrap();
        assert!(page.has_next_page);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].node_id, "MDEwOlJlcG9zaXRvcnkx");
        assert_eq!(client.rate_limit().get().unwrap().remaining, 4999);
    }

    #[tokio::test]
    async fn authenticated_user_uses_the_client_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .and(header("authorization", "Bearer user-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 583231,
                "node_id": "MDQ6VXNlcjU4MzIzMQ==",
                "login": "octocat",
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .and(header("authorization", "Bearer revoked-token"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(serde_json::json!({"message": "Bad credentials"})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, None).await;
        let user = client
            .with_token("user-token")
            .get_authenticated_user()
            .await
            .unwrap();
        assert_eq!(user.id, 583231);
        assert_eq!(user.login, "octocat");

        let err = client
            .with_token("revoked-token")
            .get_authenticated_user()
            .await
            .unwrap_err();
        assert!(
            matches!(&err, CodeHostError::Unauthorized { message } if message == "Bad credentials"),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn maps_error_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/missing"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(serde_json::json!({"message": "Not Found"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/limited"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("X-RateLimit-Remaining", "0")
                    .insert_header("Retry-After", "30")
                    .set_body_json(serde_json::json!({"message": "API rate limit exceeded"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/secret"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_json(serde_json::json!({"message": "Resource not accessible"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/broken"))
            .respond_with(
                ResponseTemplate::new(502).set_body_json(serde_json::json!({"message": "Bad gateway"})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, None).await;
        assert!(matches!(
            client.get_repository("octo", "missing", false).await,
            Err(CodeHostError::NotFound { .. })
        ));
        assert!(matches!(
            client.get_repository("octo", "limited", false).await,
            Err(CodeHostError::RateLimited { retry_after: Some(d) }) if d == Duration::from_secs(30)
        ));
        assert!(matches!(
            client.get_repository("octo", "secret", false).await,
            Err(CodeHostError::Forbidden { message }) if message == "Resource not accessible"
        ));
        assert!(matches!(
            client.get_repository("octo", "broken", false).await,
            Err(CodeHostError::Api { status: 502, message, .. }) if message == "Bad gateway"
        ));
    }

    #[tokio::test]
    async fn repository_cache_is_scoped_by_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/one"))
            .respond_with(ResponseTemplate::new(200).set_body_json(repo_json(
                "MDEwOlJlcG9zaXRvcnkx",
                "octo/one",
                false,
            )))
            .expect(2)
            .mount(&server)
            .await;

        let rcache = Rcache::in_memory("test");
        let client = client_for(&server, Some(rcache)).await;

        // Second call is served from the cache.
        client.get_repository("octo", "one", false).await.unwrap();
        client.get_repository("Octo", "One", false).await.unwrap();

        // Another token misses the cache.
        client
            .with_token("other-token")
            .get_repository("octo", "one", false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn not_found_is_cached_and_bypass_skips_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/gone"))
            .respond_with(ResponseTemplate::new(404))
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server, Some(Rcache::in_memory("test"))).await;
        for bypass in [false, false, true] {
            let err = client.get_repository("octo", "gone", bypass).await.unwrap_err();
            assert!(err.is_not_found());
        }
    }
}
