//! GitLab v4 client.

use std::sync::Arc;
use std::time::Instant;

use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;

use super::ratelimit::GITLAB_HEADERS;
use super::{CodeHostError, Page, RateLimitMonitor, header_str, record_request, retry_after};

const CLIENT: &str = "gitlab";
const PER_PAGE: u32 = 100;
/// Reporter; the lowest level that can read repository contents.
const MIN_READ_ACCESS_LEVEL: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub path_with_namespace: String,
    #[serde(default)]
    pub visibility: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: i64,
    pub username: String,
    pub access_level: u32,
}

#[derive(Clone)]
pub struct GitLabClient {
    http: reqwest::Client,
    api_url: Url,
    token: Option<String>,
    rate_limit: Arc<RateLimitMonitor>,
}

impl GitLabClient {
    /// `base_url` is the instance root; requests go to `<base_url>/api/v4/`.
    pub fn new(base_url: &Url, token: Option<String>) -> Result<Self, url::ParseError> {
        let api_url = super::normalize_base_url(base_url).join("api/v4/")?;
        Ok(Self {
            http: reqwest::Client::new(),
            api_url,
            token,
            rate_limit: Arc::new(RateLimitMonitor::new(CLIENT, GITLAB_HEADERS)),
        })
    }

    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..self.clone()
        }
    }

    pub fn rate_limit(&self) -> &RateLimitMonitor {
        &self.rate_limit
    }

    pub async fn get_user(&self) -> Result<User, CodeHostError> {
        Ok(self.get::<User>("user", "user").await?.0)
    }

    pub async fn get_project(&self, id: i64) -> Result<Project, CodeHostError> {
        Ok(self.get::<Project>("project", &format!("projects/{id}")).await?.0)
    }

    /// Projects the token can read at reporter level or above. Pages start at 1.
    pub async fn list_projects(&self, page: u32) -> Result<Page<Project>, CodeHostError> {
        let path = format!(
            "projects?min_access_level={MIN_READ_ACCESS_LEVEL}&page={page}&per_page={PER_PAGE}"
        );
        let (items, has_next_page) = self.get("projects", &path).await?;
        Ok(Page {
            items,
            has_next_page,
        })
    }

    /// Members of a project including those inherited from parent groups. Pages start at 1.
    pub async fn list_project_members(
        &self,
        id: i64,
        page: u32,
    ) -> Result<Page<Member>, CodeHostError> {
        let path = format!("projects/{id}/members/all?page={page}&per_page={PER_PAGE}");
        let (items, has_next_page) = self.get("members", &path).await?;
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
        let url = self.api_url.join(path)?;
        let mut request = self.http.get(url.clone());
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
            return Err(map_error(url, response).await);
        }

        let has_next_page = header_str(response.headers(), "X-Next-Page").is_some();
        let body = response.bytes().await?;
        Ok((serde_json::from_slice(&body)?, has_next_page))
    }
}

async fn map_error(url: Url, response: Response) -> CodeHostError {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    // GitLab reports `message` as a string or as a field-keyed object.
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|value| value.get("message").cloned())
        .map(|message| match message {
            serde_json::Value::String(text) => text,
            other => other.to_string(),
        })
        .unwrap_or(body);

    match status {
        StatusCode::NOT_FOUND => CodeHostError::NotFound {
            url: url.to_string(),
        },
        StatusCode::UNAUTHORIZED => CodeHostError::Unauthorized { message },
        StatusCode::FORBIDDEN => CodeHostError::Forbidden { message },
        StatusCode::TOO_MANY_REQUESTS => CodeHostError::RateLimited {
            retry_after: retry_after(&headers),
        },
        _ => CodeHostError::Api {
            url: url.to_string(),
            status: status.as_u16(),
            message,
        },
    }
}
