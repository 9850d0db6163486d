//! GitLab authorization provider.

use async_trait::async_trait;
use tracing::instrument;
use url::Url;

use super::{AuthzError, AuthzProvider, FetchPermsOptions, Repo, account_token, ensure_own_repo};
use crate::extsvc::{ExternalAccount, GitLabClient, SERVICE_TYPE_GITLAB};

pub struct GitLabProvider {
    service_id: String,
    client: GitLabClient,
}

impl GitLabProvider {
    pub fn new(base_url: &Url, client: GitLabClient) -> Self {
        Self {
            service_id: base_url.to_string(),
            client,
        }
    }
}

#[async_trait]
impl AuthzProvider for GitLabProvider {
    fn service_type(&self) -> &str {
        SERVICE_TYPE_GITLAB
    }

    fn service_id(&self) -> &str {
        &self.service_id
    }

    #[instrument(skip_all, fields(provider = "gitlab"))]
    async fn fetch_user_perms(
        &self,
        account: Option<&ExternalAccount>,
        _opts: FetchPermsOptions,
    ) -> Result<Vec<String>, AuthzError> {
        let token = account_token(SERVICE_TYPE_GITLAB, &self.service_id, account)?;
        let client = self.client.with_token(token);

        let mut project_ids = Vec::new();
        let mut page = 1;
        loop {
            let listing = client.list_projects(page).await?;
            project_ids.extend(listing.items.into_iter().map(|p| p.id.to_string()));
            if !listing.has_next_page {
                break;
            }
            page += 1;
        }
        Ok(project_ids)
    }

    #[instrument(skip_all, fields(provider = "gitlab", repo_id = repo.id))]
    async fn fetch_repo_perms(
        &self,
        repo: &Repo,
        _opts: FetchPermsOptions,
    ) -> Result<Vec<String>, AuthzError> {
        ensure_own_repo(SERVICE_TYPE_GITLAB, &self.service_id, repo)?;
        let project_id: i64 = repo
            .external_repo
            .id
            .parse()
            .map_err(|_| AuthzError::InvalidRepo(repo.name.clone()))?;

        let mut user_ids = Vec::new();
        let mut page = 1;
        loop {
            let listing = self.client.list_project_members(project_id, page).await?;
            user_ids.extend(listing.items.into_iter().map(|m| m.id.to_string()));
            if !listing.has_next_page {
                break;
            }
            page += 1;
        }
        Ok(user_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extsvc::ExternalRepoSpec;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> GitLabProvider {
        let base = Url::parse(&format!("{}/", server.uri())).unwrap();
        let client = GitLabClient::new(&base, Some("site-token".into())).unwrap();
        GitLabProvider::new(&base, client)
    }

    #[tokio::test]
    async fn fetch_user_perms_returns_project_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects"))
            .and(query_param("page", "1"))
            .and(header("authorization", "Bearer user-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Next-Page", "2")
                    .set_body_json(serde_json::json!([
                        {"id": 1, "path_with_namespace": "g/one"}
                    ])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": 2, "path_with_namespace": "g/two"}
            ])))
            .mount(&server)
            .await;

        let provider = provider(&server);
        let account = ExternalAccount {
            id: 1,
            user_id: 1,
            service_type: SERVICE_TYPE_GITLAB.into(),
            service_id: provider.service_id().to_string(),
            account_id: "55".into(),
            access_token: Some("user-token".into()),
        };
        let ids = provider
            .fetch_user_perms(Some(&account), FetchPermsOptions::default())
            .await
            .unwrap();
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn fetch_repo_perms_rejects_non_numeric_ids() {
        let server = MockServer::start().await;
        let provider = provider(&server);
        let repo = Repo {
            id: 3,
            name: "gitlab.example.com/g/three".into(),
            external_repo: ExternalRepoSpec {
                id: "not-a-number".into(),
                service_type: SERVICE_TYPE_GITLAB.into(),
                service_id: provider.service_id().to_string(),
            },
        };
        let err = provider
            .fetch_repo_perms(&repo, FetchPermsOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::InvalidRepo(_)));
    }

    #[tokio::test]
    async fn fetch_repo_perms_returns_member_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/3/members/all"))
            .and(header("authorization", "Bearer site-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": 55, "username": "alice", "access_level": 30}
            ])))
            .mount(&server)
            .await;

        let provider = provider(&server);
        let repo = Repo {
            id: 3,
            name: "gitlab.example.com/g/three".into(),
            external_repo: ExternalRepoSpec {
                id: "3".into(),
                service_type: SERVICE_TYPE_GITLAB.into(),
                service_id: provider.service_id().to_string(),
            },
        };
        let ids = provider
            .fetch_repo_perms(&repo, FetchPermsOptions::default())
            .await
            .unwrap();
        assert_eq!(ids, vec!["55".to_string()]);
    }
}
