//! HTTP sources for the module overlay and the permission list.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

use modgate_auth::Session;
use modgate_core::FetchError;
use modgate_registry::{ModuleStatus, ModuleStatusSource};

use crate::permission_store::{PermissionRecord, PermissionSource};

/// `GET {base}/api/modules`.
#[derive(Debug, Clone)]
pub struct HttpModuleStatusSource {
    client: Client,
    base_url: String,
}

impl HttpModuleStatusSource {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self) -> String {
        format!("{}/api/modules", self.base_url)
    }
}

#[async_trait]
impl ModuleStatusSource for HttpModuleStatusSource {
    async fn fetch_statuses(&self) -> Result<Vec<ModuleStatus>, FetchError> {
        let response = self
            .client
            .get(self.url())
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        decode(response).await
    }
}

/// `GET {base}/api/users/{user_id}/permissions` with the session's bearer token.
#[derive(Debug, Clone)]
pub struct HttpPermissionSource {
    client: Client,
    base_url: String,
}

impl HttpPermissionSource {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, session: &Session) -> String {
        format!("{}/api/users/{}/permissions", self.base_url, session.user_id())
    }
}

#[async_trait]
impl PermissionSource for HttpPermissionSource {
    async fn fetch_permissions(&self, session: &Session) -> Result<Vec<PermissionRecord>, FetchError> {
        let response = self
            .client
            .get(self.url(session))
            .bearer_auth(session.bearer_token())
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        decode(response).await
    }
}

fn check_status(status: StatusCode) -> Result<(), FetchError> {
    if status == StatusCode::UNAUTHORIZED {
        Err(FetchError::Unauthorized)
    } else if !status.is_success() {
        Err(FetchError::Status(status.as_u16()))
    } else {
        Ok(())
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, FetchError> {
    check_status(response.status())?;
    let body = response
        .bytes()
        .await
        .map_err(|e| FetchError::Network(e.to_string()))?;
    serde_json::from_slice(&body).map_err(|e| FetchError::Parse(e.to_string()))
}
