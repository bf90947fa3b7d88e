//! `reqwest` implementation of [`RemoteApi`].

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::RemoteApi;
use crate::config::ClientConfig;
use crate::models::{
    Collection, DocumentReplicaState, EntityId, Invitation, MemberRole, Note, Setting,
};
use crate::util::{compact_text, join_url, normalize_http_url, normalize_text_option};
use crate::{Error, Result};

/// Header correlating HTTP calls with this client's realtime connection.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

#[derive(Clone)]
pub struct HttpRemoteApi {
    base_url: String,
    client_id: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemoteApi {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteApi")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl HttpRemoteApi {
    pub fn new(base_url: impl Into<String>, client_id: impl Into<String>) -> Result<Self> {
        Self::with_client(base_url, client_id, reqwest::Client::builder().build()?)
    }

    pub fn from_config(config: &ClientConfig, client_id: impl Into<String>) -> Result<Self> {
        let base_url = config.api_base_url.clone().ok_or_else(|| {
            Error::InvalidInput("api_base_url is required for remote sync".to_string())
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Self::with_client(base_url, client_id, client)
    }

    fn with_client(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client: reqwest::Client,
    ) -> Result<Self> {
        let base_url = normalize_http_url(base_url.into(), "api_base_url")?;
        let client_id = normalize_text_option(Some(client_id.into()))
            .ok_or_else(|| Error::InvalidInput("client id must not be empty".to_string()))?;
        Ok(Self {
            base_url,
            client_id,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, join_url(&self.base_url, path))
            .header(CLIENT_ID_HEADER, &self.client_id)
            .header("Accept", "application/json")
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let response = check_status(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn send_empty(&self, request: RequestBuilder) -> Result<()> {
        let response = request.send().await?;
        check_status(response).await?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InviteRequest<'a> {
    email: &'a str,
    role: MemberRole,
}

#[derive(Debug, Serialize)]
struct RoleRequest {
    role: MemberRole,
}

#[derive(Debug, Serialize)]
struct SettingValueRequest<'a> {
    value: &'a serde_json::Value,
    #[serde(rename = "updatedAt")]
    updated_at: i64,
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn list_notes(&self) -> Result<Vec<Note>> {
        self.send_json(self.request(Method::GET, "/notes")).await
    }

    async fn create_note(&self, note: &Note) -> Result<Note> {
        self.send_json(self.request(Method::POST, "/notes").json(note))
            .await
    }

    async fn update_note(&self, note: &Note) -> Result<Note> {
        self.send_json(
            self.request(Method::PUT, &format!("/notes/{}", note.id))
                .json(note),
        )
        .await
    }

    async fn delete_note(&self, id: &EntityId) -> Result<()> {
        self.send_empty(self.request(Method::DELETE, &format!("/notes/{id}")))
            .await
    }

    async fn list_collections(&self) -> Result<Vec<Collection>> {
        self.send_json(self.request(Method::GET, "/collections"))
            .await
    }

    async fn create_collection(&self, collection: &Collection) -> Result<Collection> {
        self.send_json(self.request(Method::POST, "/collections").json(collection))
            .await
    }

    async fn update_collection(&self, collection: &Collection) -> Result<Collection> {
        self.send_json(
            self.request(Method::PUT, &format!("/collections/{}", collection.id))
                .json(collection),
        )
        .await
    }

    async fn delete_collection(&self, id: &EntityId) -> Result<()> {
        self.send_empty(self.request(Method::DELETE, &format!("/collections/{id}")))
            .await
    }

    async fn leave_collection(&self, id: &EntityId) -> Result<()> {
        self.send_empty(self.request(Method::POST, &format!("/collections/{id}/leave")))
            .await
    }

    async fn list_settings(&self) -> Result<Vec<Setting>> {
        self.send_json(self.request(Method::GET, "/settings")).await
    }

    async fn update_setting(&self, setting: &Setting) -> Result<Setting> {
        let body = SettingValueRequest {
            value: &setting.value,
            updated_at: setting.updated_at,
        };
        self.send_json(
            self.request(Method::PUT, &format!("/settings/{}", setting.key))
                .json(&body),
        )
        .await
    }

    async fn sync_settings(&self, settings: &[Setting]) -> Result<Vec<Setting>> {
        self.send_json(self.request(Method::PUT, "/settings").json(settings))
            .await
    }

    async fn list_document_states(&self) -> Result<Vec<DocumentReplicaState>> {
        self.send_json(self.request(Method::GET, "/documents")).await
    }

    async fn invite_member(
        &self,
        collection_id: &EntityId,
        email: &str,
        role: MemberRole,
    ) -> Result<Invitation> {
        let body = InviteRequest { email, role };
        self.send_json(
            self.request(
                Method::POST,
                &format!("/collections/{collection_id}/invitations"),
            )
            .json(&body),
        )
        .await
    }

    async fn accept_invitation(&self, invitation_id: &str) -> Result<Collection> {
        self.send_json(self.request(
            Method::POST,
            &format!("/invitations/{invitation_id}/accept"),
        ))
        .await
    }

    async fn reject_invitation(&self, invitation_id: &str) -> Result<()> {
        self.send_empty(self.request(
            Method::POST,
            &format!("/invitations/{invitation_id}/reject"),
        ))
        .await
    }

    async fn cancel_invitation(&self, invitation_id: &str) -> Result<()> {
        self.send_empty(self.request(Method::DELETE, &format!("/invitations/{invitation_id}")))
            .await
    }

    async fn remove_member(&self, collection_id: &EntityId, user_id: &str) -> Result<()> {
        self.send_empty(self.request(
            Method::DELETE,
            &format!("/collections/{collection_id}/members/{user_id}"),
        ))
        .await
    }

    async fn change_member_role(
        &self,
        collection_id: &EntityId,
        user_id: &str,
        role: MemberRole,
    ) -> Result<Collection> {
        self.send_json(
            self.request(
                Method::PATCH,
                &format!("/collections/{collection_id}/members/{user_id}"),
            )
            .json(&RoleRequest { role }),
        )
        .await
    }
}

pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Api {
        status: status.as_u16(),
        message: parse_api_error(status, &body),
    })
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

pub(crate) fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return compact_text(&message);
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed
    }
}
