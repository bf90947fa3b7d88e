//! Transport to the collaboration server holding the authoritative replica.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use crate::api::{check_status, CLIENT_ID_HEADER};
use crate::config::ClientConfig;
use crate::util::{join_url, normalize_http_url};
use crate::{Error, Result};

const OCTET_STREAM: &str = "application/octet-stream";

/// Opens sessions against the authority for one document at a time.
#[async_trait]
pub trait DocumentAuthority: Send + Sync {
    async fn connect(&self, doc_name: &str) -> Result<Box<dyn AuthoritySession>>;
}

/// A connected session for a single document.
#[async_trait]
pub trait AuthoritySession: Send {
    /// Send the local state and receive whatever the authority has that the
    /// local replica may lack. Both directions are opaque update blobs.
    async fn exchange(&mut self, local_state: &[u8]) -> Result<Vec<u8>>;

    async fn close(&mut self) -> Result<()>;
}

/// Authority reached over plain HTTP: each exchange is one
/// `POST {base}/documents/{name}/sync` round-trip.
#[derive(Clone)]
pub struct HttpDocumentAuthority {
    base_url: String,
    client_id: String,
    client: reqwest::Client,
}

impl HttpDocumentAuthority {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client: reqwest::Client,
    ) -> Result<Self> {
        Ok(Self {
            base_url: normalize_http_url(base_url.into(), "api_base_url")?,
            client_id: client_id.into(),
            client,
        })
    }

    pub fn from_config(config: &ClientConfig, client_id: impl Into<String>) -> Result<Self> {
        let base_url = config.api_base_url.clone().ok_or_else(|| {
            Error::InvalidInput("api_base_url is required for document sync".to_string())
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Self::new(base_url, client_id, client)
    }
}

#[async_trait]
impl DocumentAuthority for HttpDocumentAuthority {
    async fn connect(&self, doc_name: &str) -> Result<Box<dyn AuthoritySession>> {
        Ok(Box::new(HttpAuthoritySession {
            url: join_url(&self.base_url, &format!("documents/{doc_name}/sync")),
            client_id: self.client_id.clone(),
            client: self.client.clone(),
            closed: false,
        }))
    }
}

struct HttpAuthoritySession {
    url: String,
    client_id: String,
    client: reqwest::Client,
    closed: bool,
}

#[async_trait]
impl AuthoritySession for HttpAuthoritySession {
    async fn exchange(&mut self, local_state: &[u8]) -> Result<Vec<u8>> {
        if self.closed {
            return Err(Error::Document("session already closed".to_string()));
        }
        let response = self
            .client
            .post(&self.url)
            .header(CLIENT_ID_HEADER, &self.client_id)
            .header(CONTENT_TYPE, OCTET_STREAM)
            .header("Accept", OCTET_STREAM)
            .body(local_state.to_vec())
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Authority used when no server is configured; every connect fails.
pub struct OfflineAuthority;

#[async_trait]
impl DocumentAuthority for OfflineAuthority {
    async fn connect(&self, doc_name: &str) -> Result<Box<dyn AuthoritySession>> {
        Err(Error::Network(format!(
            "no collaboration server configured for {doc_name}"
        )))
    }
}
