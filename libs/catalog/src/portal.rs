use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use serde::Deserialize;
use url::Url;

const USER_AGENT: &str = "aprs2net-poller/2.0";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// One rotate in the portal's catalog payload. Everything beyond the member
/// server map is portal-side metadata we don't consume.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalRotate {
    #[serde(default)]
    pub servers: HashMap<String, PortalServer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalServer {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default)]
    pub ipv6: Option<Ipv6Addr>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub out_of_service: bool,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_alerts: bool,
}

pub type PortalSnapshot = HashMap<String, PortalRotate>;

#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error("portal request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("portal returned status {0}")]
    Status(StatusCode),
    #[error("portal login failed with status {0}")]
    Login(StatusCode),
}

/// Credentials for portals behind a cookie-based session login.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub login_url: Url,
    pub username: String,
    pub password: String,
}

/// HTTP client for the portal's catalog, with ETag caching and an optional
/// session login.
pub struct Portal {
    client: reqwest::Client,
    rotates_url: Url,
    credentials: Option<Credentials>,
    etag: Option<String>,
}

impl Portal {
    pub fn new(rotates_url: Url, credentials: Option<Credentials>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            rotates_url,
            credentials,
            etag: None,
        })
    }

    /// Fetch the rotate catalog. Returns `None` when the portal answers
    /// `304 Not Modified` for our cached ETag.
    pub async fn fetch_rotates(&mut self) -> Result<Option<PortalSnapshot>, PortalError> {
        if let Some(credentials) = &self.credentials {
            self.login(credentials.clone()).await?;
        }

        let mut request = self.client.get(self.rotates_url.clone());
        if let Some(etag) = &self.etag {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }

        let response = request.send().await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(PortalError::Status(response.status()));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_owned());

        let snapshot = response.json::<PortalSnapshot>().await?;
        self.etag = etag;

        Ok(Some(snapshot))
    }

    async fn login(&self, credentials: Credentials) -> Result<(), PortalError> {
        let response = self
            .client
            .post(credentials.login_url)
            .form(&[
                ("user", credentials.username),
                ("pass", credentials.password),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PortalError::Login(response.status()));
        }

        Ok(())
    }
}
