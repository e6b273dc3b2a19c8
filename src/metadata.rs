use oauth2::url::{ParseError, Url};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
enum MetadataError {
    #[error("{0}")]
    Request(#[from] reqwest::Error),
    #[error("end_session_endpoint is not a valid URL: {0}")]
    InvalidEndpoint(#[from] ParseError),
}

#[derive(Deserialize)]
struct OpenIdConfiguration {
    end_session_endpoint: Option<String>,
}

/// Identity provider endpoints needed for RP-initiated logout, resolved once at startup.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OidcMetadata {
    end_session_endpoint: Option<Url>,
}

impl OidcMetadata {
    const DISCOVERY_PATH: &'static str = "/.well-known/openid-configuration";

    pub fn new(end_session_endpoint: Option<Url>) -> Self {
        Self {
            end_session_endpoint,
        }
    }

    pub fn end_session_endpoint(&self) -> Option<&Url> {
        self.end_session_endpoint.as_ref()
    }

    pub(crate) fn discovery_url(issuer_url: &str) -> String {
        format!(
            "{}{}",
            issuer_url.trim_end_matches('/'),
            Self::DISCOVERY_PATH
        )
    }

    /// Never fails: without an endpoint logout degrades to local only.
    pub async fn resolve(http: &reqwest::Client, issuer_url: &str, timeout: Duration) -> Self {
        let discovery_url = Self::discovery_url(issuer_url);

        match Self::fetch(http, &discovery_url, timeout).await {
            Ok(Some(endpoint)) => {
                log::info!("Resolved end_session_endpoint {}.", endpoint);
                Self::new(Some(endpoint))
            }
            Ok(None) => {
                log::error!(
                    "No end_session_endpoint in {}. Identity provider logout is unavailable.",
                    discovery_url
                );
                Self::default()
            }
            Err(err) => {
                log::error!(
                    "Failed to fetch OIDC metadata from {}: {}. Identity provider logout is unavailable.",
                    discovery_url,
                    err
                );
                Self::default()
            }
        }
    }

    async fn fetch(
        http: &reqwest::Client,
        discovery_url: &str,
        timeout: Duration,
    ) -> Result<Option<Url>, MetadataError> {
        let configuration: OpenIdConfiguration = http
            .get(discovery_url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(configuration
            .end_session_endpoint
            .filter(|endpoint| !endpoint.trim().is_empty())
            .map(|endpoint| Url::parse(&endpoint))
            .transpose()?)
    }
}
