//! Short-lived deployment identity tokens.
//!
//! CI runners that grant `id-token: write` export a request URL and a
//! bearer token; exchanging them yields a signed identity token the hosting
//! service uses to authenticate the deployment. A pre-minted token can be
//! supplied directly instead.

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use bookship_shared::{BookshipError, PublishConfig, Result};

/// Where the identity token comes from.
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// Token supplied verbatim.
    Static(String),
    /// Token minted from the runner's token endpoint.
    Mint {
        request_url: String,
        request_token: String,
        audience: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct MintResponse {
    value: String,
}

impl TokenSource {
    /// Pick a source from the environment. Minting wins over a static token.
    pub fn from_env(publish: &PublishConfig) -> Result<Self> {
        let url = non_empty_env(&publish.oidc_request_url_env);
        let token = non_empty_env(&publish.oidc_request_token_env);

        if let (Some(request_url), Some(request_token)) = (url, token) {
            return Ok(Self::Mint {
                request_url,
                request_token,
                audience: publish.oidc_audience.clone(),
            });
        }

        match non_empty_env(&publish.oidc_token_env) {
            Some(token) => Ok(Self::Static(token)),
            None => Err(BookshipError::deployment_rejected(format!(
                "no identity token: set {} or run with id-token permission ({} / {})",
                publish.oidc_token_env,
                publish.oidc_request_url_env,
                publish.oidc_request_token_env
            ))),
        }
    }

    /// Resolve to a token string.
    #[instrument(skip_all)]
    pub async fn fetch(&self, client: &Client) -> Result<String> {
        match self {
            Self::Static(token) => Ok(token.clone()),
            Self::Mint {
                request_url,
                request_token,
                audience,
            } => {
                let mut url = Url::parse(request_url).map_err(|e| {
                    BookshipError::deployment_rejected(format!("invalid token request URL: {e}"))
                })?;
                if let Some(aud) = audience {
                    url.query_pairs_mut().append_pair("audience", aud);
                }

                debug!(host = url.host_str().unwrap_or(""), "minting identity token");

                let response = client
                    .get(url)
                    .bearer_auth(request_token)
                    .send()
                    .await
                    .map_err(|e| BookshipError::deployment(format!("token request failed: {e}")))?;

                let status = response.status();
                if !status.is_success() {
                    return Err(BookshipError::deployment_status(
                        format!("token request failed: HTTP {status}"),
                        status.as_u16(),
                    ));
                }

                let body: MintResponse = response.json().await.map_err(|e| {
                    BookshipError::deployment_rejected(format!("invalid token response: {e}"))
                })?;

                if body.value.is_empty() {
                    return Err(BookshipError::deployment_rejected(
                        "token endpoint returned an empty token",
                    ));
                }
                Ok(body.value)
            }
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
