//! Registry authentication
//!
//! Registries announce how to authenticate in the `WWW-Authenticate` header of
//! a 401 response. Bearer challenges are answered by fetching a token from the
//! advertised realm (anonymously, or with basic credentials when configured);
//! Basic challenges are answered with the credentials directly.

use crate::config::AuthConfig;
use crate::error::handlers::HttpErrorHandler;
use crate::error::{Result, StoreError};
use crate::logging::Logger;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic {
        realm: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

impl Challenge {
    /// Parses a `WWW-Authenticate` header value
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        let params = parse_params(params);

        match scheme.to_ascii_lowercase().as_str() {
            "bearer" => {
                let realm = params.get("realm").cloned().ok_or_else(|| {
                    StoreError::Auth("Bearer challenge without realm".to_string())
                })?;
                Ok(Challenge::Bearer {
                    realm,
                    service: params.get("service").cloned(),
                    scope: params.get("scope").cloned(),
                })
            }
            "basic" => Ok(Challenge::Basic {
                realm: params.get("realm").cloned(),
            }),
            other => Err(StoreError::Unsupported(format!(
                "authentication scheme {}",
                other
            ))),
        }
    }

    /// Produces an `Authorization` header value answering this challenge.
    ///
    /// `scope` is used when the challenge doesn't name one itself.
    pub async fn authorize(
        &self,
        client: &Client,
        credentials: Option<&AuthConfig>,
        scope: &str,
        logger: &Logger,
    ) -> Result<String> {
        match self {
            Challenge::Basic { .. } => {
                let (username, password) = credentials
                    .and_then(|c| c.username.as_deref().zip(c.password.as_deref()))
                    .ok_or_else(|| {
                        StoreError::Auth(
                            "registry requires basic authentication but no credentials are configured"
                                .to_string(),
                        )
                    })?;
                Ok(basic_header(username, password))
            }
            Challenge::Bearer {
                realm,
                service,
                scope: challenge_scope,
            } => {
                let token = fetch_token(
                    client,
                    realm,
                    service.as_deref(),
                    challenge_scope.as_deref().unwrap_or(scope),
                    credentials,
                    logger,
                )
                .await?;
                Ok(format!("Bearer {}", token))
            }
        }
    }
}

/// Pull scope for `repository`
pub fn pull_scope(repository: &str) -> String {
    format!("repository:{}:pull", repository)
}

pub fn basic_header(username: &str, password: &str) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", username, password))
    )
}

async fn fetch_token(
    client: &Client,
    realm: &str,
    service: Option<&str>,
    scope: &str,
    credentials: Option<&AuthConfig>,
    logger: &Logger,
) -> Result<String> {
    let mut url = Url::parse(realm)?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(service) = service {
            query.append_pair("service", service);
        }
        query.append_pair("scope", scope);
    }

    logger.detail(&format!("Requesting token from: {}", url));

    let mut request = client.get(url);
    if let Some((username, password)) =
        credentials.and_then(|c| c.username.as_deref().zip(c.password.as_deref()))
    {
        logger.debug(&format!("Authenticating as {}", username));
        request = request.basic_auth(username, Some(password));
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        return Err(HttpErrorHandler::handle_auth_error(status, &error_text));
    }

    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| StoreError::Parse(format!("Failed to parse token response: {}", e)))?;

    if let Some(expires_in) = body.expires_in {
        logger.trace(&format!("Token expires in {} seconds", expires_in));
    }

    body.token
        .or(body.access_token)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| StoreError::Auth("token response did not contain a token".to_string()))
}

/// Splits `key="value", key2=value2` pairs, honoring commas inside quotes
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, after_key)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after_key = after_key.trim_start();

        let (value, remainder) = if let Some(quoted) = after_key.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after_key.find(',') {
                Some(end) => (after_key[..end].trim(), &after_key[end..]),
                None => (after_key.trim(), ""),
            }
        };

        params.insert(key, value.to_string());
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }

    params
}
