//! Token and basic-auth resolution for registry hosts.

use reqwest::Client;
use serde::Deserialize;

use crate::config::SourceConfig;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct AuthChallenge {
    realm: String,
    service: String,
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// A credential to attach to a registry request.
#[derive(Debug, Clone)]
pub enum Credential {
    Bearer(String),
    Basic { username: String, password: String },
    Anonymous,
}

impl Credential {
    pub fn apply(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Credential::Bearer(token) => builder.bearer_auth(token),
            Credential::Basic { username, password } => builder.basic_auth(username, Some(password)),
            Credential::Anonymous => builder,
        }
    }
}

/// Resolves a [`Credential`] for a given host/repository.
///
/// Bearer hosts (Docker Hub via `auth.docker.io`) get a token exchange for
/// scope `repository:<repo>:pull`; basic-auth hosts get the encoded
/// credential; anonymous hosts get no credential at all. Every call probes
/// fresh rather than caching a token across requests: a manifest GET and its
/// blob GETs are infrequent enough per task that the extra round trip isn't
/// worth the complexity of tracking per-repository expiry.
pub struct Auth {
    client: Client,
    source: SourceConfig,
}

impl Auth {
    pub fn new(client: Client, source: SourceConfig) -> Self {
        Self { client, source }
    }

    /// Resolve the credential to present for `repository` on this source.
    pub async fn resolve_token(&self, repository: &str) -> Result<Credential> {
        // `tags/list` exists on every repository and needs no reference,
        // so it doubles as a cheap way to elicit the auth challenge.
        let probe_url = format!("{}/v2/{}/tags/list", self.source.host, repository);
        let response = self.client.get(&probe_url).send().await?;

        if response.status() == 401 {
            if let Some(header) = response.headers().get("www-authenticate") {
                let header_str = header
                    .to_str()
                    .map_err(|e| Error::Auth(format!("invalid WWW-Authenticate header: {e}")))?;
                if let Some(challenge) = header_str.strip_prefix("Bearer ") {
                    return self.exchange_bearer_token(challenge, repository).await;
                }
                if header_str.starts_with("Basic") {
                    return self.basic_credential();
                }
            }
            return self.basic_credential();
        }

        Ok(Credential::Anonymous)
    }

    fn basic_credential(&self) -> Result<Credential> {
        match (&self.source.username, &self.source.password) {
            (Some(username), Some(password)) => Ok(Credential::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => Ok(Credential::Anonymous),
        }
    }

    async fn exchange_bearer_token(&self, challenge: &str, repository: &str) -> Result<Credential> {
        let parsed = parse_challenge(challenge)?;
        let scope = parsed
            .scope
            .unwrap_or_else(|| format!("repository:{repository}:pull"));

        let mut request = self
            .client
            .get(&parsed.realm)
            .query(&[("service", parsed.service.as_str()), ("scope", scope.as_str())]);

        if let (Some(username), Some(password)) = (&self.source.username, &self.source.password) {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Auth(format!(
                "token exchange failed with status {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("failed to parse token response: {e}")))?;
        let token = body
            .token
            .or(body.access_token)
            .ok_or_else(|| Error::Auth("token response had no token field".into()))?;

        Ok(Credential::Bearer(token))
    }
}

fn parse_challenge(header: &str) -> Result<AuthChallenge> {
    let mut realm = None;
    let mut service = None;
    let mut scope = None;

    for param in header.split(',') {
        let param = param.trim();
        if let Some((key, value)) = param.split_once('=') {
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }
    }

    match (realm, service) {
        (Some(realm), Some(service)) => Ok(AuthChallenge { realm, service, scope }),
        _ => Err(Error::Auth("malformed Bearer challenge".into())),
    }
}
