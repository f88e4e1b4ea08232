//! Client for a knot's internal API, as used by the directory service and
//! the `keyfetch` helper.  Every request carries a fresh signature.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Method, Response, StatusCode, Url};
use serde_json::json;
use tracing::{debug, instrument};

use super::signature::{RequestSigner, SharedSecret, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::db::PublicKey;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Message the knot signs in its `/init` response to prove it holds the
/// shared secret.
pub const INIT_ACK: &[u8] = b"ok";

#[derive(Debug, Clone)]
pub struct SignedClient {
    http: reqwest::Client,
    base: String,
    secret: SharedSecret,
    signer: RequestSigner,
}

impl SignedClient {
    pub fn new(base_url: &str, secret: SharedSecret) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("knotserver/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build reqwest client")?;
        Url::parse(base_url).with_context(|| format!("invalid knot URL: {base_url}"))?;
        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
            signer: RequestSigner::new(secret.clone()),
            secret,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        let raw = format!("{}{path}", self.base);
        Url::parse(&raw).with_context(|| format!("invalid request URL: {raw}"))
    }

    /// Send a signed request to an already-built URL.
    #[instrument(skip(self, url, body), fields(path = %url.path()))]
    pub async fn send_url(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<Response> {
        let signed = self.signer.sign(method.as_str(), url.path())?;
        let mut request = self
            .http
            .request(method, url)
            .header(SIGNATURE_HEADER, signed.signature)
            .header(TIMESTAMP_HEADER, signed.timestamp);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.context("knot request failed")?;
        debug!(status = %response.status(), "knot responded");
        Ok(response)
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Response> {
        let url = self.url(path)?;
        self.send_url(method, url, body).await
    }

    // -----------------------------------------------------------------------
    // Typed calls
    // -----------------------------------------------------------------------

    /// Claim an uninitialized knot for `did`.
    pub async fn init(&self, did: &str, keys: &[String]) -> Result<()> {
        let response = self
            .send(Method::POST, "/init", Some(json!({ "did": did, "keys": keys })))
            .await?;
        let response = expect_status(response, StatusCode::NO_CONTENT, "init").await?;

        let ack = response
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .context("knot did not sign its init response")?;
        self.secret
            .verify_message(INIT_ACK, ack)
            .context("knot init response carries a bad signature")?;
        Ok(())
    }

    pub async fn new_repo(&self, did: &str, name: &str) -> Result<()> {
        let response = self
            .send(Method::PUT, "/repo/new", Some(json!({ "did": did, "name": name })))
            .await?;
        expect_status(response, StatusCode::NO_CONTENT, "create repo").await?;
        Ok(())
    }

    /// Delete `did/name`, acting as `actor` (the owner when `None`).
    pub async fn delete_repo(&self, did: &str, name: &str, actor: Option<&str>) -> Result<()> {
        let response = self
            .send(
                Method::DELETE,
                "/repo",
                Some(json!({ "did": did, "name": name, "actor": actor })),
            )
            .await?;
        expect_status(response, StatusCode::NO_CONTENT, "delete repo").await?;
        Ok(())
    }

    pub async fn add_member(&self, did: &str) -> Result<()> {
        let response = self
            .send(Method::PUT, "/member/add", Some(json!({ "did": did })))
            .await?;
        expect_status(response, StatusCode::NO_CONTENT, "add member").await?;
        Ok(())
    }

    pub async fn add_collaborator(&self, owner: &str, repo: &str, collaborator: &str) -> Result<()> {
        let path = format!("/{owner}/{repo}/collaborator/add");
        let response = self
            .send(Method::POST, &path, Some(json!({ "did": collaborator })))
            .await?;
        expect_status(response, StatusCode::NO_CONTENT, "add collaborator").await?;
        Ok(())
    }

    pub async fn add_key(&self, did: &str, name: &str, key: &str) -> Result<()> {
        let response = self
            .send(
                Method::PUT,
                "/keys",
                Some(json!({ "did": did, "name": name, "key": key })),
            )
            .await?;
        expect_status(response, StatusCode::NO_CONTENT, "add key").await?;
        Ok(())
    }

    pub async fn keys(&self) -> Result<Vec<PublicKey>> {
        let response = self.send(Method::GET, "/keys", None).await?;
        let response = expect_status(response, StatusCode::OK, "list keys").await?;
        response
            .json::<Vec<PublicKey>>()
            .await
            .context("failed to decode key list")
    }

    /// `Ok(true)` on 204, `Ok(false)` on 403.
    pub async fn push_allowed(&self, user: &str, repo: &str) -> Result<bool> {
        let mut url = self.url("/push-allowed")?;
        url.query_pairs_mut()
            .append_pair("user", user)
            .append_pair("repo", repo);
        let response = self.send_url(Method::GET, url, None).await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(true),
            StatusCode::FORBIDDEN => Ok(false),
            status => bail!("push check returned unexpected status {status}"),
        }
    }

    pub async fn health(&self) -> Result<()> {
        let response = self.send(Method::GET, "/health", None).await?;
        expect_status(response, StatusCode::OK, "health").await?;
        Ok(())
    }
}

async fn expect_status(response: Response, expected: StatusCode, what: &str) -> Result<Response> {
    let status = response.status();
    if status == expected {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("{what} failed with status {status}: {}", body.trim())
}
