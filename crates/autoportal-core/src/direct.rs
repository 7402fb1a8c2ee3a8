//! Cheap direct-protocol client.
//!
//! Replays cached session cookies against the portal's plain HTTP
//! endpoints, skipping the automation engine entirely. Responses are
//! returned raw; the orchestrator classifies them via [`crate::classify`].

use std::time::Duration;

use async_trait::async_trait;
use autoportal_store::{CredentialBundle, CredentialItem};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::{HeaderMap, COOKIE, LOCATION, SET_COOKIE};
use tracing::debug;

use crate::accounts::PortalSecret;
use crate::classify::{classify, FailureKind};
use crate::config::PortalRoutes;
use crate::error::PortalError;
use crate::operation::{MutationOp, PortalOperation};

/// Raw response from the direct-protocol path.
#[derive(Debug, Clone)]
pub struct DirectResponse {
    pub status: u16,
    pub location: Option<String>,
    pub body: String,
    /// Fresh credentials piggybacked on the response (rotated cookies).
    pub refreshed: Option<CredentialBundle>,
}

impl DirectResponse {
    pub fn kind(&self) -> FailureKind {
        classify(self.status, self.location.as_deref(), &self.body)
    }
}

/// Direct-protocol collaborator.
///
/// Transport-level failures surface as [`PortalError::Transient`];
/// everything that produced a response comes back as a [`DirectResponse`]
/// for classification.
#[async_trait]
pub trait DirectClient: Send + Sync {
    async fn read(
        &self,
        bundle: &CredentialBundle,
        query: &str,
    ) -> Result<DirectResponse, PortalError>;

    async fn mutate(
        &self,
        bundle: &CredentialBundle,
        op: &MutationOp,
    ) -> Result<DirectResponse, PortalError>;

    /// Lightweight login. `Ok(None)` means the portal refuses plain-protocol
    /// logins (challenge required) and the caller must fall back to an
    /// automation session.
    async fn login(&self, secret: &PortalSecret) -> Result<Option<CredentialBundle>, PortalError>;

    /// Whether the operation has a direct-protocol form at all.
    fn supports(&self, op: &PortalOperation<'_>) -> bool {
        let _ = op;
        true
    }
}

/// reqwest-backed implementation.
///
/// Redirects are never followed: a login redirect must stay visible to the
/// classifier instead of being resolved into a served login page.
pub struct HttpDirectClient {
    client: reqwest::Client,
    routes: PortalRoutes,
}

impl HttpDirectClient {
    pub fn new(routes: PortalRoutes, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, routes })
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<DirectResponse, PortalError> {
        let response = request
            .send()
            .await
            .map_err(|error| PortalError::Transient(format!("portal request failed: {error}")))?;

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);
        let refreshed = bundle_from_set_cookie(response.headers());
        let body = response.text().await.unwrap_or_default();

        debug!(status, "direct portal response");
        Ok(DirectResponse {
            status,
            location,
            body,
            refreshed,
        })
    }
}

#[async_trait]
impl DirectClient for HttpDirectClient {
    async fn read(
        &self,
        bundle: &CredentialBundle,
        query: &str,
    ) -> Result<DirectResponse, PortalError> {
        let request = self
            .client
            .get(self.routes.dashboard_url(query))
            .header(COOKIE, cookie_header(bundle));
        self.execute(request).await
    }

    async fn mutate(
        &self,
        bundle: &CredentialBundle,
        op: &MutationOp,
    ) -> Result<DirectResponse, PortalError> {
        let form: Vec<(String, String)> = op
            .form_fields()
            .into_iter()
            .map(|field| (field.name, field.value))
            .collect();
        let request = self
            .client
            .post(self.routes.manage_url())
            .header(COOKIE, cookie_header(bundle))
            .form(&form);
        self.execute(request).await
    }

    async fn login(&self, secret: &PortalSecret) -> Result<Option<CredentialBundle>, PortalError> {
        let request = self.client.post(self.routes.login_url()).form(&[
            ("username", secret.username.as_str()),
            ("password", secret.password.as_str()),
        ]);
        let response = self.execute(request).await?;

        match response.kind() {
            FailureKind::Unauthorized => Err(PortalError::Unauthorized),
            FailureKind::Transient => Err(PortalError::Transient(format!(
                "login endpoint returned status {}",
                response.status
            ))),
            _ => Ok(response.refreshed.filter(|bundle| !bundle.is_empty())),
        }
    }
}

fn cookie_header(bundle: &CredentialBundle) -> String {
    bundle
        .items
        .iter()
        .map(|item| format!("{}={}", item.name, item.value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Build a bundle from Set-Cookie headers. The bundle-level expiry is the
/// least-far expiry announced by any cookie (Max-Age wins over Expires).
fn bundle_from_set_cookie(headers: &HeaderMap) -> Option<CredentialBundle> {
    let mut items = Vec::new();
    let mut earliest: Option<DateTime<Utc>> = None;

    for raw in headers.get_all(SET_COOKIE) {
        let Ok(raw) = raw.to_str() else { continue };
        let Some(item) = parse_set_cookie(raw) else {
            continue;
        };
        if let Some(expiry) = cookie_expiry(&item) {
            earliest = Some(match earliest {
                Some(current) => current.min(expiry),
                None => expiry,
            });
        }
        items.push(item);
    }

    if items.is_empty() {
        return None;
    }
    let mut bundle = CredentialBundle::new(items);
    bundle.expires_at = earliest;
    Some(bundle)
}

fn parse_set_cookie(raw: &str) -> Option<CredentialItem> {
    let mut segments = raw.split(';');
    let (name, value) = segments.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut item = CredentialItem::new(name, value.trim());
    for segment in segments {
        let segment = segment.trim();
        let (attr_name, attr_value) = match segment.split_once('=') {
            Some((n, v)) => (n.trim().to_ascii_lowercase(), v.trim().to_string()),
            None => (segment.to_ascii_lowercase(), String::new()),
        };
        if !attr_name.is_empty() {
            item.attributes.insert(attr_name, attr_value);
        }
    }
    Some(item)
}

fn cookie_expiry(item: &CredentialItem) -> Option<DateTime<Utc>> {
    if let Some(max_age) = item.attributes.get("max-age") {
        if let Ok(seconds) = max_age.parse::<i64>() {
            return Some(Utc::now() + ChronoDuration::seconds(seconds));
        }
    }
    let expires = item.attributes.get("expires")?;
    DateTime::parse_from_rfc2822(expires)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn cookie_header_joins_items() {
        let bundle = CredentialBundle::new(vec![
            CredentialItem::new("session", "abc"),
            CredentialItem::new("token", "xyz"),
        ]);
        assert_eq!(cookie_header(&bundle), "session=abc; token=xyz");
    }

    #[test]
    fn set_cookie_parsing_keeps_attributes() {
        let item = parse_set_cookie("session=abc123; Path=/; HttpOnly; Max-Age=3600").unwrap();
        assert_eq!(item.name, "session");
        assert_eq!(item.value, "abc123");
        assert_eq!(item.attributes.get("max-age").unwrap(), "3600");
        assert!(item.attributes.contains_key("httponly"));
    }

    #[test]
    fn set_cookie_without_value_is_rejected() {
        assert!(parse_set_cookie("garbage").is_none());
        assert!(parse_set_cookie("=nameless; Path=/").is_none());
    }

    #[test]
    fn bundle_expiry_uses_least_far_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("session=abc; Max-Age=60"),
        );
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("token=xyz; Max-Age=3600"),
        );

        let bundle = bundle_from_set_cookie(&headers).unwrap();
        assert_eq!(bundle.items.len(), 2);
        let expiry = bundle.expires_at.unwrap();
        let in_two_minutes = Utc::now() + ChronoDuration::seconds(120);
        assert!(expiry < in_two_minutes, "least-far expiry should win");
    }

    #[test]
    fn no_cookies_means_no_bundle() {
        assert!(bundle_from_set_cookie(&HeaderMap::new()).is_none());
    }
}
