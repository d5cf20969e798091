//! GuerrillaMail adapter.
//!
//! Every mailbox lives in a GuerrillaMail session; the session's `sid_token` is
//! the credential. A listing is one `get_email_list` call followed by one
//! `fetch_email` per message, since the list only carries excerpts.

use super::http::{self, Endpoint};
use super::{split_address, CreatedMailbox, ProviderAdapter, ProviderKey};
use crate::error::{Error, FetchError, Result};
use crate::message::Message;
use crate::normalize::{self, looks_like_html, DateHint, RawMessage};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const DOMAINS: [&str; 6] = [
    "guerrillamail.info",
    "guerrillamail.biz",
    "guerrillamail.com",
    "guerrillamail.de",
    "guerrillamail.net",
    "guerrillamail.org",
];

/// Adapter for <https://www.guerrillamail.com>.
#[derive(Debug)]
pub struct GuerrillaMail {
    endpoint: Endpoint,
}

impl GuerrillaMail {
    /// Production AJAX endpoint.
    pub const BASE_URL: &'static str = "https://api.guerrillamail.com/ajax.php";

    /// Creates the adapter against the production API.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            endpoint: Endpoint::new(client, Self::BASE_URL),
        }
    }

    /// Points the adapter at another endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.endpoint = Endpoint::new(self.endpoint.client.clone(), base_url);
        self
    }

    /// Wait applied when a rate-limited response has no `Retry-After`.
    #[must_use]
    pub fn with_default_retry_after(mut self, retry_after: Duration) -> Self {
        self.endpoint.default_retry_after = retry_after;
        self
    }

    async fn session(&self, query: &[(&str, &str)]) -> std::result::Result<SessionDto, reqwest::Error> {
        self.endpoint
            .client
            .get(&self.endpoint.base_url)
            .query(query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    async fn fetch_one(&self, sid_token: &str, mail_id: &str) -> std::result::Result<MailDto, FetchError> {
        let response = self
            .endpoint
            .client
            .get(&self.endpoint.base_url)
            .query(&[("f", "fetch_email"), ("sid_token", sid_token), ("email_id", mail_id)])
            .send()
            .await
            .map_err(|e| http::transport_error(&e))?;

        if !response.status().is_success() {
            return Err(self.endpoint.classify(&response));
        }
        http::fetch_json(response).await
    }
}

#[async_trait]
impl ProviderAdapter for GuerrillaMail {
    fn key(&self) -> ProviderKey {
        ProviderKey::GUERRILLA_MAIL
    }

    fn display_name(&self) -> &str {
        "GuerrillaMail"
    }

    fn domains(&self) -> Vec<String> {
        DOMAINS.iter().map(ToString::to_string).collect()
    }

    /// With a prefix the session is bound via `set_email_user`; the service may
    /// silently hand back a different local-part, which is reported as taken.
    #[instrument(name = "GuerrillaMail::create_email", skip(self))]
    async fn create_email(&self, desired_prefix: Option<&str>) -> Result<CreatedMailbox> {
        let session = match desired_prefix {
            Some(prefix) => self
                .session(&[
                    ("f", "set_email_user"),
                    ("email_user", prefix),
                    ("lang", "en"),
                    ("site", "guerrillamail.com"),
                ])
                .await
                .map_err(http::request_failed(ProviderKey::GUERRILLA_MAIL, "set_email_user"))?,
            None => self
                .session(&[("f", "get_email_address")])
                .await
                .map_err(http::request_failed(ProviderKey::GUERRILLA_MAIL, "get_email_address"))?,
        };

        let (local, domain) = split_address(&session.email_addr).ok_or_else(|| Error::InvalidEmailFormat {
            email: session.email_addr.clone(),
        })?;

        if let Some(prefix) = desired_prefix {
            if !local.eq_ignore_ascii_case(prefix) {
                debug!(requested = prefix, granted = local, "Session bound to another user");
                return Err(Error::PrefixTaken {
                    prefix: prefix.to_string(),
                    provider: ProviderKey::GUERRILLA_MAIL,
                });
            }
        }

        let sid_token = session.sid_token.clone().ok_or_else(|| Error::CreateMailbox {
            provider: ProviderKey::GUERRILLA_MAIL,
            message: "session without sid_token".to_string(),
        })?;

        Ok(CreatedMailbox::new(local, domain, SecretString::from(sid_token)))
    }

    #[instrument(name = "GuerrillaMail::fetch_messages", skip(self, credential))]
    async fn fetch_messages(
        &self,
        credential: &SecretString,
        address: &str,
    ) -> std::result::Result<Vec<Message>, FetchError> {
        let sid_token = credential.expose_secret();
        let response = self
            .endpoint
            .client
            .get(&self.endpoint.base_url)
            .query(&[("f", "get_email_list"), ("offset", "0"), ("sid_token", sid_token)])
            .send()
            .await
            .map_err(|e| http::transport_error(&e))?;

        if !response.status().is_success() {
            return Err(self.endpoint.classify(&response));
        }
        let listing: ListDto = http::fetch_json(response).await?;

        let mut messages = Vec::with_capacity(listing.list.len());
        for item in listing.list {
            let mail_id = value_to_string(&item.mail_id);
            match self.fetch_one(sid_token, &mail_id).await {
                Ok(mail) => messages.push(normalize::normalize(
                    &ProviderKey::GUERRILLA_MAIL,
                    mail.into_raw(mail_id, item),
                )),
                Err(e @ FetchError::RateLimited { .. }) => return Err(e),
                // One unreadable message must not hide the rest.
                Err(e) => warn!(%mail_id, error = %e, "Skipping unreadable message"),
            }
        }
        Ok(messages)
    }

    async fn check_liveness(&self) -> bool {
        match self.session(&[("f", "get_email_address")]).await {
            Ok(session) => !session.email_addr.is_empty(),
            Err(e) => {
                warn!(error = %e, "GuerrillaMail liveness probe failed");
                false
            }
        }
    }
}

/// Ids and timestamps arrive as numbers or strings depending on the call.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire format
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SessionDto {
    email_addr: String,
    sid_token: Option<String>,
}

#[derive(Deserialize)]
struct ListDto {
    #[serde(default)]
    list: Vec<ListItemDto>,
}

#[derive(Deserialize)]
struct ListItemDto {
    mail_id: Value,
    mail_from: Option<String>,
    mail_subject: Option<String>,
    #[serde(default)]
    mail_timestamp: Value,
}

#[derive(Deserialize)]
struct MailDto {
    mail_from: Option<String>,
    mail_subject: Option<String>,
    mail_body: Option<String>,
    #[serde(default)]
    mail_timestamp: Value,
}

impl MailDto {
    /// Detail fields win; the list item fills the gaps.
    fn into_raw(self, native_id: String, item: ListItemDto) -> RawMessage {
        let (text, html) = match self.mail_body {
            Some(body) if looks_like_html(&body) => (None, Some(body)),
            body => (body, None),
        };
        let date = match DateHint::from_json(&self.mail_timestamp) {
            DateHint::Missing => DateHint::from_json(&item.mail_timestamp),
            hint => hint,
        };
        RawMessage {
            native_id,
            from: self.mail_from.or(item.mail_from),
            subject: self.mail_subject.or(item.mail_subject),
            date,
            text,
            html,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{local_client, StubRoute, StubServer};
    use chrono::{TimeZone, Utc};

    fn item(json: &str) -> ListItemDto {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_html_body_is_kept_as_html() {
        let mail: MailDto = serde_json::from_str(
            r#"{"mail_from": "bot@svc.example", "mail_subject": "Welcome",
                "mail_body": "<p>Code: <b>246810</b></p>", "mail_timestamp": "1528468435"}"#,
        )
        .unwrap();
        let list_item = item(r#"{"mail_id": 17, "mail_timestamp": 0}"#);
        let message = normalize::normalize(
            &ProviderKey::GUERRILLA_MAIL,
            mail.into_raw(value_to_string(&list_item.mail_id), list_item),
        );

        assert_eq!(message.id.to_string(), "guerrillamail_17");
        assert_eq!(message.text, "Code: 246810");
        assert!(message.html.starts_with("<p>"));
        assert_eq!(message.date, Utc.timestamp_opt(1_528_468_435, 0).unwrap());
    }

    #[test]
    fn test_plain_body_and_list_fallbacks() {
        let mail: MailDto = serde_json::from_str(r#"{"mail_body": "line 1\nline 2"}"#).unwrap();
        let list_item = item(
            r#"{"mail_id": "9", "mail_from": "x@y.example", "mail_subject": "From list", "mail_timestamp": 1528468435}"#,
        );
        let message = normalize::normalize(&ProviderKey::GUERRILLA_MAIL, mail.into_raw("9".into(), list_item));

        assert_eq!(message.subject, "From list");
        assert_eq!(message.from, "x@y.example");
        assert_eq!(message.text, "line 1\nline 2");
        assert_eq!(message.html, "line 1<br>line 2");
        assert_eq!(message.date, Utc.timestamp_opt(1_528_468_435, 0).unwrap());
    }

    #[test]
    fn test_parse_listing() {
        let listing: ListDto = serde_json::from_str(
            r#"{"list": [{"mail_id": "1", "mail_from": "a@b.c", "mail_subject": "s", "mail_excerpt": "e"}], "count": "1"}"#,
        )
        .unwrap();
        assert_eq!(listing.list.len(), 1);

        let empty: ListDto = serde_json::from_str(r#"{"count": 0}"#).unwrap();
        assert!(empty.list.is_empty());
    }

    fn sid() -> SecretString {
        SecretString::from("sid-abc".to_string())
    }

    #[tokio::test]
    async fn test_rate_limited_fetch_email_fails_the_fetch() {
        let server = StubServer::start(vec![
            StubRoute::new("f=get_email_list", 200, r#"{"list": [{"mail_id": "1"}]}"#),
            StubRoute::new("f=fetch_email", 429, "").header("Retry-After", "30"),
        ])
        .await;
        let adapter = GuerrillaMail::new(local_client()).with_base_url(&server.url("/ajax.php"));

        let result = adapter.fetch_messages(&sid(), "kpay010@guerrillamail.com").await;
        assert_eq!(
            result,
            Err(FetchError::RateLimited {
                retry_after: Duration::from_secs(30)
            })
        );
    }

    #[tokio::test]
    async fn test_failed_fetch_email_is_skipped() {
        let server = StubServer::start(vec![
            StubRoute::new(
                "f=get_email_list",
                200,
                r#"{"list": [{"mail_id": 1, "mail_subject": "first"},
                             {"mail_id": 2, "mail_subject": "second", "mail_timestamp": "1528468435"}]}"#,
            ),
            StubRoute::new("email_id=1 ", 502, ""),
            StubRoute::new(
                "email_id=2 ",
                200,
                r#"{"mail_from": "bot@svc.example", "mail_body": "code 246810"}"#,
            ),
        ])
        .await;
        let adapter = GuerrillaMail::new(local_client()).with_base_url(&server.url("/ajax.php"));

        let messages = adapter
            .fetch_messages(&sid(), "kpay010@guerrillamail.com")
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id.to_string(), "guerrillamail_2");
        assert_eq!(messages[0].subject, "second");
        assert_eq!(messages[0].text, "code 246810");
        assert!(server.requests()[0].contains("sid_token=sid-abc"));
    }

    #[tokio::test]
    async fn test_listing_not_found_is_classified() {
        let server = StubServer::start(vec![StubRoute::new("f=get_email_list", 404, "")]).await;
        let adapter = GuerrillaMail::new(local_client()).with_base_url(&server.url("/ajax.php"));

        let result = adapter.fetch_messages(&sid(), "kpay010@guerrillamail.com").await;
        assert_eq!(result, Err(FetchError::NotFound));
    }

    #[test]
    fn test_static_domains() {
        let adapter = GuerrillaMail::new(Client::new());
        assert!(adapter.domains().contains(&"guerrillamail.com".to_string()));
    }
}
