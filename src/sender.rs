use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::fmt;
use std::time::Duration;

use crate::error::SendError;
use crate::message::Mail;

pub const DEFAULT_HOST: &str = "api.sendgrid.com";
const USER_AGENT: &str = concat!("sendgrid-appender/", env!("CARGO_PKG_VERSION"));

/// Delivers a composed mail. Implemented by [`SendGridClient`]; tests and
/// alternative providers can supply their own.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &Mail) -> Result<SendResponse, SendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResponse {
    pub status_code: u16,
    /// The `X-Message-Id` SendGrid assigns to accepted mail.
    pub message_id: Option<String>,
    pub body: String,
}

#[derive(Clone)]
pub struct SendGridClient {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl SendGridClient {
    pub fn new(
        api_key: impl Into<String>,
        host: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            // Requests may be driven by different runtimes; pooled
            // connections must not outlive the one that opened them.
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(SendGridClient {
            client,
            api_key: api_key.into(),
            endpoint: endpoint_for(host),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Debug for SendGridClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendGridClient")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// A bare host gets `https://`; a host that already carries a scheme is used
/// as the base URL as is.
pub(crate) fn endpoint_for(host: Option<&str>) -> String {
    let host = host
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .unwrap_or(DEFAULT_HOST);
    let base = if host.contains("://") {
        host.trim_end_matches('/').to_owned()
    } else {
        format!("https://{}", host.trim_end_matches('/'))
    };
    format!("{base}/v3/mail/send")
}

#[async_trait]
impl MailTransport for SendGridClient {
    async fn send(&self, mail: &Mail) -> Result<SendResponse, SendError> {
        let body = serde_json::to_vec(mail)?;
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = body_or_read_error(response.text().await);

        if status.is_success() {
            Ok(SendResponse {
                status_code: status.as_u16(),
                message_id,
                body,
            })
        } else {
            Err(SendError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// A body that failed to read still says why in the diagnostic.
fn body_or_read_error(body: Result<String, reqwest::Error>) -> String {
    body.unwrap_or_else(|e| format!("<failed to read response body: {e}>"))
}
