//! Email error events through SendGrid.
//!
//! [`SendGridAppender`] is a [`tracing_subscriber::Layer`]. Events at or above
//! its threshold (ERROR by default) are sent as an email through the SendGrid
//! v3 API, preceded by the most recent lower-severity events for context.
//!
//! ```no_run
//! use tracing_subscriber::filter::LevelFilter;
//! use tracing_subscriber::prelude::*;
//!
//! # fn main() -> Result<(), sendgrid_appender::ConfigError> {
//! let appender = sendgrid_appender::SendGridAppender::builder()
//!     .api_key("SG.xxxxxxxx")
//!     .to("ops@example.com")
//!     .from("Alerts <alerts@example.com>")
//!     .subject("[{level}] {target}: {message}")
//!     .build()?;
//!
//! tracing_subscriber::registry()
//!     .with(tracing_subscriber::fmt::layer())
//!     .with(appender.clone().with_filter(LevelFilter::DEBUG))
//!     .init();
//!
//! tracing::error!("This one is mailed");
//! # Ok(())
//! # }
//! ```

pub mod appender;
pub mod buffer;
pub mod email_config;
pub mod error;
pub mod event;
pub mod layout;
pub mod message;
pub mod sender;

pub use appender::{Builder, SendGridAppender, STATUS_TARGET};
pub use email_config::EmailConfig;
pub use error::{ConfigError, SendError};
pub use event::LogEvent;
pub use layout::{HtmlLayout, Layout, LayoutKind, SubjectTemplate, TextLayout};
pub use message::Mail;
pub use sender::{MailTransport, SendGridClient, SendResponse};

#[cfg(test)]
mod tests {
    use crate::{Mail, MailTransport, SendError, SendGridAppender, SendResponse};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct MockSendGrid {
        requests: Mutex<Vec<Mail>>,
    }

    #[async_trait]
    impl MailTransport for MockSendGrid {
        async fn send(&self, mail: &Mail) -> Result<SendResponse, SendError> {
            self.requests.lock().push(mail.clone());
            Ok(SendResponse {
                status_code: 202,
                message_id: Some("mock".into()),
                body: r#"{"message":"success"}"#.into(),
            })
        }
    }

    #[test]
    fn test_delivery() {
        let send_grid = Arc::new(MockSendGrid::default());
        let appender = SendGridAppender::builder()
            .name("Test")
            .to("to@example.com")
            .cc("cc@example.com")
            .bcc("bcc@example.com")
            .from("from@example.com")
            .reply_to("replyTo@example.com")
            .subject("Subject Pattern {request_id}")
            .api_key("apiKey")
            .buffer_size(3)
            .transport(send_grid.clone())
            .build()
            .unwrap();

        let subscriber =
            tracing_subscriber::registry().with(appender.with_filter(LevelFilter::DEBUG));
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("request", request_id = "SubjectValue1");
            let _entered = span.enter();
            tracing::debug!("Debug message #1");
            tracing::debug!("Debug message #2");
            tracing::debug!("Debug message #3");
            tracing::debug!("Debug message #4");
            let err = std::io::Error::other("Exception message");
            let err: &(dyn std::error::Error + 'static) = &err;
            tracing::error!(error = err, "Error with exception");
            tracing::error!("Error message #2");
        });

        let requests = send_grid.requests.lock();
        assert_eq!(requests.len(), 2);

        let message = &requests[0];
        let personalization = &message.personalizations[0];
        assert_eq!(personalization.to[0].email, "to@example.com");
        assert_eq!(personalization.cc[0].email, "cc@example.com");
        assert_eq!(personalization.bcc[0].email, "bcc@example.com");
        assert_eq!(message.from.as_ref().unwrap().email, "from@example.com");
        assert_eq!(message.reply_to.as_ref().unwrap().email, "replyTo@example.com");
        assert_eq!(message.subject.as_deref(), Some("Subject Pattern SubjectValue1"));

        let content = &message.content[0];
        assert_eq!(content.content_type, "text/html");
        let body = &content.value;
        assert!(!body.contains("Debug message #1"));
        assert!(body.contains("Debug message #2"));
        assert!(body.contains("Debug message #3"));
        assert!(body.contains("Debug message #4"));
        assert!(body.contains("Error with exception"));
        assert!(body.contains("Exception message"));
        assert!(!body.contains("Error message #2"));

        let body2 = &requests[1].content[0].value;
        assert!(!body2.contains("Debug message #4"));
        assert!(!body2.contains("Error with exception"));
        assert!(body2.contains("Error message #2"));
    }

    #[test]
    fn events_below_threshold_never_send() {
        let send_grid = Arc::new(MockSendGrid::default());
        let appender = SendGridAppender::builder()
            .to("to@example.com")
            .from("from@example.com")
            .api_key("apiKey")
            .transport(send_grid.clone())
            .build()
            .unwrap();

        let subscriber = tracing_subscriber::registry().with(appender.clone());
        tracing::subscriber::with_default(subscriber, || {
            for i in 0..10 {
                tracing::warn!(attempt = i, "retrying");
            }
        });

        assert!(send_grid.requests.lock().is_empty());
        assert_eq!(appender.buffered(), 10);
    }

    #[test]
    fn ignored_targets_are_not_mailed() {
        let send_grid = Arc::new(MockSendGrid::default());
        let appender = SendGridAppender::builder()
            .to("to@example.com")
            .from("from@example.com")
            .api_key("apiKey")
            .transport(send_grid.clone())
            .build()
            .unwrap();

        let subscriber = tracing_subscriber::registry().with(appender);
        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "hyper::client", "connection closed");
            tracing::error!(target: "billing", "charge failed");
        });

        let requests = send_grid.requests.lock();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].content[0].value.contains("charge failed"));
    }

    #[tokio::test]
    async fn posts_to_sendgrid_from_runtime() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v3/mail/send"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&mock_server)
            .await;

        let appender = SendGridAppender::builder()
            .to("to@example.com")
            .from("from@example.com")
            .api_key("SG.test")
            .host(mock_server.uri())
            .sandbox_mode(true)
            .build()
            .unwrap();

        let subscriber = tracing_subscriber::registry().with(appender.clone());
        {
            let _guard = tracing::subscriber::set_default(subscriber);
            tracing::info!("context line");
            tracing::error!("payment service unreachable");
        }
        appender.shutdown().await;

        let requests = mock_server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let mail: Mail = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(mail.mail_settings.unwrap().sandbox_mode.unwrap().enable);
        let body = &mail.content[0].value;
        assert!(body.contains("context line"));
        assert!(body.contains("payment service unreachable"));
    }

    #[tokio::test]
    async fn rejected_delivery_does_not_reach_caller() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v3/mail/send"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&mock_server)
            .await;

        let appender = SendGridAppender::builder()
            .to("to@example.com")
            .from("from@example.com")
            .api_key("SG.test")
            .host(mock_server.uri())
            .build()
            .unwrap();

        let subscriber = tracing_subscriber::registry().with(appender.clone());
        {
            let _guard = tracing::subscriber::set_default(subscriber);
            tracing::error!("still logging fine");
        }
        appender.shutdown().await;
    }
}
