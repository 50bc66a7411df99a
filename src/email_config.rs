use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::Level;

use crate::error::ConfigError;
use crate::event::level_serde;
use crate::layout::{LayoutKind, SubjectTemplate};
use crate::message::{Mail, MessageBuilder, RecipientType};

pub const DEFAULT_BUFFER_SIZE: usize = 512;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SUBJECT: &str = "[{level}] {target}: {message}";

/// Prefix for environment overrides, e.g. `SENDGRID_APPENDER__API_KEY`.
#[cfg(feature = "config-file")]
pub const ENV_PREFIX: &str = "SENDGRID_APPENDER";

/// Targets whose events never reach the appender: the HTTP stack that
/// delivers the mail.
pub fn default_ignored_targets() -> Vec<String> {
    ["hyper", "hyper_util", "h2", "reqwest", "rustls"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

/// Attributes of a SendGrid appender. Address lists are comma-separated
/// RFC 5322 mailboxes.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub name: String,
    pub api_key: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub from: Option<String>,
    pub reply_to: Option<String>,
    /// See [`SubjectTemplate`](crate::layout::SubjectTemplate). SendGrid
    /// requires a subject, so [`DEFAULT_SUBJECT`] applies when unset.
    pub subject: Option<String>,
    /// SendGrid API host, `api.sendgrid.com` when unset.
    pub host: Option<String>,
    pub sandbox_mode: bool,
    /// Number of lower-severity events kept for context.
    pub buffer_size: usize,
    #[serde(with = "level_serde")]
    pub threshold: Level,
    pub layout: LayoutKind,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
    pub ignored_targets: Vec<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        EmailConfig {
            name: "SendGrid".to_owned(),
            api_key: None,
            to: None,
            cc: None,
            bcc: None,
            from: None,
            reply_to: None,
            subject: None,
            host: None,
            sandbox_mode: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            threshold: Level::ERROR,
            layout: LayoutKind::Html,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            ignored_targets: default_ignored_targets(),
        }
    }
}

impl fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailConfig")
            .field("name", &self.name)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("to", &self.to)
            .field("cc", &self.cc)
            .field("bcc", &self.bcc)
            .field("from", &self.from)
            .field("reply_to", &self.reply_to)
            .field("subject", &self.subject)
            .field("host", &self.host)
            .field("sandbox_mode", &self.sandbox_mode)
            .field("buffer_size", &self.buffer_size)
            .field("threshold", &self.threshold)
            .field("layout", &self.layout)
            .field("timeout_ms", &self.timeout_ms)
            .field("ignored_targets", &self.ignored_targets)
            .finish()
    }
}

impl EmailConfig {
    /// Loads a config file (format picked from its extension) with
    /// environment overrides on top, then validates it.
    #[cfg(feature = "config-file")]
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        use config::{Config, Environment, File};

        let cfg = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let email: EmailConfig = cfg.try_deserialize()?;
        email.validate()?;
        Ok(email)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.message_template().map(|_| ())
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn subject_template(&self) -> SubjectTemplate {
        let pattern = self
            .subject
            .as_deref()
            .filter(|subject| !subject.trim().is_empty())
            .unwrap_or(DEFAULT_SUBJECT);
        SubjectTemplate::parse(pattern)
    }

    /// The per-event invariant part of every mail: sender, recipients and
    /// mail settings.
    pub(crate) fn message_template(&self) -> Result<Mail, ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Missing("name"));
        }
        if self.api_key().is_none() {
            return Err(ConfigError::Missing("api_key"));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "timeout_ms must be greater than 0".to_owned(),
            ));
        }
        if let Some(host) = &self.host {
            if host.trim().contains(char::is_whitespace) {
                return Err(ConfigError::Validation(format!("Invalid host '{host}'")));
            }
        }

        let mail = MessageBuilder::new()
            .from(self.from.as_deref())
            .map_err(address_error("from"))?
            .reply_to(self.reply_to.as_deref())
            .map_err(address_error("reply_to"))?
            .recipients(RecipientType::To, self.to.as_deref())
            .map_err(address_error("to"))?
            .recipients(RecipientType::Cc, self.cc.as_deref())
            .map_err(address_error("cc"))?
            .recipients(RecipientType::Bcc, self.bcc.as_deref())
            .map_err(address_error("bcc"))?
            .sandbox_mode(self.sandbox_mode)
            .build();

        if mail.personalizations.iter().all(|p| p.to.is_empty()) {
            return Err(ConfigError::Missing("to"));
        }
        if mail.from.is_none() {
            return Err(ConfigError::Missing("from"));
        }
        Ok(mail)
    }
}

fn address_error(field: &'static str) -> impl FnOnce(lettre::address::AddressError) -> ConfigError {
    move |e| ConfigError::InvalidAddress {
        field,
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> EmailConfig {
        EmailConfig {
            api_key: Some("SG.key".into()),
            to: Some("ops@example.com".into()),
            from: Some("app@example.com".into()),
            ..EmailConfig::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = EmailConfig::default();
        assert_eq!(config.buffer_size, 512);
        assert_eq!(config.threshold, Level::ERROR);
        assert_eq!(config.layout, LayoutKind::Html);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(!config.sandbox_mode);
        assert!(config.ignored_targets.iter().any(|t| t == "hyper"));
    }

    #[test]
    fn valid_config_passes() {
        valid().validate().unwrap();
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let config = EmailConfig {
            api_key: Some("   ".into()),
            ..valid()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("api_key"))
        ));
    }

    #[test]
    fn missing_recipient_is_rejected() {
        let config = EmailConfig { to: None, ..valid() };
        assert!(matches!(config.validate(), Err(ConfigError::Missing("to"))));
    }

    #[test]
    fn invalid_address_names_the_field() {
        let config = EmailConfig {
            cc: Some("ops@example.com, not-an-address".into()),
            ..valid()
        };
        match config.validate() {
            Err(ConfigError::InvalidAddress { field, .. }) => assert_eq!(field, "cc"),
            other => panic!("expected invalid address, got {other:?}"),
        }
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = EmailConfig {
            timeout_ms: 0,
            ..valid()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn template_carries_static_parts() {
        let config = EmailConfig {
            cc: Some("a@example.com, B <b@example.com>".into()),
            reply_to: Some("replies@example.com".into()),
            sandbox_mode: true,
            ..valid()
        };
        let mail = config.message_template().unwrap();
        assert_eq!(mail.from.unwrap().email, "app@example.com");
        assert_eq!(mail.reply_to.unwrap().email, "replies@example.com");
        assert_eq!(mail.personalizations[0].cc.len(), 2);
        assert_eq!(mail.personalizations[0].cc[1].name.as_deref(), Some("B"));
        assert!(mail.mail_settings.unwrap().sandbox_mode.unwrap().enable);
        assert!(mail.subject.is_none());
        assert!(mail.content.is_empty());
    }

    #[test]
    fn blank_subject_falls_back_to_default() {
        let event = crate::event::LogEvent::new(Level::ERROR, "app::db", "pool exhausted");
        let unset = valid();
        let blank = EmailConfig {
            subject: Some("  ".into()),
            ..valid()
        };
        let custom = EmailConfig {
            subject: Some("{message}".into()),
            ..valid()
        };
        assert_eq!(
            unset.subject_template().render(&event),
            "[ERROR] app::db: pool exhausted"
        );
        assert_eq!(blank.subject_template(), unset.subject_template());
        assert_eq!(custom.subject_template().render(&event), "pool exhausted");
    }

    #[test]
    fn debug_redacts_api_key() {
        let debug = format!("{:?}", valid());
        assert!(!debug.contains("SG.key"));
        assert!(debug.contains("<redacted>"));
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn loads_from_toml_file() {
        use std::io::Write;

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
name = "alerts"
api_key = "SG.file"
to = "ops@example.com"
from = "app@example.com"
subject = "[{{level}}] {{message}}"
threshold = "warn"
buffer_size = 16
layout = "text"
sandbox_mode = true
"#
        )
        .unwrap();

        let config = EmailConfig::load(file.path()).unwrap();
        assert_eq!(config.name, "alerts");
        assert_eq!(config.threshold, Level::WARN);
        assert_eq!(config.buffer_size, 16);
        assert_eq!(config.layout, LayoutKind::Text);
        assert_eq!(config.subject.as_deref(), Some("[{level}] {message}"));
        assert!(config.sandbox_mode);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn load_rejects_incomplete_file() {
        use std::io::Write;

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "to = \"ops@example.com\"").unwrap();
        assert!(EmailConfig::load(file.path()).is_err());
    }
}
