//! The SendGrid v3 `mail/send` request body and a builder that fills it
//! from address strings.

use lettre::address::AddressError;
use lettre::message::{Mailbox, Mailboxes};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mail {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub personalizations: Vec<Personalization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<EmailAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<EmailAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mail_settings: Option<MailSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Personalization {
    #[serde(default)]
    pub to: Vec<EmailAddress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<EmailAddress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<EmailAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl EmailAddress {
    pub fn new(email: impl Into<String>) -> Self {
        EmailAddress {
            email: email.into(),
            name: None,
        }
    }
}

impl From<Mailbox> for EmailAddress {
    fn from(mailbox: Mailbox) -> Self {
        EmailAddress {
            email: mailbox.email.to_string(),
            name: mailbox.name.filter(|name| !name.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(rename = "type")]
    pub content_type: String,
    pub value: String,
}

impl Content {
    pub fn new(content_type: impl Into<String>, value: impl Into<String>) -> Self {
        Content {
            content_type: content_type.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_mode: Option<Setting>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub enable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientType {
    To,
    Cc,
    Bcc,
}

#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    mail: Mail,
}

impl MessageBuilder {
    pub fn new() -> Self {
        MessageBuilder::default()
    }

    /// Sets the sender. Without an address the local `user@host` address is
    /// used when one can be derived.
    pub fn from(mut self, from: Option<&str>) -> Result<Self, AddressError> {
        match parse_address(from)? {
            Some(address) => self.mail.from = Some(address),
            None => {
                if let Some(local) = local_address() {
                    self.mail.from = Some(local);
                }
            }
        }
        Ok(self)
    }

    pub fn reply_to(mut self, reply_to: Option<&str>) -> Result<Self, AddressError> {
        if let Some(address) = parse_address(reply_to)? {
            self.mail.reply_to = Some(address);
        }
        Ok(self)
    }

    /// Adds a comma-separated list of recipients to the single
    /// personalization, creating it on first use.
    pub fn recipients(
        mut self,
        kind: RecipientType,
        recipients: Option<&str>,
    ) -> Result<Self, AddressError> {
        let addresses = parse_addresses(recipients)?;
        if self.mail.personalizations.is_empty() {
            self.mail.personalizations.push(Personalization::default());
        }
        let personalization = &mut self.mail.personalizations[0];
        let list = match kind {
            RecipientType::To => &mut personalization.to,
            RecipientType::Cc => &mut personalization.cc,
            RecipientType::Bcc => &mut personalization.bcc,
        };
        list.extend(addresses);
        Ok(self)
    }

    pub fn subject(mut self, subject: Option<String>) -> Self {
        if subject.is_some() {
            self.mail.subject = subject;
        }
        self
    }

    pub fn content(mut self, content: Content) -> Self {
        self.mail.content.push(content);
        self
    }

    pub fn sandbox_mode(mut self, enable: bool) -> Self {
        self.mail.mail_settings = enable.then(|| MailSettings {
            sandbox_mode: Some(Setting { enable: true }),
        });
        self
    }

    pub fn build(self) -> Mail {
        self.mail
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Parses a single RFC 5322 mailbox such as `Name <user@example.com>`.
pub fn parse_address(value: Option<&str>) -> Result<Option<EmailAddress>, AddressError> {
    match non_empty(value) {
        Some(value) => Ok(Some(value.parse::<Mailbox>()?.into())),
        None => Ok(None),
    }
}

pub fn parse_addresses(value: Option<&str>) -> Result<Vec<EmailAddress>, AddressError> {
    match non_empty(value) {
        Some(value) => Ok(value
            .parse::<Mailboxes>()?
            .into_iter()
            .map(EmailAddress::from)
            .collect()),
        None => Ok(Vec::new()),
    }
}

/// `$USER@hostname`, if both parts are known and form a valid address.
pub fn local_address() -> Option<EmailAddress> {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()?;
    let host = hostname::get().ok()?.into_string().ok()?;
    let candidate = format!("{user}@{host}");
    candidate.parse::<Mailbox>().ok().map(EmailAddress::from)
}
