use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use tracing::field::{Field, Visit};
use tracing::Level;

/// An owned snapshot of a log event, detached from the `tracing` callsite so
/// it can sit in the buffer until an email goes out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(with = "level_serde")]
    pub level: Level,
    pub target: String,
    pub thread: Option<String>,
    pub message: String,
    /// Span fields from root to leaf, then the event's own fields.
    pub fields: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl LogEvent {
    pub fn new(level: Level, target: impl Into<String>, message: impl Into<String>) -> Self {
        LogEvent {
            timestamp: Utc::now(),
            level,
            target: target.into(),
            thread: current_thread_name(),
            message: message.into(),
            fields: BTreeMap::new(),
            error: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

pub(crate) fn current_thread_name() -> Option<String> {
    let thread = std::thread::current();
    Some(match thread.name() {
        Some(name) => name.to_owned(),
        None => format!("{:?}", thread.id()),
    })
}

/// Collects the fields of an event or span.
#[derive(Debug, Default, Clone)]
pub(crate) struct FieldVisitor {
    pub message: Option<String>,
    pub error: Option<String>,
    pub fields: BTreeMap<String, String>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.insert(field.name().to_owned(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.to_owned());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn Error + 'static)) {
        let rendered = render_error_chain(value);
        if self.error.is_none() {
            self.error = Some(rendered);
        } else {
            self.insert(field, rendered);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, format!("{value:?}"));
    }
}

fn render_error_chain(error: &(dyn Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str("\nCaused by: ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

/// Fields recorded on a span, stored in the span's extensions.
#[derive(Debug, Default, Clone)]
pub(crate) struct SpanFields(pub BTreeMap<String, String>);

impl SpanFields {
    pub(crate) fn merge(&mut self, visitor: FieldVisitor) {
        self.0.extend(visitor.fields);
        if let Some(message) = visitor.message {
            self.0.insert("message".to_owned(), message);
        }
        if let Some(error) = visitor.error {
            self.0.insert("error".to_owned(), error);
        }
    }
}

pub(crate) mod level_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(level.as_str())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        parse_level(&value).map_err(serde::de::Error::custom)
    }

    /// Accepts `tracing` level names in any case, plus `fatal` as an alias
    /// for ERROR.
    pub fn parse_level(value: &str) -> Result<Level, String> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("fatal") {
            return Ok(Level::ERROR);
        }
        value
            .parse::<Level>()
            .map_err(|e| format!("Invalid level '{value}': {e}"))
    }
}
