use serde::Deserialize;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::Level;

use crate::event::LogEvent;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Formats events into an email body.
pub trait Layout: Send + Sync {
    /// MIME type of the rendered body.
    fn content_type(&self) -> &'static str;

    fn header(&self) -> Option<String> {
        None
    }

    fn footer(&self) -> Option<String> {
        None
    }

    fn format(&self, event: &LogEvent) -> String;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutKind {
    #[default]
    Html,
    Text,
}

impl LayoutKind {
    pub fn build(self) -> Arc<dyn Layout> {
        match self {
            LayoutKind::Html => Arc::new(HtmlLayout::default()),
            LayoutKind::Text => Arc::new(TextLayout),
        }
    }
}

/// Renders events as rows of an HTML table.
#[derive(Debug, Clone)]
pub struct HtmlLayout {
    title: String,
}

impl HtmlLayout {
    pub fn new(title: impl Into<String>) -> Self {
        HtmlLayout {
            title: title.into(),
        }
    }
}

impl Default for HtmlLayout {
    fn default() -> Self {
        HtmlLayout::new("Log Messages")
    }
}

impl Layout for HtmlLayout {
    fn content_type(&self) -> &'static str {
        "text/html"
    }

    fn header(&self) -> Option<String> {
        let mut html = String::new();
        html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\"/>\n");
        let _ = writeln!(html, "<title>{}</title>", escape_html(&self.title));
        html.push_str(concat!(
            "<style type=\"text/css\">\n",
            "body, table {font-family:arial,sans-serif; font-size: small;}\n",
            "th {background: #336699; color: #FFFFFF; text-align: left;}\n",
            "</style>\n",
            "</head>\n<body>\n<hr size=\"1\" noshade=\"noshade\">\n",
            "<table cellspacing=\"0\" cellpadding=\"4\" border=\"1\" bordercolor=\"#224466\" width=\"100%\">\n",
            "<tr>\n<th>Time</th>\n<th>Thread</th>\n<th>Level</th>\n<th>Target</th>\n<th>Message</th>\n</tr>\n",
        ));
        Some(html)
    }

    fn footer(&self) -> Option<String> {
        Some("</table>\n<br>\n</body></html>\n".to_owned())
    }

    fn format(&self, event: &LogEvent) -> String {
        let mut row = String::from("<tr>\n");
        let _ = writeln!(
            row,
            "<td>{}</td>",
            event.timestamp.format(TIME_FORMAT)
        );
        let thread = escape_html(event.thread.as_deref().unwrap_or_default());
        let _ = writeln!(row, "<td title=\"{thread} thread\">{thread}</td>");
        let level = match event.level {
            Level::ERROR => "<font color=\"#993300\"><strong>ERROR</strong></font>".to_owned(),
            Level::WARN => "<font color=\"#993300\"><strong>WARN</strong></font>".to_owned(),
            level => level.as_str().to_owned(),
        };
        let _ = writeln!(row, "<td title=\"Level\">{level}</td>");
        let target = escape_html(&event.target);
        let _ = writeln!(row, "<td title=\"{target} target\">{target}</td>");
        let _ = write!(row, "<td title=\"Message\">{}", escape_html(&event.message));
        if !event.fields.is_empty() {
            row.push_str("<br><small>");
            for (i, (key, value)) in event.fields.iter().enumerate() {
                if i > 0 {
                    row.push(' ');
                }
                let _ = write!(row, "{}={}", escape_html(key), escape_html(value));
            }
            row.push_str("</small>");
        }
        row.push_str("</td>\n</tr>\n");
        if let Some(error) = &event.error {
            let _ = writeln!(
                row,
                "<tr><td bgcolor=\"#993300\" style=\"color:White; font-size : xx-small;\" colspan=\"5\"><pre>{}</pre></td></tr>",
                escape_html(error)
            );
        }
        row
    }
}

/// One line per event, error detail on the lines that follow.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextLayout;

impl Layout for TextLayout {
    fn content_type(&self) -> &'static str {
        "text/plain"
    }

    fn format(&self, event: &LogEvent) -> String {
        let mut line = format!(
            "{} [{}] {:<5} {} - {}",
            event.timestamp.format(TIME_FORMAT),
            event.thread.as_deref().unwrap_or_default(),
            event.level.as_str(),
            event.target,
            event.message
        );
        for (key, value) in &event.fields {
            let _ = write!(line, " {key}={value}");
        }
        line.push('\n');
        if let Some(error) = &event.error {
            line.push_str(error);
            line.push('\n');
        }
        line
    }
}

pub(crate) fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            '\n' => escaped.push_str("<br />"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Level,
    Target,
    Message,
    Thread,
    Time,
    Field(String),
}

/// Subject line pattern, e.g. `"[{level}] {target}: {message}"`.
///
/// Placeholders other than the built-in ones resolve to the event's context
/// field of that name, or to nothing when the field is absent. `{{` and `}}`
/// produce literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectTemplate {
    segments: Vec<Segment>,
}

impl SubjectTemplate {
    pub fn parse(pattern: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = pattern;

        while let Some(c) = rest.chars().next() {
            if rest.starts_with("{{") || rest.starts_with("}}") {
                literal.push(c);
                rest = &rest[2..];
                continue;
            }
            if c == '{' {
                if let Some(end) = rest.find('}') {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(placeholder(rest[1..end].trim()));
                    rest = &rest[end + 1..];
                    continue;
                }
            }
            literal.push(c);
            rest = &rest[c.len_utf8()..];
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        SubjectTemplate { segments }
    }

    pub fn render(&self, event: &LogEvent) -> String {
        let mut subject = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => subject.push_str(text),
                Segment::Level => subject.push_str(event.level.as_str()),
                Segment::Target => subject.push_str(&event.target),
                Segment::Message => {
                    subject.push_str(event.message.lines().next().unwrap_or_default())
                }
                Segment::Thread => subject.push_str(event.thread.as_deref().unwrap_or_default()),
                Segment::Time => {
                    let _ = write!(subject, "{}", event.timestamp.format(TIME_FORMAT));
                }
                Segment::Field(name) => subject.push_str(event.field(name).unwrap_or_default()),
            }
        }
        // Mail headers are single-line.
        subject.replace(['\r', '\n'], " ")
    }
}

fn placeholder(name: &str) -> Segment {
    match name {
        "level" => Segment::Level,
        "target" => Segment::Target,
        "message" => Segment::Message,
        "thread" => Segment::Thread,
        "time" => Segment::Time,
        other => Segment::Field(other.to_owned()),
    }
}

impl From<&str> for SubjectTemplate {
    fn from(pattern: &str) -> Self {
        SubjectTemplate::parse(pattern)
    }
}
