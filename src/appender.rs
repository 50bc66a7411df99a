use parking_lot::Mutex;
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::buffer::CyclicBuffer;
use crate::email_config::EmailConfig;
use crate::error::ConfigError;
use crate::event::{current_thread_name, FieldVisitor, LogEvent, SpanFields};
use crate::layout::{Layout, SubjectTemplate};
use crate::message::{Content, Mail};
use crate::sender::{MailTransport, SendGridClient};

/// Diagnostic target for delivery outcomes. Events emitted here while the
/// appender is working never re-enter it.
pub const STATUS_TARGET: &str = "sendgrid_appender::status";

thread_local! {
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as busy inside the appender until dropped.
struct Entered {
    previous: bool,
}

impl Entered {
    fn enter() -> Self {
        Entered {
            previous: ACTIVE.with(|active| active.replace(true)),
        }
    }

    fn is_active() -> bool {
        ACTIVE.with(Cell::get)
    }
}

impl Drop for Entered {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.set(self.previous));
    }
}

/// Runs the wrapped delivery with the re-entrancy flag set on every poll,
/// whichever thread polls it.
struct Delivering<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for Delivering<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let _entered = Entered::enter();
        self.inner.as_mut().poll(cx)
    }
}

/// A `tracing` layer that emails events at or above a threshold through
/// SendGrid.
///
/// Lower-severity events are kept in a cyclic buffer and included, oldest
/// first, ahead of the triggering event in the next mail. Delivery failures
/// are reported on [`STATUS_TARGET`] and never reach the caller.
///
/// Cloning is cheap and clones share state, so keep a clone around to call
/// [`shutdown`](Self::shutdown) after handing one to the subscriber.
#[derive(Clone)]
pub struct SendGridAppender {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    threshold: Level,
    layout: Arc<dyn Layout>,
    subject: SubjectTemplate,
    template: Mail,
    buffer: Mutex<CyclicBuffer<LogEvent>>,
    transport: Arc<dyn MailTransport>,
    ignored_targets: Vec<String>,
    started: AtomicBool,
    tasks: TaskTracker,
}

impl SendGridAppender {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn from_config(config: EmailConfig) -> Result<Self, ConfigError> {
        Builder::with_config(config).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn threshold(&self) -> Level {
        self.inner.threshold
    }

    pub fn start(&self) {
        self.inner.started.store(true, Ordering::Release);
    }

    /// Stops reacting to events. Deliveries already under way still finish.
    pub fn stop(&self) {
        self.inner.started.store(false, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Stops the appender and waits for in-flight deliveries spawned on a
    /// runtime.
    pub async fn shutdown(&self) {
        self.stop();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    /// Number of buffered events waiting for the next mail.
    pub fn buffered(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    /// `tracing` orders levels by verbosity, so "at or above" in severity is
    /// `<=`.
    pub fn is_triggering(&self, level: Level) -> bool {
        level <= self.inner.threshold
    }

    fn is_ignored(&self, target: &str) -> bool {
        self.inner.ignored_targets.iter().any(|ignored| {
            target
                .strip_prefix(ignored.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
        })
    }

    /// Processes one event: buffers it when below the threshold, otherwise
    /// mails it together with the buffered events. Never panics on delivery
    /// failure and never returns one.
    pub fn handle(&self, event: LogEvent) {
        if !self.is_started() || Entered::is_active() || self.is_ignored(&event.target) {
            return;
        }
        let _entered = Entered::enter();

        if !self.is_triggering(event.level) {
            self.inner.buffer.lock().add(event);
            return;
        }

        let prior = self.inner.buffer.lock().drain_all();
        let mail = self.compose(&event, &prior);
        self.dispatch(mail);
    }

    /// Builds the mail for `event`, with `prior` events rendered ahead of it.
    /// Depends only on its arguments and the appender's configuration.
    pub fn compose(&self, event: &LogEvent, prior: &[LogEvent]) -> Mail {
        let layout = &self.inner.layout;
        let mut body = layout.header().unwrap_or_default();
        for prior_event in prior {
            body.push_str(&layout.format(prior_event));
        }
        body.push_str(&layout.format(event));
        if let Some(footer) = layout.footer() {
            body.push_str(&footer);
        }

        let mut mail = self.inner.template.clone();
        mail.subject = Some(self.inner.subject.render(event));
        mail.content = vec![Content::new(layout.content_type(), body)];
        mail
    }

    fn dispatch(&self, mail: Mail) {
        let transport = Arc::clone(&self.inner.transport);
        let name = self.inner.name.clone();
        let delivery = Delivering {
            inner: Box::pin(async move { deliver(&name, transport.as_ref(), &mail).await }),
        };

        match Handle::try_current() {
            Ok(handle) => {
                self.inner.tasks.spawn_on(delivery, &handle);
            }
            Err(_) => match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime.block_on(delivery),
                Err(e) => tracing::error!(
                    target: STATUS_TARGET,
                    appender = %self.inner.name,
                    error = %e,
                    "Failed to start a runtime for e-mail delivery"
                ),
            },
        }
    }

    fn capture<S>(&self, event: &Event<'_>, ctx: &Context<'_, S>) -> LogEvent
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let metadata = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut fields = std::collections::BTreeMap::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(span_fields) = span.extensions().get::<SpanFields>() {
                    fields.extend(span_fields.0.clone());
                }
            }
        }
        fields.extend(visitor.fields);

        LogEvent {
            timestamp: chrono::Utc::now(),
            level: *metadata.level(),
            target: metadata.target().to_owned(),
            thread: current_thread_name(),
            message: visitor.message.unwrap_or_default(),
            fields,
            error: visitor.error,
        }
    }
}

async fn deliver(name: &str, transport: &dyn MailTransport, mail: &Mail) {
    match transport.send(mail).await {
        Ok(response) => tracing::debug!(
            target: STATUS_TARGET,
            appender = name,
            status = response.status_code,
            message_id = ?response.message_id,
            "Delivered e-mail notification"
        ),
        Err(e) => tracing::error!(
            target: STATUS_TARGET,
            appender = name,
            error = %e,
            "Caught exception while sending e-mail notification"
        ),
    }
}

impl fmt::Debug for SendGridAppender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendGridAppender")
            .field("name", &self.inner.name)
            .field("threshold", &self.inner.threshold)
            .field("buffer_size", &self.inner.buffer.lock().capacity())
            .field("started", &self.is_started())
            .finish()
    }
}

impl<S> Layer<S> for SendGridAppender
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if Entered::is_active() {
            return;
        }
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        let mut fields = SpanFields::default();
        fields.merge(visitor);
        // Another appender in the same registry may have recorded them already.
        span.extensions_mut().replace(fields);
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        if Entered::is_active() {
            return;
        }
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<SpanFields>() {
            Some(fields) => fields.merge(visitor),
            None => {
                let mut fields = SpanFields::default();
                fields.merge(visitor);
                extensions.replace(fields);
            }
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if !self.is_started()
            || Entered::is_active()
            || self.is_ignored(event.metadata().target())
        {
            return;
        }
        let captured = self.capture(event, &ctx);
        self.handle(captured);
    }
}

/// Configures a [`SendGridAppender`]. Every attribute of [`EmailConfig`]
/// has a setter; [`transport`](Self::transport) swaps the SendGrid client
/// for another [`MailTransport`].
#[derive(Default)]
pub struct Builder {
    config: EmailConfig,
    layout: Option<Arc<dyn Layout>>,
    transport: Option<Arc<dyn MailTransport>>,
}

impl Builder {
    pub fn with_config(config: EmailConfig) -> Self {
        Builder {
            config,
            layout: None,
            transport: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.config.api_key = Some(api_key.into());
        self
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.config.to = Some(to.into());
        self
    }

    pub fn cc(mut self, cc: impl Into<String>) -> Self {
        self.config.cc = Some(cc.into());
        self
    }

    pub fn bcc(mut self, bcc: impl Into<String>) -> Self {
        self.config.bcc = Some(bcc.into());
        self
    }

    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.config.from = Some(from.into());
        self
    }

    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.config.reply_to = Some(reply_to.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.config.subject = Some(subject.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = Some(host.into());
        self
    }

    pub fn sandbox_mode(mut self, sandbox_mode: bool) -> Self {
        self.config.sandbox_mode = sandbox_mode;
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.config.buffer_size = buffer_size;
        self
    }

    pub fn threshold(mut self, threshold: Level) -> Self {
        self.config.threshold = threshold;
        self
    }

    /// Rounded up to whole milliseconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        let millis = timeout.as_nanos().div_ceil(1_000_000);
        self.config.timeout_ms = u64::try_from(millis).unwrap_or(u64::MAX);
        self
    }

    pub fn ignore_target(mut self, target: impl Into<String>) -> Self {
        self.config.ignored_targets.push(target.into());
        self
    }

    /// Overrides the layout picked by `config.layout`.
    pub fn layout(mut self, layout: impl Layout + 'static) -> Self {
        self.layout = Some(Arc::new(layout));
        self
    }

    pub fn transport(mut self, transport: Arc<dyn MailTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<SendGridAppender, ConfigError> {
        let Builder {
            config,
            layout,
            transport,
        } = self;

        let template = config.message_template()?;
        let transport = match transport {
            Some(transport) => transport,
            None => {
                let api_key = config.api_key().ok_or(ConfigError::Missing("api_key"))?;
                Arc::new(SendGridClient::new(
                    api_key,
                    config.host.as_deref(),
                    config.timeout(),
                )?)
            }
        };
        let layout = layout.unwrap_or_else(|| config.layout.build());
        let subject = config.subject_template();

        tracing::debug!(
            target: STATUS_TARGET,
            appender = %config.name,
            threshold = %config.threshold,
            buffer_size = config.buffer_size,
            sandbox_mode = config.sandbox_mode,
            "Created SendGrid appender"
        );

        Ok(SendGridAppender {
            inner: Arc::new(Inner {
                name: config.name,
                threshold: config.threshold,
                layout,
                subject,
                template,
                buffer: Mutex::new(CyclicBuffer::new(config.buffer_size)),
                transport,
                ignored_targets: config.ignored_targets,
                started: AtomicBool::new(true),
                tasks: TaskTracker::new(),
            }),
        })
    }
}
