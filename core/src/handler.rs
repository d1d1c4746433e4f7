//! Handler capability, schedule model and registration-time validation.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Result, RetryError};
use crate::listener::RetryListener;

/// Longest accepted handler identity, in characters.
pub const MAX_IDENTITY_LEN: usize = 50;

/// A unit of work that must eventually succeed.
///
/// `handle` is the business operation. Everything else is scheduling
/// metadata read once, at registration. Exactly one of [`cron`](Self::cron)
/// and [`interval_secs`](Self::interval_secs) must be provided.
pub trait RetryHandler: Send + Sync + 'static {
    /// Argument persisted when an invocation fails.
    type Arg: Serialize + DeserializeOwned + Send + Sync + 'static;
    /// Value returned by a successful invocation.
    type Output: Send + 'static;

    /// Process-wide unique key, at most [`MAX_IDENTITY_LEN`] characters.
    fn identity(&self) -> &str;

    /// Display name; defaults to the identity.
    fn name(&self) -> &str {
        self.identity()
    }

    /// Cron expression driving retries (5, 6 or 7 fields).
    fn cron(&self) -> Option<&str> {
        None
    }

    /// Fixed retry period in seconds (local scheduling only).
    fn interval_secs(&self) -> Option<u64> {
        None
    }

    /// Start the retry job as soon as it is registered.
    fn auto_start(&self) -> bool {
        true
    }

    /// Pin the handler to one scheduler backend instead of the engine default.
    fn backend(&self) -> Option<BackendKind> {
        None
    }

    /// Callback told about every replay outcome.
    fn listener(&self) -> Option<Arc<dyn RetryListener>> {
        None
    }

    /// Run the operation.
    fn handle(&self, arg: &Self::Arg) -> anyhow::Result<Self::Output>;
}

impl<H: RetryHandler> RetryHandler for Arc<H> {
    type Arg = H::Arg;
    type Output = H::Output;

    fn identity(&self) -> &str {
        (**self).identity()
    }
    fn name(&self) -> &str {
        (**self).name()
    }
    fn cron(&self) -> Option<&str> {
        (**self).cron()
    }
    fn interval_secs(&self) -> Option<u64> {
        (**self).interval_secs()
    }
    fn auto_start(&self) -> bool {
        (**self).auto_start()
    }
    fn backend(&self) -> Option<BackendKind> {
        (**self).backend()
    }
    fn listener(&self) -> Option<Arc<dyn RetryListener>> {
        (**self).listener()
    }
    fn handle(&self, arg: &Self::Arg) -> anyhow::Result<Self::Output> {
        (**self).handle(arg)
    }
}

/// Which scheduling backend drives a handler's retry job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process timers on a shared worker pool.
    Local,
    /// Cluster-coordinated, one winner per cron fire.
    Distributed,
}

impl BackendKind {
    /// Lowercase name used in config and messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Distributed => "distributed",
        }
    }
}

/// A parsed cron expression together with its source text.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpr {
    /// Parse `expr`. Five-field expressions get a leading seconds field of `0`.
    pub fn parse(expr: &str) -> std::result::Result<Self, cron::error::Error> {
        let expr = expr.trim();
        let normalized = if expr.split_whitespace().count() == 5 {
            format!("0 {expr}")
        } else {
            expr.to_string()
        };
        let schedule = cron::Schedule::from_str(&normalized)?;
        Ok(Self { source: expr.to_string(), schedule })
    }

    /// The expression as written by the integrator.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Next fire strictly after `after`.
    pub fn next_after(&self, after: chrono::DateTime<chrono::Utc>) -> Option<chrono::DateTime<chrono::Utc>> {
        self.schedule.after(&after).next()
    }
}

/// When a handler's retry job fires.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Cron-aligned fires.
    Cron(CronExpr),
    /// Fixed rate, in seconds.
    Interval(u64),
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Cron(c) => f.write_str(c.as_str()),
            Schedule::Interval(secs) => write!(f, "{secs}"),
        }
    }
}

/// Raw, unvalidated handler attributes.
///
/// Used directly to declare a retry function, and built from a
/// [`RetryHandler`]'s accessors for plain handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttrs {
    /// Identity.
    pub identity: String,
    /// Optional display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Optional cron expression.
    #[serde(default)]
    pub cron: Option<String>,
    /// Optional interval in seconds.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Auto-start flag.
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Backend preference.
    #[serde(default)]
    pub backend: Option<BackendKind>,
}

const fn default_true() -> bool {
    true
}

impl RetryAttrs {
    /// Attributes with only an identity; auto-start on.
    pub fn new(identity: impl Into<String>) -> Self {
        Self { identity: identity.into(), auto_start: true, ..Default::default() }
    }

    /// Set the display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the cron expression.
    pub fn cron(mut self, cron: impl Into<String>) -> Self {
        self.cron = Some(cron.into());
        self
    }

    /// Set the interval in seconds.
    pub fn interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = Some(secs);
        self
    }

    /// Set the auto-start flag.
    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Pin a backend.
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    fn of<H: RetryHandler + ?Sized>(handler: &H) -> Self {
        Self {
            identity: handler.identity().to_string(),
            name: Some(handler.name().to_string()),
            cron: handler.cron().map(str::to_string),
            interval_secs: handler.interval_secs(),
            auto_start: handler.auto_start(),
            backend: handler.backend(),
        }
    }
}

/// Validated, normalized description of a registered handler.
#[derive(Debug, Clone)]
pub struct HandlerDescriptor {
    /// Identity (trimmed).
    pub identity: String,
    /// Display name (identity when none was given).
    pub name: String,
    /// Retry schedule.
    pub schedule: Schedule,
    /// Auto-start flag as declared by the handler.
    pub auto_start: bool,
    /// Backend preference; `None` means the engine default.
    pub backend: Option<BackendKind>,
}

impl HandlerDescriptor {
    /// Normalize and check `attrs`. Pure: no registration side effects.
    pub fn validate(attrs: &RetryAttrs) -> Result<Self> {
        let identity = attrs.identity.trim();
        if identity.is_empty() {
            return Err(RetryError::EmptyIdentity);
        }
        let len = identity.chars().count();
        if len > MAX_IDENTITY_LEN {
            return Err(RetryError::IdentityTooLong {
                identity: identity.to_string(),
                len,
                max: MAX_IDENTITY_LEN,
            });
        }

        let cron = attrs.cron.as_deref().map(str::trim).filter(|c| !c.is_empty());
        let schedule = match (cron, attrs.interval_secs) {
            (Some(_), Some(_)) => {
                return Err(invalid(identity, "cron and interval are mutually exclusive"))
            }
            (None, None) => return Err(invalid(identity, "either cron or interval must be set")),
            (None, Some(0)) => return Err(invalid(identity, "interval must be positive")),
            (None, Some(secs)) => Schedule::Interval(secs),
            (Some(expr), None) => {
                let parsed = CronExpr::parse(expr).map_err(|source| RetryError::InvalidCron {
                    identity: identity.to_string(),
                    expression: expr.to_string(),
                    source,
                })?;
                Schedule::Cron(parsed)
            }
        };

        if attrs.backend == Some(BackendKind::Distributed) && !matches!(schedule, Schedule::Cron(_)) {
            return Err(RetryError::CronRequired(identity.to_string()));
        }

        let name = attrs
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(identity)
            .to_string();

        Ok(Self {
            identity: identity.to_string(),
            name,
            schedule,
            auto_start: attrs.auto_start,
            backend: attrs.backend,
        })
    }

    /// Validate a handler's declared metadata.
    pub fn of<H: RetryHandler + ?Sized>(handler: &H) -> Result<Self> {
        Self::validate(&RetryAttrs::of(handler))
    }
}

fn invalid(identity: &str, reason: &str) -> RetryError {
    RetryError::InvalidSchedule { identity: identity.to_string(), reason: reason.to_string() }
}

/* --------------------- retry functions --------------------- */

/// A method of some service object, declared retryable.
///
/// Binds the declaring instance and the method so the pair can be registered
/// like any other [`RetryHandler`].
pub struct MethodHandler<T, A, R> {
    receiver: Arc<T>,
    method: fn(&T, &A) -> anyhow::Result<R>,
    attrs: RetryAttrs,
    listener: Option<Arc<dyn RetryListener>>,
}

impl<T, A, R> MethodHandler<T, A, R> {
    /// Bind `method` on `receiver` with the given attributes.
    pub fn new(receiver: Arc<T>, mut attrs: RetryAttrs, method: fn(&T, &A) -> anyhow::Result<R>) -> Self {
        attrs.identity = attrs.identity.trim().to_string();
        Self { receiver, method, attrs, listener: None }
    }

    /// Report replay outcomes to `listener`.
    pub fn with_listener(mut self, listener: Arc<dyn RetryListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Declaring instance.
    pub fn receiver(&self) -> &Arc<T> {
        &self.receiver
    }
}

impl<T, A, R> RetryHandler for MethodHandler<T, A, R>
where
    T: Send + Sync + 'static,
    A: Serialize + DeserializeOwned + Send + Sync + 'static,
    R: Send + 'static,
{
    type Arg = A;
    type Output = R;

    fn identity(&self) -> &str {
        &self.attrs.identity
    }
    fn name(&self) -> &str {
        self.attrs.name.as_deref().unwrap_or(&self.attrs.identity)
    }
    fn cron(&self) -> Option<&str> {
        self.attrs.cron.as_deref()
    }
    fn interval_secs(&self) -> Option<u64> {
        self.attrs.interval_secs
    }
    fn auto_start(&self) -> bool {
        self.attrs.auto_start
    }
    fn backend(&self) -> Option<BackendKind> {
        self.attrs.backend
    }
    fn listener(&self) -> Option<Arc<dyn RetryListener>> {
        self.listener.clone()
    }
    fn handle(&self, arg: &A) -> anyhow::Result<R> {
        (self.method)(&self.receiver, arg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_length_bound() {
        let ok = RetryAttrs::new("a".repeat(50)).interval_secs(5);
        assert!(HandlerDescriptor::validate(&ok).is_ok());

        let long = RetryAttrs::new("a".repeat(51)).interval_secs(5);
        let err = HandlerDescriptor::validate(&long).unwrap_err();
        assert!(matches!(err, RetryError::IdentityTooLong { len: 51, .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn schedule_is_exclusive() {
        let both = RetryAttrs::new("h").cron("0 * * * * *").interval_secs(5);
        assert!(matches!(
            HandlerDescriptor::validate(&both),
            Err(RetryError::InvalidSchedule { .. })
        ));

        let neither = RetryAttrs::new("h");
        assert!(matches!(
            HandlerDescriptor::validate(&neither),
            Err(RetryError::InvalidSchedule { .. })
        ));

        // A blank cron counts as unset.
        let blank = RetryAttrs::new("h").cron("  ").interval_secs(5);
        assert!(matches!(HandlerDescriptor::validate(&blank).unwrap().schedule, Schedule::Interval(5)));
    }

    #[test]
    fn rejects_zero_interval_and_bad_cron() {
        assert!(matches!(
            HandlerDescriptor::validate(&RetryAttrs::new("h").interval_secs(0)),
            Err(RetryError::InvalidSchedule { .. })
        ));
        assert!(matches!(
            HandlerDescriptor::validate(&RetryAttrs::new("h").cron("every tuesday")),
            Err(RetryError::InvalidCron { .. })
        ));
    }

    #[test]
    fn five_field_cron_gets_seconds() {
        let d = HandlerDescriptor::validate(&RetryAttrs::new("h").cron("*/5 * * * *")).unwrap();
        let Schedule::Cron(expr) = &d.schedule else { panic!("expected cron") };
        assert_eq!(expr.as_str(), "*/5 * * * *");
        let now = chrono::Utc::now();
        assert!(expr.next_after(now).unwrap() > now);
    }

    #[test]
    fn distributed_needs_cron() {
        let attrs = RetryAttrs::new("h").interval_secs(5).backend(BackendKind::Distributed);
        assert!(matches!(HandlerDescriptor::validate(&attrs), Err(RetryError::CronRequired(_))));
    }

    #[test]
    fn name_defaults_to_identity() {
        let d = HandlerDescriptor::validate(&RetryAttrs::new(" sync ").name(" ").interval_secs(1)).unwrap();
        assert_eq!(d.identity, "sync");
        assert_eq!(d.name, "sync");
    }

    struct Mailer;

    impl Mailer {
        fn send(&self, to: &String) -> anyhow::Result<usize> {
            Ok(to.len())
        }
    }

    #[test]
    fn method_handler_binds_receiver() {
        let h = MethodHandler::new(
            Arc::new(Mailer),
            RetryAttrs::new("mail.send").name("Send mail").cron("0 * * * * *"),
            Mailer::send,
        );
        assert_eq!(h.name(), "Send mail");
        assert_eq!(h.handle(&"bob@example.com".to_string()).unwrap(), 15);
        let d = HandlerDescriptor::of(&h).unwrap();
        assert!(matches!(d.schedule, Schedule::Cron(_)));
    }
}
