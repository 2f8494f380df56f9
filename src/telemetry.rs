//! Structured reporting of broken invariants.
//!
//! Conditions that should not happen (a cursor out of order, a snapshot of the
//! wrong size, a command that arrives in a state that cannot accept it) are
//! reported as [`InvariantViolation`] values rather than bare log lines. By default they
//! are logged through `tracing`; sessions built with
//! [`SessionBuilder::with_violation_observer`](crate::SessionBuilder::with_violation_observer)
//! send them to a custom [`ViolationObserver`] instead, which is how tests assert on them.
//!
//! ```
//! use netplay_rollback::telemetry::{CollectingObserver, ViolationKind, ViolationObserver};
//! use netplay_rollback::{report_violation_to, telemetry::ViolationSeverity};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! let sink: Option<Arc<dyn ViolationObserver>> = Some(observer.clone());
//! report_violation_to!(&sink, ViolationSeverity::Warning, ViolationKind::Transport,
//!     "dropped {} stale packets", 3);
//! assert!(observer.has_violation(ViolationKind::Transport));
//! ```

use crate::Frame;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Severity of a violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Recovered automatically.
    Warning,
    /// Behavior degraded but the session continues.
    Error,
    /// State may be corrupt; the session is about to end.
    Critical,
}

impl ViolationSeverity {
    /// Label for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subsystem a violation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Ring slot addressing or snapshot storage.
    FrameRing,
    /// Cursor ordering, confirmation or skip-ahead.
    Reconciliation,
    /// Restoring or re-executing frames.
    Replay,
    /// Datagram or stream I/O.
    Transport,
    /// Hello validation and configuration exchange.
    Handshake,
    /// Reliable commands (flip, pause, savestate, acknowledgements).
    Command,
    /// Spectator fan-out or playback.
    Spectator,
    /// Builder or protocol settings.
    Configuration,
    /// A bug in this library.
    InternalError,
}

impl ViolationKind {
    /// Label for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FrameRing => "frame_ring",
            Self::Reconciliation => "reconciliation",
            Self::Replay => "replay",
            Self::Transport => "transport",
            Self::Handshake => "handshake",
            Self::Command => "command",
            Self::Spectator => "spectator",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded violation with its context.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InvariantViolation {
    /// How bad it is.
    pub severity: ViolationSeverity,
    /// Where it came from.
    pub kind: ViolationKind,
    /// What went wrong.
    pub message: String,
    /// `file:line` of the report.
    pub location: &'static str,
    /// The frame involved, if any.
    pub frame: Option<Frame>,
    /// Extra key-value context.
    pub context: BTreeMap<String, String>,
}

impl InvariantViolation {
    /// Creates a violation without frame or context.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            frame: None,
            context: BTreeMap::new(),
        }
    }

    /// Attaches the frame involved.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Adds a context pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(frame) = self.frame {
            write!(f, ", frame={frame}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Receives violations.
#[cfg(feature = "sync-send")]
pub trait ViolationObserver: Send + Sync {
    /// Called for every violation. Keep it cheap; it may run inside a replay.
    fn on_violation(&self, violation: &InvariantViolation);
}

/// Receives violations.
#[cfg(not(feature = "sync-send"))]
pub trait ViolationObserver {
    /// Called for every violation. Keep it cheap; it may run inside a replay.
    fn on_violation(&self, violation: &InvariantViolation);
}

/// Logs violations through `tracing`: warnings at `warn`, everything else at `error`.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// Creates a new tracing observer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &InvariantViolation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let frame = violation
            .frame
            .map_or_else(|| "none".to_owned(), |f| f.to_string());
        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(
                    severity,
                    kind,
                    location,
                    frame = %frame,
                    context = ?violation.context,
                    "{}",
                    violation.message
                );
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(
                    severity,
                    kind,
                    location,
                    frame = %frame,
                    context = ?violation.context,
                    "{}",
                    violation.message
                );
            },
        }
    }
}

/// Stores every violation; meant for tests.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<InvariantViolation>>,
}

impl CollectingObserver {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            violations: Mutex::new(Vec::new()),
        }
    }

    /// A copy of everything collected so far.
    #[must_use]
    pub fn violations(&self) -> Vec<InvariantViolation> {
        self.violations.lock().clone()
    }

    /// Number collected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Whether nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Whether any violation of `kind` was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Violations at or above `min_severity`.
    #[must_use]
    pub fn violations_at_severity(&self, min_severity: ViolationSeverity) -> Vec<InvariantViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.severity >= min_severity)
            .cloned()
            .collect()
    }

    /// Forgets everything collected.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &InvariantViolation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Sends `violation` to `observer`, or to [`TracingObserver`] when there is none.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &InvariantViolation,
) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation to the tracing log, tagged with the call site.
///
/// ```
/// use netplay_rollback::{report_violation, telemetry::{ViolationKind, ViolationSeverity}};
///
/// report_violation!(ViolationSeverity::Warning, ViolationKind::FrameRing,
///     "slot {} out of range", 9);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::InvariantViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::InvariantViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// Reports a violation to an `Option<Arc<dyn ViolationObserver>>`, falling back to tracing.
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::InvariantViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::InvariantViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

/// Panics with the collected violations if `observer` holds any.
#[macro_export]
macro_rules! assert_no_violations {
    ($observer:expr) => {{
        let violations = $observer.violations();
        assert!(
            violations.is_empty(),
            "Expected no violations, but found {}:\n{:#?}",
            violations.len(),
            violations
        );
    }};
}

/// Panics unless `observer` holds a violation of `kind`.
#[macro_export]
macro_rules! assert_violation {
    ($observer:expr, $kind:expr) => {{
        assert!(
            $observer.has_violation($kind),
            "Expected violation of kind {:?}, but found: {:#?}",
            $kind,
            $observer.violations()
        );
    }};
}
