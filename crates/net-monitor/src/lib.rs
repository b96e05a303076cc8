//! ztnet monitor
//!
//! Health checks of the overlay service, a cancellable monitor loop that
//! alerts on status and peer transitions, and read-only host diagnostics.

pub mod alert;
pub mod diagnose;
pub mod health;
pub mod watch;

pub use alert::{Alert, AlertDispatcher, AlertSink, LogSink, MailSink, WebhookSink};
pub use diagnose::{Diagnosis, Diagnostics, RuleCheck};
pub use health::{HealthChecker, HealthReport, HealthSource, NetworkHealth, SystemHealthSource};
pub use watch::{EdgeDetector, Monitor, Transition};

pub use tokio_util::sync::CancellationToken;
