//! Alert delivery
//!
//! Every alert goes to the log. Mail and webhook sinks are added when the
//! settings name a recipient. A sink that fails is logged and skipped; alert
//! delivery never fails the monitor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use ztnet_config::ToolSettings;
use ztnet_exec::{CommandRunner, CommandSpec, ExecMode};

/// A rendered notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub subject: String,
    pub message: String,
}

impl Alert {
    pub fn new(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// Something that can deliver an [`Alert`]
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Writes alerts to the log
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        warn!(target: "ztnet::alert", "{}: {}", alert.subject, alert.message);
        Ok(())
    }
}

/// Sends alerts with the local `mail` command
pub struct MailSink {
    runner: Arc<dyn CommandRunner>,
    recipient: String,
}

impl MailSink {
    pub fn new(runner: Arc<dyn CommandRunner>, recipient: impl Into<String>) -> Self {
        Self {
            runner,
            recipient: recipient.into(),
        }
    }
}

#[async_trait]
impl AlertSink for MailSink {
    fn name(&self) -> &str {
        "mail"
    }

    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        let spec = CommandSpec::mutate("mail")
            .args(["-s", alert.subject.as_str(), self.recipient.as_str()])
            .stdin(alert.message.clone());
        self.runner
            .run(&spec)
            .await?
            .ensure_success()
            .with_context(|| format!("mailing {}", self.recipient))?;
        Ok(())
    }
}

/// JSON body posted by [`WebhookSink`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub source: String,
    pub subject: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl WebhookPayload {
    pub fn new(alert: &Alert) -> Self {
        Self {
            source: "ztnet".to_string(),
            subject: alert.subject.clone(),
            message: alert.message.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Posts alerts as JSON to an HTTP endpoint
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    mode: ExecMode,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration, mode: ExecMode) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building the webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            mode,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        if self.mode == ExecMode::DryRun {
            info!("[dry-run] would post alert '{}' to {}", alert.subject, self.url);
            return Ok(());
        }
        self.client
            .post(self.url.as_str())
            .json(&WebhookPayload::new(alert))
            .send()
            .await
            .with_context(|| format!("posting to {}", self.url))?
            .error_for_status()
            .with_context(|| format!("webhook {} rejected the alert", self.url))?;
        Ok(())
    }
}

/// Fans an alert out to every sink
pub struct AlertDispatcher {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl Default for AlertDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertDispatcher {
    /// Dispatcher with the log sink only
    pub fn new() -> Self {
        Self {
            sinks: vec![Arc::new(LogSink)],
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Log sink plus the mail and webhook targets named in `settings`
    pub fn from_settings(
        settings: &ToolSettings,
        runner: Arc<dyn CommandRunner>,
    ) -> anyhow::Result<Self> {
        let mode = runner.mode();
        let mut dispatcher = Self::new();
        if let Some(recipient) = &settings.alert_email {
            dispatcher = dispatcher.with_sink(Arc::new(MailSink::new(runner, recipient.clone())));
        }
        if let Some(url) = &settings.alert_webhook {
            let sink = WebhookSink::new(url.clone(), settings.command_timeout, mode)?;
            dispatcher = dispatcher.with_sink(Arc::new(sink));
        }
        Ok(dispatcher)
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Deliver `alert` to every sink, returning how many accepted it
    pub async fn dispatch(&self, alert: &Alert) -> usize {
        let mut delivered = 0;
        for sink in &self.sinks {
            match sink.send(alert).await {
                Ok(()) => {
                    debug!("Alert '{}' delivered via {}", alert.subject, sink.name());
                    delivered += 1;
                }
                Err(e) => warn!(
                    "Alert sink {} failed for '{}': {:#}",
                    sink.name(),
                    alert.subject,
                    e
                ),
            }
        }
        delivered
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use ztnet_exec::ScriptedRunner;

    /// Keeps every alert it receives
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) alerts: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl AlertSink for BrokenSink {
        fn name(&self) -> &str {
            "broken"
        }

        async fn send(&self, _alert: &Alert) -> anyhow::Result<()> {
            anyhow::bail!("smtp relay refused the connection")
        }
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_stop_delivery() {
        let recorder = Arc::new(RecordingSink::default());
        let dispatcher = AlertDispatcher::new()
            .with_sink(Arc::new(BrokenSink))
            .with_sink(recorder.clone());

        let delivered = dispatcher.dispatch(&Alert::new("subject", "body")).await;
        assert_eq!(delivered, 2);
        assert_eq!(recorder.alerts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mail_pipes_message_through_runner() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("mail", 0, "");
        let sink = MailSink::new(runner.clone(), "ops@example.com");

        sink.send(&Alert::new("ztnet: peers lost", "no leaf peers"))
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].command, "mail -s ztnet: peers lost ops@example.com");
        assert_eq!(calls[0].stdin.as_deref(), Some("no leaf peers"));
    }

    #[tokio::test]
    async fn test_mail_failure_is_an_error() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("mail", 1, "");
        let sink = MailSink::new(runner, "ops@example.com");
        assert!(sink.send(&Alert::new("s", "m")).await.is_err());
    }

    #[tokio::test]
    async fn test_dry_run_webhook_posts_nothing() {
        let sink = WebhookSink::new(
            "http://127.0.0.1:9/hook",
            Duration::from_secs(1),
            ExecMode::DryRun,
        )
        .unwrap();
        assert!(sink.send(&Alert::new("s", "m")).await.is_ok());
    }

    #[test]
    fn test_sinks_follow_settings() {
        let runner = Arc::new(ScriptedRunner::new());
        let settings = ToolSettings::default();
        let dispatcher = AlertDispatcher::from_settings(&settings, runner.clone()).unwrap();
        assert_eq!(dispatcher.sink_names(), vec!["log"]);

        let settings = ToolSettings {
            alert_email: Some("ops@example.com".to_string()),
            alert_webhook: Some("https://hooks.example.com/ztnet".to_string()),
            ..ToolSettings::default()
        };
        let dispatcher = AlertDispatcher::from_settings(&settings, runner).unwrap();
        assert_eq!(dispatcher.sink_names(), vec!["log", "mail", "webhook"]);
    }

    #[test]
    fn test_webhook_payload() {
        let payload = WebhookPayload::new(&Alert::new("subject", "body"));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["source"], "ztnet");
        assert_eq!(json["subject"], "subject");
        assert!(json["timestamp"].is_string());
    }
}
