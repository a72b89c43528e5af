//! Crisis alert webhook dispatch.
//!
//! Each crisis-class event is posted to the configured sink from its own
//! task so routing latency never depends on the webhook endpoint.  Failures
//! are logged and not retried here; the sink may retry on its side.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};

use notify_protocol::CrisisAlertEvent;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AlertDispatcher {
    sink: Option<Sink>,
}

#[derive(Clone)]
struct Sink {
    client: reqwest::Client,
    url: String,
}

impl AlertDispatcher {
    pub fn new(url: Option<String>) -> Self {
        Self {
            sink: url.map(|url| Sink {
                client: reqwest::Client::new(),
                url,
            }),
        }
    }

    /// A dispatcher with no sink; crisis alerts are dropped with a debug log.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Post `alert` to the sink, fire-and-forget.  Returns immediately.
    pub fn dispatch(&self, alert: CrisisAlertEvent, timestamp: DateTime<Utc>) {
        let Some(sink) = self.sink.clone() else {
            debug!(alert_type = %alert.alert_type, "no webhook configured, skipping crisis alert");
            return;
        };
        tokio::spawn(async move {
            let body = format_alert(&alert, timestamp);
            let result = sink
                .client
                .post(&sink.url)
                .timeout(WEBHOOK_TIMEOUT)
                .json(&body)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(alert_type = %alert.alert_type, "crisis alert webhook delivered");
                }
                Ok(response) => {
                    warn!(
                        alert_type = %alert.alert_type,
                        status = %response.status(),
                        "crisis alert webhook rejected"
                    );
                }
                Err(e) => {
                    warn!(alert_type = %alert.alert_type, error = %e, "crisis alert webhook failed");
                }
            }
        });
    }
}

/// Build the sink body: a human-readable summary plus the raw alert for
/// machine consumers.
fn format_alert(alert: &CrisisAlertEvent, timestamp: DateTime<Utc>) -> serde_json::Value {
    let mut lines = vec![format!("Crisis alert: {}", alert.alert_type)];
    if let Some(severity) = &alert.severity {
        lines.push(format!("Severity: {severity}"));
    }
    if let Some(project_name) = &alert.project_name {
        lines.push(format!("Project: {project_name}"));
    }
    if let (Some(metric), Some(current), Some(threshold)) =
        (&alert.metric, alert.current_value, alert.threshold)
    {
        lines.push(format!("{metric}: {current} (threshold {threshold})"));
    }
    if let Some(window) = &alert.time_window {
        lines.push(format!("Window: {window}"));
    }
    if let Some(action) = &alert.action_required {
        lines.push(format!("Action required: {action}"));
    }
    lines.push(format!("At: {}", timestamp.to_rfc3339()));

    serde_json::json!({
        "text": lines.join("\n"),
        "alert": alert,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert() -> CrisisAlertEvent {
        serde_json::from_str(
            r#"{"alert_type":"spike","severity":"high","project_name":"P","metric":"mentions",
                "current_value":1.0,"threshold":0.5,"time_window":"5m","action_required":"review"}"#,
        )
        .unwrap()
    }

    #[test]
    fn format_alert_includes_summary_and_raw_payload() {
        let timestamp = Utc::now();
        let body = format_alert(&alert(), timestamp);

        let text = body["text"].as_str().unwrap();
        assert!(text.contains("Crisis alert: spike"));
        assert!(text.contains("Severity: high"));
        assert!(text.contains("mentions: 1 (threshold 0.5)"));
        assert!(text.contains("Action required: review"));
        assert_eq!(body["alert"]["alert_type"], "spike");
    }

    #[test]
    fn format_alert_tolerates_sparse_payloads() {
        let sparse: CrisisAlertEvent = serde_json::from_str(r#"{"alert_type":"spike"}"#).unwrap();
        let body = format_alert(&sparse, Utc::now());
        let text = body["text"].as_str().unwrap();
        assert!(text.starts_with("Crisis alert: spike"));
        assert!(!text.contains("Severity"));
    }
}
