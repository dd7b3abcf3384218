//! Result notification posted to an external webhook when a run finishes.
//!
//! Purely a convenience for humans watching a channel; failures are logged
//! by the caller and never affect the test result.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

const USERNAME: &str = "skiff";
const ICON: &str = ":sailboat:";
const COLOR_PASSED: &str = "#2eb886";
const COLOR_FAILED: &str = "#dc3545";

/// Outcome of one harness run.
#[derive(Debug, Clone)]
pub struct ResultNotification {
    pub test_id: String,
    pub workflow: String,
    pub passed: bool,
    pub cluster_id: String,
    pub installation_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct Payload {
    username: &'static str,
    icon_emoji: &'static str,
    text: String,
    attachments: Vec<Attachment>,
}

#[derive(Serialize)]
struct Attachment {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    title_link: Option<String>,
    color: &'static str,
    fields: Vec<Field>,
}

#[derive(Serialize)]
struct Field {
    short: bool,
    title: &'static str,
    value: String,
}

fn humanize(duration: chrono::Duration) -> String {
    let seconds = duration.num_seconds().max(0);
    format!("{}m{:02}s", seconds / 60, seconds % 60)
}

fn payload_for(notification: &ResultNotification) -> Payload {
    let outcome = if notification.passed { "passed" } else { "failed" };
    Payload {
        username: USERNAME,
        icon_emoji: ICON,
        text: format!("e2e workflow {} {outcome}", notification.workflow),
        attachments: vec![Attachment {
            title: format!("Test {}", notification.test_id),
            title_link: None,
            color: if notification.passed { COLOR_PASSED } else { COLOR_FAILED },
            fields: vec![
                Field {
                    short: true,
                    title: "Cluster",
                    value: notification.cluster_id.clone(),
                },
                Field {
                    short: true,
                    title: "Installation",
                    value: notification.installation_id.clone(),
                },
                Field {
                    short: true,
                    title: "Runtime",
                    value: humanize(notification.finished_at - notification.started_at),
                },
            ],
        }],
    }
}

/// POST the notification to `webhook_url`.
pub async fn send_result_notification(
    webhook_url: &str,
    notification: &ResultNotification,
) -> Result<()> {
    let response = reqwest::Client::new()
        .post(webhook_url)
        .json(&payload_for(notification))
        .send()
        .await
        .context("failed to post result notification")?;
    response
        .error_for_status()
        .context("result notification rejected")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_outcome_and_fields() {
        let notification = ResultNotification {
            test_id: "t-1".to_string(),
            workflow: "cluster-lifecycle".to_string(),
            passed: false,
            cluster_id: "c-1".to_string(),
            installation_id: String::new(),
            started_at: Utc::now() - chrono::Duration::seconds(754),
            finished_at: Utc::now(),
        };
        let payload = payload_for(&notification);
        assert!(payload.text.contains("failed"));
        assert_eq!(payload.attachments[0].color, COLOR_FAILED);
        assert_eq!(payload.attachments[0].fields[2].value, "12m34s");
    }
}
