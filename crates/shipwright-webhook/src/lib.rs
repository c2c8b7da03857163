//! Webhook notifications for the Shipwright daemon.
//!
//! `notifications.slack_webhook`, when configured, receives a
//! fire-and-forget HTTP POST for a subset of event types
//! (`daemon.auto_pause`, `daemon.retry_exhausted`, `pipeline.completed`
//! with a failure result, `daemon.alert` by default — see
//! [`should_notify`]). The send is spawned on its own thread
//! ([`notify_fire_and_forget`]) so a slow or unreachable webhook endpoint
//! never blocks the poll loop. Payloads are signed with HMAC-SHA256 over
//! the JSON body using a configured shared secret, carried in an
//! `X-Shipwright-Signature: sha256=<hex>` header.
//!
//! # Example
//!
//! ```
//! use shipwright_webhook::{WebhookConfig, WebhookType, WebhookPayload, sign_payload};
//!
//! let config = WebhookConfig {
//!     url: "https://hooks.slack.com/services/...".to_string(),
//!     webhook_type: WebhookType::Slack,
//!     secret: Some("shared-secret".to_string()),
//!     timeout_secs: 30,
//! };
//!
//! let payload = WebhookPayload {
//!     message: "pipeline #42 failed at test stage".to_string(),
//!     ..Default::default()
//! };
//!
//! let body = serde_json::to_string(&payload).expect("serialize");
//! let signature = sign_payload("shared-secret", &body);
//! assert!(signature.starts_with("sha256="));
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use shipwright_types::{EventType, PipelineResult};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the HMAC-SHA256 signature of the request body.
pub const SIGNATURE_HEADER: &str = "X-Shipwright-Signature";

/// Webhook type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookType {
    /// Generic webhook (POST JSON).
    #[default]
    Generic,
    /// Slack incoming webhook.
    Slack,
    /// Discord webhook.
    Discord,
}

/// Webhook configuration, built from `notifications.slack_webhook` (or a
/// generic/Discord URL) in the daemon config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Webhook URL.
    pub url: String,
    /// Type of webhook.
    #[serde(default)]
    pub webhook_type: WebhookType,
    /// Shared secret used to sign the payload. Unsigned when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            webhook_type: WebhookType::default(),
            secret: None,
            timeout_secs: default_timeout(),
        }
    }
}

/// Webhook payload describing a single daemon or pipeline event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Main message.
    pub message: String,
    /// Optional title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Whether the underlying event represents success.
    pub success: bool,
    /// Issue/job id, if applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<u64>,
    /// Pipeline template, if applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Error message, if the event represents a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Additional fields.
    #[serde(flatten)]
    pub extra: std::collections::BTreeMap<String, serde_json::Value>,
}

/// Whether `event` falls in the default notification subset: daemon
/// auto-pause, retry exhaustion, pipeline completion with a failure
/// result, and daemon alerts. Callers with a configured event allowlist
/// should use that instead; this is the default when none is set.
pub fn should_notify(event: &EventType) -> bool {
    matches!(
        event,
        EventType::DaemonAutoPause { .. }
            | EventType::DaemonRetryExhausted { .. }
            | EventType::DaemonAlert { .. }
    ) || matches!(
        event,
        EventType::PipelineCompleted {
            result: PipelineResult::Failure,
            ..
        }
    )
}

/// Compute the `sha256=<hex>` signature for `body` under `secret`,
/// suitable for the [`SIGNATURE_HEADER`] value.
pub fn sign_payload(secret: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body.as_bytes());
    let bytes = mac.finalize().into_bytes();
    let mut hex = String::with_capacity(bytes.len() * 2 + 7);
    hex.push_str("sha256=");
    for b in bytes {
        hex.push_str(&format!("{b:02x}"));
    }
    hex
}

/// Send a webhook notification, blocking the calling thread. Use
/// [`notify_fire_and_forget`] from the poll loop so a slow endpoint
/// can't stall a cycle.
pub fn send_webhook(config: &WebhookConfig, payload: &WebhookPayload) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .context("failed to create HTTP client")?;

    let body = match config.webhook_type {
        WebhookType::Generic => serde_json::to_string(payload)?,
        WebhookType::Slack => slack_payload(payload)?,
        WebhookType::Discord => discord_payload(payload)?,
    };

    let mut request = client
        .post(&config.url)
        .header("Content-Type", "application/json");

    if let Some(secret) = &config.secret {
        request = request.header(SIGNATURE_HEADER, sign_payload(secret, &body));
    }

    let response = request
        .body(body)
        .send()
        .context("failed to send webhook request")?;

    if !response.status().is_success() {
        return Err(anyhow::anyhow!(
            "webhook request failed with status {}: {}",
            response.status(),
            response.text().unwrap_or_default()
        ));
    }

    Ok(())
}

/// Send a webhook notification on a detached thread, logging (rather
/// than propagating) any failure. This is what the poll loop should call
/// so a slow or unreachable endpoint never holds up a cycle.
pub fn notify_fire_and_forget(config: WebhookConfig, payload: WebhookPayload) {
    std::thread::spawn(move || {
        if let Err(err) = send_webhook(&config, &payload) {
            eprintln!("webhook delivery failed: {err:#}");
        }
    });
}

/// Send a webhook notification asynchronously.
pub async fn send_webhook_async(config: &WebhookConfig, payload: &WebhookPayload) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .context("failed to create HTTP client")?;

    let body = match config.webhook_type {
        WebhookType::Generic => serde_json::to_string(payload)?,
        WebhookType::Slack => slack_payload(payload)?,
        WebhookType::Discord => discord_payload(payload)?,
    };

    let mut request = client
        .post(&config.url)
        .header("Content-Type", "application/json");

    if let Some(secret) = &config.secret {
        request = request.header(SIGNATURE_HEADER, sign_payload(secret, &body));
    }

    let response = request
        .body(body)
        .send()
        .await
        .context("failed to send webhook request")?;

    if !response.status().is_success() {
        return Err(anyhow::anyhow!(
            "webhook request failed with status {}: {}",
            response.status(),
            response.text().await.unwrap_or_default()
        ));
    }

    Ok(())
}

/// Format payload for Slack.
fn slack_payload(payload: &WebhookPayload) -> Result<String> {
    let color = if payload.success { "good" } else { "danger" };

    let mut fields = vec![];

    if let Some(issue_id) = payload.issue_id {
        fields.push(json!({
            "title": "Issue",
            "value": issue_id.to_string(),
            "short": true
        }));
    }

    if let Some(template) = &payload.template {
        fields.push(json!({
            "title": "Template",
            "value": template,
            "short": true
        }));
    }

    if let Some(error) = &payload.error {
        fields.push(json!({
            "title": "Error",
            "value": error,
            "short": false
        }));
    }

    let slack_json = json!({
        "attachments": [{
            "color": color,
            "title": payload.title.as_ref().unwrap_or(&"Shipwright Notification".to_string()),
            "text": payload.message,
            "fields": fields
        }]
    });

    Ok(serde_json::to_string(&slack_json)?)
}

/// Format payload for Discord.
fn discord_payload(payload: &WebhookPayload) -> Result<String> {
    let color = if payload.success { 65280_u32 } else { 16711680_u32 };

    let mut fields = vec![];

    if let Some(issue_id) = payload.issue_id {
        fields.push(json!({
            "name": "Issue",
            "value": issue_id.to_string(),
            "inline": true
        }));
    }

    if let Some(template) = &payload.template {
        fields.push(json!({
            "name": "Template",
            "value": template,
            "inline": true
        }));
    }

    if let Some(error) = &payload.error {
        fields.push(json!({
            "name": "Error",
            "value": error,
            "inline": false
        }));
    }

    let discord_json = json!({
        "embeds": [{
            "title": payload.title.as_ref().unwrap_or(&"Shipwright Notification".to_string()),
            "description": payload.message,
            "color": color,
            "fields": fields
        }]
    });

    Ok(serde_json::to_string(&discord_json)?)
}

/// Build a payload for a pipeline that completed (success or failure).
pub fn pipeline_completed_payload(issue_id: u64, template: &str, success: bool) -> WebhookPayload {
    WebhookPayload {
        message: if success {
            format!("pipeline for issue #{issue_id} completed successfully")
        } else {
            format!("pipeline for issue #{issue_id} failed")
        },
        title: Some(if success {
            "Pipeline Completed".to_string()
        } else {
            "Pipeline Failed".to_string()
        }),
        success,
        issue_id: Some(issue_id),
        template: Some(template.to_string()),
        ..Default::default()
    }
}

/// Build a payload for a daemon-level alert (auto-pause, retry
/// exhaustion, disk pressure, etc).
pub fn daemon_alert_payload(message: &str) -> WebhookPayload {
    WebhookPayload {
        message: message.to_string(),
        title: Some("Shipwright Alert".to_string()),
        success: false,
        ..Default::default()
    }
}
