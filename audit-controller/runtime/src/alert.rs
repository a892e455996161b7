//! Fans persisted events out to notification channels.
//!
//! Each matching rule is notified on its own task under its own timeout, so a
//! slow or failing channel never delays another channel or the pipeline
//! worker that dispatched the event. Delivery is at most once; failures are
//! logged and counted but never retried.

use crate::{metrics::AlertMetrics, policy::AlertRules};
use anyhow::{bail, Result};
use kubetrail_controller_core::{ChangeEvent, Channel, ChannelType};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time};
use tracing::{debug, info_span, warn, Instrument};

const USER_AGENT: &str = concat!("kubetrail/", env!("CARGO_PKG_VERSION"));

/// The body delivered to a notification channel.
#[derive(Clone, Debug, Serialize)]
pub struct AlertPayload {
    pub rule: String,
    pub event: Arc<ChangeEvent>,
}

/// Delivers a payload to a channel.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel: &Channel, payload: &AlertPayload) -> Result<()>;
}

/// Posts payloads as JSON to webhook channels.
#[derive(Clone, Debug)]
pub struct WebhookNotifier {
    client: reqwest::Client,
}

#[derive(Clone)]
pub struct AlertRouter {
    rules: AlertRules,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
    metrics: AlertMetrics,
}

// === impl WebhookNotifier ===

impl WebhookNotifier {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, channel: &Channel, payload: &AlertPayload) -> Result<()> {
        match channel.channel_type {
            ChannelType::Webhook => {}
        }

        let mut req = self.client.post(&channel.target).json(payload);
        for (name, value) in &channel.headers {
            req = req.header(name, value);
        }

        let rsp = req.send().await?;
        let status = rsp.status();
        if !status.is_success() {
            bail!("webhook responded with {status}");
        }
        Ok(())
    }
}

// === impl AlertRouter ===

impl AlertRouter {
    pub fn new(
        rules: AlertRules,
        notifier: Arc<dyn Notifier>,
        timeout: Duration,
        metrics: AlertMetrics,
    ) -> Self {
        Self {
            rules,
            notifier,
            timeout,
            metrics,
        }
    }

    /// Starts a notification for every rule that matches the event. The
    /// returned handles may be dropped; notifications complete regardless.
    pub fn dispatch(&self, event: &Arc<ChangeEvent>) -> Vec<JoinHandle<()>> {
        let rules = self.rules.current();
        rules
            .iter()
            .filter(|rule| rule.matches(&**event))
            .map(|rule| {
                let channel = rule.channel.clone();
                let payload = AlertPayload {
                    rule: rule.name.clone(),
                    event: event.clone(),
                };
                let notifier = self.notifier.clone();
                let metrics = self.metrics.clone();
                let timeout = self.timeout;
                let span = info_span!("alert", rule = %rule.name, event = %event.id);
                tokio::spawn(
                    async move {
                        match time::timeout(timeout, notifier.notify(&channel, &payload)).await {
                            Ok(Ok(())) => {
                                metrics.sent();
                                debug!(url = %channel.target, "Delivered alert");
                            }
                            Ok(Err(error)) => {
                                metrics.failed();
                                warn!(url = %channel.target, %error, "Failed to deliver alert");
                            }
                            Err(_) => {
                                metrics.failed();
                                warn!(url = %channel.target, ?timeout, "Alert delivery timed out");
                            }
                        }
                    }
                    .instrument(span),
                )
            })
            .collect()
    }
}
