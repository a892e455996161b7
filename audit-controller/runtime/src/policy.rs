//! Publishes policy and alert-rule snapshots.
//!
//! Readers hold a [`Policy`] or [`AlertRules`] handle and load the current
//! snapshot, an `Arc` that is never modified once published. Updates build a
//! complete replacement and swap it in, so a reader observes either the old
//! or the new configuration and never a mix.
//!
//! The configuration is persisted in a ConfigMap. [`PolicyAdmin::run`]
//! follows that ConfigMap and republishes on every change; content that fails
//! validation is rejected and the previous snapshot stays active.

use anyhow::{Context, Result};
use futures::prelude::*;
use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta};
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::watcher,
};
use kubetrail_controller_core::{AlertRule, PatternRule, PolicyConfig};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

pub const POLICY_KEY: &str = "policy.yaml";
pub const ALERTS_KEY: &str = "alerts.yaml";

const FIELD_MANAGER: &str = "kubetrail-controller";

/// A read handle on the active policy snapshot.
#[derive(Clone, Debug)]
pub struct Policy(watch::Receiver<Arc<PolicyConfig>>);

/// A read handle on the active alert rules.
#[derive(Clone, Debug)]
pub struct AlertRules(watch::Receiver<Arc<[AlertRule]>>);

/// Owns the policy and alert-rule snapshots and their persisted form.
pub struct PolicyAdmin {
    policy: watch::Sender<Arc<PolicyConfig>>,
    alerts: watch::Sender<Arc<[AlertRule]>>,
    store: Option<ConfigMapRef>,
    updates: Mutex<()>,
}

struct ConfigMapRef {
    api: Api<ConfigMap>,
    name: String,
}

// === impl Policy ===

impl Policy {
    pub fn current(&self) -> Arc<PolicyConfig> {
        self.0.borrow().clone()
    }

    /// A handle whose snapshot never changes.
    pub fn fixed(config: PolicyConfig) -> Self {
        let (_, rx) = watch::channel(Arc::new(config));
        Self(rx)
    }
}

// === impl AlertRules ===

impl AlertRules {
    pub fn current(&self) -> Arc<[AlertRule]> {
        self.0.borrow().clone()
    }

    pub fn fixed(rules: Vec<AlertRule>) -> Self {
        let (_, rx) = watch::channel(rules.into());
        Self(rx)
    }
}

// === impl PolicyAdmin ===

impl PolicyAdmin {
    pub fn new() -> (Self, Policy, AlertRules) {
        let (policy, policy_rx) = watch::channel(Arc::new(PolicyConfig::default()));
        let (alerts, alerts_rx) = watch::channel(Arc::from(Vec::new()));
        let admin = Self {
            policy,
            alerts,
            store: None,
            updates: Mutex::new(()),
        };
        (admin, Policy(policy_rx), AlertRules(alerts_rx))
    }

    /// Persists updates to the named ConfigMap.
    pub fn with_config_map(mut self, api: Api<ConfigMap>, name: impl ToString) -> Self {
        self.store = Some(ConfigMapRef {
            api,
            name: name.to_string(),
        });
        self
    }

    pub fn get_ignore_config(&self) -> Vec<PatternRule> {
        self.policy.borrow().ignore.clone()
    }

    pub fn get_block_config(&self) -> Vec<PatternRule> {
        self.policy.borrow().block.clone()
    }

    pub async fn update_ignore_config(&self, rules: Vec<PatternRule>) -> Result<()> {
        let _guard = self.updates.lock().await;
        let next = self.policy.borrow().with_ignore(rules);
        self.persist(&next).await?;
        self.publish_policy(next);
        Ok(())
    }

    pub async fn update_block_config(&self, rules: Vec<PatternRule>) -> Result<()> {
        let _guard = self.updates.lock().await;
        let next = self.policy.borrow().with_block(rules);
        self.persist(&next).await?;
        self.publish_policy(next);
        Ok(())
    }

    /// Follows the persisted ConfigMap until the stream ends.
    pub async fn run(self: Arc<Self>, events: impl Stream<Item = watcher::Event<ConfigMap>>) {
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            match event {
                watcher::Event::Apply(cm) | watcher::Event::InitApply(cm) => {
                    let _guard = self.updates.lock().await;
                    self.apply_config_map(&cm);
                }
                watcher::Event::Delete(_) => {
                    let _guard = self.updates.lock().await;
                    info!("Configuration deleted; clearing policy and alert rules");
                    self.publish_policy(PolicyConfig::default());
                    self.publish_alerts(Vec::new());
                }
                watcher::Event::Init | watcher::Event::InitDone => {}
            }
        }
        debug!("Configuration watch ended");
    }

    /// Validates and publishes the content of a configuration ConfigMap. Keys
    /// that fail to parse leave their previous snapshot in place.
    pub fn apply_config_map(&self, cm: &ConfigMap) {
        let data = cm.data.clone().unwrap_or_default();

        match data.get(POLICY_KEY).map(|yaml| parse_policy(yaml)) {
            Some(Ok(policy)) => self.publish_policy(policy),
            Some(Err(error)) => warn!(%error, "Rejected invalid policy; keeping the active policy"),
            None => self.publish_policy(PolicyConfig::default()),
        }

        match data.get(ALERTS_KEY).map(|yaml| parse_alerts(yaml)) {
            Some(Ok(rules)) => self.publish_alerts(rules),
            Some(Err(error)) => {
                warn!(%error, "Rejected invalid alert rules; keeping the active rules")
            }
            None => self.publish_alerts(Vec::new()),
        }
    }

    async fn persist(&self, policy: &PolicyConfig) -> Result<()> {
        let Some(ConfigMapRef { api, name }) = &self.store else {
            return Ok(());
        };

        let yaml = serde_yaml::to_string(policy)?;
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(POLICY_KEY.to_string(), yaml)])),
            ..Default::default()
        };
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(&cm))
            .await
            .with_context(|| format!("failed to persist policy to ConfigMap {name}"))?;
        Ok(())
    }

    fn publish_policy(&self, next: PolicyConfig) {
        let changed = self.policy.send_if_modified(|current| {
            if **current == next {
                return false;
            }
            *current = Arc::new(next);
            true
        });
        if changed {
            let policy = self.policy.borrow();
            info!(
                ignore = policy.ignore.len(),
                block = policy.block.len(),
                "Published policy"
            );
        }
    }

    fn publish_alerts(&self, next: Vec<AlertRule>) {
        let changed = self.alerts.send_if_modified(|current| {
            if **current == *next {
                return false;
            }
            *current = next.into();
            true
        });
        if changed {
            info!(rules = self.alerts.borrow().len(), "Published alert rules");
        }
    }
}

fn parse_policy(yaml: &str) -> Result<PolicyConfig> {
    serde_yaml::from_str(yaml).context("invalid policy")
}

fn parse_alerts(yaml: &str) -> Result<Vec<AlertRule>> {
    let rules: Vec<AlertRule> = serde_yaml::from_str(yaml).context("invalid alert rules")?;
    for rule in &rules {
        reqwest::Url::parse(&rule.channel.target).with_context(|| {
            format!(
                "alert rule {} has an invalid target {:?}",
                rule.name, rule.channel.target
            )
        })?;
    }
    Ok(rules)
}
