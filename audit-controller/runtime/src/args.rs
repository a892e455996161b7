use crate::{
    admission::Admission,
    alert::{AlertRouter, WebhookNotifier},
    audit::AuditLogWatcher,
    metrics::{AdmissionMetrics, AlertMetrics, AuditMetrics, PipelineMetrics},
    pipeline::{Backoff, EventPipeline, PipelineConfig},
    policy::PolicyAdmin,
    server::Webhook,
    store::FileStore,
};
use anyhow::{bail, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{runtime::watcher, Api};
use kubetrail_controller_core::{MemoryStore, Store};
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "kubetrail",
    about = "Records and polices mutations to Kubernetes resources"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "kubetrail=info,warn",
        env = "KUBETRAIL_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Records requests denied by a block rule.
    #[clap(long)]
    record_blocked: bool,

    /// The number of events that may wait to be persisted.
    #[clap(long, default_value = "1024")]
    queue_capacity: usize,

    #[clap(long, default_value = "4")]
    workers: usize,

    /// Seconds to spend persisting queued events on shutdown.
    #[clap(long, default_value = "10")]
    drain_grace_period: u64,

    #[clap(long, default_value = "5000")]
    alert_timeout_ms: u64,

    /// An API server audit log to tail.
    #[clap(long)]
    audit_log_file: Option<PathBuf>,

    /// A directory of API server audit logs; the newest file is tailed.
    #[clap(long)]
    audit_log_dir: Option<PathBuf>,

    #[clap(long, default_value = "500")]
    audit_poll_interval_ms: u64,

    /// Appends events to this file. Events are kept in memory when unset.
    #[clap(long)]
    store_path: Option<PathBuf>,

    #[clap(long, default_value = "10000")]
    memory_store_limit: usize,

    #[clap(long, env = "KUBETRAIL_NAMESPACE", default_value = "kubetrail")]
    config_namespace: String,

    /// The ConfigMap holding `policy.yaml` and `alerts.yaml`.
    #[clap(long, default_value = "kubetrail-config")]
    config_name: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            server,
            admin,
            record_blocked,
            queue_capacity,
            workers,
            drain_grace_period,
            alert_timeout_ms,
            audit_log_file,
            audit_log_dir,
            audit_poll_interval_ms,
            store_path,
            memory_store_limit,
            config_namespace,
            config_name,
        } = self;

        if queue_capacity == 0 {
            bail!("--queue-capacity must be positive");
        }
        if workers == 0 {
            bail!("--workers must be positive");
        }

        let mut prom = <Registry>::with_prefix("kubetrail");
        let admission_metrics =
            AdmissionMetrics::register(prom.sub_registry_with_prefix("admission"));
        let pipeline_metrics =
            PipelineMetrics::register(prom.sub_registry_with_prefix("pipeline"));
        let alert_metrics = AlertMetrics::register(prom.sub_registry_with_prefix("alerts"));
        let audit_metrics = AuditMetrics::register(prom.sub_registry_with_prefix("audit"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_server(server)
            .build()
            .await?;

        // Follow the configuration ConfigMap so that policy and alert rules
        // are republished whenever it changes.
        let (admin, policy, alert_rules) = PolicyAdmin::new();
        let admin = Arc::new(admin.with_config_map(
            Api::<ConfigMap>::namespaced(runtime.client(), &config_namespace),
            &config_name,
        ));
        let config_maps = runtime.watch_namespaced::<ConfigMap>(
            config_namespace.clone(),
            watcher::Config::default().fields(&format!("metadata.name={config_name}")),
        );
        tokio::spawn(admin.run(config_maps).instrument(info_span!("config")));

        let store: Arc<dyn Store> = match store_path {
            Some(path) => {
                info!(path = %path.display(), "Persisting events to file");
                Arc::new(FileStore::open(path).await?)
            }
            None => {
                info!(limit = memory_store_limit, "Keeping events in memory");
                Arc::new(MemoryStore::new(memory_store_limit))
            }
        };

        let router = AlertRouter::new(
            alert_rules,
            Arc::new(WebhookNotifier::new()?),
            Duration::from_millis(alert_timeout_ms),
            alert_metrics,
        );
        let pipeline = EventPipeline::start(
            PipelineConfig {
                capacity: queue_capacity,
                workers,
                retry: Backoff::default(),
            },
            store,
            router,
            pipeline_metrics,
        );

        let admission = Admission::new(policy.clone(), pipeline.sink(), admission_metrics)
            .with_record_blocked(record_blocked);
        let audit = AuditLogWatcher::new(
            policy,
            pipeline.sink(),
            Duration::from_millis(audit_poll_interval_ms),
            audit_metrics,
        );

        // Watchers stop as soon as shutdown begins; the pipeline then gets the
        // grace period to persist what was already queued.
        let watchers = CancellationToken::new();
        if let Some(path) = audit_log_file {
            let audit = audit.clone();
            let token = watchers.clone();
            tokio::spawn(
                async move {
                    if let Err(error) = audit.watch_file(path, token).await {
                        error!(%error, "Audit log watcher failed");
                    }
                }
                .instrument(info_span!("audit_file")),
            );
        }
        if let Some(dir) = audit_log_dir {
            let audit = audit.clone();
            let token = watchers.clone();
            tokio::spawn(
                async move {
                    if let Err(error) = audit.watch_directory(dir, token).await {
                        error!(%error, "Audit log directory watcher failed");
                    }
                }
                .instrument(info_span!("audit_dir")),
            );
        }

        let shutdown = runtime.shutdown_handle();
        let grace = Duration::from_secs(drain_grace_period);
        tokio::spawn(
            async move {
                let release = shutdown.signaled().await;
                watchers.cancel();
                release.release_after(pipeline.drain(grace)).await;
            }
            .instrument(info_span!("pipeline")),
        );

        let webhook = Webhook::new(admission, audit);
        let runtime = runtime.spawn_server(webhook);

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // the pipeline to drain before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
