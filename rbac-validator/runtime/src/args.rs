use crate::{
    admission::Admission, core::ClusterConfig, metrics::OptimizationMetrics,
    remote::KubeConnector, store::KubeStore, tracker::Tracker,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "application-rbac-validator",
    about = "Authorizes Argo CD Application destinations and tracks the namespaces they use"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "application_rbac_validator=info,warn",
        env = "APPLICATION_RBAC_VALIDATOR_LOG"
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

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Disables namespace tracking on destination credential objects.
    #[clap(long)]
    tracker_disabled: bool,

    /// Domain used to expand bare cluster names into server URLs.
    #[clap(long, env = "KUBERNETES_CLUSTER_DOMAIN")]
    cluster_domain: Option<String>,

    /// File holding the namespace the webhook runs in.
    #[clap(
        long,
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/namespace"
    )]
    namespace_path: PathBuf,

    /// Only track Applications in namespaces starting with this prefix.
    #[clap(long)]
    application_namespace_prefix: Option<String>,

    #[clap(long, default_value = "5")]
    update_attempts: usize,

    #[clap(long, default_value = "10000")]
    remote_timeout_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            tracker_disabled,
            cluster_domain,
            namespace_path,
            application_namespace_prefix,
            update_attempts,
            remote_timeout_ms,
        } = self;

        if update_attempts == 0 {
            bail!("--update-attempts must be at least 1");
        }

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let cluster = Arc::new(ClusterConfig::new(cluster_domain));

        let mut prom = <Registry>::default();
        let metrics = OptimizationMetrics::register(&mut prom);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        if cluster.domain().is_none() {
            info!("No cluster domain configured; destinations must be server URLs");
        }

        let store = Arc::new(KubeStore::new(runtime.client()));

        if tracker_disabled {
            info!("Namespace tracking is disabled");
        } else {
            let tracker = Arc::new(Tracker::new(
                store.clone(),
                cluster.clone(),
                metrics,
                application_namespace_prefix,
                update_attempts,
            ));
            tokio::spawn(
                tracker
                    .run(runtime.client(), runtime.shutdown_handle())
                    .instrument(info_span!("tracker")),
            );
        }

        let admission = Admission::new(
            store,
            Arc::new(KubeConnector),
            cluster,
            namespace_path,
            Duration::from_millis(remote_timeout_ms),
        );
        let runtime = runtime.spawn_server(move || admission.clone());

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
