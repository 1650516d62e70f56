use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{builder::NonEmptyStringValueParser, Parser, ValueEnum};
use kube::config::{KubeConfigOptions, Kubeconfig};
use rollcheck_core::{Outcome, WorkloadId};
use rollcheck_detector::{watch, DetectorConfig, ProblemDetector, WatchConfig};
use rollcheck_kubehub::KubeState;
use rollcheck_report::TeamcityFormat;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "rollcheck", version, about = "Track a Deployment rollout and report problems for CI")]
struct Cli {
    /// Name of the deployment to track
    #[arg(long, env = "ROLLCHECK_NAME", value_parser = NonEmptyStringValueParser::new())]
    name: String,

    /// Namespace of the deployment to track
    #[arg(long, env = "ROLLCHECK_NAMESPACE", value_parser = NonEmptyStringValueParser::new())]
    namespace: String,

    /// Path to a kubeconfig file (default: $KUBECONFIG, ~/.kube/config, then in-cluster)
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Seconds between poll cycles
    #[arg(long = "poll-interval-secs", default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    poll_interval_secs: u64,

    /// Stop retrying a pod's log stream after this many failed opens (default: retry forever)
    #[arg(long = "max-stream-attempts")]
    max_stream_attempts: Option<u32>,

    /// Output format; `auto` picks TeamCity service messages when TEAMCITY_VERSION is set
    #[arg(long, value_enum, default_value_t = Format::Auto)]
    format: Format,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Format {
    Auto,
    Human,
    Teamcity,
}

impl Format {
    fn resolve(self, under_teamcity: bool) -> Format {
        match self {
            Format::Auto if under_teamcity => Format::Teamcity,
            Format::Auto => Format::Human,
            other => other,
        }
    }
}

fn init_tracing(format: Format) {
    let env = std::env::var("ROLLCHECK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        Format::Teamcity => tracing_subscriber::fmt().with_env_filter(filter).event_format(TeamcityFormat).init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).with_target(false).without_time().init(),
    }
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ROLLCHECK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid ROLLCHECK_METRICS_ADDR; expected host:port");
        }
    }
}

async fn build_client(kubeconfig: Option<&Path>) -> Result<kube::Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?
        }
        None => kube::Config::infer().await.context("inferring kube config")?,
    };
    kube::Client::try_from(config).context("building kube client")
}

async fn run(cli: Cli) -> Result<Outcome> {
    let client = build_client(cli.kubeconfig.as_deref()).await?;
    let state = Arc::new(KubeState::new(client));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received; stopping");
                cancel.cancel();
            }
        }
    });

    let config = DetectorConfig { max_stream_attempts: cli.max_stream_attempts };
    let mut detector = ProblemDetector::with_config(state, config).with_cancellation(cancel.child_token());
    let id = WorkloadId::new(cli.namespace, cli.name);
    let watch_config = WatchConfig { poll_interval: Duration::from_secs(cli.poll_interval_secs) };

    let outcome = watch(&mut detector, &id, &watch_config, &cancel).await;
    detector.shutdown().await;
    outcome.with_context(|| format!("watching deployment {}", id))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.format.resolve(std::env::var_os("TEAMCITY_VERSION").is_some()));
    init_metrics();

    match run(cli).await {
        Ok(outcome) if outcome.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            error!(message_name = "buildProblem", fatal = true, "{:#}", e);
            ExitCode::FAILURE
        }
    }
}
