use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use kstrace_k8s::{KubeClient, KubeCluster, KubeExecTransport, TokioClock, WorkloadRef, WorkloadResolver};
use kstrace_trace::{CleanupCoordinator, TraceOrchestrator};
use kstrace_types::{OutputRoot, PodOutcome, SessionReport};

mod config;
mod logging;

use config::{FileConfig, Overrides};

/// kstrace - run strace against pods, deployments, services and daemonsets in Kubernetes
#[derive(Parser, Debug)]
#[command(name = "kstrace")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// What to trace: NAME (a pod), pod/NAME, svc/NAME, deploy/NAME or ds/NAME
    #[arg(value_name = "RESOURCE", required = true)]
    resources: Vec<String>,

    /// Kubernetes context name (defaults to the kubeconfig's current context)
    #[arg(long)]
    context: Option<String>,

    /// Namespace of the resources (defaults to the context's namespace)
    #[arg(short, long)]
    namespace: Option<String>,

    /// The trace image for use when performing the strace [default: quay.io/mwasher/crictl:0.0.1]
    #[arg(long)]
    image: Option<String>,

    /// The location of the CRI socket on the host machine [default: /run/crio/crio.sock]
    #[arg(long)]
    socket_path: Option<String>,

    /// How long to capture trace output for, e.g. 30s or 2m; 0s runs until the command exits
    #[arg(long, value_parser = humantime::parse_duration)]
    trace_timeout: Option<Duration>,

    /// Directory to store the strace data, or - for stdout/stderr [default: strace-collection]
    #[arg(short, long)]
    output: Option<String>,

    /// Command run against each container; {target_pid} is replaced by its host PID [default: "strace -fp {target_pid}"]
    #[arg(long)]
    command: Option<String>,

    /// Maximum number of pods traced at the same time
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Log verbosity: off, error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Send logs to a file; - is stderr
    #[arg(long, default_value = "-")]
    log_file: String,

    /// Config file [default: ~/.kstrace/config.toml]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the session report as JSON
    #[arg(long)]
    report_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = logging::init(&args.log_level, &args.log_file) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let file = FileConfig::load(args.config.as_deref())?;
    let config = Arc::new(config::session_config(
        Overrides {
            image: args.image,
            socket_path: args.socket_path,
            output: args.output,
            command: args.command,
            trace_timeout: args.trace_timeout,
            max_parallel: args.max_parallel,
        },
        file,
    )?);

    let refs = args
        .resources
        .iter()
        .map(|r| r.parse::<WorkloadRef>())
        .collect::<Result<Vec<_>, _>>()?;

    let kube_client = KubeClient::new()?;
    let context = kube_client.resolve_context(args.context.as_deref())?;
    let namespace = args
        .namespace
        .clone()
        .unwrap_or_else(|| kube_client.namespace_for_context(context));
    let client = kube_client.client_for_context(context).await?;

    let targets = WorkloadResolver::new(client.clone())
        .resolve(&namespace, &refs)
        .await
        .context("Failed to resolve pods to trace")?;
    TraceOrchestrator::validate(&targets, &config)?;

    let coordinator = Arc::new(CleanupCoordinator::new());
    let signals = coordinator
        .install_signal_handler()
        .context("Failed to install signal handlers")?;

    let orchestrator = TraceOrchestrator::new(
        config.clone(),
        Arc::new(KubeCluster::new(client.clone())),
        Arc::new(KubeExecTransport::new(client)),
        Arc::new(TokioClock),
        coordinator,
    );
    let report = orchestrator.run(targets).await?;

    // An interrupt may still be deleting resources; let it finish
    let interrupted = signals.finish().await;
    print_summary(&report, &config.output);
    if let Some(code) = interrupted {
        return Ok(ExitCode::from(code as u8));
    }

    if let Some(path) = &args.report_file {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }

    Ok(if report.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Human summary on stderr; stdout may be carrying trace output
fn print_summary(report: &SessionReport, output: &OutputRoot) {
    eprintln!();
    for pod in &report.pods {
        match &pod.outcome {
            PodOutcome::Succeeded => {
                eprintln!("✓ {}/{}", pod.namespace, pod.pod);
                for trace in &pod.traces {
                    let dest = trace
                        .output
                        .as_ref()
                        .map_or_else(|| output.to_string(), |p| p.display().to_string());
                    eprintln!(
                        "    {} (pid {}, exit {}) -> {}",
                        trace.container, trace.pid, trace.exit_code, dest
                    );
                }
            }
            PodOutcome::Failed { reason } => {
                eprintln!("✗ {}/{}: {}", pod.namespace, pod.pod, reason);
            }
        }
    }

    for leak in report.leaks() {
        eprintln!("! {}", leak);
    }

    eprintln!(
        "\n{} succeeded, {} failed",
        report.succeeded().count(),
        report.failed().count()
    );
}
