use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use drydock_apply::Applier;
use drydock_core::{EnvBinding, ResourceKind, ResourceRef, WorkloadKind, WorkloadSpec};
use drydock_kubehub::{KubeLogs, LogOptions, Stores};
use drydock_ops::{apply_patch, JobRunner, Mutation, RunnerConfig};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "drydock", version, about = "Apply, patch and run workloads on Kubernetes")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true, env = "DRYDOCK_NAMESPACE")]
    namespace: Option<String>,

    /// Explicit kubeconfig; otherwise in-cluster or the default kubeconfig
    #[arg(long = "kubeconfig", global = true, env = "DRYDOCK_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update every manifest in a YAML file ("-" for stdin)
    Apply {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Create or update a Deployment
    Deploy {
        name: String,
        #[arg(long)]
        image: String,
        /// Pin the replica count; by default the running count is kept
        #[arg(long)]
        replicas: Option<i32>,
        /// KEY=VALUE, repeatable
        #[arg(short = 'e', long = "env")]
        env: Vec<EnvBinding>,
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Create or update a CronJob
    Cronjob {
        name: String,
        #[arg(long)]
        image: String,
        #[arg(long)]
        schedule: String,
        #[arg(short = 'e', long = "env")]
        env: Vec<EnvBinding>,
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Create or update a ConfigMap from literals
    Configmap {
        name: String,
        /// KEY=VALUE, repeatable
        #[arg(long = "from-literal")]
        data: Vec<EnvBinding>,
    },
    /// Create or update an Opaque Secret from literals
    Secret {
        name: String,
        #[arg(long = "from-literal")]
        data: Vec<EnvBinding>,
    },
    /// Patch environment variables of a Deployment or CronJob
    Env {
        #[command(subcommand)]
        action: EnvAction,
    },
    /// Set the replica count of a Deployment
    Scale { name: String, replicas: i32 },
    /// Roll a Deployment back to a prior revision
    Rollback { name: String, revision: String },
    /// Replace the full annotation map of a resource
    Annotate {
        /// deploy, cronjob, service, ...
        kind: ResourceKind,
        name: String,
        /// KEY=VALUE, repeatable; the resulting map replaces the existing one
        annotations: Vec<EnvBinding>,
    },
    /// Run a pod to completion, streaming its output; exits with the pod's code
    Run {
        #[arg(long)]
        image: String,
        /// Pod name (default: run-<random>)
        #[arg(long)]
        name: Option<String>,
        #[arg(short = 'e', long = "env")]
        env: Vec<EnvBinding>,
        /// Run timeout in seconds once the pod has started
        #[arg(long)]
        timeout: Option<u64>,
        /// Keep the pod after it finishes
        #[arg(long, action = ArgAction::SetTrue)]
        keep: bool,
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Print pod logs
    Logs {
        pod: String,
        #[arg(short = 'f', long, action = ArgAction::SetTrue)]
        follow: bool,
        #[arg(long)]
        tail: Option<i64>,
        #[arg(long, action = ArgAction::SetTrue)]
        previous: bool,
        #[arg(short = 'c', long)]
        container: Option<String>,
    },
    /// Check connectivity and credentials
    Health,
}

#[derive(Subcommand, Debug)]
enum EnvAction {
    /// Add or replace KEY=VALUE variables
    Set {
        name: String,
        vars: Vec<EnvBinding>,
        #[command(flatten)]
        target: EnvTarget,
    },
    /// Remove variables by name
    Unset {
        name: String,
        keys: Vec<String>,
        #[command(flatten)]
        target: EnvTarget,
    },
    /// Expose secret keys as variables of the same name
    Secret {
        name: String,
        #[arg(long)]
        secret: String,
        keys: Vec<String>,
        #[command(flatten)]
        target: EnvTarget,
    },
}

#[derive(clap::Args, Debug)]
struct EnvTarget {
    /// Patch a CronJob instead of a Deployment
    #[arg(long, action = ArgAction::SetTrue)]
    cronjob: bool,
    /// Container to patch (default: the resource name)
    #[arg(long)]
    container: Option<String>,
}

impl EnvTarget {
    fn resolve(&self, ns: &str, name: &str) -> (ResourceRef, String) {
        let kind = if self.cronjob { ResourceKind::CronJob } else { ResourceKind::Deployment };
        (ResourceRef::new(kind, ns, name), self.container.clone().unwrap_or_else(|| name.to_string()))
    }
}

fn init_tracing() {
    let env = std::env::var("DRYDOCK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DRYDOCK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid DRYDOCK_METRICS_ADDR; expected host:port");
        }
    }
}

fn literals(bindings: Vec<EnvBinding>) -> Vec<(String, String)> {
    bindings
        .into_iter()
        .filter_map(|b| match b.source {
            drydock_core::EnvSource::Literal(v) => Some((b.name, v)),
            drydock_core::EnvSource::Secret { .. } => None,
        })
        .collect()
}

fn read_manifests(file: &Path) -> Result<String> {
    if file.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf).context("reading manifests from stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))
}

fn workload(ns: &str, name: String, kind: WorkloadKind, image: String, env: Vec<EnvBinding>, command: Vec<String>) -> WorkloadSpec {
    let mut spec = WorkloadSpec::new(ns, name, kind, image).with_command(command);
    spec.container.env = env;
    spec
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = drydock_kubehub::connect(cli.kubeconfig.as_deref()).await?;
    let ns = cli.namespace.clone().unwrap_or_else(|| client.default_namespace().to_string());
    let stores = Stores::kube(client.clone());
    let applier = Applier::new(&stores);

    match cli.command {
        Commands::Health => {
            drydock_kubehub::health_check(&client).await?;
            println!("ok");
        }
        Commands::Apply { file } => {
            let yaml = read_manifests(&file)?;
            let applied = applier.apply_yaml(&yaml, cli.namespace.as_deref()).await?;
            match cli.output {
                Output::Human => {
                    for (kind, outcome) in &applied {
                        println!("{} {}", kind, outcome.as_str());
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&applied)?),
            }
        }
        Commands::Deploy { name, image, replicas, env, command } => {
            let spec = workload(&ns, name, WorkloadKind::Deployment { replicas }, image, env, command);
            let outcome = applier.apply_workload(&spec).await?;
            println!("{} {}", spec.reference(), outcome.as_str());
        }
        Commands::Cronjob { name, image, schedule, env, command } => {
            let spec = workload(&ns, name, WorkloadKind::CronJob { schedule }, image, env, command);
            let outcome = applier.apply_workload(&spec).await?;
            println!("{} {}", spec.reference(), outcome.as_str());
        }
        Commands::Configmap { name, data } => {
            let data: BTreeMap<_, _> = literals(data).into_iter().collect();
            let outcome = applier.config_map(&ns, &name, data).await?;
            println!("configmap {}/{} {}", ns, name, outcome.as_str());
        }
        Commands::Secret { name, data } => {
            let data: BTreeMap<_, _> = literals(data).into_iter().map(|(k, v)| (k, v.into_bytes())).collect();
            let outcome = applier.secret(&ns, &name, data).await?;
            println!("secret {}/{} {}", ns, name, outcome.as_str());
        }
        Commands::Env { action } => {
            let (target, mutation) = match action {
                EnvAction::Set { name, vars, target } => {
                    let (r, container) = target.resolve(&ns, &name);
                    (r, Mutation::SetEnv { container, vars: literals(vars) })
                }
                EnvAction::Unset { name, keys, target } => {
                    let (r, container) = target.resolve(&ns, &name);
                    (r, Mutation::UnsetEnv { container, names: keys })
                }
                EnvAction::Secret { name, secret, keys, target } => {
                    let (r, container) = target.resolve(&ns, &name);
                    (r, Mutation::SetSecretEnv { container, secret, keys })
                }
            };
            patch(&stores, &target, &mutation, cli.output).await?;
        }
        Commands::Scale { name, replicas } => {
            let target = ResourceRef::new(ResourceKind::Deployment, &ns, name);
            patch(&stores, &target, &Mutation::Scale(replicas), cli.output).await?;
        }
        Commands::Rollback { name, revision } => {
            let target = ResourceRef::new(ResourceKind::Deployment, &ns, name);
            patch(&stores, &target, &Mutation::Rollback(revision), cli.output).await?;
        }
        Commands::Annotate { kind, name, annotations } => {
            let target = ResourceRef::new(kind, &ns, name);
            let map = literals(annotations).into_iter().collect();
            patch(&stores, &target, &Mutation::Annotations(map), cli.output).await?;
        }
        Commands::Logs { pod, follow, tail, previous, container } => {
            let opts = LogOptions { follow, tail_lines: tail, previous, container };
            let runner = JobRunner::new(stores.pods.clone(), Arc::new(KubeLogs::new(client)), RunnerConfig::from_env());
            let mut stream = runner.pod_logs(&ns, &pod, &opts).await.with_context(|| format!("opening logs of {ns}/{pod}"))?;
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = stream.next().await {
                stdout.write_all(&chunk.context("reading log stream")?).await?;
            }
            stdout.flush().await?;
        }
        Commands::Run { image, name, env, timeout, keep, command } => {
            let mut config = RunnerConfig::from_env();
            if let Some(secs) = timeout {
                config.run_timeout = Duration::from_secs(secs);
            }
            config.cleanup = !keep;
            let runner = JobRunner::new(stores.pods.clone(), Arc::new(KubeLogs::new(client)), config);
            let name = name.unwrap_or_else(|| format!("run-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
            let spec = workload(&ns, name, WorkloadKind::Pod, image, env, command);
            let code = run(&runner, &spec).await?;
            std::process::exit(code);
        }
    }
    Ok(())
}

async fn patch(stores: &Stores, target: &ResourceRef, mutation: &Mutation, output: Output) -> Result<()> {
    let payload = apply_patch(stores, target, mutation).await?;
    match output {
        Output::Human => println!("{} patched ({})", target, mutation.as_str()),
        Output::Json => println!("{}", serde_json::to_string_pretty(&payload.body)?),
    }
    Ok(())
}

async fn run(runner: &JobRunner, spec: &WorkloadSpec) -> Result<i32> {
    let session = runner.run_to_completion(spec).await?;
    info!(pod = %session.pod, "run started");
    let drydock_ops::RunSession { mut output, completion, cancel, supervisor, .. } = session;
    let mut cancel = Some(cancel);

    let mut stdout = tokio::io::stdout();
    {
        let copy = tokio::io::copy(&mut output, &mut stdout);
        tokio::pin!(copy);
        loop {
            tokio::select! {
                r = &mut copy => {
                    r.context("writing run output")?;
                    break;
                }
                _ = signal::ctrl_c(), if cancel.is_some() => {
                    if let Some(c) = cancel.take() {
                        warn!("interrupted; cancelling run");
                        c.cancel();
                    }
                }
            }
        }
    }
    stdout.flush().await?;
    let result = completion.await.map_err(|_| anyhow!("run ended without a result"))?;
    // cleanup runs after the result is published; let it finish before the process exits
    if let Err(e) = supervisor.await {
        warn!(error = %e, "run supervisor did not finish cleanly");
    }
    Ok(result?)
}
