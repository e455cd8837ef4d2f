//! Run-to-completion pods: create, wait for start, stream logs while waiting
//! for the end, report the exit code, clean up.

use std::sync::Arc;
use std::time::Duration;

use drydock_apply::{ApplyError, Reconciler};
use drydock_core::{manifest::to_pod, ResourceKind, ResourceRef, WorkloadSpec};
use drydock_kubehub::{ByteStream, LogOptions, LogSource, ResourceStore, StoreError};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::poll::{poll_until, Check, PollError};
use crate::CancelHandle;

const OUTPUT_BUFFER: usize = 64 * 1024;
/// Floor for poll intervals read from the environment.
const MIN_POLL: Duration = Duration::from_millis(100);

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_poll(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_u64(key, default.as_millis() as u64)).max(MIN_POLL)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub start_poll: Duration,
    pub start_timeout: Duration,
    pub end_poll: Duration,
    /// Upper bound on the whole run once the pod has started.
    pub run_timeout: Duration,
    pub tail_lines: i64,
    /// How long log copying may trail the end of the pod.
    pub drain_grace: Duration,
    /// Delete the pod after a successful run.
    pub cleanup: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            start_poll: Duration::from_secs(1),
            start_timeout: Duration::from_secs(300),
            end_poll: Duration::from_secs(3),
            run_timeout: Duration::from_secs(1800),
            tail_lines: 10,
            drain_grace: Duration::from_secs(10),
            cleanup: true,
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            start_poll: env_poll("DRYDOCK_POD_START_POLL_MS", d.start_poll),
            start_timeout: Duration::from_secs(env_u64("DRYDOCK_POD_START_TIMEOUT_SECS", d.start_timeout.as_secs())),
            end_poll: env_poll("DRYDOCK_POD_END_POLL_MS", d.end_poll),
            run_timeout: Duration::from_secs(env_u64("DRYDOCK_POD_RUN_TIMEOUT_SECS", d.run_timeout.as_secs())),
            tail_lines: env_u64("DRYDOCK_LOG_TAIL_LINES", d.tail_lines as u64) as i64,
            drain_grace: Duration::from_secs(env_u64("DRYDOCK_LOG_DRAIN_SECS", d.drain_grace.as_secs())),
            cleanup: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Submitted,
    Starting,
    Streaming,
    Completed(i32),
    Failed(String),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed(_) | RunState::Failed(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("creating pod: {0}")]
    Create(#[source] ApplyError),
    #[error("run failed to start: {0}")]
    Start(#[source] PollError),
    #[error("opening logs: {0}")]
    Logs(#[source] StoreError),
    #[error("waiting for pod to finish: {0}")]
    End(#[source] PollError),
    #[error("pod {0} reported a terminal phase but no container has terminated")]
    StillRunning(String),
    #[error("run cancelled")]
    Cancelled,
}

impl RunError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RunError::Start(e) | RunError::End(e) if e.is_timeout())
    }

    fn stage(&self) -> &'static str {
        match self {
            RunError::Create(_) => "create",
            RunError::Start(_) => "start",
            RunError::Logs(_) => "logs",
            RunError::End(_) => "end",
            RunError::StillRunning(_) => "exit_code",
            RunError::Cancelled => "cancelled",
        }
    }
}

/// Handles on one submitted pod.
///
/// `output` reaches EOF on every path, and that happens before `completion` resolves.
/// `completion` yields exactly one value. `supervisor` finishes after cleanup; a process
/// about to exit awaits it so the pod deletion is not cut short.
pub struct RunSession {
    pub pod: ResourceRef,
    pub output: DuplexStream,
    pub completion: oneshot::Receiver<Result<i32, RunError>>,
    pub state: watch::Receiver<RunState>,
    pub cancel: CancelHandle,
    pub supervisor: JoinHandle<()>,
}

impl RunSession {
    /// Read the whole output, then the result.
    pub async fn collect(mut self) -> (Vec<u8>, Result<i32, RunError>) {
        use tokio::io::AsyncReadExt;
        let mut out = Vec::new();
        if let Err(e) = self.output.read_to_end(&mut out).await {
            debug!(error = %e, "reading run output");
        }
        let result = self.completion.await.unwrap_or(Err(RunError::Cancelled));
        (out, result)
    }
}

#[derive(Clone)]
pub struct JobRunner {
    pods: Arc<dyn ResourceStore<Pod>>,
    reconciler: Reconciler<Pod>,
    logs: Arc<dyn LogSource>,
    config: RunnerConfig,
}

impl JobRunner {
    pub fn new(pods: Arc<dyn ResourceStore<Pod>>, logs: Arc<dyn LogSource>, config: RunnerConfig) -> Self {
        Self { reconciler: Reconciler::new(pods.clone()), pods, logs, config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Submit `spec` as a pod and drive it in the background.
    ///
    /// Only creation happens before this returns; a creation failure is the
    /// returned error and nothing is spawned.
    pub async fn run_to_completion(&self, spec: &WorkloadSpec) -> Result<RunSession, RunError> {
        let manifest = to_pod(spec).map_err(|e| RunError::Create(ApplyError::Spec(e)))?;
        let pod = ResourceRef::new(ResourceKind::Pod, spec.namespace.clone(), spec.name.clone());
        counter!("run_started", 1u64);
        // a pod left over under the same name must not be mistaken for this run
        if let Err(e) = self.reconciler.create(&manifest).await {
            counter!("run_failed", 1u64, "stage" => "create");
            return Err(RunError::Create(e));
        }
        info!(ns = %pod.namespace, pod = %pod.name, "run submitted");

        let (state_tx, state_rx) = watch::channel(RunState::Submitted);
        let (writer, output) = tokio::io::duplex(OUTPUT_BUFFER);
        let (done_tx, done_rx) = oneshot::channel();
        let (cancel, cancel_rx) = CancelHandle::new();

        let runner = self.clone();
        let target = pod.clone();
        let supervisor = tokio::spawn(async move {
            runner.supervise(target, writer, state_tx, done_tx, cancel_rx).await;
        });

        Ok(RunSession { pod, output, completion: done_rx, state: state_rx, cancel, supervisor })
    }

    async fn supervise(
        self,
        pod: ResourceRef,
        writer: DuplexStream,
        state: watch::Sender<RunState>,
        done: oneshot::Sender<Result<i32, RunError>>,
        mut cancel: oneshot::Receiver<()>,
    ) {
        let t0 = Instant::now();
        let (ns, name) = (pod.namespace.as_str(), pod.name.as_str());
        // `drive` owns the writer; it is dropped before the result is published.
        let result = tokio::select! {
            r = self.drive(ns, name, writer, &state) => r,
            Ok(()) = &mut cancel => Err(RunError::Cancelled),
        };

        match &result {
            Ok(code) => {
                histogram!("run_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("run_completed", 1u64, "exit" => if *code == 0 { "zero" } else { "nonzero" });
                info!(ns = %ns, pod = %name, exit_code = code, "run completed");
                state.send_replace(RunState::Completed(*code));
            }
            Err(e) => {
                counter!("run_failed", 1u64, "stage" => e.stage());
                warn!(ns = %ns, pod = %name, error = %e, "run failed");
                state.send_replace(RunState::Failed(e.to_string()));
            }
        }
        let cleanup = match &result {
            Ok(_) => self.config.cleanup,
            Err(RunError::Cancelled) => true,
            Err(_) => false,
        };
        let _ = done.send(result);

        if cleanup {
            delete_pod(self.pods.as_ref(), ns, name).await;
        }
    }

    async fn drive(&self, ns: &str, name: &str, writer: DuplexStream, state: &watch::Sender<RunState>) -> Result<i32, RunError> {
        let pods = self.pods.as_ref();

        state.send_replace(RunState::Starting);
        poll_until(self.config.start_poll, self.config.start_timeout, || async move {
            pods.get(ns, name).await.map(|p| started(&p))
        })
        .await
        .map_err(RunError::Start)?;

        state.send_replace(RunState::Streaming);
        let opts = LogOptions { follow: true, tail_lines: Some(self.config.tail_lines), ..Default::default() };
        let stream = self.logs.open_logs(ns, name, &opts).await.map_err(RunError::Logs)?;

        let copy = copy_output(stream, writer, name.to_string());
        tokio::pin!(copy);
        let end = poll_until(self.config.end_poll, self.config.run_timeout, || async move {
            pods.get(ns, name).await.map(ended)
        });
        tokio::pin!(end);

        let mut copied = false;
        let finished = loop {
            tokio::select! {
                r = &mut end => break r,
                _ = &mut copy, if !copied => copied = true,
            }
        };
        if !copied && tokio::time::timeout(self.config.drain_grace, &mut copy).await.is_err() {
            debug!(ns = %ns, pod = %name, "log copy still open after drain grace; closing output");
        }

        let finished = finished.map_err(RunError::End)?;
        exit_code(&finished).ok_or_else(|| RunError::StillRunning(name.to_string()))
    }

    pub async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.pods.delete(namespace, name).await
    }

    pub async fn pod_logs(&self, namespace: &str, pod: &str, opts: &LogOptions) -> Result<ByteStream, StoreError> {
        self.logs.open_logs(namespace, pod, opts).await
    }
}

/// Best-effort removal; failures are logged and counted, never returned.
pub async fn delete_pod(pods: &dyn ResourceStore<Pod>, namespace: &str, name: &str) {
    match pods.delete(namespace, name).await {
        Ok(()) => debug!(ns = %namespace, pod = %name, "pod deleted"),
        Err(e) => {
            counter!("cleanup_err", 1u64);
            warn!(ns = %namespace, pod = %name, error = %e, "pod cleanup failed");
        }
    }
}

async fn copy_output(mut stream: ByteStream, mut writer: DuplexStream, pod: String) {
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!(pod = %pod, error = %e, "output reader gone");
                    return;
                }
            }
            Err(e) => {
                warn!(pod = %pod, error = %e, "log stream error");
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

fn phase(pod: &Pod) -> &str {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("")
}

/// Start-wait: `Failed` before running can never recover.
fn started(pod: &Pod) -> Check<()> {
    match phase(pod) {
        "Running" | "Succeeded" => Check::Done(()),
        "Failed" => Check::Fail("pod entered phase Failed before running".to_string()),
        _ => Check::Pending,
    }
}

/// End-wait: both terminal phases end the run.
fn ended(pod: Pod) -> Check<Pod> {
    match phase(&pod) {
        "Succeeded" | "Failed" => Check::Done(pod),
        _ => Check::Pending,
    }
}

fn exit_code(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find_map(|cs| cs.state.as_ref()?.terminated.as_ref().map(|t| t.exit_code))
}
