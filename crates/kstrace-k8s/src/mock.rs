//! In-memory stand-ins for the cluster, the exec channel and the clock

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::{Namespace, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Status, StatusCause, StatusDetails};
use parking_lot::Mutex;

use crate::cluster::{ClusterApi, ClusterError};
use crate::exec::{
    AttachOptions, BoxReader, BoxWriter, ExecChannel, ExecError, ExecRequest, ExecTransport,
};
use crate::wait::Clock;

/// Phase script entry that makes `get_pod` fail
pub const PHASE_ERROR: &str = "<error>";

#[derive(Default)]
struct ClusterState {
    namespaces: BTreeSet<String>,
    pods: BTreeMap<(String, String), Pod>,
    namespace_deletes: Vec<String>,
    pod_deletes: Vec<String>,
    pod_nodes: Vec<(String, String)>,
    phases: VecDeque<String>,
    fail_namespace_create: bool,
    fail_namespace_delete: bool,
    fail_pod_deletes: bool,
    delete_latency: Duration,
    next_id: u64,
}

/// Records every mutation; pods are reported `Running` unless phases are scripted
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<ClusterState>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phases returned by successive `get_pod` calls; the last one repeats
    pub fn script_phases(&self, phases: &[&str]) {
        self.state.lock().phases = phases.iter().map(|p| p.to_string()).collect();
    }

    pub fn fail_namespace_create(&self) {
        self.state.lock().fail_namespace_create = true;
    }

    pub fn fail_namespace_delete(&self) {
        self.state.lock().fail_namespace_delete = true;
    }

    /// Every delete takes `latency` before it is recorded
    pub fn delete_latency(&self, latency: Duration) {
        self.state.lock().delete_latency = latency;
    }

    pub fn fail_pod_deletes(&self) {
        self.state.lock().fail_pod_deletes = true;
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().namespaces.contains(name)
    }

    pub fn namespace_deletes(&self) -> Vec<String> {
        self.state.lock().namespace_deletes.clone()
    }

    pub fn pod_deletes(&self) -> Vec<String> {
        self.state.lock().pod_deletes.clone()
    }

    /// `(pod name, node name)` of every created pod, in creation order
    pub fn pod_nodes(&self) -> Vec<(String, String)> {
        self.state.lock().pod_nodes.clone()
    }

    /// Pods created and not yet deleted
    pub fn live_pods(&self) -> usize {
        self.state.lock().pods.len()
    }

    async fn delay_delete(&self) {
        let latency = self.state.lock().delete_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn generate_name(state: &mut ClusterState, prefix: Option<&str>) -> String {
        state.next_id += 1;
        format!("{}{:05}", prefix.unwrap_or("generated-"), state.next_id)
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, ClusterError> {
        let mut state = self.state.lock();
        if state.fail_namespace_create {
            return Err(ClusterError::Invalid("namespaces is forbidden".into()));
        }

        let name = Self::generate_name(&mut state, namespace.metadata.generate_name.as_deref());
        state.namespaces.insert(name.clone());

        let mut created = namespace.clone();
        created.metadata.name = Some(name);
        Ok(created)
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        self.delay_delete().await;
        let mut state = self.state.lock();
        state.namespace_deletes.push(name.to_string());
        if state.fail_namespace_delete {
            return Err(ClusterError::Invalid("namespace deletion refused".into()));
        }
        state.namespaces.remove(name);
        state.pods.retain(|(ns, _), _| ns != name);
        Ok(())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClusterError> {
        let mut state = self.state.lock();
        let name = Self::generate_name(&mut state, pod.metadata.generate_name.as_deref());
        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default();
        state.pod_nodes.push((name.clone(), node));

        let mut created = pod.clone();
        created.metadata.name = Some(name.clone());
        created.metadata.namespace = Some(namespace.to_string());
        state
            .pods
            .insert((namespace.to_string(), name), created.clone());
        Ok(created)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        let mut state = self.state.lock();
        let scripted = if state.phases.len() > 1 {
            state.phases.pop_front()
        } else {
            state.phases.front().cloned()
        };
        let phase = scripted.unwrap_or_else(|| "Running".to_string());

        if phase == PHASE_ERROR {
            return Err(ClusterError::Invalid(format!("pods {name:?} not found")));
        }

        let mut pod = state
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default();
        pod.status = Some(PodStatus {
            phase: Some(phase),
            ..Default::default()
        });
        Ok(pod)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.delay_delete().await;
        let mut state = self.state.lock();
        state.pod_deletes.push(name.to_string());
        if state.fail_pod_deletes {
            return Err(ClusterError::Invalid("pod deletion refused".into()));
        }
        state.pods.remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

#[derive(Clone, Debug)]
enum Outcome {
    Exit(i32),
    NoStatus,
    ConnectError(String),
    StreamError(String),
    Hang,
}

/// Scripted behaviour of one remote command
#[derive(Clone, Debug)]
pub struct ExecScript {
    outcome: Outcome,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl ExecScript {
    fn with(outcome: Outcome) -> Self {
        Self {
            outcome,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub fn exit(code: i32) -> Self {
        Self::with(Outcome::Exit(code))
    }

    pub fn connect_error(message: &str) -> Self {
        Self::with(Outcome::ConnectError(message.to_string()))
    }

    pub fn stream_error(message: &str) -> Self {
        Self::with(Outcome::StreamError(message.to_string()))
    }

    pub fn no_status() -> Self {
        Self::with(Outcome::NoStatus)
    }

    /// Never completes; for cancellation tests
    pub fn hang() -> Self {
        Self::with(Outcome::Hang)
    }

    pub fn stdout(mut self, output: &str) -> Self {
        self.stdout = output.as_bytes().to_vec();
        self
    }

    pub fn stderr(mut self, output: &str) -> Self {
        self.stderr = output.as_bytes().to_vec();
        self
    }
}

/// One `open` call seen by [`MockExecTransport`]
#[derive(Clone, Debug)]
pub struct ExecCall {
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
    pub argv: Vec<String>,
    pub attach: AttachOptions,
}

impl ExecCall {
    /// The string handed to `sh -c`
    pub fn command(&self) -> &str {
        self.argv.last().map(String::as_str).unwrap_or_default()
    }
}

/// Answers exec requests from rules matched against the shell command.
///
/// The first rule whose pattern is a substring of the command wins; unmatched
/// commands exit 0 with no output.
#[derive(Default)]
pub struct MockExecTransport {
    rules: Mutex<Vec<(String, ExecScript)>>,
    calls: Mutex<Vec<ExecCall>>,
}

impl MockExecTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, pattern: &str, script: ExecScript) {
        self.rules.lock().push((pattern.to_string(), script));
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        self.calls.lock().clone()
    }

    /// Shell commands in call order
    pub fn commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|c| c.command().to_string())
            .collect()
    }
}

/// Status the API server sends for a given exit code
pub fn status_for_exit(code: i32) -> Status {
    if code == 0 {
        return Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
    }

    Status {
        status: Some("Failure".to_string()),
        reason: Some("NonZeroExitCode".to_string()),
        message: Some(format!("command terminated with non-zero exit code: {code}")),
        details: Some(StatusDetails {
            causes: Some(vec![StatusCause {
                reason: Some("ExitCode".to_string()),
                message: Some(code.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ExecTransport for MockExecTransport {
    async fn open(
        &self,
        request: &ExecRequest<'_>,
        argv: Vec<String>,
        attach: AttachOptions,
    ) -> Result<ExecChannel, ExecError> {
        let call = ExecCall {
            namespace: request.namespace.to_string(),
            pod: request.pod.to_string(),
            container: request.container.map(str::to_string),
            argv,
            attach,
        };
        let script = self
            .rules
            .lock()
            .iter()
            .find(|(pattern, _)| call.command().contains(pattern.as_str()))
            .map(|(_, script)| script.clone())
            .unwrap_or_else(|| ExecScript::exit(0));
        self.calls.lock().push(call);

        let completion: BoxFuture<'static, Result<Option<Status>, ExecError>> = match script
            .outcome
        {
            Outcome::ConnectError(message) => {
                return Err(ExecError::Connect(message.into()));
            }
            Outcome::Exit(code) => futures::future::ready(Ok(Some(status_for_exit(code)))).boxed(),
            Outcome::NoStatus => futures::future::ready(Ok(None)).boxed(),
            Outcome::StreamError(message) => {
                futures::future::ready(Err(ExecError::Stream(message.into()))).boxed()
            }
            Outcome::Hang => futures::future::pending().boxed(),
        };

        Ok(ExecChannel {
            stdin: attach
                .stdin
                .then(|| Box::new(tokio::io::sink()) as BoxWriter),
            stdout: attach
                .stdout
                .then(|| Box::new(Cursor::new(script.stdout)) as BoxReader),
            stderr: attach
                .stderr
                .then(|| Box::new(Cursor::new(script.stderr)) as BoxReader),
            completion,
        })
    }
}

/// Returns from `sleep` immediately and remembers every requested delay
#[derive(Default)]
pub struct RecordingClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingClock {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    pub fn total(&self) -> Duration {
        self.sleeps.lock().iter().sum()
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        tokio::task::yield_now().await;
    }
}
