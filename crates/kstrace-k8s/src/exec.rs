//! Remote command execution inside a running pod
//!
//! [`RemoteCommandExecutor`] is the one primitive used both for short
//! metadata probes (output captured in memory) and for long-running trace
//! capture (output streamed to a sink). A remote non-zero exit is `Ok(code)`;
//! a broken channel is `Err`. Callers rely on that split to tell a failed
//! command from a failed transport.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::Api;
use kube::api::AttachParams;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("unable to open exec stream: {0}")]
    Connect(#[source] BoxError),

    #[error("exec stream failed: {0}")]
    Stream(#[source] BoxError),

    #[error("exec stream closed without reporting an exit status")]
    MissingStatus,

    #[error("remote command could not be run: {0}")]
    Remote(String),

    #[error("malformed exit status from the API server: {0}")]
    Protocol(String),

    #[error("failed relaying command output: {0}")]
    Io(#[source] io::Error),
}

/// Which pod to exec into and what to run there
#[derive(Clone, Copy, Debug)]
pub struct ExecRequest<'a> {
    pub namespace: &'a str,
    pub pod: &'a str,
    /// `None` picks the pod's only container
    pub container: Option<&'a str>,
    /// Passed to `sh -c` verbatim
    pub command: &'a str,
    pub tty: bool,
}

/// Local ends of the remote process's standard streams
#[derive(Default)]
pub struct ExecStreams<'a> {
    pub stdin: Option<&'a mut (dyn AsyncRead + Send + Unpin)>,
    pub stdout: Option<&'a mut (dyn AsyncWrite + Send + Unpin)>,
    pub stderr: Option<&'a mut (dyn AsyncWrite + Send + Unpin)>,
}

/// Streams requested from the transport
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachOptions {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
}

/// An open exec session as seen by the executor
pub struct ExecChannel {
    pub stdin: Option<BoxWriter>,
    pub stdout: Option<BoxReader>,
    pub stderr: Option<BoxReader>,
    /// Resolves once the remote process is gone, with the status the API
    /// server sent on the error channel (if any)
    pub completion: BoxFuture<'static, Result<Option<Status>, ExecError>>,
}

/// Opens the bidirectional stream to a pod
#[async_trait]
pub trait ExecTransport: Send + Sync {
    async fn open(
        &self,
        request: &ExecRequest<'_>,
        argv: Vec<String>,
        attach: AttachOptions,
    ) -> Result<ExecChannel, ExecError>;
}

/// [`ExecTransport`] over the API server's websocket exec subresource
#[derive(Clone)]
pub struct KubeExecTransport {
    client: kube::Client,
}

impl KubeExecTransport {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExecTransport for KubeExecTransport {
    async fn open(
        &self,
        request: &ExecRequest<'_>,
        argv: Vec<String>,
        attach: AttachOptions,
    ) -> Result<ExecChannel, ExecError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), request.namespace);

        let mut params = AttachParams::default()
            .stdin(attach.stdin)
            .stdout(attach.stdout)
            .stderr(attach.stderr)
            .tty(attach.tty);
        if let Some(container) = request.container {
            params = params.container(container);
        }

        let mut attached = pods
            .exec(request.pod, argv, &params)
            .await
            .map_err(|e| ExecError::Connect(Box::new(e)))?;

        let stdin = attached.stdin().map(|w| Box::new(w) as BoxWriter);
        let stdout = attached.stdout().map(|r| Box::new(r) as BoxReader);
        let stderr = attached.stderr().map(|r| Box::new(r) as BoxReader);
        let status = attached.take_status();

        let completion = async move {
            let status = match status {
                Some(status) => status.await,
                None => None,
            };
            attached
                .join()
                .await
                .map_err(|e| ExecError::Stream(Box::new(e)))?;
            Ok(status)
        }
        .boxed();

        Ok(ExecChannel {
            stdin,
            stdout,
            stderr,
            completion,
        })
    }
}

/// Runs shell commands in pods over an [`ExecTransport`]
#[derive(Clone)]
pub struct RemoteCommandExecutor {
    transport: Arc<dyn ExecTransport>,
}

impl RemoteCommandExecutor {
    pub fn new(transport: Arc<dyn ExecTransport>) -> Self {
        Self { transport }
    }

    /// Run `sh -c <command>` and block until the remote process exits.
    ///
    /// Output is relayed while the command runs. Returns the remote exit code,
    /// including non-zero codes; only channel and relay failures are errors.
    pub async fn execute_streaming(
        &self,
        request: &ExecRequest<'_>,
        streams: ExecStreams<'_>,
    ) -> Result<i32, ExecError> {
        let ExecStreams {
            stdin: local_stdin,
            stdout: local_stdout,
            stderr: local_stderr,
        } = streams;

        let attach = AttachOptions {
            stdin: local_stdin.is_some(),
            stdout: local_stdout.is_some(),
            // A TTY merges stderr into stdout
            stderr: local_stderr.is_some() && !request.tty,
            tty: request.tty,
        };

        let ExecChannel {
            stdin,
            stdout,
            stderr,
            completion,
        } = self
            .transport
            .open(request, shell_argv(request.command), attach)
            .await?;

        let (fed, out, err, status) = tokio::join!(
            feed(local_stdin, stdin),
            relay(stdout, local_stdout),
            relay(stderr, local_stderr),
            completion,
        );

        if let Err(e) = fed {
            // The remote side may exit without reading all of its input
            tracing::debug!(pod = %request.pod, error = %e, "stdin closed early");
        }

        let status = status?.ok_or(ExecError::MissingStatus)?;
        out.map_err(ExecError::Io)?;
        err.map_err(ExecError::Io)?;

        let code = exit_code_from_status(&status)?;
        tracing::debug!(
            pod = %request.pod,
            command = %request.command,
            exit_code = code,
            "Remote command finished"
        );
        Ok(code)
    }
}

/// `sh -c <command>`
pub fn shell_argv(command: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command.to_string()]
}

/// Decode the exit code from the status the API server sends when an exec ends
pub fn exit_code_from_status(status: &Status) -> Result<i32, ExecError> {
    if status.status.as_deref() == Some("Success") {
        return Ok(0);
    }

    if status.reason.as_deref() == Some("NonZeroExitCode") {
        let cause = status
            .details
            .as_ref()
            .and_then(|d| d.causes.as_ref())
            .and_then(|causes| {
                causes
                    .iter()
                    .find(|c| c.reason.as_deref() == Some("ExitCode"))
            })
            .and_then(|c| c.message.as_deref());

        return match cause {
            Some(code) => code
                .trim()
                .parse()
                .map_err(|_| ExecError::Protocol(format!("exit code {code:?} is not a number"))),
            None => Err(ExecError::Protocol(
                "NonZeroExitCode status without an ExitCode cause".to_string(),
            )),
        };
    }

    Err(ExecError::Remote(
        status
            .message
            .clone()
            .unwrap_or_else(|| "unknown failure".to_string()),
    ))
}

async fn feed(
    source: Option<&mut (dyn AsyncRead + Send + Unpin)>,
    remote: Option<BoxWriter>,
) -> io::Result<()> {
    if let (Some(source), Some(mut remote)) = (source, remote) {
        tokio::io::copy(source, &mut remote).await?;
        remote.shutdown().await?;
    }
    Ok(())
}

async fn relay(
    remote: Option<BoxReader>,
    local: Option<&mut (dyn AsyncWrite + Send + Unpin)>,
) -> io::Result<u64> {
    match (remote, local) {
        (Some(mut remote), Some(local)) => {
            let copied = tokio::io::copy(&mut remote, local).await?;
            local.flush().await?;
            Ok(copied)
        }
        // Keep draining so the remote side never stalls on a full buffer
        (Some(mut remote), None) => tokio::io::copy(&mut remote, &mut tokio::io::sink()).await,
        (None, _) => Ok(0),
    }
}
