//! Running commands inside live containers.
//!
//! Promotion and replication probing both shell into running pods. The
//! [`PodExec`] trait is the seam: [`KubePodExec`] goes through the API
//! server's exec subresource, and tests substitute scripted implementations.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("IO error during exec: {0}")]
    Io(#[from] std::io::Error),

    #[error("command failed in {pod}/{container}: {message}")]
    CommandFailed {
        pod: String,
        container: String,
        message: String,
    },
}

pub type ExecResult<T> = std::result::Result<T, ExecError>;

/// Captured output of an in-container command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait PodExec: Send + Sync {
    /// Run `command` inside the named container and capture its output.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> ExecResult<ExecOutput>;
}

#[derive(Clone)]
pub struct KubePodExec {
    client: Client,
}

impl KubePodExec {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodExec for KubePodExec {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> ExecResult<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        let attach_params = AttachParams {
            container: Some(container.to_string()),
            stdin: true,
            stdout: true,
            stderr: true,
            tty: false,
            ..Default::default()
        };

        let mut attached = pods.exec(pod, command.to_vec(), &attach_params).await?;

        // Close stdin to signal end of input
        if let Some(mut stdin) = attached.stdin() {
            stdin.shutdown().await?;
        }

        let mut stdout = String::new();
        if let Some(mut reader) = attached.stdout() {
            reader.read_to_string(&mut stdout).await?;
        }

        let mut stderr = String::new();
        if let Some(mut reader) = attached.stderr() {
            reader.read_to_string(&mut stderr).await?;
        }

        if let Some(status_rx) = attached.take_status() {
            if let Some(status) = status_rx.await {
                if status.status.as_deref() != Some("Success") {
                    let message = if stderr.is_empty() {
                        status.message.unwrap_or_else(|| "unknown failure".to_string())
                    } else {
                        stderr.clone()
                    };
                    return Err(ExecError::CommandFailed {
                        pod: pod.to_string(),
                        container: container.to_string(),
                        message,
                    });
                }
            }
        }

        Ok(ExecOutput { stdout, stderr })
    }
}
