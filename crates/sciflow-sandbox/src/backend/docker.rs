//! Docker CLI backend
//!
//! Each sandbox is a detached container idling on `tail -f /dev/null`, with
//! networking disabled, capabilities dropped and memory/CPU/pid caps applied.
//! Every CLI child is `kill_on_drop`, so abandoning a call kills the client;
//! the in-container process dies when the pool removes the container.

use super::{BackendHandle, ExecOutput, SandboxBackend};
use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::sandbox::OwnerLabel;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Default sandbox image
pub const DEFAULT_IMAGE: &str = "sciflow-sandbox:latest";

/// Backend that shells out to the `docker` binary
#[derive(Debug, Clone)]
pub struct DockerCliBackend {
    program: String,
    image: String,
}

impl DockerCliBackend {
    /// Create backend for `image` using `docker` from `PATH`
    #[inline]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            program: "docker".to_string(),
            image: image.into(),
        }
    }

    /// Use a different CLI binary (e.g. `podman`)
    #[inline]
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Image sandboxes are created from
    #[inline]
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Arguments for `docker run` creating one idle sandbox
    #[must_use]
    pub fn run_args(&self, limits: &ResourceLimits, label: &OwnerLabel) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--memory".to_string(),
            format!("{}m", limits.memory_mb),
            "--cpus".to_string(),
            limits.cpus(),
            "--pids-limit".to_string(),
            limits.pids_limit.to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--label".to_string(),
            label.to_string(),
        ];
        if limits.network_disabled {
            args.push("--network=none".to_string());
        }
        args.extend([
            self.image.clone(),
            "tail".to_string(),
            "-f".to_string(),
            "/dev/null".to_string(),
        ]);
        args
    }

    async fn docker(&self, args: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput, SandboxError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                SandboxError::Unavailable(format!("'{}' not found on PATH", self.program))
            }
            _ => SandboxError::Io(e),
        })?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(bytes).await?;
                pipe.shutdown().await?;
            }
        }

        let output = child.wait_with_output().await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

impl Default for DockerCliBackend {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE)
    }
}

/// Messages the CLI prints when it cannot reach the daemon
const DAEMON_DOWN: [&str; 3] = [
    "Cannot connect to the Docker daemon",
    "Is the docker daemon running",
    "error during connect",
];

fn failed(output: &ExecOutput) -> bool {
    output.exit_code != Some(0)
}

fn daemon_down(stderr: &str) -> bool {
    DAEMON_DOWN.iter().any(|m| stderr.contains(m))
}

/// Error for a failed CLI call; an unreachable daemon is always `Unavailable`
fn cli_error(output: &ExecOutput, wrap: impl FnOnce(String) -> SandboxError) -> SandboxError {
    let msg = output.stderr.trim().to_string();
    if daemon_down(&msg) {
        SandboxError::Unavailable(msg)
    } else {
        wrap(msg)
    }
}

#[async_trait]
impl SandboxBackend for DockerCliBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        let args = ["version", "--format", "{{.Server.Version}}"].map(String::from);
        let out = self.docker(&args, None).await?;
        if failed(&out) {
            return Err(SandboxError::Unavailable(out.stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn list_labeled(&self, label: &OwnerLabel) -> Result<Vec<BackendHandle>, SandboxError> {
        let args = vec![
            "ps".to_string(),
            "-aq".to_string(),
            "--filter".to_string(),
            format!("label={label}"),
        ];
        let out = self.docker(&args, None).await?;
        if failed(&out) {
            return Err(cli_error(&out, SandboxError::Backend));
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(BackendHandle::new)
            .collect())
    }

    async fn create(
        &self,
        limits: &ResourceLimits,
        label: &OwnerLabel,
    ) -> Result<BackendHandle, SandboxError> {
        let out = self.docker(&self.run_args(limits, label), None).await?;
        if failed(&out) {
            return Err(cli_error(&out, SandboxError::CreationFailed));
        }
        let id = out.stdout.trim();
        if id.is_empty() {
            return Err(SandboxError::CreationFailed("docker returned no container id".into()));
        }
        Ok(BackendHandle::new(id))
    }

    async fn put_file(
        &self,
        handle: &BackendHandle,
        path: &str,
        contents: &[u8],
    ) -> Result<(), SandboxError> {
        let args = vec![
            "exec".to_string(),
            "-i".to_string(),
            handle.to_string(),
            "sh".to_string(),
            "-c".to_string(),
            format!("cat > '{}'", path.replace('\'', "")),
        ];
        let out = self.docker(&args, Some(contents)).await?;
        if failed(&out) {
            return Err(cli_error(&out, |msg| {
                SandboxError::Backend(format!("writing {path} into {handle}: {msg}"))
            }));
        }
        Ok(())
    }

    async fn exec(&self, handle: &BackendHandle, argv: &[&str]) -> Result<ExecOutput, SandboxError> {
        let mut args = vec!["exec".to_string(), handle.to_string()];
        args.extend(argv.iter().map(|a| (*a).to_string()));
        let out = self.docker(&args, None).await?;
        // a script can print the same text, so ask the daemon directly
        if failed(&out) && daemon_down(&out.stderr) {
            self.ping().await?;
        }
        Ok(out)
    }

    async fn remove(&self, handle: &BackendHandle) -> Result<(), SandboxError> {
        let args = vec!["rm".to_string(), "-f".to_string(), handle.to_string()];
        let out = self.docker(&args, None).await?;
        if failed(&out) {
            return Err(cli_error(&out, SandboxError::Backend));
        }
        Ok(())
    }
}
