//! Spawning the helper program.
//!
//! Every lifecycle step is one short-lived helper process:
//! `<helper> <command>` with the request on stdin and the reply (if any) on
//! stdout. Stderr is inherited so helper diagnostics land in the agent log.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use excon_protocol::{HelperCommand, Reply, Request, codec};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::HelperConfig;
use crate::error::ContainerizerError;
use crate::race;
use crate::registry::Sandbox;

/// How a helper process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
    /// The process could not be reaped.
    Unknown,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Self::Unknown => f.write_str("exit status unknown"),
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled(signal);
            }
        }
        Self::Unknown
    }
}

/// A running helper process.
///
/// `output` resolves with everything the helper wrote to stdout once it
/// closes the stream; `status` resolves when the process exits. The two are
/// independent: a helper can exit while a forked child still holds stdout.
pub struct Invocation {
    pub command: HelperCommand,
    pub pid: Option<u32>,
    pub output: BoxFuture<'static, io::Result<Vec<u8>>>,
    pub status: BoxFuture<'static, ExitStatus>,
}

impl Invocation {
    /// Wait for a helper that replies with its exit status only.
    ///
    /// Resolves on exit. Stdout is drained in the background since whatever
    /// the helper left running (typically the executor) may hold it open.
    pub async fn finish(self) -> Result<(), ContainerizerError> {
        let command = self.command;
        let output = self.output;
        tokio::spawn(async move {
            if let Err(e) = output.await {
                tracing::debug!(%command, "Failed to drain helper stdout: {e}");
            }
        });

        let status = self.status.await;
        if status.success() {
            Ok(())
        } else {
            Err(ContainerizerError::HelperExitFailure { command, status })
        }
    }

    /// Wait for a helper that replies with a payload, racing the reply
    /// against the helper's own exit.
    pub async fn reply<M: Reply>(self) -> Result<M, ContainerizerError> {
        race::race(self.output, self.status)
            .await
            .settle::<M>(self.command)
            .await
    }
}

/// Starts helper processes.
///
/// The production implementation is [`SubprocessInvoker`]; tests drive the
/// containerizer with a scripted one.
pub trait Invoker: Send + Sync + 'static {
    fn invoke(
        &self,
        command: HelperCommand,
        sandbox: &Sandbox,
        input: Vec<u8>,
        env: &BTreeMap<String, String>,
    ) -> Result<Invocation, ContainerizerError>;

    /// Forcibly stop a running helper and everything it spawned.
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// Encode `request` and hand it to the helper sub-command it belongs to.
pub fn call<R: Request>(
    invoker: &dyn Invoker,
    sandbox: &Sandbox,
    request: &R,
    env: &BTreeMap<String, String>,
) -> Result<Invocation, ContainerizerError> {
    let input = codec::encode(request)?;
    tracing::debug!(
        command = %R::COMMAND,
        container_id = %request.container_id(),
        directory = %sandbox.directory.display(),
        "Invoking helper"
    );
    invoker.invoke(R::COMMAND, sandbox, input, env)
}

/// Runs the helper as a tokio child process.
///
/// Each helper is placed in its own process group so [`Invoker::terminate`]
/// reaches whatever it forked.
pub struct SubprocessInvoker {
    helper: PathBuf,
    env: BTreeMap<String, String>,
}

impl SubprocessInvoker {
    pub fn new(helper: impl Into<PathBuf>) -> Self {
        Self {
            helper: helper.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &HelperConfig) -> Self {
        let mut env = config.env.clone();
        if let Some(image) = &config.default_container_image {
            env.insert("EXCON_DEFAULT_CONTAINER_IMAGE".into(), image.clone());
        }
        Self {
            helper: config.path.clone(),
            env,
        }
    }
}

impl Invoker for SubprocessInvoker {
    fn invoke(
        &self,
        command: HelperCommand,
        sandbox: &Sandbox,
        input: Vec<u8>,
        env: &BTreeMap<String, String>,
    ) -> Result<Invocation, ContainerizerError> {
        let spawn_failure = |reason: String| ContainerizerError::SpawnFailure { command, reason };

        let mut cmd = tokio::process::Command::new(&self.helper);
        cmd.arg(command.as_str())
            .current_dir(&sandbox.directory)
            .envs(&self.env)
            .envs(env)
            .env("EXCON_HELPER_COMMAND", command.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        #[cfg(unix)]
        {
            cmd.process_group(0);
            if let Some(user) = &sandbox.user {
                let (uid, gid) = lookup_user(user).map_err(spawn_failure)?;
                cmd.uid(uid).gid(gid);
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            spawn_failure(format!("{}: {e}", self.helper.display()))
        })?;
        let pid = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                // A helper is free to exit without reading its request.
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!(%command, "Failed to write helper request: {e}");
                }
            });
        }

        let stdout = child.stdout.take();
        let output = async move {
            let mut buf = Vec::new();
            if let Some(mut stdout) = stdout {
                stdout.read_to_end(&mut buf).await?;
            }
            Ok::<_, io::Error>(buf)
        }
        .boxed();

        let status = async move {
            match child.wait().await {
                Ok(status) => ExitStatus::from(status),
                Err(e) => {
                    tracing::warn!(%command, "Failed to reap helper: {e}");
                    ExitStatus::Unknown
                }
            }
        }
        .boxed();

        Ok(Invocation {
            command,
            pid,
            output,
            status,
        })
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> io::Result<()> {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let pid = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        killpg(Pid::from_raw(pid), Signal::SIGKILL).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&self, _pid: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "terminating helpers requires process groups",
        ))
    }
}

/// Whether a [`Invoker::terminate`] error means the helper was already gone.
pub(crate) fn already_exited(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(nix::errno::Errno::ESRCH as i32)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

#[cfg(unix)]
fn lookup_user(name: &str) -> Result<(u32, u32), String> {
    match nix::unistd::User::from_name(name) {
        Ok(Some(user)) => Ok((user.uid.as_raw(), user.gid.as_raw())),
        Ok(None) => Err(format!("no such user: {name}")),
        Err(e) => Err(format!("failed to look up user {name}: {e}")),
    }
}
