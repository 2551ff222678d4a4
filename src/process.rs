/// Child process lifecycle: spawn the supervised command, then wait for it to
/// exit while listening for shutdown signals, and turn the result into the
/// supervisor's own exit code.
use crate::signals::is_termination;
use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// What to run under supervision.
#[derive(Debug, Clone, Default)]
pub struct ChildCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Added on top of the supervisor's own environment.
    pub env: Vec<(String, String)>,
}

impl ChildCommand {
    /// Split `argv` into program and arguments. Returns `None` when empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: Vec::new(),
        })
    }
}

/// Errors that can occur while starting the child.
#[derive(Debug)]
pub enum ProcessError {
    /// Failed to spawn the subprocess.
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Spawn { program, source } => {
                write!(f, "failed to start subprocess {:?}: {}", program, source)
            }
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Spawn { source, .. } => Some(source),
        }
    }
}

/// Spawn the child with inherited stdio.
///
/// The child shares the supervisor's stdout and stderr and inherits its
/// environment, extended by `command.env`.
pub fn spawn_child(command: &ChildCommand) -> Result<Child, ProcessError> {
    tracing::info!(
        program = %command.program,
        args = ?command.args,
        "starting subprocess"
    );

    let child = Command::new(&command.program)
        .args(&command.args)
        .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| ProcessError::Spawn {
            program: command.program.clone(),
            source: e,
        })?;

    tracing::info!(pid = child.id().unwrap_or(0), "started subprocess");
    Ok(child)
}

/// Wait until the child exits or a termination signal arrives.
///
/// A natural exit yields the child's exit code (0 when it was killed by a
/// signal or the wait failed). SIGTERM or SIGQUIT on `shutdown` kills the
/// child and yields 0. Any other signal is logged and the wait continues.
pub async fn wait_child(child: &mut Child, shutdown: &mut mpsc::Receiver<Signal>) -> i32 {
    loop {
        tokio::select! {
            result = child.wait() => {
                return match result {
                    Ok(status) => exit_code(status),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to wait for subprocess");
                        0
                    }
                };
            }
            Some(sig) = shutdown.recv() => {
                if !is_termination(sig) {
                    tracing::info!(signal = %sig, "ignoring signal");
                    continue;
                }
                tracing::info!(signal = %sig, "shutdown requested, killing subprocess");
                if let Err(e) = child.kill().await {
                    tracing::error!(error = %e, "failed to kill subprocess");
                }
                return 0;
            }
        }
    }
}

/// Map an exit status to the supervisor's exit code.
fn exit_code(status: ExitStatus) -> i32 {
    if status.success() {
        tracing::info!("subprocess exited successfully");
        return 0;
    }
    match status.code() {
        Some(code) => {
            tracing::info!(exit_code = code, "subprocess exited");
            code
        }
        None => {
            tracing::warn!(signal = ?status.signal(), "subprocess terminated without exit code");
            0
        }
    }
}
