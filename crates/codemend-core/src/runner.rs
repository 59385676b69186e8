use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Captured output of a finished external command.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes external commands with a controlled environment.
///
/// Knows nothing about git or lint semantics. Every invocation is bounded
/// by the configured timeout so a hung tool cannot stall a sweep.
#[derive(Debug, Clone)]
pub struct Runner {
    timeout: Duration,
}

impl Runner {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Run a command, failing with [`Error::Command`] on a non-zero exit.
    pub async fn run(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
        interpreter: Option<&Path>,
    ) -> Result<ToolOutput> {
        let (output, status) = self.run_unchecked(program, args, cwd, interpreter).await?;
        if status != 0 {
            return Err(Error::Command {
                program: program.to_string(),
                status,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Run a command and return its output and exit status without treating
    /// a non-zero exit as an error. Spawn failures and timeouts still fail.
    pub async fn run_unchecked(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
        interpreter: Option<&Path>,
    ) -> Result<(ToolOutput, i32)> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        shape_env(&mut cmd, interpreter);
        cmd.kill_on_drop(true);

        debug!("running {program} {}", args.join(" "));

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                program: program.to_string(),
                secs: self.timeout.as_secs(),
            })??;

        Ok((
            ToolOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            output.status.code().unwrap_or(1),
        ))
    }

    /// Resolve an executable's absolute path, trying `command -v` first and
    /// `whereis` second. `None` means the tool is unavailable on this host;
    /// callers must abort, not retry.
    pub async fn find_executable(&self, name: &str) -> Option<PathBuf> {
        if let Ok(out) = self
            .run("sh", &["-c", &format!("command -v {name}")], None, None)
            .await
        {
            let path = out.stdout.trim();
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }

        if let Ok(out) = self
            .run("sh", &["-c", &format!("whereis {name}")], None, None)
            .await
        {
            if let Some((_, rest)) = out.stdout.split_once(':') {
                if let Some(first) = rest.split_whitespace().next() {
                    return Some(PathBuf::from(first));
                }
            }
        }

        None
    }
}

/// Shape the process environment for machine-parseable output.
///
/// When an interpreter is given, point the environment at its installation
/// root (two levels above the binary) instead of sourcing any activation
/// script, so the tool resolves its own dependencies.
fn shape_env(cmd: &mut Command, interpreter: Option<&Path>) {
    cmd.env("NO_COLOR", "1");
    cmd.env("ANSIBLE_FORCE_COLOR", "0");
    // Never trip a leftover breakpoint() inside an invoked tool.
    cmd.env("PYTHONBREAKPOINT", "0");

    if let Some(interpreter) = interpreter {
        let root = interpreter
            .parent()
            .and_then(Path::parent)
            .unwrap_or(interpreter);
        let bin = root.join("bin");
        let path = std::env::var("PATH").unwrap_or_default();
        cmd.env("VIRTUAL_ENV", root);
        cmd.env("PATH", format!("{}:{path}", bin.display()));
        cmd.env_remove("PYTHONHOME");
    }
}
