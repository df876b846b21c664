use std::{process::Stdio, time::Duration};

use tokio::{io::AsyncWriteExt, process::Command, time::timeout};
use tracing::debug;

use crate::error::{ReconError, Result};

/// Captured result of one tool invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Substitute the shell-quoted target for every `{target}` placeholder.
pub fn render_command(template: &str, target: &str) -> Result<String> {
    let quoted = shlex::try_quote(target).map_err(|e| {
        ReconError::Execution(format!("cannot quote target {target:?}: {e}"))
    })?;
    Ok(template.replace("{target}", &quoted))
}

/// Run `command` through `shell -c`, optionally feeding `stdin`, and capture
/// both output streams. The child is killed if `limit` elapses.
pub async fn run_shell(
    shell: &str,
    command: &str,
    stdin: Option<String>,
    limit: Duration,
) -> Result<CommandOutput> {
    let mut child = Command::new(shell)
        .arg("-c")
        .arg(command)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            ReconError::Execution(format!("failed to spawn `{shell} -c`: {e}"))
        })?;

    // stdin is written while output is being collected.
    let writer = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => Some(tokio::spawn(async move {
            let result = pipe.write_all(input.as_bytes()).await;
            drop(pipe);
            result
        })),
        _ => None,
    };

    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| {
            ReconError::Execution(format!("failed to collect command output: {e}"))
        })?,
        Err(_) => {
            return Err(ReconError::Execution(format!(
                "command timed out after {}s",
                limit.as_secs()
            )));
        }
    };

    if let Some(writer) = writer
        && let Ok(Err(e)) = writer.await
    {
        // Tools are free to exit without reading their input.
        debug!(target: "scan::executor", error = %e, "stdin write did not complete");
    }

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_is_shell_quoted() {
        assert_eq!(
            render_command("subfinder -d {target} -silent", "example.com").unwrap(),
            "subfinder -d example.com -silent"
        );
        let rendered = render_command("echo {target}", "a.com; rm -rf /").unwrap();
        assert_eq!(
            shlex::split(&rendered).unwrap(),
            vec!["echo".to_string(), "a.com; rm -rf /".to_string()]
        );
        assert!(render_command("echo {target}", "nul\0byte").is_err());
    }

    #[tokio::test]
    async fn captures_streams_and_exit_code() {
        let output = run_shell(
            "/bin/sh",
            "echo out; echo err >&2; exit 3",
            None,
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
    }

    #[tokio::test]
    async fn pipes_stdin() {
        let output = run_shell(
            "/bin/sh",
            "tr a-z A-Z",
            Some("a.example.com\nb.example.com".into()),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(output.stdout, "A.EXAMPLE.COM\nB.EXAMPLE.COM");
    }

    #[tokio::test]
    async fn times_out() {
        let err = run_shell("/bin/sh", "sleep 5", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }
}
