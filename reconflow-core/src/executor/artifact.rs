use std::path::{Path, PathBuf};

use tokio::fs;

use super::command::CommandOutput;
use crate::{error::Result, tasks::TaskId};

pub fn artifact_path(dir: &Path, task_id: TaskId) -> PathBuf {
    dir.join(format!("task_{task_id}.log"))
}

/// Write the per-task artifact: the command line, then stdout, then stderr.
pub async fn write_artifact(
    dir: &Path,
    task_id: TaskId,
    command: &str,
    output: &CommandOutput,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).await?;
    let path = artifact_path(dir, task_id);
    let exit = output
        .exit_code
        .map_or_else(|| "signal".to_owned(), |code| code.to_string());
    let body = format!(
        "$ {command}\n# exit: {exit}\n\n=== stdout ===\n{}\n=== stderr ===\n{}\n",
        output.stdout, output.stderr
    );
    fs::write(&path, body).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn artifact_holds_command_then_streams() {
        let dir = tempfile::tempdir().unwrap();
        let output = CommandOutput {
            exit_code: Some(0),
            stdout: "sub.example.com".into(),
            stderr: "[INF] done".into(),
        };
        let path = write_artifact(
            &dir.path().join("nested"),
            TaskId(7),
            "subfinder -d example.com",
            &output,
        )
        .await
        .unwrap();

        assert!(path.ends_with("nested/task_7.log"));
        let text = std::fs::read_to_string(&path).unwrap();
        let cmd = text.find("$ subfinder -d example.com").unwrap();
        let out = text.find("sub.example.com\n=== stderr").unwrap();
        let err = text.find("[INF] done").unwrap();
        assert!(cmd < out && out < err);
    }
}
