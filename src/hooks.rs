use tokio::process::Command;
use tokio::task::JoinHandle;

/// Run a user command (`sh -c`) in the background. Failures are logged only.
///
/// `env` is passed to the command as extra environment variables so a
/// script can tell what happened (e.g. `MOTIONCAM_EVENT`).
pub fn run_hook(label: &str, command: &str, env: Vec<(&'static str, String)>) -> JoinHandle<()> {
    let label = label.to_owned();
    let command = command.to_owned();

    tokio::task::spawn(async move {
        tracing::debug!("[{}] Running hook: {}", label, command);

        match Command::new("sh")
            .arg("-c")
            .arg(&command)
            .envs(env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => match child.wait_with_output().await {
                Ok(output) => {
                    if !output.status.success() {
                        let stderr = String::from_utf8_lossy(&output.stderr);
                        tracing::warn!(
                            "[{}] Hook exited with {}: {}",
                            label,
                            output.status,
                            stderr.trim()
                        );
                    }
                }
                Err(e) => tracing::warn!("[{}] Failed to wait on hook: {}", label, e),
            },
            Err(e) => tracing::warn!("[{}] Failed to spawn hook: {}", label, e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hook_sees_event_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("event.txt");
        let command = format!("printf '%s' \"$MOTIONCAM_EVENT\" > '{}'", out.display());

        run_hook(
            "test",
            &command,
            vec![("MOTIONCAM_EVENT", "recording_start".to_string())],
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "recording_start");
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_propagate() {
        run_hook("test", "exit 3", Vec::new()).await.unwrap();
    }
}
