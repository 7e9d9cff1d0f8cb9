use std::path::Path;
use tokio::process::Command;

/// Environment variable carrying the exported file's path
pub const FILE_ENV: &str = "GHOSTNOTE_FILE";

/// Run the post-export hook for `file` in the background. Failures are logged
/// and never reach the caller.
pub fn run_export_hook(command: &str, file: &Path) -> tokio::task::JoinHandle<()> {
    let command = command.to_owned();
    let file = file.to_owned();

    tokio::task::spawn(async move {
        tracing::info!("[export] Running hook for {:?}: {}", file, command);

        match Command::new("sh")
            .arg("-c")
            .arg(&command)
            .env(FILE_ENV, &file)
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
                            "[export] Hook exited with {}: {}",
                            output.status,
                            stderr.trim()
                        );
                    }
                }
                Err(e) => tracing::warn!("[export] Failed to wait on hook: {}", e),
            },
            Err(e) => tracing::warn!("[export] Failed to spawn hook: {}", e),
        }
    })
}
