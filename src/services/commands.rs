use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, error};

/// Run an external command to completion and return its stdout.
///
/// Success is judged solely by the exit status; on failure the error
/// carries stderr when present, stdout otherwise.
pub async fn run(program: &str, args: &[&str]) -> Result<String> {
    debug!("Executing command: {} {}", program, args.join(" "));

    let output = AsyncCommand::new(program).args(args).output().await?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if output.status.success() {
        Ok(stdout)
    } else {
        let error_msg = if !stderr.is_empty() { stderr } else { stdout };
        Err(anyhow!(
            "Command '{} {}' failed: {}",
            program,
            args.join(" "),
            error_msg.trim()
        ))
    }
}

/// Run an external command under a deadline.
///
/// The child is spawned with `kill_on_drop`, so an expired deadline
/// force-kills it instead of leaving a stuck process behind. The transfer
/// commands we bound this way are not cooperatively cancellable.
pub async fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> Result<String> {
    debug!(
        "Executing command with {}s budget: {} {}",
        timeout.as_secs(),
        program,
        args.join(" ")
    );

    let mut command = AsyncCommand::new(program);
    command.args(args).kill_on_drop(true);

    // Dropping the output future on deadline expiry kills the child via
    // kill_on_drop.
    match tokio::time::timeout(timeout, command.output()).await {
        Ok(output) => {
            let output = output?;
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if output.status.success() {
                Ok(stdout)
            } else {
                let error_msg = if !stderr.is_empty() { stderr } else { stdout };
                Err(anyhow!(
                    "Command '{} {}' failed: {}",
                    program,
                    args.join(" "),
                    error_msg.trim()
                ))
            }
        }
        Err(_) => {
            error!(
                "Command '{} {}' exceeded its {}s budget and was killed",
                program,
                args.join(" "),
                timeout.as_secs()
            );
            Err(anyhow!(
                "Timed out after {}s: {} {}",
                timeout.as_secs(),
                program,
                args.join(" ")
            ))
        }
    }
}
