use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{PbrSyncError, Result};

/// Run `program` with `args`, killing it if it outlives `timeout`.
///
/// A non-zero exit status is not an error here; callers inspect it.
pub async fn run(program: &str, args: &[&str], timeout: Duration) -> Result<Output> {
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(PbrSyncError::Command(format!("{}: {}", program, e))),
        Err(_) => Err(PbrSyncError::Command(format!(
            "{} {} timed out after {:?}",
            program,
            args.join(" "),
            timeout
        ))),
    }
}

/// Trimmed stderr, falling back to stdout when stderr is empty.
pub fn error_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr
    }
}
