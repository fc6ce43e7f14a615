//! External tool invocation.

use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

/// Run `program` with `args` and extra environment, returning stdout.
///
/// A non-zero exit status becomes [`Error::Command`] carrying stderr.
pub async fn run_command(program: &str, args: &[&str], env: &[(&str, &str)]) -> Result<String> {
    let line = render(program, args);
    debug!(command = %line, "Running command");

    let output = Command::new(program)
        .args(args)
        .envs(env.iter().copied())
        .output()
        .await
        .map_err(|e| Error::command(&line, format!("failed to spawn: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::command(
            line,
            format!("exit status {}: {}", output.status, stderr.trim()),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Shell-ish rendering of a command line for logs and errors
pub fn render(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}
