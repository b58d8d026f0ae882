// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use tokio::process::Command;

use crate::{Result, SysError};

pub(crate) fn render(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Run a command and capture stdout, failing on a non-zero exit status.
pub(crate) async fn run_capture(program: &str, args: &[&str], limit: Duration) -> Result<String> {
    let rendered = render(program, args);
    tracing::trace!("exec: {}", rendered);

    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);

    let output = match tokio::time::timeout(limit, command.output()).await {
        Ok(output) => output?,
        Err(_) => {
            return Err(SysError::Timeout {
                command: rendered,
                seconds: limit.as_secs(),
            });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(SysError::CommandFailed {
            command: rendered,
            stderr,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
