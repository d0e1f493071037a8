//! Host command execution.

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};

/// Concatenate stdout and stderr the way a terminal would show them.
fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(stderr));
    combined
}

/// Run `args[0]` with the remaining arguments and return the combined output.
///
/// No shell is involved and no argument is re-split or escaped. The call
/// waits for the command to exit; there is no timeout at this layer.
pub async fn run_command(args: &[String]) -> Result<String> {
    let (program, rest) = args.split_first().ok_or(RelayError::EmptyCommand)?;

    debug!(program = %program, args = ?rest, "Executing command");

    let output = Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| RelayError::Spawn {
            program: program.clone(),
            source,
        })?;

    let combined = combine_output(&output.stdout, &output.stderr);

    if !output.status.success() {
        warn!(
            program = %program,
            status = %output.status,
            output = %combined.trim_end(),
            "Command exited unsuccessfully"
        );
        return Err(RelayError::CommandFailed {
            program: program.clone(),
            status: output.status,
            output: combined,
        });
    }

    debug!(program = %program, bytes = combined.len(), "Command completed");
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_combine_output_order() {
        assert_eq!(combine_output(b"out\n", b"err\n"), "out\nerr\n");
        assert_eq!(combine_output(b"", b""), "");
    }

    #[tokio::test]
    async fn test_run_command_success() {
        let output = run_command(&argv(&["echo", "hello"])).await.unwrap();
        assert_eq!(output, "hello\n");
    }

    #[tokio::test]
    async fn test_run_command_passes_arguments_untouched() {
        // A single argument containing spaces must not be split
        let output = run_command(&argv(&["printf", "%s|", "a b", "c"]))
            .await
            .unwrap();
        assert_eq!(output, "a b|c|");
    }

    #[tokio::test]
    async fn test_run_command_empty() {
        let err = run_command(&[]).await.unwrap_err();
        assert!(matches!(err, RelayError::EmptyCommand));
    }

    #[tokio::test]
    async fn test_run_command_missing_program() {
        let err = run_command(&argv(&["/nonexistent/iscsiadm", "-m", "session"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_run_command_failure_keeps_output() {
        let err = run_command(&argv(&["sh", "-c", "echo out; echo already present >&2; exit 15"]))
            .await
            .unwrap_err();

        match err {
            RelayError::CommandFailed {
                program,
                status,
                output,
            } => {
                assert_eq!(program, "sh");
                assert_eq!(status.code(), Some(15));
                assert!(output.contains("out"));
                assert!(output.contains("already present"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
