use std::io::{self, Write};
use std::process::{Command, Stdio};
use std::thread;

use thiserror::Error;

/// Errors from running an external program.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Couldn't start '{program}': {source}")]
    Spawn { program: String, source: io::Error },

    #[error("'{program}' exited with {status}:\n{stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Runs `program` with `args` and returns stdout. When `stdin` is given it
/// is fed to the child from a separate thread while the output is drained.
pub(crate) fn run_tool(program: &str, args: &[String], stdin: Option<&[u8]>) -> Result<Vec<u8>, ToolError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ToolError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let pipe = child.stdin.take();

    let (output, written) = thread::scope(|scope| {
        let writer = stdin
            .zip(pipe)
            .map(|(input, mut pipe)| scope.spawn(move || pipe.write_all(input)));

        let output = child.wait_with_output();
        let written = match writer {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked"))),
            None => Ok(()),
        };

        (output, written)
    });

    let output = output?;

    if !output.status.success() {
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if stderr.trim().is_empty() {
            stderr = String::from_utf8_lossy(&output.stdout).into_owned();
        }

        return Err(ToolError::Failed {
            program: program.to_string(),
            status: output.status,
            stderr,
        });
    }

    written?;
    Ok(output.stdout)
}
