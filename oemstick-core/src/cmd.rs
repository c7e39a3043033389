//! Thin wrappers around the external partitioning and formatting tools.

use std::process::{Command, Stdio};

use crate::error::{Error, Result};

/// Fails with [`Error::MissingTool`] unless `tool` is an executable file
/// somewhere in `PATH`.
pub(crate) fn require(tool: &'static str) -> Result<()> {
    let found = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(tool).is_file()))
        .unwrap_or(false);

    if found {
        Ok(())
    } else {
        Err(Error::MissingTool(tool))
    }
}

/// Runs `tool` with `args`, discarding stdout. Non-zero exit is an error.
pub(crate) fn run(tool: &'static str, args: &[&str]) -> Result<()> {
    tracing::debug!(tool, ?args, "running external tool");
    let status = Command::new(tool)
        .args(args)
        .stdout(Stdio::null())
        .status()
        .map_err(|e| Error::Tool {
            tool,
            message: e.to_string(),
        })?;

    if !status.success() {
        return Err(Error::Tool {
            tool,
            message: format!("exited with {status}"),
        });
    }
    Ok(())
}

/// Runs `tool` with `args` and captures stdout as UTF-8 (lossy).
pub(crate) fn output(tool: &'static str, args: &[&str]) -> Result<String> {
    tracing::debug!(tool, ?args, "running external tool (captured)");
    let out = Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| Error::Tool {
            tool,
            message: e.to_string(),
        })?;

    if !out.status.success() {
        return Err(Error::Tool {
            tool,
            message: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tool_is_reported_by_name() {
        let err = require("definitely-not-a-real-tool-4a1f").unwrap_err();
        match err {
            Error::MissingTool(name) => assert_eq!(name, "definitely-not-a-real-tool-4a1f"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
