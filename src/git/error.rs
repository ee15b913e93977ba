//! Git error types.

use std::fmt;

/// Failure of a git invocation or of parsing its output.
///
/// Every mutating adapter call surfaces the failed command line and git's
/// stderr verbatim; the engine layers classification and hints on top.
#[derive(Debug)]
pub enum GitError {
    /// Git exited non-zero.
    CommandFailed { command: String, stderr: String },
    /// Git could not be spawned or its output could not be read.
    Io {
        command: String,
        source: std::io::Error,
    },
    /// Git output did not have the expected shape.
    ParseError(String),
}

impl GitError {
    /// The failed command line, when one exists.
    pub fn command(&self) -> Option<&str> {
        match self {
            GitError::CommandFailed { command, .. } | GitError::Io { command, .. } => {
                Some(command)
            }
            GitError::ParseError(_) => None,
        }
    }

    /// Raw stderr of the failed command, when one exists.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            GitError::CommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

impl fmt::Display for GitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitError::CommandFailed { command, stderr } => {
                if stderr.is_empty() {
                    write!(f, "{command} failed")
                } else {
                    write!(f, "{command} failed: {stderr}")
                }
            }
            GitError::Io { command, source } => {
                write!(f, "failed to execute {command}: {source}")
            }
            GitError::ParseError(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for GitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GitError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_command_and_stderr() {
        let err = GitError::CommandFailed {
            command: "git push origin main".to_string(),
            stderr: "! [rejected] (non-fast-forward)".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("git push origin main"));
        assert!(msg.contains("non-fast-forward"));
        assert_eq!(err.stderr(), Some("! [rejected] (non-fast-forward)"));
    }

    #[test]
    fn parse_error_has_no_command() {
        let err = GitError::ParseError("worktree block must open with a path".to_string());
        assert!(err.command().is_none());
    }
}
