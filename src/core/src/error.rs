use thiserror::Error;

/// Kiln error types.
///
/// Message text is part of the builder's compatibility surface: clients
/// match on substrings of these messages, so the formats here are stable.
#[derive(Error, Debug)]
pub enum KilnError {
    /// Bad build input: missing/oversized Dockerfile, unknown instruction,
    /// invalid argument counts, malformed options.
    #[error("{0}")]
    Input(String),

    /// A computed path would escape the build context or container root.
    #[error("Forbidden path outside the build context: {requested} ({resolved})")]
    ForbiddenPath { requested: String, resolved: String },

    /// Missing source file for ADD/COPY.
    #[error("stat {0}: no such file or directory")]
    NotFound(String),

    /// Unsupported modifier or malformed `${...}` substitution.
    #[error("bad substitution: {0}")]
    BadSubstitution(String),

    /// A CLI-supplied build-arg was never declared by an ARG instruction.
    #[error("One or more build-args were not consumed: [{0}]")]
    UnconsumedBuildArg(String),

    /// A `run` task reported a non-zero exit code.
    #[error("The command '{command}' returned a non-zero code: {code}")]
    ExecFailure { command: String, code: i32 },

    /// A host task callback reported an error.
    #[error("{0}")]
    TaskFailure(String),

    /// Recognized but unimplemented functionality (e.g. remote ADD).
    #[error("{0}")]
    NotImplemented(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}

/// Result type alias for kiln operations
pub type Result<T> = std::result::Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_path_message() {
        let err = KilnError::ForbiddenPath {
            requested: "../../etc/passwd".to_string(),
            resolved: "/etc/passwd".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Forbidden path outside the build context: ../../etc/passwd (/etc/passwd)"
        );
    }

    #[test]
    fn test_not_found_message() {
        let err = KilnError::NotFound("missing.txt".to_string());
        assert_eq!(err.to_string(), "stat missing.txt: no such file or directory");
    }

    #[test]
    fn test_exec_failure_message() {
        let err = KilnError::ExecFailure {
            command: "/hello how are you".to_string(),
            code: 2,
        };
        assert_eq!(
            err.to_string(),
            "The command '/hello how are you' returned a non-zero code: 2"
        );
    }

    #[test]
    fn test_unconsumed_build_arg_message() {
        let err = KilnError::UnconsumedBuildArg("foo, bar".to_string());
        assert!(err
            .to_string()
            .contains("One or more build-args were not consumed"));
    }
}
