use thiserror::Error;

/// Failures raised while scanning inputs or rewriting a target class.
///
/// Every variant is local to one class or one rule: callers log it and keep
/// going with the remaining classes and rules.
#[derive(Debug, Error)]
pub(crate) enum AutoRegisterError {
    #[error("malformed class file {origin}: {reason}")]
    MalformedClass { origin: String, reason: String },
    #[error("target class {class} not found in any input root")]
    TargetClassNotFound { class: String },
    #[error("method {method} not found in target class {class}")]
    TargetMethodNotFound { class: String, method: String },
    #[error("failed to extract {class} from {location}: {reason}")]
    ClassExtraction {
        class: String,
        location: String,
        reason: String,
    },
    #[error("cannot call register method {method} on {class}: {reason}")]
    RegisterMethod {
        class: String,
        method: String,
        reason: String,
    },
    #[error("failed to rewrite {class}: {reason}")]
    Rewrite { class: String, reason: String },
}

impl AutoRegisterError {
    /// Short machine-readable kind used in reports.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            AutoRegisterError::MalformedClass { .. } => "malformedClass",
            AutoRegisterError::TargetClassNotFound { .. } => "targetClassNotFound",
            AutoRegisterError::TargetMethodNotFound { .. } => "targetMethodNotFound",
            AutoRegisterError::ClassExtraction { .. } => "classExtraction",
            AutoRegisterError::RegisterMethod { .. } => "registerMethod",
            AutoRegisterError::Rewrite { .. } => "rewrite",
        }
    }

    pub(crate) fn rewrite(class: &str, err: anyhow::Error) -> Self {
        AutoRegisterError::Rewrite {
            class: class.to_string(),
            reason: format!("{err:#}"),
        }
    }
}
