/// Sandbox error types and handling utilities

/// Main error type for sandbox operations
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Invalid policy or workload configuration (e.g. an overridden reserved run option)
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
    /// Image or user that could not be found anywhere
    #[error("Resource not found: {resource}{}", available_hint(.available))]
    ResourceNotFound {
        resource: String,
        available: Vec<String>,
    },
    /// Execution context could not be created
    #[error("Startup error in {stage}: {reason}")]
    Startup { stage: String, reason: String },
    /// A single workload could not be resolved or submitted
    #[error("Injection failed for workload {workload}: {reason}")]
    Injection { workload: String, reason: String },
    /// Releasing the execution context failed
    #[error("Shutdown error for {context}: {reason}")]
    Shutdown { context: String, reason: String },
    /// Adapter call failed before it was attributed to a lifecycle stage
    #[error("Runtime error in {operation}: {reason}")]
    Runtime { operation: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapped anyhow error for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

fn available_hint(available: &[String]) -> String {
    if available.is_empty() {
        String::new()
    } else {
        format!(" (available: {})", available.join(", "))
    }
}

impl SandboxError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        SandboxError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn runtime(operation: impl Into<String>, reason: impl ToString) -> Self {
        SandboxError::Runtime {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Re-attributes an adapter failure to the startup stage it happened in.
    /// Errors that already carry a precise kind are kept as they are.
    pub fn into_startup(self, stage: &str) -> Self {
        match self {
            SandboxError::Runtime { operation, reason } => SandboxError::Startup {
                stage: stage.to_string(),
                reason: format!("{}: {}", operation, reason),
            },
            SandboxError::Io(e) => SandboxError::Startup {
                stage: stage.to_string(),
                reason: e.to_string(),
            },
            other => other,
        }
    }
}

/// Helper to determine if an error ends the current execute() attempt
pub fn is_fatal(err: &SandboxError) -> bool {
    match err {
        SandboxError::Configuration { .. } => true,
        SandboxError::ResourceNotFound { .. } => true,
        SandboxError::Startup { .. } => true,
        SandboxError::Injection { .. } => false,
        SandboxError::Shutdown { .. } => false,
        SandboxError::Runtime { .. } => true,
        SandboxError::Io(_) => true,
        SandboxError::Other(_) => true,
    }
}
