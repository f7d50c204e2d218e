// PhotonDB - Query Execution Core
// Streaming operators over document values, with cumulative aggregation

#![warn(rust_2018_idioms)]

pub mod algebra;
pub mod config;
pub mod datastore;
pub mod execution;
pub mod metrics;
pub mod plan;
pub mod value;

// Re-exports for convenience
pub use config::ExecConfig;
pub use execution::{Context, Operator};
pub use value::{AnnotatedValue, Value, ValueType};

/// Query execution error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug, Clone, PartialEq)]
    pub enum Error {
        #[error("Error evaluating {context}: {cause}")]
        Evaluation { cause: String, context: String },

        #[error("Index scan error: {0}")]
        IndexScan(String),

        #[error("Assertion failure: {0}")]
        Assertion(String),

        #[error("Execution error: {0}")]
        Execution(String),

        #[error("Panic in operator {operator}: {message}")]
        Panic { operator: String, message: String },

        #[error("Field or index {0} is not updatable")]
        Unsettable(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    impl Error {
        pub fn evaluation(cause: impl ToString, context: impl Into<String>) -> Self {
            Error::Evaluation {
                cause: cause.to_string(),
                context: context.into(),
            }
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::error::Error;

    #[test]
    fn test_evaluation_error_display() {
        let err = Error::evaluation("No value for named parameter $x", "span");
        assert_eq!(
            err.to_string(),
            "Error evaluating span: No value for named parameter $x"
        );
    }
}
