use thiserror::Error;

/// Main error type for the EvoFlow system
#[derive(Error, Debug)]
pub enum EfError {
    #[error("Structure error: {0}")]
    Structure(#[from] StructureError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("HPO error: {0}")]
    Hpo(#[from] HpoError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Errors in the module tree or in the shape of a state snapshot
#[derive(Error, Debug)]
pub enum StructureError {
    #[error("Path not found in state: {path}")]
    PathNotFound { path: String },

    #[error("Attribute {name} not found at {path}")]
    AttributeNotFound { path: String, name: String },

    #[error("Local state has no attribute named {name}")]
    MissingAttribute { name: String },

    #[error("Duplicate child name {name} under {parent}")]
    DuplicateChild { parent: String, name: String },

    #[error("Duplicate attribute {name} in schema")]
    DuplicateAttribute { name: String },

    #[error("Invalid node name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("State at {path} does not match its schema (missing: {missing:?}, unexpected: {unexpected:?})")]
    SchemaMismatch {
        path: String,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("Cannot stack states: {message}")]
    StackMismatch { message: String },

    #[error("Cannot stack an empty list of states")]
    EmptyStack,

    #[error("State has no batch dimension to unstack")]
    NotBatched,

    #[error("Shape mismatch for {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Value {name} is not a {expected}")]
    ValueKind { name: String, expected: String },

    #[error("Invalid placement for {path}: {message}")]
    InvalidPlacement { path: String, message: String },
}

/// Step-protocol errors
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Workflow not initialized: {path}")]
    NotInitialized { path: String },

    #[error("Candidate batch rejected by problem input contract: {message}")]
    InputMismatch { message: String },

    #[error("Fitness shape {actual:?} does not match candidate batch of {expected_batch}")]
    FitnessShape {
        expected_batch: usize,
        actual: Vec<usize>,
    },

    #[error("Expected {expected} candidates, got {actual}")]
    CandidateKind { expected: String, actual: String },

    #[error("Component at {path} failed: {message}")]
    Component { path: String, message: String },

    #[error("No monitor named {name}")]
    MissingMonitor { name: String },

    #[error("Monitor at {path} does not expose a metric")]
    NoMetric { path: String },
}

/// Hyper-parameter optimization wrapper errors
#[derive(Error, Debug)]
pub enum HpoError {
    #[error("Parameter {path} has leading dimension {actual}, expected {expected} instances")]
    InstanceCountMismatch {
        path: String,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown hyper-parameter path: {path}")]
    UnknownParameter { path: String },

    #[error("Hyper-parameter {path} has shape {actual:?}, expected {expected:?}")]
    ParameterShape {
        path: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Invalid HPO configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Inner workflow must be initialized before wrapping")]
    WorkflowNotReady,
}

/// Result type alias for EvoFlow operations
pub type EfResult<T> = Result<T, EfError>;

/// Helper trait for converting string errors
pub trait IntoEfError {
    fn into_ef_error(self) -> EfError;
}

impl IntoEfError for String {
    fn into_ef_error(self) -> EfError {
        EfError::Internal(self)
    }
}

impl IntoEfError for &str {
    fn into_ef_error(self) -> EfError {
        EfError::Internal(self.to_string())
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::EfError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::EfError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::EfError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = HpoError::InstanceCountMismatch {
            path: "algorithm.w".to_string(),
            expected: 5,
            actual: 3,
        };

        assert!(error.to_string().contains("algorithm.w"));
        assert!(error.to_string().contains('5'));
        assert!(error.to_string().contains('3'));
    }

    #[test]
    fn test_error_conversion() {
        let structure_error = StructureError::PathNotFound {
            path: "monitor".to_string(),
        };
        let ef_error: EfError = structure_error.into();

        match ef_error {
            EfError::Structure(StructureError::PathNotFound { path }) => assert_eq!(path, "monitor"),
            _ => panic!("Expected Structure error"),
        }
    }

    #[test]
    fn test_shape_mismatch_lists_both_shapes() {
        let error = StructureError::ShapeMismatch {
            context: "algorithm.population".into(),
            expected: vec![10, 2],
            actual: vec![10, 3],
        };
        let text = error.to_string();
        assert!(text.contains("[10, 2]"));
        assert!(text.contains("[10, 3]"));
    }

    #[test]
    fn test_macros() {
        let _validation_err = validation_error!("Invalid value: {}", 42);
        let _internal_err = internal_error!("Something went wrong");
        let _config_err = config_error!("Missing required field: {}", "seed");
    }
}
