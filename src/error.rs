//! Error types for the i8c middle end

use crate::compiler::ir::Location;
use thiserror::Error;

/// Compilation errors raised while building, verifying and optimizing a
/// function. Every variant is fatal for the function being compiled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // Control flow errors
    /// A jump names a label that was never defined
    ///
    /// **Triggered by:** `goto missing` with no `missing:` marker, or a marker
    /// for a label that is not in the function's declared label set
    #[error("{location}: undefined label '{label}'")]
    UndefinedLabel {
        /// Label name
        label: String,
        /// Location of the referencing operation
        location: Location,
    },

    /// The same label marker appears twice in one function
    #[error("{location}: redefined label '{label}'")]
    RedefinedLabel {
        /// Label name
        label: String,
        /// Location of the second marker
        location: Location,
    },

    // Stack errors
    /// An operation needs more slots than the abstract stack holds
    ///
    /// **Triggered by:** `add` on a stack of depth 1, `return` with fewer
    /// slots than declared return types
    #[error("{location}: stack underflow in '{verb}' (needs {required} slots)\n{stack}")]
    StackUnderflow {
        /// Operation verb
        verb: String,
        /// Number of slots the operation needs
        required: usize,
        /// Location of the operation
        location: Location,
        /// Stack dump before the operation ran
        stack: String,
    },

    /// Operand types do not satisfy an operation's typing rule
    ///
    /// **Triggered by:** `mul` on a pointer, `call` on a non-function slot,
    /// `return` with the wrong result types
    #[error("{location}: type mismatch in '{verb}': expected {expected}, got {found}\n{stack}")]
    StackTypeMismatch {
        /// Operation verb
        verb: String,
        /// Expected type(s)
        expected: String,
        /// Actual type(s)
        found: String,
        /// Location of the operation
        location: Location,
        /// Stack dump before the operation ran
        stack: String,
    },

    /// Two stacks arriving at the same block cannot be merged
    ///
    /// `slot` is `None` when the depths differ.
    #[error("{location}: cannot merge stacks at {}\n{stack}", merge_site(.slot))]
    StackMergeMismatch {
        /// Offending slot index (0 = top), `None` for a depth mismatch
        slot: Option<usize>,
        /// Location of the jump that published the incoming stack
        location: Location,
        /// Dump of the stored and the incoming stack
        stack: String,
    },

    // Cast errors
    /// Cast to a type with the same basetype
    #[error("{location}: unnecessary cast from {from} to {to}\n{stack}")]
    UnnecessaryCast {
        /// Current slot type
        from: String,
        /// Requested type
        to: String,
        /// Location of the cast
        location: Location,
        /// Stack dump before the cast
        stack: String,
    },

    /// Cast from or to a non-computable type
    #[error("{location}: invalid cast from {from} to {to}\n{stack}")]
    InvalidCast {
        /// Current slot type
        from: String,
        /// Requested type
        to: String,
        /// Location of the cast
        location: Location,
        /// Stack dump before the cast
        stack: String,
    },

    // Name errors
    /// No slot (or type) carries the requested name
    #[error("{location}: undefined name '{name}'\n{stack}")]
    UndefinedName {
        /// Requested name
        name: String,
        /// Location of the referencing operation
        location: Location,
        /// Stack dump at the reference
        stack: String,
    },

    /// A name (or type name) is already bound elsewhere
    #[error("{location}: redefined name '{name}'\n{stack}")]
    RedefinedName {
        /// Name being redefined
        name: String,
        /// Location of the redefinition
        location: Location,
        /// Stack dump at the redefinition
        stack: String,
    },

    /// A name search matched several slots
    #[error("{location}: ambiguous name '{name}' matches slots {slots:?}\n{stack}")]
    AmbiguousName {
        /// Requested name
        name: String,
        /// Matching slot indices
        slots: Vec<usize>,
        /// Location of the referencing operation
        location: Location,
        /// Stack dump at the reference
        stack: String,
    },

    /// A cached `load` resolution changed on a later walk of the block
    #[error("{location}: name '{name}' resolved to slot {previous} before, now slot {current}\n{stack}")]
    InconsistentName {
        /// Requested name
        name: String,
        /// Slot index cached on the first walk
        previous: usize,
        /// Slot index found on this walk
        current: usize,
        /// Location of the load
        location: Location,
        /// Stack dump at the load
        stack: String,
    },

    // Resource errors
    /// Verification did not converge within the configured walk budget
    #[error("verification of '{function}' exceeded {limit} block walks")]
    FixpointLimit {
        /// Function name
        function: String,
        /// Configured maximum number of block walks
        limit: usize,
    },

    // Interchange errors
    /// Malformed JSON handed over by the front end
    #[error("serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
    },

    /// Error raised while compiling a specific function of a module
    #[error("in function '{function}': {source}")]
    InFunction {
        /// Function name
        function: String,
        /// Underlying error
        source: Box<Error>,
    },
}

fn merge_site(slot: &Option<usize>) -> String {
    match slot {
        Some(slot) => format!("slot {}", slot),
        None => "depth mismatch".to_string(),
    }
}

/// Error severity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Fatal error, compilation of the function stops
    Fatal,
    /// Warning that doesn't prevent compilation
    Warning,
}

impl Error {
    /// Classify error severity
    pub fn classify(&self) -> ErrorSeverity {
        match self {
            Error::InFunction { source, .. } => source.classify(),
            _ => ErrorSeverity::Fatal,
        }
    }

    /// Location of the operation that caused the error, if any
    pub fn location(&self) -> Option<Location> {
        match self {
            Error::UndefinedLabel { location, .. }
            | Error::RedefinedLabel { location, .. }
            | Error::StackUnderflow { location, .. }
            | Error::StackTypeMismatch { location, .. }
            | Error::StackMergeMismatch { location, .. }
            | Error::UnnecessaryCast { location, .. }
            | Error::InvalidCast { location, .. }
            | Error::UndefinedName { location, .. }
            | Error::RedefinedName { location, .. }
            | Error::AmbiguousName { location, .. }
            | Error::InconsistentName { location, .. } => Some(*location),
            Error::FixpointLimit { .. } | Error::Serialization { .. } => None,
            Error::InFunction { source, .. } => source.location(),
        }
    }

    /// Attach the name of the function being compiled
    pub fn in_function(self, function: impl Into<String>) -> Self {
        Error::InFunction {
            function: function.into(),
            source: Box::new(self),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type for i8c operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_mismatch_message() {
        let err = Error::StackMergeMismatch {
            slot: None,
            location: Location::new(3, 1),
            stack: String::new(),
        };
        assert!(err.to_string().contains("depth mismatch"));

        let err = Error::StackMergeMismatch {
            slot: Some(2),
            location: Location::new(3, 1),
            stack: String::new(),
        };
        assert!(err.to_string().contains("slot 2"));
    }

    #[test]
    fn test_in_function_keeps_location() {
        let err = Error::UndefinedLabel {
            label: "done".into(),
            location: Location::new(7, 5),
        }
        .in_function("main");
        assert_eq!(err.location(), Some(Location::new(7, 5)));
        assert_eq!(err.classify(), ErrorSeverity::Fatal);
        assert!(err.to_string().starts_with("in function 'main'"));
    }
}
