use std::fmt;
use std::io;

/// Convenience alias used across all quern crates.
pub type Result<T, E = QuernError> = std::result::Result<T, E>;

/// Error produced anywhere in the engine.
///
/// Variants are coarse categories; the payload carries the human-readable
/// detail. Callers are expected to match on the variant, not the message.
#[derive(Debug)]
pub enum QuernError {
    /// The plan handed to the executor is internally inconsistent, e.g. a
    /// combining split mode without a combine function.
    PlannerContract(String),

    /// An aggregate function could not be resolved from the catalog.
    CatalogMissing(String),

    /// The caller may not execute one of the component functions.
    Permission(String),

    /// An aggregate call's arguments contain another aggregate call.
    NestedAggregate(String),

    /// Incompatible types, e.g. a strict transition with a null initial
    /// value whose first input is not binary-compatible with the state.
    TypeMismatch(String),

    /// Reading or writing a temporary spill file failed.
    SpillIo {
        message: String,
        source: io::Error,
    },

    /// A spill batch file's read count does not match its write count.
    SpillCorruption(String),

    /// Another parallel worker signalled an error.
    ParallelPeerError(String),

    /// Cooperative cancellation was requested.
    Interrupted,

    /// Invariant breach inside the engine. Always a bug.
    Internal(String),
}

impl QuernError {
    pub fn internal(msg: impl Into<String>) -> Self {
        QuernError::Internal(msg.into())
    }

    pub fn spill_io(msg: impl Into<String>, source: io::Error) -> Self {
        QuernError::SpillIo {
            message: msg.into(),
            source,
        }
    }
}

impl fmt::Display for QuernError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlannerContract(msg) => write!(f, "Planner contract violation: {msg}"),
            Self::CatalogMissing(msg) => write!(f, "Missing catalog entry: {msg}"),
            Self::Permission(msg) => write!(f, "Permission denied: {msg}"),
            Self::NestedAggregate(msg) => write!(f, "Nested aggregate: {msg}"),
            Self::TypeMismatch(msg) => write!(f, "Type mismatch: {msg}"),
            Self::SpillIo { message, source } => write!(f, "Spill io: {message}: {source}"),
            Self::SpillCorruption(msg) => write!(f, "Spill corruption: {msg}"),
            Self::ParallelPeerError(msg) => write!(f, "Parallel peer error: {msg}"),
            Self::Interrupted => write!(f, "Interrupted"),
            Self::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for QuernError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SpillIo { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for QuernError {
    fn from(value: io::Error) -> Self {
        QuernError::SpillIo {
            message: "io".to_string(),
            source: value,
        }
    }
}

/// Helper for converting `Option` to `Result` with an internal error.
pub trait OptionExt<T> {
    /// Errors with an internal error if the value is None.
    fn required(self, field: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, field: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(QuernError::Internal(format!("missing {field}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_category() {
        let err = QuernError::PlannerContract("combine split without combine function".to_string());
        assert!(err.to_string().starts_with("Planner contract violation"));
    }

    #[test]
    fn required_on_none() {
        let opt: Option<i32> = None;
        assert!(opt.required("thing").is_err());
    }
}
