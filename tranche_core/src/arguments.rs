//! Typed access to a migration's job arguments.
//!
//! Job arguments are persisted as a JSON array and forwarded untouched to every batch. The
//! [`JobArguments`] trait maps them to a struct whose fields are the positional arguments,
//! usually through `#[derive(JobArguments)]`.

use serde_json::Value;

/// Errors converting between a struct and a migration's positional job arguments.
#[derive(Debug, thiserror::Error)]
pub enum JobArgumentsError {
    /// The array has a length the struct cannot accept.
    #[error("expected between {min} and {max} job arguments, found {found}")]
    Count {
        /// Fewest arguments accepted.
        min: usize,
        /// Most arguments accepted.
        max: usize,
        /// Arguments provided.
        found: usize,
    },
    /// A field could not be serialized.
    #[error("failed to encode job argument {index}: {source}")]
    Encode {
        /// Position of the argument.
        index: usize,
        /// The serialization error.
        #[source]
        source: serde_json::Error,
    },
    /// An argument could not be deserialized into its field.
    #[error("failed to decode job argument {index}: {source}")]
    Decode {
        /// Position of the argument.
        index: usize,
        /// The deserialization error.
        #[source]
        source: serde_json::Error,
    },
}

impl JobArgumentsError {
    /// Checks that `found` arguments fall within `min..=max`.
    pub fn check_count(min: usize, max: usize, found: usize) -> Result<(), Self> {
        if found < min || found > max {
            return Err(JobArgumentsError::Count { min, max, found });
        }
        Ok(())
    }
}

/// Converts a struct to and from a migration's positional job arguments.
///
/// ```ignore
/// use tranche_derive::JobArguments;
///
/// #[derive(JobArguments)]
/// struct CopyColumnArguments {
///     copy_from: Vec<String>,
///     copy_to: Vec<String>,
/// }
/// ```
pub trait JobArguments: Sized {
    /// Serializes the fields, in declaration order.
    fn to_job_arguments(&self) -> Result<Vec<Value>, JobArgumentsError>;

    /// Rebuilds the struct from positional arguments.
    fn from_job_arguments(arguments: &[Value]) -> Result<Self, JobArgumentsError>;
}

impl JobArguments for Vec<Value> {
    fn to_job_arguments(&self) -> Result<Vec<Value>, JobArgumentsError> {
        Ok(self.clone())
    }

    fn from_job_arguments(arguments: &[Value]) -> Result<Self, JobArgumentsError> {
        Ok(arguments.to_vec())
    }
}

impl JobArguments for () {
    fn to_job_arguments(&self) -> Result<Vec<Value>, JobArgumentsError> {
        Ok(Vec::new())
    }

    fn from_job_arguments(arguments: &[Value]) -> Result<Self, JobArgumentsError> {
        JobArgumentsError::check_count(0, 0, arguments.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_arguments_pass_through() {
        let args = vec![json!(1), json!("two")];
        assert_eq!(Vec::<Value>::from_job_arguments(&args).unwrap(), args);
        assert_eq!(args.to_job_arguments().unwrap(), args);
    }

    #[test]
    fn unit_rejects_arguments() {
        assert!(<()>::from_job_arguments(&[]).is_ok());
        let err = <()>::from_job_arguments(&[json!(1)]).unwrap_err();
        assert_eq!(err.to_string(), "expected between 0 and 0 job arguments, found 1");
    }

    #[test]
    fn count_check_bounds_are_inclusive() {
        assert!(JobArgumentsError::check_count(1, 3, 1).is_ok());
        assert!(JobArgumentsError::check_count(1, 3, 3).is_ok());
        assert!(JobArgumentsError::check_count(1, 3, 4).is_err());
        assert!(JobArgumentsError::check_count(1, 3, 0).is_err());
    }
}
