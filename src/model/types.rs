//! Identifier newtypes.
//!
//! Agent ids, task ids, and branch names travel through KV keys, bus
//! subjects, and git command lines, so they are validated once at the edge
//! and carried as types from then on.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// What kind of identifier failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    AgentId,
    TaskId,
    BranchName,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AgentId => "agent id",
            Self::TaskId => "task id",
            Self::BranchName => "branch name",
        };
        f.write_str(name)
    }
}

/// An identifier failed validation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} `{value}`: {reason}")]
pub struct ValidationError {
    /// Which identifier kind was being validated.
    pub kind: ErrorKind,
    /// The raw value that failed.
    pub value: String,
    /// Why it failed.
    pub reason: String,
}

/// Shared id charset: ascii letters, digits, `-`, `_`. Dots are excluded —
/// ids are spliced into dot-separated bus subjects.
fn validate_id(kind: ErrorKind, s: &str, max_len: usize) -> Result<(), ValidationError> {
    if s.is_empty() {
        return Err(ValidationError {
            kind,
            value: s.to_owned(),
            reason: "must not be empty".to_owned(),
        });
    }
    if s.len() > max_len {
        return Err(ValidationError {
            kind,
            value: s.to_owned(),
            reason: format!("must be at most {max_len} characters, got {}", s.len()),
        });
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err(ValidationError {
            kind,
            value: s.to_owned(),
            reason: "must contain only ascii letters, digits, `-`, `_`".to_owned(),
        });
    }
    Ok(())
}

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// The maximum length in bytes.
            pub const MAX_LEN: usize = 128;

            /// Create a new id, validating format.
            ///
            /// # Errors
            /// Returns an error if the value is empty, too long, or contains
            /// characters outside the id charset.
            pub fn new(s: &str) -> Result<Self, ValidationError> {
                validate_id($kind, s, Self::MAX_LEN)?;
                Ok(Self(s.to_owned()))
            }

            /// The id as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;
            fn try_from(s: String) -> Result<Self, Self::Error> {
                validate_id($kind, &s, Self::MAX_LEN)?;
                Ok(Self(s))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

id_newtype!(
    /// A stable agent identity, e.g. `worker-1`.
    AgentId,
    ErrorKind::AgentId
);

id_newtype!(
    /// A task identity, unique within the cluster, e.g. `t1`.
    TaskId,
    ErrorKind::TaskId
);

// ---------------------------------------------------------------------------
// BranchName
// ---------------------------------------------------------------------------

/// A git branch name produced by a worker, e.g. `agent/worker-1/t1`.
///
/// Validation is a conservative subset of `git check-ref-format`: enough to
/// keep branch names safe to splice into git command lines.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchName(String);

impl BranchName {
    /// The maximum length in bytes.
    pub const MAX_LEN: usize = 255;

    /// Create a new branch name, validating format.
    ///
    /// # Errors
    /// Returns an error if the name is empty, too long, starts with `-`,
    /// contains whitespace, control characters, or `..`.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// The branch name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        let fail = |reason: &str| ValidationError {
            kind: ErrorKind::BranchName,
            value: s.to_owned(),
            reason: reason.to_owned(),
        };
        if s.is_empty() {
            return Err(fail("must not be empty"));
        }
        if s.len() > Self::MAX_LEN {
            return Err(fail("too long"));
        }
        if s.starts_with('-') {
            return Err(fail("must not start with `-`"));
        }
        if s.contains("..") {
            return Err(fail("must not contain `..`"));
        }
        if s.ends_with('/') || s.starts_with('/') {
            return Err(fail("must not start or end with `/`"));
        }
        if s.chars().any(|c| c.is_whitespace() || c.is_control() || matches!(c, ':' | '~' | '^' | '?' | '*' | '[' | '\\')) {
            return Err(fail("contains characters git refuses in ref names"));
        }
        Ok(())
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BranchName {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for BranchName {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<BranchName> for String {
    fn from(b: BranchName) -> Self {
        b.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_accepts_common_forms() {
        for ok in ["w1", "A", "worker-1", "node_3"] {
            assert!(AgentId::new(ok).is_ok(), "{ok} should be valid");
        }
    }

    #[test]
    fn agent_id_rejects_bad_forms() {
        // Dots would split bus subject tokens, so they are out too.
        for bad in ["", "has space", "slash/y", "tab\t", "agent.7"] {
            assert!(AgentId::new(bad).is_err(), "{bad:?} should be invalid");
        }
    }

    #[test]
    fn agent_id_rejects_over_long() {
        let long = "a".repeat(AgentId::MAX_LEN + 1);
        assert!(AgentId::new(&long).is_err());
    }

    #[test]
    fn task_id_serde_roundtrip() {
        let id = TaskId::new("t1").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"t1\"");
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn task_id_serde_rejects_invalid() {
        let res: Result<TaskId, _> = serde_json::from_str("\"has space\"");
        assert!(res.is_err());
    }

    #[test]
    fn branch_name_accepts_slashes() {
        assert!(BranchName::new("agent/w1/t1").is_ok());
    }

    #[test]
    fn branch_name_rejects_git_unsafe() {
        for bad in ["", "-rf", "a..b", "a b", "head:x", "x?", "/lead", "trail/"] {
            assert!(BranchName::new(bad).is_err(), "{bad:?} should be invalid");
        }
    }

    #[test]
    fn validation_error_display_names_kind() {
        let err = TaskId::new("").unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("task id"));
        assert!(msg.contains("must not be empty"));
    }
}
