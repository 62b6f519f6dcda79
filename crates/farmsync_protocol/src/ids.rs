//! Identifier newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic per-origin sequence number.
///
/// Logged tasks start at 1. [`SequenceId::UNSEQUENCED`] marks dependency
/// upserts the staging manager sends ahead of a blocked task; receivers
/// apply those without de-duplication.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceId(pub u64);

impl SequenceId {
    /// Sequence id of tasks that were never logged.
    pub const UNSEQUENCED: SequenceId = SequenceId(0);

    /// Returns true for [`SequenceId::UNSEQUENCED`].
    #[must_use]
    pub fn is_unsequenced(self) -> bool {
        self.0 == 0
    }

    /// Returns the raw value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following sequence id.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an identifier from any string.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
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

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identity of a node (web-farm peer or staging environment).
    ServerId
);
string_id!(
    /// Identifier of a registered task kind, e.g. `cache.invalidate`.
    TaskKindId
);
string_id!(
    /// Named partition used to route tasks to a subset of targets.
    GroupTag
);
