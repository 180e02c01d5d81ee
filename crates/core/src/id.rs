//! Strongly-typed identifiers used across the pipeline.
//!
//! Both identifiers are assigned outside this system (by the app store and
//! by the review feed), so they wrap the external string verbatim.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of a monitored application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppId(String);

/// Feed-assigned identifier of a review (unique per application).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReviewId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Validate and wrap an externally supplied identifier.
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.is_empty() {
                    return Err(DomainError::invalid_id(format!("{}: empty", $name)));
                }
                if value.trim() != value {
                    return Err(DomainError::invalid_id(format!(
                        "{}: surrounding whitespace in {:?}",
                        $name, value
                    )));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_string_newtype!(AppId, "AppId");
impl_string_newtype!(ReviewId, "ReviewId");

impl AppId {
    /// Decode a queue payload back into an application identifier.
    pub fn from_payload(payload: &[u8]) -> Result<Self, DomainError> {
        let s = core::str::from_utf8(payload)
            .map_err(|e| DomainError::invalid_id(format!("AppId: payload is not utf-8: {e}")))?;
        Self::new(s)
    }

    /// Store app ids are numeric; registration rejects anything else.
    pub fn is_numeric(&self) -> bool {
        self.0.bytes().all(|b| b.is_ascii_digit())
    }
}
