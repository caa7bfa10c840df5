use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::ValidationError;

const MAX_ID_LEN: usize = 64;

fn is_id_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | ':' | '.' | '#' | '/')
}

fn parse_id(kind: &'static str, input: &str, lowercase: bool) -> Result<String, ValidationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyId { kind });
    }

    let normalized = if lowercase {
        trimmed.to_ascii_lowercase()
    } else {
        trimmed.to_owned()
    };

    let len = normalized.chars().count();
    if len > MAX_ID_LEN {
        return Err(ValidationError::IdTooLong {
            kind,
            len,
            max: MAX_ID_LEN,
        });
    }

    for (index, ch) in normalized.chars().enumerate() {
        if !is_id_char(ch) {
            return Err(ValidationError::IdInvalidChar { kind, ch, index });
        }
    }

    Ok(normalized)
}

macro_rules! validated_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal, lowercase = $lower:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(input: &str) -> Result<Self, ValidationError> {
                parse_id($kind, input, $lower).map(Self)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = ValidationError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

validated_id!(
    /// Identifier of a tracked entity (protocol).
    EntityId,
    "entity",
    lowercase = false
);

validated_id!(
    /// Identifier of a partition (chain). Normalized to lowercase.
    PartitionId,
    "partition",
    lowercase = true
);

validated_id!(
    /// Identifier of an asset held on a partition, e.g. `ethereum:0xa0b8...` or `usdc`.
    AssetId,
    "asset",
    lowercase = false
);

/// ISO-4217 style currency code, always uppercase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let normalized = input.trim().to_ascii_uppercase();
        let is_valid =
            normalized.len() == 3 && normalized.chars().all(|ch| ch.is_ascii_alphabetic());

        if !is_valid {
            return Err(ValidationError::InvalidCurrency {
                value: input.to_owned(),
            });
        }

        Ok(Self(normalized))
    }

    pub fn usd() -> Self {
        Self(String::from("USD"))
    }

    pub fn is_usd(&self) -> bool {
        self.0 == "USD"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Currency {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Currency {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.0
    }
}
