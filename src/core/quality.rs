//! Data quality indicator.

use serde::{Deserialize, Serialize};

/// Trustworthiness of a sample.
///
/// Every sample carries a quality tag. A read failure keeps the variable in
/// the cache but flips the current quality to `Bad`; the next successful
/// read restores `Good`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Value read successfully and trusted.
    #[default]
    Good,

    /// Read or decode failed; value is absent.
    Bad,

    /// Value present but of doubtful validity.
    Uncertain,
}

impl Quality {
    /// Check whether the sample value can be trusted.
    #[inline]
    pub const fn is_good(&self) -> bool {
        matches!(self, Self::Good)
    }

    /// Wire representation, as used in snapshot and history payloads.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Bad => "bad",
            Self::Uncertain => "uncertain",
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
