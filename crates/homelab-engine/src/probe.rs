//! Result of inspecting one resource.

use std::fmt;

/// Observed state of a resource relative to what the step wants.
///
/// "Absent" is an answer, not an error. Recomputed on every probe and never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// Resource does not exist
    Absent,
    /// Resource exists and matches
    PresentMatching,
    /// Resource exists but differs
    PresentDiverging {
        /// Human-readable rendering of what was observed
        actual: String,
    },
}

impl ProbeResult {
    /// Shorthand for [`ProbeResult::PresentDiverging`]
    pub fn diverging(actual: impl Into<String>) -> Self {
        Self::PresentDiverging {
            actual: actual.into(),
        }
    }

    /// Whether the resource matches
    pub fn is_matching(&self) -> bool {
        matches!(self, Self::PresentMatching)
    }

    /// Compare optional observed file content with the desired content
    pub fn of_content(actual: Option<&str>, desired: &str) -> Self {
        match actual {
            None => Self::Absent,
            Some(actual) if actual == desired => Self::PresentMatching,
            Some(actual) => Self::diverging(format!(
                "content differs ({} bytes on disk, {} wanted)",
                actual.len(),
                desired.len()
            )),
        }
    }

    /// Compare an optional observed value with the desired one
    pub fn of_value<T>(actual: Option<T>, desired: &T) -> Self
    where
        T: PartialEq + fmt::Display,
    {
        match actual {
            None => Self::Absent,
            Some(actual) if &actual == desired => Self::PresentMatching,
            Some(actual) => Self::diverging(actual.to_string()),
        }
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("absent"),
            Self::PresentMatching => f.write_str("matching"),
            Self::PresentDiverging { actual } => write!(f, "diverging: {}", actual),
        }
    }
}
