use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Short opaque identifier, unique across the process lifetime.
///
/// Matches the source's `str(uuid4())[:8]` convention closely enough to be
/// human-scannable in logs while keeping collision odds acceptable for a
/// single process's lifetime.
pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// SemVer triple used for capability artifact versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ToolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ToolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Version assigned to a freshly quarantined artifact.
    pub const fn quarantine() -> Self {
        Self::new(0, 1, 0)
    }

    /// Version assigned on promotion to production.
    pub const fn promoted() -> Self {
        Self::new(1, 0, 0)
    }
}

impl std::fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::str::FromStr for ToolVersion {
    type Err = crate::AicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        let err = || crate::AicError::Fatal(format!("invalid version string: {s}"));
        let major = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let minor = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let patch = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        Ok(Self { major, minor, patch })
    }
}
