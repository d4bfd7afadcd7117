//! Subscription tiers.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Subscription level a tenant is billed at.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Individual,
    Professional,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 4] = [
        Tier::Free,
        Tier::Individual,
        Tier::Professional,
        Tier::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Individual => "individual",
            Tier::Professional => "professional",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "individual" => Ok(Tier::Individual),
            "professional" => Ok(Tier::Professional),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(EngineError::validation(format!("unknown tier: {other}"))),
        }
    }
}
