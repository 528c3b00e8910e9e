use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How targets are split between the tunnel and direct dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Everything goes through the tunnel.
    Global,
    /// Chinese destinations are dialed directly, the rest tunneled.
    BypassCn,
    /// Nothing is tunneled; every target is dialed directly.
    None,
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(RoutingMode::Global),
            "bypass_cn" => Ok(RoutingMode::BypassCn),
            "none" => Ok(RoutingMode::None),
            other => Err(format!(
                "unknown routing mode {other:?} (expected global, bypass_cn or none)"
            )),
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingMode::Global => write!(f, "global"),
            RoutingMode::BypassCn => write!(f, "bypass_cn"),
            RoutingMode::None => write!(f, "none"),
        }
    }
}
