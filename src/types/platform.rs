//! The closed set of destination ad/analytics platforms.
//!
//! Dispatch is always an exhaustive match on this tag; payload shaping never
//! inspects the runtime shape of credentials beyond it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A destination platform for server-side conversion delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Meta,
    Google,
    Tiktok,
    Pinterest,
}

impl Platform {
    /// All platforms, in dispatch order.
    pub const ALL: [Platform; 4] = [
        Platform::Meta,
        Platform::Google,
        Platform::Tiktok,
        Platform::Pinterest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Meta => "meta",
            Platform::Google => "google",
            Platform::Tiktok => "tiktok",
            Platform::Pinterest => "pinterest",
        }
    }

    /// Parses a platform tag. Returns `None` for unknown tags.
    pub fn parse(s: &str) -> Option<Platform> {
        match s {
            "meta" => Some(Platform::Meta),
            "google" => Some(Platform::Google),
            "tiktok" => Some(Platform::Tiktok),
            "pinterest" => Some(Platform::Pinterest),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Endpoint region for a platform destination.
///
/// Some destinations expose a regional variant of their ingestion endpoint;
/// the choice is driven by stored per-shop config, never by the event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    #[default]
    Global,
    Eu,
}
