//! Versioned test/live environment configuration for a platform destination.
//!
//! Switching environments snapshots the outgoing configuration so it can be
//! rolled back, and promoting to live is blocked unless the destination's
//! required credentials are present. A half-configured destination must never
//! silently go live.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Platform;

/// Which environment a destination currently sends to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Test,
    Live,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Test => "test",
            Environment::Live => "live",
        }
    }
}

/// Credentials for one platform destination.
///
/// Which fields are required depends on the platform; see
/// [`required_credentials`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformCredentials {
    /// Pixel / tag / ad-account identifier (meta, tiktok, pinterest).
    #[serde(default)]
    pub pixel_id: Option<String>,
    /// Server-side API access token (meta, tiktok, pinterest).
    #[serde(default)]
    pub access_token: Option<String>,
    /// Measurement id (google).
    #[serde(default)]
    pub measurement_id: Option<String>,
    /// Measurement-protocol API secret (google).
    #[serde(default)]
    pub api_secret: Option<String>,
    /// Test-event code, sent only in the test environment (meta, tiktok).
    #[serde(default)]
    pub test_event_code: Option<String>,
}

/// The credential fields a platform requires before it may go live.
pub fn required_credentials(platform: Platform) -> &'static [&'static str] {
    match platform {
        Platform::Meta => &["pixel_id", "access_token"],
        Platform::Google => &["measurement_id", "api_secret"],
        Platform::Tiktok => &["pixel_id", "access_token"],
        Platform::Pinterest => &["pixel_id", "access_token"],
    }
}

/// Error promoting a destination to live.
#[derive(Debug, Error, PartialEq)]
#[error("{platform} cannot go live: missing credentials: {}", missing.join(", "))]
pub struct MissingCredentials {
    pub platform: Platform,
    pub missing: Vec<&'static str>,
}

/// A point-in-time copy of the outgoing environment config, kept for rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub version: u32,
    pub environment: Environment,
    pub credentials: PlatformCredentials,
}

/// Versioned environment state for one platform destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub environment: Environment,
    /// Bumped on every environment switch.
    #[serde(default)]
    pub version: u32,
    pub credentials: PlatformCredentials,
    /// Snapshot of the config that was live before the last switch.
    #[serde(default)]
    pub previous: Option<EnvironmentSnapshot>,
}

impl EnvironmentConfig {
    /// Names the required credential fields that are missing or empty.
    pub fn missing_credentials(&self, platform: Platform) -> Vec<&'static str> {
        required_credentials(platform)
            .iter()
            .copied()
            .filter(|field| {
                let value = match *field {
                    "pixel_id" => &self.credentials.pixel_id,
                    "access_token" => &self.credentials.access_token,
                    "measurement_id" => &self.credentials.measurement_id,
                    "api_secret" => &self.credentials.api_secret,
                    _ => &None,
                };
                value.as_deref().is_none_or(|v| v.trim().is_empty())
            })
            .collect()
    }

    /// Switches to `target`, snapshotting the outgoing config first.
    ///
    /// Promotion to live validates required credentials and fails with the
    /// full list of missing fields rather than half-switching.
    pub fn switch_to(
        &mut self,
        platform: Platform,
        target: Environment,
    ) -> std::result::Result<(), MissingCredentials> {
        if target == Environment::Live {
            let missing = self.missing_credentials(platform);
            if !missing.is_empty() {
                return Err(MissingCredentials { platform, missing });
            }
        }

        self.previous = Some(EnvironmentSnapshot {
            version: self.version,
            environment: self.environment,
            credentials: self.credentials.clone(),
        });
        self.version += 1;
        self.environment = target;
        Ok(())
    }

    /// Restores the snapshotted previous config, if one exists.
    ///
    /// Returns `false` when there is nothing to roll back to.
    pub fn rollback(&mut self) -> bool {
        match self.previous.take() {
            Some(snapshot) => {
                self.environment = snapshot.environment;
                self.credentials = snapshot.credentials;
                self.version += 1;
                true
            }
            None => false,
        }
    }
}
