// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Build metadata reported by `gateport version` and logged at startup.
//!
//! Commit and build date come from the `GATEPORT_GIT_COMMIT` and `GATEPORT_BUILD_DATE`
//! variables set at compile time by the release pipeline; local builds report `unknown`.

use serde::Serialize;
use std::fmt;

const UNKNOWN: &str = "unknown";

/// Build information for this binary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_commit: &'static str,
    pub build_date: &'static str,
    pub platform: String,
}

impl BuildInfo {
    #[must_use]
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_commit: option_env!("GATEPORT_GIT_COMMIT").unwrap_or(UNKNOWN),
            build_date: option_env!("GATEPORT_BUILD_DATE").unwrap_or(UNKNOWN),
            platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }

    /// Pretty-printed JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Version:    {}", self.version)?;
        writeln!(f, "Git commit: {}", self.git_commit)?;
        writeln!(f, "Build date: {}", self.build_date)?;
        write!(f, "Platform:   {}", self.platform)
    }
}
