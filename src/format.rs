//! # Disk Format Versioning
//!
//! A single record under a fixed key in the metadata dictionary describes
//! the on-disk format the data was written with:
//!
//! ```json
//! {
//!   "currentVersion": 6,
//!   "originalVersion": 4,
//!   "history": [
//!     { "upgradedTo": 5, "upgradedAt": 1422492400,
//!       "upgradedBy": { "version": "0.3.0", "gitHash": "…", "sysInfo": "…" } }
//!   ]
//! }
//! ```
//!
//! Load rejects versions outside the closed compatibility window. Upgrades
//! are one-way and advance by exactly one version, appending a history
//! event. Several historical transitions changed a key encoding and cannot
//! be performed in place; attempting them is a hard internal error, the
//! caller is expected to dump and reload instead.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dictionary::Dictionary;
use crate::error::{Error, Result};
use crate::recovery::OperationContext;

pub const VERSION_INFO_KEY: &[u8] = b"diskFormatVersionInfo";

// Version history:
//   1  implicit version before version numbers were serialized
//   2  initial prerelease: raw index keys, memcmp-able record ids
//   3  order-preserving index key encoding, incompatible with earlier
//   4  record ids moved to the biased big-endian format, incompatible
//   5  index keys gained type bits, incompatible
//   6  one dictionary per ident
/// Oldest version this build can read.
pub const MIN_SUPPORTED_VERSION: u32 = 6;
/// Version written by this build.
pub const CURRENT_VERSION: u32 = 6;

#[derive(Debug, Serialize, Deserialize)]
struct UpgradedBy {
    version: String,
    #[serde(rename = "gitHash")]
    git_hash: String,
    #[serde(rename = "sysInfo")]
    sys_info: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct UpgradeEvent {
    #[serde(rename = "upgradedTo")]
    upgraded_to: u32,
    #[serde(rename = "upgradedAt")]
    upgraded_at: u64,
    #[serde(rename = "upgradedBy")]
    upgraded_by: UpgradedBy,
}

#[derive(Debug, Serialize, Deserialize)]
struct VersionInfo {
    #[serde(rename = "currentVersion")]
    current_version: u32,
    #[serde(rename = "originalVersion")]
    original_version: u32,
    history: Vec<UpgradeEvent>,
}

fn upgraded_by() -> UpgradedBy {
    UpgradedBy {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        sys_info: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct DiskFormatVersion {
    metadata: Arc<dyn Dictionary>,
    startup_version: u32,
    current_version: u32,
}

impl DiskFormatVersion {
    pub fn new(metadata: Arc<dyn Dictionary>) -> DiskFormatVersion {
        DiskFormatVersion {
            metadata,
            startup_version: 0,
            current_version: 0,
        }
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    pub fn startup_version(&self) -> u32 {
        self.startup_version
    }

    /// Read (or initialize) the version record and check the compatibility
    /// window.
    pub fn initialize(&mut self, ctx: &mut OperationContext) -> Result<()> {
        match self.read_info(ctx) {
            Err(Error::NotFound) => {
                // Fresh store: stamp it with the current version.
                let info = VersionInfo {
                    current_version: CURRENT_VERSION,
                    original_version: CURRENT_VERSION,
                    history: vec![UpgradeEvent {
                        upgraded_to: CURRENT_VERSION,
                        upgraded_at: now_secs(),
                        upgraded_by: upgraded_by(),
                    }],
                };
                self.write_info(ctx, &info)?;
                self.startup_version = CURRENT_VERSION;
            }
            Err(err) => return Err(err),
            Ok(info) => {
                self.startup_version = info.current_version;
            }
        }

        if self.startup_version < MIN_SUPPORTED_VERSION {
            warn!(
                found = self.startup_version,
                min = MIN_SUPPORTED_VERSION,
                "disk format version too old; dump and reload with an earlier release"
            );
            return Err(Error::UnsupportedFormat(format!(
                "disk format version {} is below the supported minimum {}",
                self.startup_version, MIN_SUPPORTED_VERSION
            )));
        }
        if self.startup_version > CURRENT_VERSION {
            warn!(
                found = self.startup_version,
                max = CURRENT_VERSION,
                "disk format version too new; upgrade this build to read the data"
            );
            return Err(Error::UnsupportedFormat(format!(
                "disk format version {} is above the supported maximum {}",
                self.startup_version, CURRENT_VERSION
            )));
        }

        self.current_version = self.startup_version;
        Ok(())
    }

    /// Walk the version forward one step at a time until current.
    pub fn upgrade_to_current(&mut self, ctx: &mut OperationContext) -> Result<()> {
        if self.current_version < CURRENT_VERSION {
            info!(
                from = self.current_version,
                to = CURRENT_VERSION,
                "upgrading disk format version"
            );
        }
        while self.current_version < CURRENT_VERSION {
            self.upgrade_to_version(ctx, self.current_version + 1)?;
        }
        Ok(())
    }

    fn upgrade_to_version(&mut self, ctx: &mut OperationContext, target: u32) -> Result<()> {
        if self.current_version + 1 != target {
            return Err(Error::BadValue(format!(
                "bad version in upgrade: {} -> {}",
                self.current_version, target
            )));
        }
        info!(from = self.current_version, to = target, "running disk format upgrade");

        match target {
            // Versions 3 through 6 each changed a key encoding or the ident
            // mapping; entries cannot be rewritten in place. Dump and reload.
            3..=6 => {
                return Err(Error::Internal(format!(
                    "cannot upgrade to version {} in place: storage format changed",
                    target
                )));
            }
            2 => {
                // First serialized version; nothing to rewrite.
            }
            _ => {
                return Err(Error::BadValue(format!(
                    "unknown upgrade target version {}",
                    target
                )));
            }
        }

        let mut info = self.read_info(ctx)?;
        info.history.push(UpgradeEvent {
            upgraded_to: target,
            upgraded_at: now_secs(),
            upgraded_by: upgraded_by(),
        });
        info.current_version = target;
        self.write_info(ctx, &info)?;
        self.current_version = target;
        Ok(())
    }

    fn read_info(&self, ctx: &mut OperationContext) -> Result<VersionInfo> {
        let raw = self.metadata.get(ctx, VERSION_INFO_KEY, false)?;
        serde_json::from_slice(&raw)
            .map_err(|err| Error::BadValue(format!("corrupt version info record: {}", err)))
    }

    fn write_info(&self, ctx: &mut OperationContext, info: &VersionInfo) -> Result<()> {
        let raw = serde_json::to_vec(info)
            .map_err(|err| Error::Internal(format!("serializing version info: {}", err)))?;
        ctx.recovery_unit().begin_unit_of_work();
        match self.metadata.insert(ctx, VERSION_INFO_KEY, &raw, false) {
            Ok(()) => ctx.recovery_unit().commit_unit_of_work(),
            Err(err) => {
                let _ = ctx.recovery_unit().abort_unit_of_work();
                Err(err)
            }
        }
    }
}
