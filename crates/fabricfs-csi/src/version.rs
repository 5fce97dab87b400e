//! Capability gating on cluster software and filesystem format versions.
//!
//! The backend reports versions as dotted release strings; both sides of a
//! comparison are normalized to a digit string first, then compared
//! numerically with right-zero-padding so unequal lengths line up.

use std::sync::Arc;

use fabricfs_connect::ClusterConnector;

use crate::error::{ControllerError, Result};

/// Minimum cluster version for snapshot support (5.1.1-0).
pub const MIN_SNAPSHOT_VERSION: &str = "5110";
/// Minimum cluster version for explicit permissions support (5.1.1-2).
pub const MIN_PERMISSIONS_VERSION: &str = "5112";
/// Minimum cluster version for volume cloning support (5.1.2-1).
pub const MIN_CLONE_VERSION: &str = "5121";
/// Minimum cluster version for consistency group support (5.1.3-0).
pub const MIN_CONSISTENCY_GROUP_VERSION: &str = "5130";
/// Minimum cluster version for multi-endpoint management HA (5.1.5-0).
pub const MIN_MGMT_HA_VERSION: &str = "5150";
/// Minimum filesystem format version for tiering support (27.00).
pub const MIN_TIERING_FS_VERSION: &str = "2700";

/// Normalizes a cluster release string to a digit string.
///
/// GA builds look like `5.1.5-0`, developer builds like
/// `5.1.5.0-developer build`.
pub fn normalize_cluster_version(raw: &str) -> Result<String> {
    let segments: Vec<&str> = raw.split('.').collect();
    if segments.len() < 3 {
        return Err(ControllerError::Internal(format!(
            "invalid cluster version - {raw}"
        )));
    }

    if segments.len() >= 4 {
        let minor: Vec<&str> = segments[3].split('-').collect();
        Ok(format!(
            "{}{}{}{}",
            segments[0], segments[1], segments[2], minor[0]
        ))
    } else {
        let minor: Vec<&str> = segments[2].split('-').collect();
        if minor.len() < 2 || minor[1].is_empty() {
            return Err(ControllerError::Internal(format!(
                "invalid cluster version - {raw}"
            )));
        }
        Ok(format!(
            "{}{}{}{}",
            segments[0],
            segments[1],
            minor[0],
            &minor[1][0..1]
        ))
    }
}

/// Normalizes a filesystem format version such as `27.00` to `2700`.
pub fn normalize_fs_version(raw: &str) -> String {
    raw.replace('.', "")
}

/// Numeric comparison of two normalized digit strings; shorter strings are
/// right-padded with zeros so `512` compares as `5120`.
pub fn version_at_least(current: &str, minimum: &str) -> bool {
    let width = current.len().max(minimum.len());
    let pad = |s: &str| {
        let mut out = String::from(s);
        while out.len() < width {
            out.push('0');
        }
        out
    };
    pad(current) >= pad(minimum)
}

/// Checks the connected cluster's software version against a minimum.
pub async fn cluster_version_at_least(
    conn: &Arc<dyn ClusterConnector>,
    minimum: &str,
) -> Result<bool> {
    let raw = conn.cluster_version().await?;
    let normalized = normalize_cluster_version(&raw)?;
    Ok(version_at_least(&normalized, minimum))
}

/// Checks a filesystem's format version against the tiering minimum.
pub fn fs_supports_tiering(fs_version: &str) -> bool {
    version_at_least(&normalize_fs_version(fs_version), MIN_TIERING_FS_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ga_build() {
        assert_eq!(normalize_cluster_version("5.1.5-0").unwrap(), "5150");
        assert_eq!(normalize_cluster_version("5.1.1-2").unwrap(), "5112");
    }

    #[test]
    fn test_normalize_dev_build() {
        assert_eq!(
            normalize_cluster_version("5.1.5.0-developer build").unwrap(),
            "5150"
        );
        assert_eq!(normalize_cluster_version("5.1.1.1-rc1").unwrap(), "5111");
    }

    #[test]
    fn test_normalize_rejects_short_version() {
        assert!(normalize_cluster_version("5.1").is_err());
        assert!(normalize_cluster_version("garbage").is_err());
    }

    #[test]
    fn test_version_at_least() {
        assert!(version_at_least("5150", "5130"));
        assert!(version_at_least("5130", "5130"));
        assert!(!version_at_least("5121", "5130"));
        // Right-padding: "512" compares as "5120".
        assert!(!version_at_least("512", "5121"));
        assert!(version_at_least("513", "5121"));
    }

    #[test]
    fn test_fs_supports_tiering() {
        assert!(fs_supports_tiering("27.00"));
        assert!(fs_supports_tiering("28.01"));
        assert!(!fs_supports_tiering("23.00"));
    }
}
