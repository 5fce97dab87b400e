//! Cluster configuration model.
//!
//! The operator supplies one document describing every reachable cluster;
//! exactly one of them carries the primary section. Validation mirrors what
//! the management operator enforces so a bad document fails at startup, not
//! mid-request.

use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, Result};

/// Fileset under which per-volume symlinks are organized when the operator
/// does not name one.
pub const DEFAULT_PRIMARY_FILESET: &str = "fabricfs-csi-volume-store";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub id: String,
    #[serde(default)]
    pub primary: Option<PrimaryConfig>,
    #[serde(default)]
    pub rest_api: Vec<RestEndpoint>,
    #[serde(default)]
    pub secrets: String,
    #[serde(default)]
    pub secure_ssl_mode: bool,
    #[serde(default)]
    pub cacert: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestEndpoint {
    pub gui_host: String,
    #[serde(default = "default_gui_port")]
    pub gui_port: u16,
}

fn default_gui_port() -> u16 {
    443
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryConfig {
    pub primary_fs: String,
    #[serde(default)]
    pub primary_fset: String,
    #[serde(default)]
    pub remote_cluster: String,
    #[serde(default)]
    pub inode_limit: String,
}

impl Settings {
    pub fn from_file(path: &std::path::Path) -> Result<Settings> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ControllerError::Internal(format!(
                "unable to read cluster configuration {}: {err}",
                path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            ControllerError::Internal(format!(
                "unable to parse cluster configuration {}: {err}",
                path.display()
            ))
        })
    }

    pub fn cluster_ids(&self) -> Vec<String> {
        self.clusters.iter().map(|c| c.id.clone()).collect()
    }

    pub fn primary_cluster(&self) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.primary.is_some())
    }

    /// Checks the document for the issues the driver cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut issues: Vec<String> = Vec::new();

        if self.clusters.is_empty() {
            return Err(ControllerError::Internal(
                "missing cluster information in FabricFS configuration".to_string(),
            ));
        }

        let mut primary_found = false;
        let mut remote_cluster_for_primary = String::new();
        let mut non_primary_ids: Vec<String> = Vec::new();

        for cluster in &self.clusters {
            if cluster.id.is_empty() {
                issues.push("mandatory parameter 'id' is not specified".to_string());
            }
            if cluster.rest_api.is_empty() {
                issues.push(format!(
                    "mandatory section 'restApi' is not specified for cluster {}",
                    cluster.id
                ));
            }
            if cluster.rest_api.first().is_some_and(|e| e.gui_host.is_empty()) {
                issues.push(format!(
                    "mandatory parameter 'guiHost' is not specified for cluster {}",
                    cluster.id
                ));
            }
            if cluster.secrets.is_empty() {
                issues.push(format!(
                    "mandatory parameter 'secrets' is not specified for cluster {}",
                    cluster.id
                ));
            }
            if cluster.secure_ssl_mode && cluster.cacert.is_none() {
                issues.push(format!(
                    "CA certificate not specified in secure SSL mode for cluster {}",
                    cluster.id
                ));
            }

            if let Some(primary) = &cluster.primary {
                if primary_found {
                    issues.push("more than one primary cluster specified".to_string());
                }
                primary_found = true;
                if primary.primary_fs.is_empty() {
                    issues.push(format!(
                        "mandatory parameter 'primaryFs' is not specified for primary cluster {}",
                        cluster.id
                    ));
                }
                remote_cluster_for_primary = primary.remote_cluster.clone();
            } else {
                non_primary_ids.push(cluster.id.clone());
            }
        }

        if !primary_found {
            issues.push("no primary cluster specified".to_string());
        }

        if !remote_cluster_for_primary.is_empty()
            && !non_primary_ids.contains(&remote_cluster_for_primary)
        {
            issues.push(format!(
                "remote cluster specified for primary filesystem: {remote_cluster_for_primary}, \
                 but no definition found for it in config"
            ));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ControllerError::Internal(format!(
                "one or more issues found in FabricFS CSI configuration: {}",
                issues.join("; ")
            )))
        }
    }
}

/// Primary-cluster details resolved at startup and consulted on every
/// classic-generation request.
#[derive(Debug, Clone, Default)]
pub struct PrimaryInfo {
    /// Primary filesystem name as known on the primary cluster.
    pub filesystem: String,
    /// Primary filesystem name on its owning cluster (differs when the
    /// primary filesystem is remotely mounted).
    pub owning_filesystem: String,
    pub fileset: String,
    pub mount_point: String,
    pub cluster_id: String,
    pub remote_cluster: String,
    pub inode_limit: String,
    /// Absolute path of the `.volumes` symlink area.
    pub symlink_absolute_path: String,
    /// Same path, relative to the primary filesystem mount point.
    pub symlink_relative_path: String,
    /// Junction path of the primary fileset.
    pub fileset_link_path: String,
}
