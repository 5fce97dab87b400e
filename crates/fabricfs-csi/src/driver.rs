//! Driver assembly: connector set, primary-cluster bootstrap and the gRPC
//! server run loop.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use fabricfs_connect::{ClusterConnector, DirectoryOwner, MountStatus};
use fabricfs_proto::v1::controller_server::ControllerServer;
use fabricfs_proto::v1::controller_service_capability::rpc::Type as RpcType;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{error, info, warn};

use crate::controller::ControllerService;
use crate::error::{ControllerError, Result};
use crate::lightweight::ensure_directory;
use crate::settings::{PrimaryInfo, Settings, DEFAULT_PRIMARY_FILESET};
use crate::version::{cluster_version_at_least, MIN_MGMT_HA_VERSION};

pub const DRIVER_NAME: &str = "csi.fabricfs.io";
pub const VENDOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Key under which the primary cluster's connector is registered alongside
/// its cluster-id entry.
pub const PRIMARY_CONNECTOR_KEY: &str = "primary";

/// Extracts the owning-cluster filesystem name from a remote device name of
/// the form `owningCluster:filesystemName`.
pub fn remote_fs_name(remote_device_name: &str) -> String {
    remote_device_name
        .rsplit(':')
        .next()
        .unwrap_or(remote_device_name)
        .to_string()
}

pub struct Driver {
    pub name: String,
    pub vendor_version: String,
    pub node_id: String,
    pub connectors: HashMap<String, Arc<dyn ClusterConnector>>,
    pub settings: Settings,
    pub primary: PrimaryInfo,
    pub capabilities: Vec<RpcType>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("name", &self.name)
            .field("vendor_version", &self.vendor_version)
            .field("node_id", &self.node_id)
            .field(
                "connectors",
                &self.connectors.keys().collect::<Vec<_>>(),
            )
            .field("settings", &self.settings)
            .field("primary", &self.primary)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl Driver {
    /// Validates configuration, verifies each connector fronts the cluster
    /// it claims to, and bootstraps the primary fileset and symlink area.
    pub async fn setup(
        name: &str,
        node_id: &str,
        settings: Settings,
        mut connectors: HashMap<String, Arc<dyn ClusterConnector>>,
    ) -> Result<Driver> {
        if name.is_empty() {
            return Err(ControllerError::Internal("driver name missing".to_string()));
        }
        settings.validate()?;

        for cluster in &settings.clusters {
            let conn = connectors.get(&cluster.id).ok_or_else(|| {
                ControllerError::Internal(format!(
                    "no connector registered for cluster {}",
                    cluster.id
                ))
            })?;
            let live_id = conn.cluster_id().await?;
            if live_id != cluster.id {
                error!(
                    configured = %cluster.id,
                    live = %live_id,
                    "cluster ID from configuration does not match the cluster"
                );
                return Err(ControllerError::Internal(
                    "cluster ID does not match the cluster".to_string(),
                ));
            }

            // Multiple management endpoints need backend failover support.
            if cluster.rest_api.len() > 1
                && !cluster_version_at_least(conn, MIN_MGMT_HA_VERSION).await?
            {
                return Err(ControllerError::FailedPrecondition(format!(
                    "the minimum required cluster version for multiple management endpoints is \
                     5.1.5-0 (cluster {})",
                    cluster.id
                )));
            }
        }

        let primary_cluster = settings
            .primary_cluster()
            .ok_or_else(|| ControllerError::Internal("no primary cluster specified".to_string()))?
            .clone();
        let primary_config = primary_cluster.primary.clone().unwrap_or_default();
        let primary_conn = connectors
            .get(&primary_cluster.id)
            .cloned()
            .ok_or_else(|| {
                ControllerError::Internal("primary connector not present".to_string())
            })?;
        connectors.insert(PRIMARY_CONNECTOR_KEY.to_string(), primary_conn.clone());

        let primary_fs = primary_config.primary_fs.clone();
        let primary_mount = primary_conn.filesystem_mount_details(&primary_fs).await?;
        if primary_mount.status != MountStatus::Mounted {
            return Err(ControllerError::Internal(format!(
                "primary filesystem {primary_fs} is not mounted on the management node of the \
                 primary cluster"
            )));
        }

        let fileset = if primary_config.primary_fset.is_empty() {
            info!(
                fileset = DEFAULT_PRIMARY_FILESET,
                "primaryFset not specified in configuration, using default"
            );
            DEFAULT_PRIMARY_FILESET.to_string()
        } else {
            primary_config.primary_fset.clone()
        };

        // The primary filesystem may be a remote mount; the fileset has to
        // be created on the owning cluster in that case.
        let (owning_conn, owning_fs, owning_mount_point) =
            if primary_config.remote_cluster.is_empty() {
                (
                    primary_conn.clone(),
                    primary_fs.clone(),
                    primary_mount.mount_point.clone(),
                )
            } else {
                let remote_conn = connectors
                    .get(&primary_config.remote_cluster)
                    .cloned()
                    .ok_or_else(|| {
                        ControllerError::Internal(format!(
                            "no connector registered for remote cluster {}",
                            primary_config.remote_cluster
                        ))
                    })?;
                let fs = remote_fs_name(&primary_mount.remote_device_name);
                if fs.is_empty() {
                    return Err(ControllerError::Internal(
                        "failed to get the name of the remote filesystem".to_string(),
                    ));
                }
                let mount = remote_conn.filesystem_mount_details(&fs).await?;
                if mount.status != MountStatus::Mounted {
                    return Err(ControllerError::Internal(format!(
                        "filesystem {fs} is not mounted on the management node of cluster {}",
                        primary_config.remote_cluster
                    )));
                }
                (remote_conn, fs, mount.mount_point)
            };

        let mut fileset_link_path = Self::create_primary_fileset(
            &owning_conn,
            &owning_fs,
            &owning_mount_point,
            &fileset,
            &primary_config.inode_limit,
        )
        .await?;

        // A remotely created fileset may not be visible on the primary
        // cluster until a refresh sweep runs.
        if !primary_config.remote_cluster.is_empty()
            && primary_conn.list_fileset(&primary_fs, &fileset).await.is_err()
        {
            warn!(
                fileset = %fileset,
                "primary fileset not visible on primary cluster, running fileset refresh task"
            );
            primary_conn.run_fileset_refresh().await?;
            tokio::time::sleep(std::time::Duration::from_secs(8)).await;
            primary_conn
                .list_fileset(&primary_fs, &fileset)
                .await
                .map_err(|err| {
                    ControllerError::Internal(format!(
                        "primary fileset {fileset} not visible on primary cluster even after \
                         running fileset refresh task: {err}"
                    ))
                })?;
        }

        if owning_mount_point != primary_mount.mount_point {
            fileset_link_path =
                fileset_link_path.replacen(&owning_mount_point, &primary_mount.mount_point, 1);
        }

        // Directory where per-volume symlinks live.
        let trimmed_link = fileset_link_path.trim_end_matches('/').to_string();
        let rel_base = trimmed_link
            .replacen(&primary_mount.mount_point, "", 1)
            .trim_matches(|c| c == '!' || c == '/')
            .to_string();
        let symlink_relative_path = format!("{rel_base}/.volumes");
        let symlink_absolute_path = format!("{trimmed_link}/.volumes");
        ensure_directory(
            &primary_conn,
            &primary_fs,
            &symlink_relative_path,
            &DirectoryOwner::root(),
        )
        .await?;

        let primary = PrimaryInfo {
            filesystem: primary_fs,
            owning_filesystem: owning_fs,
            fileset,
            mount_point: primary_mount.mount_point,
            cluster_id: primary_cluster.id.clone(),
            remote_cluster: primary_config.remote_cluster,
            inode_limit: primary_config.inode_limit,
            symlink_absolute_path,
            symlink_relative_path,
            fileset_link_path,
        };

        info!(driver = name, node = node_id, "FabricFS CSI plugin initialized");

        Ok(Driver {
            name: name.to_string(),
            vendor_version: VENDOR_VERSION.to_string(),
            node_id: node_id.to_string(),
            connectors,
            settings,
            primary,
            capabilities: vec![
                RpcType::CreateDeleteVolume,
                RpcType::PublishUnpublishVolume,
                RpcType::CreateDeleteSnapshot,
                RpcType::ExpandVolume,
                RpcType::CloneVolume,
            ],
        })
    }

    /// Creates and links the primary fileset if needed; returns its
    /// junction path.
    async fn create_primary_fileset(
        conn: &Arc<dyn ClusterConnector>,
        filesystem: &str,
        mount_point: &str,
        fileset: &str,
        inode_limit: &str,
    ) -> Result<String> {
        let new_link_path = format!("{mount_point}/{fileset}");
        match conn.list_fileset(filesystem, fileset).await {
            Err(err) if err.is_fileset_not_found() => {
                info!(fileset, "primary fileset not found, creating it");
                let mut options = fabricfs_connect::FilesetOptions::default();
                if !inode_limit.is_empty() {
                    options.inode_limit = Some(inode_limit.to_string());
                }
                conn.create_fileset(filesystem, fileset, &options)
                    .await
                    .map_err(|err| {
                        ControllerError::Internal(format!(
                            "unable to create primary fileset {fileset}: {err}"
                        ))
                    })?;
                conn.link_fileset(filesystem, fileset, &new_link_path)
                    .await
                    .map_err(|err| {
                        ControllerError::Internal(format!(
                            "unable to link primary fileset {fileset}: {err}"
                        ))
                    })?;
                Ok(new_link_path)
            }
            Err(err) => Err(err.into()),
            Ok(info) if !info.is_linked() => {
                info!(fileset, "primary fileset not linked, linking it");
                conn.link_fileset(filesystem, fileset, &new_link_path)
                    .await
                    .map_err(|err| {
                        ControllerError::Internal(format!(
                            "unable to link primary fileset {fileset}: {err}"
                        ))
                    })?;
                Ok(new_link_path)
            }
            Ok(info) => Ok(info.path),
        }
    }

    pub fn primary_connector(&self) -> Result<&Arc<dyn ClusterConnector>> {
        self.connectors.get(PRIMARY_CONNECTOR_KEY).ok_or_else(|| {
            ControllerError::Internal("primary connector not present in configuration".to_string())
        })
    }

    pub fn connector_for(&self, cluster_id: &str) -> Result<&Arc<dyn ClusterConnector>> {
        self.connectors.get(cluster_id).ok_or_else(|| {
            ControllerError::Internal(format!(
                "unable to find cluster [{cluster_id}] details in configuration"
            ))
        })
    }

    pub fn validate_capability(&self, capability: RpcType) -> Result<()> {
        if capability == RpcType::Unknown || self.capabilities.contains(&capability) {
            Ok(())
        } else {
            Err(ControllerError::InvalidArgument(
                "invalid controller service request".to_string(),
            ))
        }
    }

    /// Serves the controller service on a Unix domain socket until the
    /// process is stopped.
    pub async fn run(self, socket_path: &Path) -> Result<()> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path).map_err(|err| {
                ControllerError::Internal(format!(
                    "unable to remove stale socket {}: {err}",
                    socket_path.display()
                ))
            })?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                ControllerError::Internal(format!(
                    "unable to create socket directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        info!(
            driver = %self.name,
            version = %self.vendor_version,
            endpoint = %socket_path.display(),
            "starting controller server"
        );

        let listener = UnixListener::bind(socket_path).map_err(|err| {
            ControllerError::Internal(format!(
                "unable to bind {}: {err}",
                socket_path.display()
            ))
        })?;
        let incoming = UnixListenerStream::new(listener);
        let service = ControllerService::new(Arc::new(self));

        Server::builder()
            .add_service(ControllerServer::new(service))
            .serve_with_incoming(incoming)
            .await
            .map_err(|err| ControllerError::Internal(format!("controller server failed: {err}")))
    }
}
