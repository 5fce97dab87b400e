//! The protocol-facing controller service.
//!
//! Every handler decodes/validates its request, resolves cluster and
//! filesystem context through the primary connector, and drives the
//! provisioning engine. Handlers are safe to retry: all backend mutations
//! are idempotent check-then-act steps and nothing is rolled back on a
//! later step's failure.

use std::sync::Arc;

use fabricfs_connect::{
    ClusterConnector, DirectoryOwner, FilesetKind, FilesetOptions, FilesystemDetails,
    FilesystemKind, MountStatus, PlacementPolicy, FILESET_COMMENT,
};
use fabricfs_proto::v1 as csi;
use fabricfs_proto::v1::controller_server::Controller;
use fabricfs_proto::v1::controller_service_capability::rpc::Type as RpcType;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info};

use crate::cluster_cache::ClusterIdentityCache;
use crate::driver::{remote_fs_name, Driver};
use crate::error::{ControllerError, Result};
use crate::fileset::{FilesetEngine, FilesetTarget};
use crate::guard::PendingRequests;
use crate::id::{SnapshotId, StorageClass, VolumeId, VolumeKind, ID_DELIMITER};
use crate::jobs::{classify_outcome, CopyJobTracker, CopyStatus, ReplayDecision};
use crate::lightweight::{create_directory_volume, ensure_symlink};
use crate::snapwindow::{
    confirm_member_in_snapshot, delete_snapshot_metadata, make_snapshot_metadata_dir,
    reusable_group_snapshot, DEFAULT_SNAP_WINDOW_MINUTES, MAX_SNAPSHOTS_PER_FILESET,
};
use crate::version::{
    cluster_version_at_least, fs_supports_tiering, MIN_CLONE_VERSION,
    MIN_CONSISTENCY_GROUP_VERSION, MIN_PERMISSIONS_VERSION, MIN_SNAPSHOT_VERSION,
};
use crate::volume::{unsupported_params, VolumeSpec, ONE_GIB, PARAM_SNAP_WINDOW};

const ENV_SKIP_MOUNT_UNMOUNT: &str = "SKIP_MOUNT_UNMOUNT";
const ENV_SHORTNAME_NODE_MAPPING: &str = "SHORTNAME_NODE_MAPPING";
const ENV_NODE_MAPPING_PREFIX: &str = "FABRICFS_NODE_MAPPING_";
const YES: &str = "yes";

const DEFAULT_POLICY_PARTITION: &str = "csi-defaultRule";

/// Default max-inode allocations the backend hands out; only these are
/// raised automatically when a volume grows past 10 GiB.
const DEFAULT_MAX_INODE_ALLOCATIONS: [u64; 6] =
    [100_096, 100_352, 102_400, 106_496, 114_688, 131_072];

pub struct ControllerService {
    driver: Arc<Driver>,
    pending: PendingRequests,
    vol_copy_jobs: CopyJobTracker,
    snap_copy_jobs: CopyJobTracker,
    cluster_cache: ClusterIdentityCache,
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn shortname(node: &str) -> &str {
    node.split('.').next().unwrap_or(node)
}

fn node_in(nodes: &[String], node: &str, shortname_match: bool) -> bool {
    if shortname_match {
        nodes.iter().any(|n| shortname(n) == shortname(node))
    } else {
        nodes.iter().any(|n| n == node)
    }
}

/// Maps an orchestrator node id to the cluster admin node name, via an
/// optional per-node environment override.
fn node_mapping(node_id: &str) -> String {
    let key = format!(
        "{ENV_NODE_MAPPING_PREFIX}{}",
        node_id.replace(['-', '.'], "_").to_uppercase()
    );
    std::env::var(key).unwrap_or_else(|_| node_id.to_string())
}

fn option_if_set(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl ControllerService {
    pub fn new(driver: Arc<Driver>) -> Self {
        Self {
            driver,
            pending: PendingRequests::new(),
            vol_copy_jobs: CopyJobTracker::new(),
            snap_copy_jobs: CopyJobTracker::new(),
            cluster_cache: ClusterIdentityCache::new(),
        }
    }

    fn capability_check(&self, capability: RpcType, operation: &str) -> Result<()> {
        self.driver.validate_capability(capability).map_err(|err| {
            ControllerError::Internal(format!("{operation} capability validation failed: {err}"))
        })
    }

    // ------------------------------------------------------------------
    // CreateVolume
    // ------------------------------------------------------------------

    async fn do_create_volume(
        &self,
        req: csi::CreateVolumeRequest,
    ) -> Result<csi::CreateVolumeResponse> {
        self.capability_check(RpcType::CreateDeleteVolume, "CreateVolume")?;

        if req.name.is_empty() {
            return Err(ControllerError::InvalidArgument(
                "volume name is a required field".to_string(),
            ));
        }
        if req.name.contains(ID_DELIMITER) {
            return Err(ControllerError::InvalidArgument(format!(
                "volume name [{}] must not contain the character '{ID_DELIMITER}'",
                req.name
            )));
        }
        if req.volume_capabilities.is_empty() {
            return Err(ControllerError::InvalidArgument(
                "volume capabilities is a required field".to_string(),
            ));
        }
        for capability in &req.volume_capabilities {
            if matches!(
                capability.access_type,
                Some(csi::volume_capability::AccessType::Block(_))
            ) {
                return Err(ControllerError::Unimplemented(
                    "block volume is not supported".to_string(),
                ));
            }
            if let Some(mode) = &capability.access_mode {
                if mode.mode() == csi::volume_capability::access_mode::Mode::MultiNodeReaderOnly {
                    return Err(ControllerError::Unimplemented(
                        "volume with access mode ReadOnlyMany is not supported".to_string(),
                    ));
                }
            }
        }

        let invalid = unsupported_params(&req.parameters);
        if !invalid.is_empty() {
            return Err(ControllerError::InvalidArgument(format!(
                "the parameter(s) not supported in storageClass: {}",
                invalid.join(", ")
            )));
        }

        let mut spec = VolumeSpec::from_params(&req.parameters)?;
        spec.name = req.name.clone();
        spec.set_requested_size(
            req.capacity_range
                .as_ref()
                .map(|r| r.required_bytes)
                .unwrap_or(0),
        );

        // Content source, if this is a clone or restore.
        let mut vol_source: Option<VolumeId> = None;
        let mut snap_source: Option<SnapshotId> = None;
        if let Some(content) = &req.volume_content_source {
            match &content.r#type {
                Some(csi::volume_content_source::Type::Volume(src)) => {
                    vol_source = Some(VolumeId::decode(&src.volume_id)?);
                }
                Some(csi::volume_content_source::Type::Snapshot(src)) => {
                    snap_source = Some(SnapshotId::decode(&src.snapshot_id)?);
                }
                None => {}
            }
        }

        let primary_conn = self.driver.primary_connector()?.clone();
        let primary = &self.driver.primary;

        // The primary fileset must be linked before any volume work.
        info!(volume = %spec.name, fileset = %primary.fileset, "checking primary fileset link");
        let primary_fileset = primary_conn
            .list_fileset(&primary.filesystem, &primary.fileset)
            .await
            .map_err(|err| {
                ControllerError::Internal(format!(
                    "unable to get details of primary fileset [{}]. Error : [{err}]",
                    primary.fileset
                ))
            })?;
        if !primary_fileset.is_linked() {
            return Err(ControllerError::Internal(format!(
                "primary fileset [{}] is not linked",
                primary.fileset
            )));
        }

        if primary.filesystem != spec.local_filesystem {
            let mount = primary_conn
                .filesystem_mount_details(&primary.filesystem)
                .await
                .map_err(|err| {
                    ControllerError::Internal(format!(
                        "unable to get filesystem mount details for {} on primary cluster. \
                         Error: {err}",
                        primary.filesystem
                    ))
                })?;
            if mount.status != MountStatus::Mounted {
                return Err(ControllerError::Internal(format!(
                    "primary filesystem {} is not mounted on the management node of the primary \
                     cluster",
                    primary.filesystem
                )));
            }
        }

        let vol_fs_info = match primary_conn.filesystem_details(&spec.local_filesystem).await {
            Ok(details) => details,
            Err(err) if err.is_unknown_filesystem() => {
                return Err(ControllerError::Internal(format!(
                    "filesystem {} is not known to the primary cluster. Error: {err}",
                    spec.local_filesystem
                )));
            }
            Err(err) => {
                return Err(ControllerError::Internal(format!(
                    "unable to get details for filesystem [{}] on the primary cluster. \
                     Error: {err}",
                    spec.local_filesystem
                )));
            }
        };
        if vol_fs_info.mount.status != MountStatus::Mounted {
            return Err(ControllerError::Internal(format!(
                "volume filesystem {} is not mounted on the management node of the primary \
                 cluster",
                spec.local_filesystem
            )));
        }

        // The named filesystem may be a remote mount; filesets are created
        // on the owning cluster under the owning-cluster name.
        if spec.is_fileset_based {
            spec.backend_filesystem = remote_fs_name(&vol_fs_info.mount.remote_device_name);
        } else {
            spec.backend_filesystem = spec.local_filesystem.clone();
        }

        let mut remote_cluster_id = String::new();
        if spec.cluster_id.is_empty() && vol_fs_info.kind == FilesystemKind::Remote {
            let owning_cluster = vol_fs_info
                .mount
                .remote_device_name
                .split(':')
                .next()
                .unwrap_or("")
                .to_string();
            info!(
                filesystem = %vol_fs_info.name,
                cluster = %owning_cluster,
                "filesystem is remotely mounted, resolving owning cluster"
            );
            remote_cluster_id = self
                .cluster_cache
                .resolve(
                    &owning_cluster,
                    &self.driver.settings.cluster_ids(),
                    &self.driver.connectors,
                )
                .await?;
        }

        let conn = if spec.is_fileset_based {
            if spec.cluster_id.is_empty() {
                spec.cluster_id = if vol_fs_info.kind == FilesystemKind::Remote {
                    remote_cluster_id
                } else {
                    primary.cluster_id.clone()
                };
            }
            self.driver.connector_for(&spec.cluster_id)?.clone()
        } else {
            spec.cluster_id = primary.cluster_id.clone();
            primary_conn.clone()
        };

        if spec.storage_class == StorageClass::Advanced {
            if !cluster_version_at_least(&conn, MIN_CONSISTENCY_GROUP_VERSION).await? {
                return Err(ControllerError::FailedPrecondition(
                    "the minimum required cluster version for consistency group support is 5.1.3-0"
                        .to_string(),
                ));
            }
            if spec.consistency_group.is_empty() {
                if spec.pvc_namespace.is_empty() {
                    return Err(ControllerError::InvalidArgument(
                        "consistencyGroup not specified and caller namespace unknown".to_string(),
                    ));
                }
                spec.consistency_group = format!("{}-{}", spec.cluster_id, spec.pvc_namespace);
            }
        }

        let clone_source_fs = match &vol_source {
            Some(source) => Some(self.validate_clone_request(&spec, source, &vol_fs_info).await?),
            None => None,
        };
        let snap_source_fs = match &snap_source {
            Some(source) => Some(self.validate_snapshot_source(&spec, source).await?),
            None => None,
        };

        spec.apply_compression_suffix();
        if spec.is_fileset_based && !spec.tier.is_empty() {
            self.ensure_tier_policies(&conn, &mut spec, &vol_fs_info).await?;
        }

        if vol_source.is_some() {
            if let ReplayDecision::AlreadyComplete(volume_id) =
                self.vol_copy_jobs.check_replay(&spec.name, "volume cloning")?
            {
                info!(volume = %spec.name, "volume cloning request has already completed");
                return Ok(Self::create_volume_response(&req, &spec, volume_id));
            }
        }
        if snap_source.is_some() {
            if let ReplayDecision::AlreadyComplete(volume_id) =
                self.snap_copy_jobs.check_replay(&spec.name, "snapshot copy")?
            {
                info!(volume = %spec.name, "snapshot copy request has already completed");
                return Ok(Self::create_volume_response(&req, &spec, volume_id));
            }
        }

        if !spec.permissions.is_empty() {
            let supported = cluster_version_at_least(&conn, MIN_PERMISSIONS_VERSION)
                .await
                .map_err(|err| {
                    ControllerError::Internal(format!(
                        "the minimum cluster version check for permissions failed with error {err}"
                    ))
                })?;
            if !supported {
                return Err(ControllerError::FailedPrecondition(
                    "the minimum required cluster version for permissions support is 5.1.1-2"
                        .to_string(),
                ));
            }
        }

        // From here on, at most one request may work on this name.
        let _guard = self.pending.try_begin(&spec.name, spec.size_bytes)?;

        let target_path = if spec.is_fileset_based {
            self.create_fileset_volume(&conn, &spec).await?
        } else {
            create_directory_volume(
                &primary_conn,
                &spec.local_filesystem,
                &spec.dir_base_path,
                &spec.name,
                &DirectoryOwner {
                    uid: spec.uid.clone(),
                    gid: spec.gid.clone(),
                    permissions: option_if_set(&spec.permissions),
                },
            )
            .await?
        };

        if spec.storage_class == StorageClass::Classic {
            let link_rel_path = format!("{}/{}", primary.symlink_relative_path, spec.name);
            ensure_symlink(
                &primary_conn,
                &primary.filesystem,
                &spec.local_filesystem,
                &target_path,
                &link_rel_path,
            )
            .await?;
        }

        let volume_id = self
            .generate_volume_id(&spec, &vol_fs_info.uuid, &target_path)
            .await?;
        let encoded = volume_id.encode();

        if let (Some(source), Some(source_fs)) = (&vol_source, &clone_source_fs) {
            self.copy_volume_content(&spec, source, source_fs, &vol_fs_info, &target_path, &encoded)
                .await?;
        }
        if let (Some(source), Some(source_fs)) = (&snap_source, &snap_source_fs) {
            self.copy_snapshot_content(
                &spec,
                source,
                source_fs,
                &vol_fs_info,
                &target_path,
                &encoded,
            )
            .await?;
        }

        Ok(Self::create_volume_response(&req, &spec, encoded))
    }

    fn create_volume_response(
        req: &csi::CreateVolumeRequest,
        spec: &VolumeSpec,
        volume_id: String,
    ) -> csi::CreateVolumeResponse {
        csi::CreateVolumeResponse {
            volume: Some(csi::Volume {
                volume_id,
                capacity_bytes: spec.size_bytes as i64,
                volume_context: req.parameters.clone(),
                content_source: req.volume_content_source.clone(),
                accessible_topology: Vec::new(),
            }),
        }
    }

    async fn create_fileset_volume(
        &self,
        conn: &Arc<dyn ClusterConnector>,
        spec: &VolumeSpec,
    ) -> Result<String> {
        let fs_details = match conn.filesystem_details(&spec.backend_filesystem).await {
            Ok(details) => details,
            Err(err) if err.is_unknown_filesystem() => {
                return Err(ControllerError::Internal(format!(
                    "filesystem {} is not known to cluster {}. Error: {err}",
                    spec.backend_filesystem, spec.cluster_id
                )));
            }
            Err(err) => {
                return Err(ControllerError::Internal(format!(
                    "unable to check type of filesystem [{}]. Error: {err}",
                    spec.backend_filesystem
                )));
            }
        };

        if fs_details.kind == FilesystemKind::Remote {
            return Err(ControllerError::Internal(format!(
                "filesystem [{}] is not local to cluster [{}]",
                spec.backend_filesystem, spec.cluster_id
            )));
        }

        if self.driver.primary.cluster_id != spec.cluster_id
            && fs_details.mount.status != MountStatus::Mounted
        {
            return Err(ControllerError::Internal(format!(
                "filesystem {} in cluster {} is not mounted",
                spec.backend_filesystem, spec.cluster_id
            )));
        }

        if spec.size_bytes != 0 {
            let quota_enabled = conn
                .is_quota_enabled(&spec.backend_filesystem)
                .await
                .unwrap_or(false);
            if !quota_enabled {
                return Err(ControllerError::Internal(format!(
                    "quota not enabled for filesystem {} of cluster {}",
                    spec.backend_filesystem, spec.cluster_id
                )));
            }
        }

        let engine = FilesetEngine::new(conn);
        let dir_owner = DirectoryOwner {
            uid: spec.uid.clone(),
            gid: spec.gid.clone(),
            permissions: option_if_set(&spec.permissions),
        };

        if spec.storage_class == StorageClass::Advanced {
            // Phase one: the group's independent fileset. Root-owned, with
            // an inode budget sized for many member volumes. A failure in
            // phase two leaves it behind for the next sibling.
            let group_target = FilesetTarget {
                filesystem: spec.backend_filesystem.clone(),
                name: spec.consistency_group.clone(),
                kind: Some(FilesetKind::Independent),
                parent: None,
                options: FilesetOptions {
                    kind: Some(FilesetKind::Independent),
                    parent_fileset: None,
                    owner_uid: Some("0".to_string()),
                    owner_gid: Some("0".to_string()),
                    permissions: None,
                    inode_limit: Some(
                        option_if_set(&spec.inode_limit).unwrap_or_else(|| "1M".to_string()),
                    ),
                    comment: FILESET_COMMENT.to_string(),
                },
                quota_bytes: 0,
                data_dir: false,
                data_dir_suffix: false,
                dir_owner: DirectoryOwner::root(),
                mount_point: fs_details.mount.mount_point.clone(),
            };
            info!(group = %spec.consistency_group, "ensuring consistency group fileset");
            engine.ensure(&group_target).await?;

            // Phase two: the member's dependent fileset.
            let member_target = FilesetTarget {
                filesystem: spec.backend_filesystem.clone(),
                name: spec.name.clone(),
                kind: Some(FilesetKind::Dependent),
                parent: Some(spec.consistency_group.clone()),
                options: FilesetOptions {
                    kind: Some(FilesetKind::Dependent),
                    parent_fileset: Some(spec.consistency_group.clone()),
                    owner_uid: option_if_set(&spec.uid),
                    owner_gid: option_if_set(&spec.gid),
                    permissions: option_if_set(&spec.permissions),
                    inode_limit: option_if_set(&spec.inode_limit),
                    comment: FILESET_COMMENT.to_string(),
                },
                quota_bytes: spec.size_bytes,
                data_dir: true,
                data_dir_suffix: false,
                dir_owner,
                mount_point: fs_details.mount.mount_point.clone(),
            };
            info!(volume = %spec.name, "ensuring consistency group member fileset");
            engine.ensure(&member_target).await
        } else {
            let target = FilesetTarget {
                filesystem: spec.backend_filesystem.clone(),
                name: spec.name.clone(),
                kind: spec.fileset_type,
                parent: option_if_set(&spec.parent_fileset),
                options: FilesetOptions {
                    kind: spec.fileset_type,
                    parent_fileset: option_if_set(&spec.parent_fileset),
                    owner_uid: option_if_set(&spec.uid),
                    owner_gid: option_if_set(&spec.gid),
                    permissions: option_if_set(&spec.permissions),
                    inode_limit: Some(spec.effective_inode_limit()),
                    comment: FILESET_COMMENT.to_string(),
                },
                quota_bytes: spec.size_bytes,
                data_dir: true,
                data_dir_suffix: true,
                dir_owner,
                mount_point: fs_details.mount.mount_point.clone(),
            };
            info!(volume = %spec.name, "ensuring fileset");
            engine.ensure(&target).await
        }
    }

    async fn generate_volume_id(
        &self,
        spec: &VolumeSpec,
        filesystem_uuid: &str,
        target_path: &str,
    ) -> Result<VolumeId> {
        let primary = &self.driver.primary;
        let (kind, fileset_name, consistency_group, path) = match spec.storage_class {
            StorageClass::Advanced => {
                let primary_conn = self.driver.primary_connector()?;
                let mount = primary_conn
                    .filesystem_mount_details(&spec.local_filesystem)
                    .await
                    .map_err(|_| {
                        ControllerError::Internal(format!(
                            "unable to get mount info for FS [{}] in cluster",
                            spec.local_filesystem
                        ))
                    })?;
                (
                    VolumeKind::DependentFileset,
                    spec.name.clone(),
                    spec.consistency_group.clone(),
                    format!("{}/{}", mount.mount_point, target_path),
                )
            }
            StorageClass::Classic => {
                let path = format!("{}/{}", primary.symlink_absolute_path, spec.name);
                if spec.is_fileset_based {
                    let kind = if spec.fileset_type == Some(FilesetKind::Independent) {
                        VolumeKind::IndependentFileset
                    } else {
                        VolumeKind::DependentFileset
                    };
                    (kind, spec.name.clone(), String::new(), path)
                } else {
                    (VolumeKind::Directory, String::new(), String::new(), path)
                }
            }
        };

        Ok(VolumeId {
            storage_class: spec.storage_class,
            kind,
            cluster_id: spec.cluster_id.clone(),
            filesystem_uuid: filesystem_uuid.to_string(),
            consistency_group,
            fileset_name,
            path,
        })
    }

    async fn ensure_tier_policies(
        &self,
        conn: &Arc<dyn ClusterConnector>,
        spec: &mut VolumeSpec,
        vol_fs_info: &FilesystemDetails,
    ) -> Result<()> {
        if !fs_supports_tiering(&vol_fs_info.version) {
            // The primary cluster's view of a remote filesystem can lag;
            // re-check against the owning cluster before giving up.
            let fresh = conn.filesystem_details(&spec.backend_filesystem).await?;
            if !fs_supports_tiering(&fresh.version) {
                return Err(ControllerError::FailedPrecondition(
                    "the minimum required filesystem format version for tiering support is 27.00"
                        .to_string(),
                ));
            }
        }

        let tier_present = conn.tier_exists(&spec.backend_filesystem, &spec.tier).await?;
        if !tier_present {
            return Err(ControllerError::NotFound(format!(
                "tier [{}] not found on filesystem [{}]",
                spec.tier, spec.backend_filesystem
            )));
        }

        let tier = spec.tier.clone();
        let policy = PlacementPolicy {
            policy: format!(
                "RULE 'csi-T{tier}' SET POOL '{tier}' WHERE FILESET_NAME LIKE 'pvc-%-T{tier}csi%'"
            ),
            priority: -5,
            partition: format!("csi-T{tier}"),
        };
        spec.apply_tier_suffix();
        conn.set_filesystem_policy(&spec.backend_filesystem, &policy)
            .await
            .map_err(|err| {
                ControllerError::Internal(format!(
                    "setting placement policy for tier [{tier}] failed: {err}"
                ))
            })?;

        // A SET POOL rule with no default rule beneath it strands files
        // that match no rule; install a catch-all partition once.
        let default_present = conn
            .policy_partition_exists(&spec.backend_filesystem, DEFAULT_POLICY_PARTITION)
            .await?;
        if !default_present {
            info!("setting default policy partition rule");
            let data_tier = conn
                .first_data_tier(&spec.backend_filesystem)
                .await
                .map_err(|_| {
                    ControllerError::Internal(format!(
                        "tier info request could not be completed: filesystemName {}",
                        spec.backend_filesystem
                    ))
                })?;
            let default_policy = PlacementPolicy {
                policy: format!("RULE '{DEFAULT_POLICY_PARTITION}' SET POOL '{data_tier}'"),
                priority: 5,
                partition: DEFAULT_POLICY_PARTITION.to_string(),
            };
            conn.set_filesystem_policy(&spec.backend_filesystem, &default_policy)
                .await
                .map_err(|err| {
                    ControllerError::Internal(format!("setting default policy failed: {err}"))
                })?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Clone / restore
    // ------------------------------------------------------------------

    async fn validate_clone_request(
        &self,
        spec: &VolumeSpec,
        source: &VolumeId,
        vol_fs_info: &FilesystemDetails,
    ) -> Result<String> {
        let conn = self.driver.connector_for(&source.cluster_id)?;

        if !cluster_version_at_least(conn, MIN_CLONE_VERSION).await? {
            return Err(ControllerError::FailedPrecondition(
                "the minimum required cluster version for volume cloning support is 5.1.2-1"
                    .to_string(),
            ));
        }
        if spec.cluster_id != source.cluster_id {
            return Err(ControllerError::Unimplemented(
                "cloning of volume across clusters is not supported".to_string(),
            ));
        }
        if spec.storage_class != source.storage_class {
            return Err(ControllerError::Unimplemented(
                "cloning of volumes between different versions of storageClass is not supported"
                    .to_string(),
            ));
        }
        if spec.is_fileset_based != source.is_fileset_based() {
            return Err(ControllerError::Unimplemented(
                "cloning of directory based volume to fileset based volume or vice versa is not \
                 supported"
                    .to_string(),
            ));
        }
        if !spec.is_fileset_based && vol_fs_info.kind == FilesystemKind::Remote {
            return Err(ControllerError::Unimplemented(
                "volume cloning for directories on a remote filesystem is not supported"
                    .to_string(),
            ));
        }

        let source_fs = conn
            .filesystem_name_from_uuid(&source.filesystem_uuid)
            .await
            .map_err(|err| {
                ControllerError::Internal(format!(
                    "unable to get filesystem name for id [{}] and clusterId [{}]. Error [{err}]",
                    source.filesystem_uuid, source.cluster_id
                ))
            })?;

        let source_details = conn.filesystem_details(&source_fs).await.map_err(|_| {
            ControllerError::Internal(format!(
                "error in getting filesystem mount details for {source_fs}"
            ))
        })?;

        if !source.is_fileset_based() && source_details.kind == FilesystemKind::Remote {
            return Err(ControllerError::Unimplemented(
                "cloning of directory based volume belonging to a remote cluster is not supported"
                    .to_string(),
            ));
        }

        if source_fs != spec.backend_filesystem && source_details.mount.status != MountStatus::Mounted
        {
            return Err(ControllerError::Internal(format!(
                "filesystem {source_fs} is not mounted on the management node"
            )));
        }

        if source.is_fileset_based() {
            let info = conn.list_fileset(&source_fs, &source.fileset_name).await.map_err(|_| {
                ControllerError::Internal(format!(
                    "unable to get fileset link information for [{}]",
                    source.fileset_name
                ))
            })?;
            if !info.is_linked() {
                return Err(ControllerError::Internal(format!(
                    "fileset [{}] of source volume is not linked",
                    source.fileset_name
                )));
            }
        }

        self.check_node_class(conn, spec).await?;
        Ok(source_fs)
    }

    async fn validate_snapshot_source(
        &self,
        spec: &VolumeSpec,
        source: &SnapshotId,
    ) -> Result<String> {
        let conn = self.driver.connector_for(&source.cluster_id)?;

        if spec.cluster_id != source.cluster_id {
            return Err(ControllerError::Unimplemented(
                "creating volume from snapshot across clusters is not supported".to_string(),
            ));
        }
        if !cluster_version_at_least(conn, MIN_SNAPSHOT_VERSION).await? {
            return Err(ControllerError::FailedPrecondition(
                "the minimum required cluster version for snapshot support is 5.1.1-0".to_string(),
            ));
        }

        self.check_node_class(conn, spec).await?;

        let source_fs = conn
            .filesystem_name_from_uuid(&source.filesystem_uuid)
            .await
            .map_err(|err| {
                ControllerError::Internal(format!(
                    "unable to get filesystem name for id [{}] and clusterId [{}]. Error [{err}]",
                    source.filesystem_uuid, source.cluster_id
                ))
            })?;

        if source_fs != spec.backend_filesystem {
            let details = conn.filesystem_details(&source_fs).await.map_err(|_| {
                ControllerError::Internal(format!(
                    "error in getting filesystem mount details for {source_fs}"
                ))
            })?;
            if details.mount.status != MountStatus::Mounted {
                return Err(ControllerError::Internal(format!(
                    "filesystem {source_fs} is not mounted on the management node"
                )));
            }
        }

        let fileset_to_check = if source.storage_class == StorageClass::Advanced {
            &source.consistency_group
        } else {
            &source.fileset_name
        };
        let info = conn.list_fileset(&source_fs, fileset_to_check).await.map_err(|_| {
            ControllerError::Internal(format!(
                "unable to get fileset link information for [{fileset_to_check}]"
            ))
        })?;
        if !info.is_linked() {
            return Err(ControllerError::Internal(format!(
                "fileset [{fileset_to_check}] of source snapshot is not linked"
            )));
        }

        let snapshot_present = conn
            .snapshot_exists(&source_fs, fileset_to_check, &source.snapshot_name)
            .await
            .map_err(|_| {
                ControllerError::Internal(format!(
                    "unable to get snapshot information for [{}]",
                    source.snapshot_name
                ))
            })?;
        if !snapshot_present {
            return Err(ControllerError::Internal(format!(
                "snapshot [{}] does not exist for fileset [{fileset_to_check}]",
                source.snapshot_name
            )));
        }

        Ok(source_fs)
    }

    async fn check_node_class(
        &self,
        conn: &Arc<dyn ClusterConnector>,
        spec: &VolumeSpec,
    ) -> Result<()> {
        if spec.node_class.is_empty() {
            return Ok(());
        }
        let valid = conn.is_valid_node_class(&spec.node_class).await?;
        if !valid {
            return Err(ControllerError::NotFound(format!(
                "nodeclass [{}] not found on cluster [{}]",
                spec.node_class, spec.cluster_id
            )));
        }
        Ok(())
    }

    /// Resolves the destination's mount point on the source cluster and
    /// returns the absolute copy target.
    async fn copy_target_path(
        &self,
        conn: &Arc<dyn ClusterConnector>,
        dest_fs_info: &FilesystemDetails,
        target_path: &str,
    ) -> Result<String> {
        let dest_fs = conn.filesystem_name_from_uuid(&dest_fs_info.uuid).await?;
        let dest_details = conn.filesystem_details(&dest_fs).await?;
        Ok(format!(
            "{}/{}",
            dest_details.mount.mount_point, target_path
        ))
    }

    async fn copy_volume_content(
        &self,
        spec: &VolumeSpec,
        source: &VolumeId,
        source_fs: &str,
        dest_fs_info: &FilesystemDetails,
        target_path: &str,
        volume_id: &str,
    ) -> Result<()> {
        let conn = self.driver.connector_for(&source.cluster_id)?.clone();
        let full_target = self.copy_target_path(&conn, dest_fs_info, target_path).await?;

        let launch = if spec.is_fileset_based {
            let source_path = if source.storage_class == StorageClass::Advanced {
                "/".to_string()
            } else {
                format!("{}-data", source.fileset_name)
            };
            conn.copy_fileset_path(
                source_fs,
                &source.fileset_name,
                &source_path,
                &full_target,
                &spec.node_class,
            )
            .await
        } else {
            let rel = source
                .path
                .replacen(&self.driver.primary.mount_point, "", 1)
                .trim_matches(|c| c == '!' || c == '/')
                .to_string();
            conn.copy_directory_path(source_fs, &rel, &full_target, &spec.node_class)
                .await
        };
        let job = launch.map_err(|err| {
            ControllerError::Internal(format!("failed to clone volume from volume. Error: [{err}]"))
        })?;

        self.vol_copy_jobs
            .store(&spec.name, CopyStatus::Running, volume_id);

        let outcome = conn.wait_for_copy_job(&job).await;
        let status = classify_outcome(&outcome);
        self.vol_copy_jobs.store(&spec.name, status, volume_id);

        if status == CopyStatus::Completed {
            info!(volume = %spec.name, "volume copy completed");
            Ok(())
        } else {
            let message = match &outcome {
                Err(err) => err.to_string(),
                Ok(report) => report.message.clone(),
            };
            error!(volume = %spec.name, status = ?status, %message, "unable to copy volume");
            Err(ControllerError::Internal(format!(
                "unable to copy volume {}: {message}",
                spec.name
            )))
        }
    }

    async fn copy_snapshot_content(
        &self,
        spec: &VolumeSpec,
        source: &SnapshotId,
        source_fs: &str,
        dest_fs_info: &FilesystemDetails,
        target_path: &str,
        volume_id: &str,
    ) -> Result<()> {
        let conn = self.driver.connector_for(&source.cluster_id)?.clone();
        let full_target = self.copy_target_path(&conn, dest_fs_info, target_path).await?;

        let (fileset_for_copy, source_path) = if source.storage_class == StorageClass::Advanced {
            (
                source.consistency_group.clone(),
                format!("/{}", source.fileset_name),
            )
        } else {
            (source.fileset_name.clone(), source.path.clone())
        };

        let job = conn
            .copy_snapshot_path(
                source_fs,
                &fileset_for_copy,
                &source.snapshot_name,
                &source_path,
                &full_target,
                &spec.node_class,
            )
            .await
            .map_err(|err| {
                ControllerError::Internal(format!(
                    "failed to create volume from snapshot {}: [{err}]",
                    source.snapshot_name
                ))
            })?;

        self.snap_copy_jobs
            .store(&spec.name, CopyStatus::Running, volume_id);

        let outcome = conn.wait_for_copy_job(&job).await;
        let status = classify_outcome(&outcome);
        self.snap_copy_jobs.store(&spec.name, status, volume_id);

        if status == CopyStatus::Completed {
            info!(volume = %spec.name, snapshot = %source.snapshot_name, "snapshot copy completed");
            Ok(())
        } else {
            let message = match &outcome {
                Err(err) => err.to_string(),
                Ok(report) => report.message.clone(),
            };
            error!(
                volume = %spec.name,
                snapshot = %source.snapshot_name,
                status = ?status,
                %message,
                "unable to copy snapshot"
            );
            Err(ControllerError::Internal(format!(
                "unable to copy snapshot {}: {message}",
                source.snapshot_name
            )))
        }
    }

    // ------------------------------------------------------------------
    // DeleteVolume
    // ------------------------------------------------------------------

    async fn do_delete_volume(
        &self,
        req: csi::DeleteVolumeRequest,
    ) -> Result<csi::DeleteVolumeResponse> {
        self.capability_check(RpcType::CreateDeleteVolume, "DeleteVolume")?;

        if req.volume_id.is_empty() {
            return Err(ControllerError::InvalidArgument(
                "volume id is missing".to_string(),
            ));
        }
        let volume_id = VolumeId::decode(&req.volume_id)?;
        debug!(?volume_id, "deleting volume");

        let conn = self.driver.connector_for(&volume_id.cluster_id)?.clone();
        let primary_conn = self.driver.primary_connector()?.clone();
        let primary = &self.driver.primary;

        let fs_name = primary_conn
            .filesystem_name_from_uuid(&volume_id.filesystem_uuid)
            .await
            .map_err(|err| {
                ControllerError::Internal(format!(
                    "unable to get filesystem name for id [{}] and clusterId [{}]. Error [{err}]",
                    volume_id.filesystem_uuid, volume_id.cluster_id
                ))
            })?;
        let mount_info = primary_conn
            .filesystem_mount_details(&fs_name)
            .await
            .map_err(|_| {
                ControllerError::Internal(format!(
                    "unable to get mount info for FS [{fs_name}] in primary cluster"
                ))
            })?;

        let rel_path = if volume_id.storage_class == StorageClass::Advanced {
            volume_id.path.replacen(&mount_info.mount_point, "", 1)
        } else {
            volume_id.path.replacen(&primary.mount_point, "", 1)
        };
        let rel_path = rel_path.trim_matches(|c| c == '!' || c == '/').to_string();

        if volume_id.is_fileset_based() {
            let backend_fs = remote_fs_name(&mount_info.remote_device_name);
            let fileset = volume_id.fileset_name.clone();
            if !fileset.is_empty() {
                // Only delete the fileset this volume was actually built on.
                let pv_name = basename(&rel_path);
                if pv_name == fileset {
                    let already_deleted = self
                        .delete_fileset_volume(&conn, &backend_fs, &fileset, &volume_id)
                        .await?;

                    if !already_deleted && volume_id.storage_class != StorageClass::Advanced {
                        primary_conn
                            .delete_symlink(&primary.filesystem, &rel_path)
                            .await
                            .map_err(|err| {
                                ControllerError::Internal(format!(
                                    "unable to delete symlink [{}:{rel_path}] Error [{err}]",
                                    primary.filesystem
                                ))
                            })?;
                    }

                    if volume_id.storage_class == StorageClass::Advanced {
                        self.delete_group_fileset(&conn, &backend_fs, &volume_id).await?;
                    }
                    return Ok(csi::DeleteVolumeResponse {});
                }
                info!(
                    pv = pv_name,
                    fileset = %fileset,
                    "pv name from path does not match fileset name, skipping fileset delete"
                );
            }
        } else {
            match primary_conn
                .delete_directory(&primary.filesystem, &rel_path, false)
                .await
            {
                Ok(()) => {}
                Err(err) if err.is_directory_absent() => {}
                Err(err) => {
                    return Err(ControllerError::Internal(format!(
                        "unable to delete directory using FS [{fs_name}] relative path \
                         [{rel_path}]. Error [{err}]"
                    )));
                }
            }
        }

        if volume_id.storage_class != StorageClass::Advanced {
            primary_conn
                .delete_symlink(&primary.filesystem, &rel_path)
                .await
                .map_err(|err| {
                    ControllerError::Internal(format!(
                        "unable to delete symlink [{}:{rel_path}] Error [{err}]",
                        primary.filesystem
                    ))
                })?;
        }

        Ok(csi::DeleteVolumeResponse {})
    }

    /// Deletes a volume fileset; `Ok(true)` means it was already gone.
    /// A fileset that still carries snapshots is never deleted.
    async fn delete_fileset_volume(
        &self,
        conn: &Arc<dyn ClusterConnector>,
        filesystem: &str,
        fileset: &str,
        volume_id: &VolumeId,
    ) -> Result<bool> {
        let snapshots = match conn.list_fileset_snapshots(filesystem, fileset).await {
            Ok(list) => list,
            Err(err) if err.is_fileset_not_found() => {
                debug!(fileset, "fileset seems already deleted");
                return Ok(true);
            }
            Err(err) => {
                return Err(ControllerError::Internal(format!(
                    "unable to list snapshots for fileset [{fileset}]. Error: [{err}]"
                )));
            }
        };
        if !snapshots.is_empty() {
            return Err(ControllerError::Internal(format!(
                "volume fileset [{fileset}] contains one or more snapshots, delete snapshots first"
            )));
        }

        match conn.delete_fileset(filesystem, fileset).await {
            Ok(()) => Ok(false),
            Err(err) if err.is_fileset_not_found() => {
                debug!(fileset, "fileset seems already deleted");
                Ok(true)
            }
            Err(err) => Err(ControllerError::Internal(format!(
                "unable to delete fileset [{fileset}] for FS [{filesystem}] and clusterId [{}]. \
                 Error : [{err}]",
                volume_id.cluster_id
            ))),
        }
    }

    /// Deletes the group's independent fileset once no member filesets
    /// share its inode space; foreign filesets are left alone.
    async fn delete_group_fileset(
        &self,
        conn: &Arc<dyn ClusterConnector>,
        filesystem: &str,
        volume_id: &VolumeId,
    ) -> Result<()> {
        let group = &volume_id.consistency_group;
        info!(group = %group, "trying to delete consistency group fileset");

        let info = match conn.list_fileset(filesystem, group).await {
            Ok(info) => info,
            Err(err) if err.is_fileset_not_found() => {
                debug!(group = %group, "group fileset seems already deleted");
                return Ok(());
            }
            Err(err) => {
                return Err(ControllerError::Internal(format!(
                    "unable to list fileset [{group}]. Error: [{err}]"
                )));
            }
        };

        if info.comment != FILESET_COMMENT {
            info!(
                group = %group,
                "consistency group fileset not created by the FabricFS CSI driver, cannot delete it"
            );
            return Ok(());
        }

        let siblings = conn
            .filesets_in_inode_space(filesystem, info.inode_space)
            .await
            .map_err(|err| {
                ControllerError::Internal(format!(
                    "listing of filesets for filesystem: [{filesystem}] failed. Error: [{err}]"
                ))
            })?;
        if siblings.len() > 1 {
            debug!(group = %group, "at least one member fileset remains, keeping group fileset");
            return Ok(());
        }

        self.delete_fileset_volume(conn, filesystem, group, volume_id).await?;
        info!(group = %group, "deleted consistency group fileset");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Publish / unpublish
    // ------------------------------------------------------------------

    async fn do_controller_publish_volume(
        &self,
        req: csi::ControllerPublishVolumeRequest,
    ) -> Result<csi::ControllerPublishVolumeResponse> {
        self.capability_check(RpcType::PublishUnpublishVolume, "ControllerPublishVolume")?;

        if req.node_id.is_empty() {
            return Err(ControllerError::InvalidArgument(
                "node id not present".to_string(),
            ));
        }
        if req.volume_id.is_empty() {
            return Err(ControllerError::InvalidArgument(
                "volume id not present".to_string(),
            ));
        }
        let volume_id = VolumeId::decode(&req.volume_id).map_err(|_| {
            ControllerError::InvalidArgument(
                "ControllerPublishVolume : volume id is not in proper format".to_string(),
            )
        })?;

        let primary_conn = self.driver.primary_connector()?.clone();
        let primary = &self.driver.primary;

        let skip_mount_unmount =
            std::env::var(ENV_SKIP_MOUNT_UNMOUNT).unwrap_or_else(|_| YES.to_string());
        let shortname_mapping = std::env::var(ENV_SHORTNAME_NODE_MAPPING)
            .map(|v| v == YES)
            .unwrap_or(false);

        let fs_name = primary_conn
            .filesystem_name_from_uuid(&volume_id.filesystem_uuid)
            .await
            .map_err(|err| {
                ControllerError::Internal(format!(
                    "error in getting filesystem name for filesystem id of {}. Error [{err}]",
                    volume_id.filesystem_uuid
                ))
            })?;

        let primary_mount = primary_conn
            .filesystem_mount_details(&primary.filesystem)
            .await
            .map_err(|err| {
                ControllerError::Internal(format!(
                    "error in getting filesystem mount details for {}. Error [{err}]",
                    primary.filesystem
                ))
            })?;

        let node = node_mapping(&req.node_id);
        info!(node = %node, requested = %req.node_id, "publish node mapping");
        let primary_mounted = node_in(&primary_mount.nodes_mounted, &node, shortname_mapping);

        let volume_path = &volume_id.path;
        let volume_mounted = if volume_id.storage_class == StorageClass::Advanced
            || primary.filesystem != fs_name
        {
            let fs_mount = primary_conn
                .filesystem_mount_details(&fs_name)
                .await
                .map_err(|err| {
                    ControllerError::Internal(format!(
                        "error in getting filesystem mount details for {fs_name}. Error [{err}]"
                    ))
                })?;

            if volume_id.storage_class == StorageClass::Advanced {
                if !volume_path.starts_with(&fs_mount.mount_point) {
                    return Err(ControllerError::Internal(format!(
                        "volume path {volume_path} is not part of the filesystem {fs_name}"
                    )));
                }
            } else if !volume_path.starts_with(&fs_mount.mount_point)
                && !volume_path.starts_with(&primary_mount.mount_point)
            {
                return Err(ControllerError::Internal(format!(
                    "volume path {volume_path} is not part of the filesystem {} or {fs_name}",
                    primary.filesystem
                )));
            }

            node_in(&fs_mount.nodes_mounted, &node, shortname_mapping)
        } else {
            if !volume_path.starts_with(&primary_mount.mount_point) {
                return Err(ControllerError::Internal(format!(
                    "volume path {volume_path} is not part of the filesystem {}",
                    primary.filesystem
                )));
            }
            primary_mounted
        };

        info!(
            primary_mounted,
            volume_mounted,
            node = %node,
            "publish mount status"
        );

        if primary_mounted && volume_mounted {
            return Ok(csi::ControllerPublishVolumeResponse {
                publish_context: Default::default(),
            });
        }

        if skip_mount_unmount == YES {
            return Err(ControllerError::Internal(format!(
                "SKIP_MOUNT_UNMOUNT == yes and either {} or {fs_name} is not mounted on node \
                 {node}",
                primary.filesystem
            )));
        }

        if !primary_mounted {
            debug!(filesystem = %primary.filesystem, node = %node, "mounting primary filesystem");
            primary_conn
                .mount_filesystem(&primary.filesystem, &node)
                .await
                .map_err(|err| {
                    ControllerError::Internal(format!(
                        "error in mounting filesystem {} on node {node}. Error [{err}]",
                        primary.filesystem
                    ))
                })?;
        }
        if !volume_mounted && primary.filesystem != fs_name {
            debug!(filesystem = %fs_name, node = %node, "mounting volume filesystem");
            primary_conn
                .mount_filesystem(&fs_name, &node)
                .await
                .map_err(|err| {
                    ControllerError::Internal(format!(
                        "error in mounting filesystem {fs_name} on node {node}. Error [{err}]"
                    ))
                })?;
        }

        Ok(csi::ControllerPublishVolumeResponse {
            publish_context: Default::default(),
        })
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    async fn do_create_snapshot(
        &self,
        req: csi::CreateSnapshotRequest,
    ) -> Result<csi::CreateSnapshotResponse> {
        self.capability_check(RpcType::CreateDeleteSnapshot, "CreateSnapshot")?;

        if req.source_volume_id.is_empty() {
            return Err(ControllerError::InvalidArgument(
                "CreateSnapshot - source volume id is a required field".to_string(),
            ));
        }
        if req.name.is_empty() {
            return Err(ControllerError::InvalidArgument(
                "CreateSnapshot - snapshot name is a required field".to_string(),
            ));
        }

        let volume_id = VolumeId::decode(&req.source_volume_id).map_err(|err| {
            ControllerError::InvalidArgument(format!(
                "CreateSnapshot - error in source volume id {}: {err}",
                req.source_volume_id
            ))
        })?;

        if !volume_id.is_fileset_based() {
            return Err(ControllerError::InvalidArgument(format!(
                "CreateSnapshot - volume [{}] - volume snapshot can only be created when source \
                 volume is fileset based",
                req.source_volume_id
            )));
        }
        if volume_id.storage_class == StorageClass::Advanced
            && volume_id.kind != VolumeKind::DependentFileset
        {
            return Err(ControllerError::InvalidArgument(format!(
                "CreateSnapshot - volume [{}] - volume snapshot can only be created when source \
                 volume is a dependent fileset",
                req.source_volume_id
            )));
        }

        let conn = self.driver.connector_for(&volume_id.cluster_id)?.clone();
        if !cluster_version_at_least(&conn, MIN_SNAPSHOT_VERSION).await? {
            return Err(ControllerError::FailedPrecondition(
                "the minimum required cluster version for snapshot support is 5.1.1-0".to_string(),
            ));
        }

        let primary_conn = self.driver.primary_connector()?.clone();
        let primary = &self.driver.primary;

        let fs_name = primary_conn
            .filesystem_name_from_uuid(&volume_id.filesystem_uuid)
            .await
            .map_err(|err| {
                ControllerError::Internal(format!(
                    "CreateSnapshot - unable to get filesystem name for uuid [{}] and clusterId \
                     [{}]. Error [{err}]",
                    volume_id.filesystem_uuid, volume_id.cluster_id
                ))
            })?;
        let mount_info = primary_conn
            .filesystem_mount_details(&fs_name)
            .await
            .map_err(|_| {
                ControllerError::Internal(format!(
                    "CreateSnapshot - unable to get mount info for FS [{fs_name}] in primary \
                     cluster"
                ))
            })?;

        let backend_fs = remote_fs_name(&mount_info.remote_device_name);
        let fileset_info = conn
            .list_fileset(&backend_fs, &volume_id.fileset_name)
            .await
            .map_err(|_| {
                ControllerError::Internal(format!(
                    "CreateSnapshot - unable to get fileset details for fileset [{}] FS \
                     [{backend_fs}] clusterId [{}]",
                    volume_id.fileset_name, volume_id.cluster_id
                ))
            })?;

        if volume_id.storage_class != StorageClass::Advanced && fileset_info.parent_id > 0 {
            return Err(ControllerError::InvalidArgument(format!(
                "CreateSnapshot - volume [{}] - volume snapshot can only be created when source \
                 volume is an independent fileset",
                req.source_volume_id
            )));
        }

        let rel_path = if volume_id.storage_class == StorageClass::Advanced {
            volume_id.path.replacen(&mount_info.mount_point, "", 1)
        } else {
            volume_id.path.replacen(&primary.mount_point, "", 1)
        };
        let rel_path = rel_path.trim_matches(|c| c == '!' || c == '/').to_string();
        let pv_name = basename(&rel_path);
        if pv_name != fileset_info.name {
            return Err(ControllerError::Internal(format!(
                "CreateSnapshot - PV name from path [{pv_name}] does not match with filesetName \
                 [{}]",
                fileset_info.name
            )));
        }

        let snap_fileset = if volume_id.storage_class == StorageClass::Advanced {
            volume_id.consistency_group.clone()
        } else {
            fileset_info.name.clone()
        };

        let window_minutes = if volume_id.storage_class == StorageClass::Advanced {
            match req.parameters.get(PARAM_SNAP_WINDOW) {
                None => {
                    info!(
                        fileset = %snap_fileset,
                        window = DEFAULT_SNAP_WINDOW_MINUTES,
                        "snapWindow not specified, using default"
                    );
                    DEFAULT_SNAP_WINDOW_MINUTES
                }
                Some(raw) => raw.parse::<i64>().map_err(|_| {
                    ControllerError::Internal(format!(
                        "CreateSnapshot [{}] - invalid snapWindow value: [{raw}]",
                        req.name
                    ))
                })?,
            }
        } else {
            0
        };

        let mut snap_name = req.name.clone();
        let snapshot_present = conn
            .snapshot_exists(&backend_fs, &snap_fileset, &snap_name)
            .await
            .map_err(|err| {
                ControllerError::Internal(format!(
                    "unable to get the snapshot details for [{snap_name}]. Error [{err}]"
                ))
            })?;

        if !snapshot_present {
            let mut create_new = true;
            if volume_id.storage_class == StorageClass::Advanced {
                if let Some(group_snapshot) =
                    reusable_group_snapshot(&conn, &backend_fs, &snap_fileset, window_minutes)
                        .await?
                {
                    confirm_member_in_snapshot(
                        &conn,
                        &backend_fs,
                        &snap_fileset,
                        &group_snapshot,
                        &fileset_info.name,
                    )
                    .await?;
                    create_new = false;
                    snap_name = group_snapshot;
                }
            }

            if create_new {
                let existing = conn
                    .list_fileset_snapshots(&backend_fs, &snap_fileset)
                    .await
                    .map_err(|err| {
                        ControllerError::Internal(format!(
                            "unable to list snapshots for fileset [{backend_fs}:{snap_fileset}]. \
                             Error: [{err}]"
                        ))
                    })?;
                if existing.len() >= MAX_SNAPSHOTS_PER_FILESET {
                    return Err(ControllerError::OutOfRange(format!(
                        "max limit of snapshots reached for fileset \
                         [{backend_fs}:{snap_fileset}]. No more snapshots can be created for \
                         this fileset."
                    )));
                }
                conn.create_snapshot(&backend_fs, &snap_fileset, &snap_name)
                    .await
                    .map_err(|err| {
                        ControllerError::Internal(format!(
                            "unable to create snapshot [{snap_name}]. Error [{err}]"
                        ))
                    })?;
            }
        }

        let snapshot_id = if volume_id.storage_class == StorageClass::Advanced {
            SnapshotId {
                storage_class: volume_id.storage_class,
                kind: volume_id.kind,
                cluster_id: volume_id.cluster_id.clone(),
                filesystem_uuid: volume_id.filesystem_uuid.clone(),
                consistency_group: volume_id.consistency_group.clone(),
                fileset_name: fileset_info.name.clone(),
                snapshot_name: snap_name.clone(),
                meta_snapshot_name: req.name.clone(),
                path: "/".to_string(),
            }
        } else {
            // Dynamically provisioned volumes keep their data one level
            // below the fileset root; statically provisioned ones are
            // rooted at the fileset itself.
            let path = if fileset_info.comment == FILESET_COMMENT
                && (primary.fileset != fileset_info.name || primary.filesystem != fs_name)
            {
                format!("{}-data", fileset_info.name)
            } else {
                "/".to_string()
            };
            SnapshotId {
                storage_class: volume_id.storage_class,
                kind: volume_id.kind,
                cluster_id: volume_id.cluster_id.clone(),
                filesystem_uuid: volume_id.filesystem_uuid.clone(),
                consistency_group: String::new(),
                fileset_name: fileset_info.name.clone(),
                snapshot_name: snap_name.clone(),
                meta_snapshot_name: String::new(),
                path,
            }
        };

        let created = conn
            .snapshot_create_time(&backend_fs, &snap_fileset, &snap_name)
            .await?;
        let restore_size = conn.fileset_quota(&backend_fs, &fileset_info.name).await? as i64;

        if volume_id.storage_class == StorageClass::Advanced {
            make_snapshot_metadata_dir(
                &conn,
                &backend_fs,
                &volume_id.consistency_group,
                &snap_name,
                &req.name,
            )
            .await?;
        }

        Ok(csi::CreateSnapshotResponse {
            snapshot: Some(csi::Snapshot {
                snapshot_id: snapshot_id.encode(),
                source_volume_id: req.source_volume_id.clone(),
                ready_to_use: true,
                creation_time: Some(prost_types::Timestamp {
                    seconds: created.timestamp(),
                    nanos: 0,
                }),
                size_bytes: restore_size,
            }),
        })
    }

    async fn do_delete_snapshot(
        &self,
        req: csi::DeleteSnapshotRequest,
    ) -> Result<csi::DeleteSnapshotResponse> {
        self.capability_check(RpcType::CreateDeleteSnapshot, "DeleteSnapshot")?;

        if req.snapshot_id.is_empty() {
            return Err(ControllerError::InvalidArgument(
                "DeleteSnapshot - snapshot id is a required field".to_string(),
            ));
        }
        let snapshot_id = SnapshotId::decode(&req.snapshot_id)?;

        let conn = self.driver.connector_for(&snapshot_id.cluster_id)?.clone();
        let fs_name = conn
            .filesystem_name_from_uuid(&snapshot_id.filesystem_uuid)
            .await
            .map_err(|err| {
                ControllerError::Internal(format!(
                    "DeleteSnapshot - unable to get filesystem name for uuid [{}] and clusterId \
                     [{}]. Error [{err}]",
                    snapshot_id.filesystem_uuid, snapshot_id.cluster_id
                ))
            })?;

        let check_fileset = if snapshot_id.storage_class == StorageClass::Advanced {
            snapshot_id.consistency_group.clone()
        } else {
            snapshot_id.fileset_name.clone()
        };

        let fileset_present = match conn.list_fileset(&fs_name, &check_fileset).await {
            Ok(_) => true,
            Err(err) if err.is_fileset_not_found() => false,
            Err(err) => {
                return Err(ControllerError::Internal(format!(
                    "DeleteSnapshot - unable to get the fileset {check_fileset} details. \
                     Error [{err}]"
                )));
            }
        };

        // Missing fileset or snapshot means the delete already happened.
        if fileset_present {
            let snapshot_present = conn
                .snapshot_exists(&fs_name, &check_fileset, &snapshot_id.snapshot_name)
                .await
                .map_err(|err| {
                    ControllerError::Internal(format!(
                        "DeleteSnapshot - unable to get the snapshot details. Error [{err}]"
                    ))
                })?;

            if snapshot_present {
                let mut delete_shared = true;
                let mut fileset_for_delete = snapshot_id.fileset_name.clone();

                if snapshot_id.storage_class == StorageClass::Advanced {
                    let released = delete_snapshot_metadata(
                        &conn,
                        &fs_name,
                        &snapshot_id.consistency_group,
                        &snapshot_id.snapshot_name,
                        &snapshot_id.meta_snapshot_name,
                    )
                    .await?;
                    if released {
                        fileset_for_delete = snapshot_id.consistency_group.clone();
                    } else {
                        delete_shared = false;
                    }
                }

                if delete_shared {
                    info!(
                        snapshot = %snapshot_id.snapshot_name,
                        fileset = %fileset_for_delete,
                        filesystem = %fs_name,
                        "deleting snapshot"
                    );
                    conn.delete_snapshot(&fs_name, &fileset_for_delete, &snapshot_id.snapshot_name)
                        .await
                        .map_err(|err| {
                            ControllerError::Internal(format!(
                                "DeleteSnapshot - error deleting snapshot {}: {err}",
                                snapshot_id.snapshot_name
                            ))
                        })?;
                }
            }
        }

        Ok(csi::DeleteSnapshotResponse {})
    }

    // ------------------------------------------------------------------
    // Expand
    // ------------------------------------------------------------------

    async fn do_controller_expand_volume(
        &self,
        req: csi::ControllerExpandVolumeRequest,
    ) -> Result<csi::ControllerExpandVolumeResponse> {
        self.capability_check(RpcType::ExpandVolume, "ControllerExpandVolume")?;

        if req.volume_id.is_empty() {
            return Err(ControllerError::InvalidArgument(
                "volume id missing in request".to_string(),
            ));
        }
        let capacity_range = req.capacity_range.as_ref().ok_or_else(|| {
            ControllerError::InvalidArgument("capacity range not provided".to_string())
        })?;
        let capacity = capacity_range.required_bytes.max(0) as u64;

        let volume_id = VolumeId::decode(&req.volume_id).map_err(|err| {
            ControllerError::InvalidArgument(format!(
                "ControllerExpandVolume - error in volume id {}: {err}",
                req.volume_id
            ))
        })?;

        // Directory volumes have no quota; nothing to do.
        if !volume_id.is_fileset_based() {
            return Ok(csi::ControllerExpandVolumeResponse {
                capacity_bytes: capacity as i64,
                node_expansion_required: false,
            });
        }

        let conn = self.driver.connector_for(&volume_id.cluster_id)?.clone();
        let fs_name = conn
            .filesystem_name_from_uuid(&volume_id.filesystem_uuid)
            .await
            .map_err(|err| {
                ControllerError::Internal(format!(
                    "ControllerExpandVolume - unable to get filesystem name for uuid [{}] and \
                     clusterId [{}]. Error [{err}]",
                    volume_id.filesystem_uuid, volume_id.cluster_id
                ))
            })?;

        let fileset = &volume_id.fileset_name;
        let fileset_info = match conn.list_fileset(&fs_name, fileset).await {
            Ok(info) => info,
            Err(err) if err.is_fileset_not_found() => {
                return Err(ControllerError::Internal(format!(
                    "fileset [{fileset}] does not exist in filesystem [{fs_name}]"
                )));
            }
            Err(err) => {
                return Err(ControllerError::Internal(format!(
                    "unable to check fileset [{fileset}] existence in filesystem [{fs_name}]. \
                     Error [{err}]"
                )));
            }
        };

        let quota = conn.fileset_quota(&fs_name, fileset).await.map_err(|err| {
            ControllerError::Internal(format!(
                "unable to list quota for fileset [{fileset}] in filesystem [{fs_name}]. \
                 Error [{err}]"
            ))
        })?;

        if quota < capacity {
            conn.set_fileset_quota(&fs_name, fileset, capacity)
                .await
                .map_err(|err| {
                    ControllerError::Internal(format!(
                        "unable to expand the volume. Error [{err}]"
                    ))
                })?;
        }

        // Volumes that grew past 10 GiB on a default inode allocation get
        // a larger inode limit; user-tuned allocations are left alone.
        if fileset_info.parent_id == 0
            && capacity > 10 * ONE_GIB
            && DEFAULT_MAX_INODE_ALLOCATIONS.contains(&fileset_info.max_num_inodes)
        {
            conn.update_fileset_inode_limit(&fs_name, fileset, "200000")
                .await
                .map_err(|err| {
                    ControllerError::Internal(format!(
                        "unable to update fileset [{fileset}] in filesystem [{fs_name}]. \
                         Error: {err}"
                    ))
                })?;
        }

        Ok(csi::ControllerExpandVolumeResponse {
            capacity_bytes: capacity as i64,
            node_expansion_required: false,
        })
    }

    // ------------------------------------------------------------------
    // Capabilities / validation
    // ------------------------------------------------------------------

    fn do_validate_volume_capabilities(
        &self,
        req: csi::ValidateVolumeCapabilitiesRequest,
    ) -> Result<csi::ValidateVolumeCapabilitiesResponse> {
        if req.volume_id.is_empty() {
            return Err(ControllerError::InvalidArgument(
                "volume id not present".to_string(),
            ));
        }
        if req.volume_capabilities.is_empty() {
            return Err(ControllerError::InvalidArgument(
                "no volume capability specified".to_string(),
            ));
        }

        for capability in &req.volume_capabilities {
            let mode = capability
                .access_mode
                .as_ref()
                .map(|m| m.mode())
                .unwrap_or(csi::volume_capability::access_mode::Mode::Unknown);
            if mode != csi::volume_capability::access_mode::Mode::MultiNodeMultiWriter {
                return Ok(csi::ValidateVolumeCapabilitiesResponse {
                    confirmed: None,
                    message: String::new(),
                });
            }
        }

        Ok(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: Default::default(),
                volume_capabilities: req.volume_capabilities,
                parameters: Default::default(),
            }),
            message: String::new(),
        })
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> std::result::Result<Response<csi::CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!(name = %req.name, "CreateVolume request");
        self.do_create_volume(req)
            .await
            .map(Response::new)
            .map_err(Status::from)
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> std::result::Result<Response<csi::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!(volume_id = %req.volume_id, "DeleteVolume request");
        self.do_delete_volume(req)
            .await
            .map(Response::new)
            .map_err(Status::from)
    }

    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!(volume_id = %req.volume_id, node = %req.node_id, "ControllerPublishVolume request");
        self.do_controller_publish_volume(req)
            .await
            .map(Response::new)
            .map_err(Status::from)
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!(volume_id = %req.volume_id, "ControllerUnpublishVolume request");
        self.capability_check(RpcType::PublishUnpublishVolume, "ControllerUnpublishVolume")
            .map_err(Status::from)?;
        VolumeId::decode(&req.volume_id).map_err(|_| {
            Status::invalid_argument(
                "ControllerUnpublishVolume : volume id is not in proper format",
            )
        })?;
        Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        self.do_validate_volume_capabilities(request.into_inner())
            .map(Response::new)
            .map_err(Status::from)
    }

    async fn list_volumes(
        &self,
        _request: Request<csi::ListVolumesRequest>,
    ) -> std::result::Result<Response<csi::ListVolumesResponse>, Status> {
        Err(Status::unimplemented(""))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> std::result::Result<Response<csi::GetCapacityResponse>, Status> {
        Err(Status::unimplemented(""))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        let capabilities = self
            .driver
            .capabilities
            .iter()
            .map(|capability| csi::ControllerServiceCapability {
                r#type: Some(csi::controller_service_capability::Type::Rpc(
                    csi::controller_service_capability::Rpc {
                        r#type: *capability as i32,
                    },
                )),
            })
            .collect();
        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> std::result::Result<Response<csi::CreateSnapshotResponse>, Status> {
        let req = request.into_inner();
        debug!(name = %req.name, source = %req.source_volume_id, "CreateSnapshot request");
        self.do_create_snapshot(req)
            .await
            .map(Response::new)
            .map_err(Status::from)
    }

    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> std::result::Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let req = request.into_inner();
        debug!(snapshot_id = %req.snapshot_id, "DeleteSnapshot request");
        self.do_delete_snapshot(req)
            .await
            .map(Response::new)
            .map_err(Status::from)
    }

    async fn list_snapshots(
        &self,
        _request: Request<csi::ListSnapshotsRequest>,
    ) -> std::result::Result<Response<csi::ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented(""))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!(volume_id = %req.volume_id, "ControllerExpandVolume request");
        self.do_controller_expand_volume(req)
            .await
            .map(Response::new)
            .map_err(Status::from)
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented(""))
    }
}
