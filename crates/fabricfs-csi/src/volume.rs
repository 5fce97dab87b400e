//! Request-scoped volume specification and storage-class parameter
//! handling.
//!
//! The parameter set accepted in a create-volume request is a closed
//! allow-list; any unrecognized key fails the request naming the offending
//! keys. The parsed specification lives for one request only.

use fabricfs_connect::FilesetKind;

use crate::error::{ControllerError, Result};
use crate::id::{StorageClass, ID_DELIMITER};

pub const ONE_GIB: u64 = 1024 * 1024 * 1024;
/// Fileset-based volumes never get a quota below 1 GiB.
pub const SMALLEST_VOLUME_SIZE: u64 = ONE_GIB;

// Storage-class parameter keys.
pub const PARAM_VOL_BACKEND_FS: &str = "volBackendFs";
pub const PARAM_VOL_DIR_BASE_PATH: &str = "volDirBasePath";
pub const PARAM_UID: &str = "uid";
pub const PARAM_GID: &str = "gid";
pub const PARAM_PERMISSIONS: &str = "permissions";
pub const PARAM_CLUSTER_ID: &str = "clusterId";
pub const PARAM_FILESET_TYPE: &str = "filesetType";
pub const PARAM_PARENT_FILESET: &str = "parentFileset";
pub const PARAM_INODE_LIMIT: &str = "inodeLimit";
pub const PARAM_NODE_CLASS: &str = "nodeClass";
pub const PARAM_VERSION: &str = "version";
pub const PARAM_TIER: &str = "tier";
pub const PARAM_COMPRESSION: &str = "compression";
pub const PARAM_CONSISTENCY_GROUP: &str = "consistencyGroup";
pub const PARAM_SHARED: &str = "shared";

// Bookkeeping keys the orchestrator adds on its own behalf.
pub const PARAM_PV_NAME: &str = "csi.storage.k8s.io/pv/name";
pub const PARAM_PVC_NAME: &str = "csi.storage.k8s.io/pvc/name";
pub const PARAM_PVC_NAMESPACE: &str = "csi.storage.k8s.io/pvc/namespace";
pub const PARAM_PROVISIONER_IDENTITY: &str = "storage.kubernetes.io/csiProvisionerIdentity";

/// CreateSnapshot parameter: reuse window in minutes for consistency-group
/// snapshots.
pub const PARAM_SNAP_WINDOW: &str = "snapWindow";

const SUPPORTED_PARAMS: &[&str] = &[
    PARAM_PV_NAME,
    PARAM_PVC_NAME,
    PARAM_PVC_NAMESPACE,
    PARAM_PROVISIONER_IDENTITY,
    PARAM_VOL_BACKEND_FS,
    PARAM_VOL_DIR_BASE_PATH,
    PARAM_UID,
    PARAM_GID,
    PARAM_PERMISSIONS,
    PARAM_CLUSTER_ID,
    PARAM_FILESET_TYPE,
    PARAM_PARENT_FILESET,
    PARAM_INODE_LIMIT,
    PARAM_NODE_CLASS,
    PARAM_VERSION,
    PARAM_TIER,
    PARAM_COMPRESSION,
    PARAM_CONSISTENCY_GROUP,
    PARAM_SHARED,
];

/// Returns the unsupported parameter keys, if any.
pub fn unsupported_params(params: &std::collections::HashMap<String, String>) -> Vec<String> {
    let mut invalid: Vec<String> = params
        .keys()
        .filter(|k| !SUPPORTED_PARAMS.contains(&k.as_str()))
        .cloned()
        .collect();
    invalid.sort();
    invalid
}

/// One provisioning request, normalized. Discarded when the request ends.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pub name: String,
    pub size_bytes: u64,
    /// Filesystem named by the request, as known to the local cluster.
    pub local_filesystem: String,
    /// Filesystem the fileset is actually created on (differs from
    /// `local_filesystem` when remotely mounted).
    pub backend_filesystem: String,
    pub dir_base_path: String,
    pub is_fileset_based: bool,
    pub fileset_type: Option<FilesetKind>,
    pub parent_fileset: String,
    pub uid: String,
    pub gid: String,
    pub permissions: String,
    pub inode_limit: String,
    pub cluster_id: String,
    pub node_class: String,
    pub tier: String,
    pub compression: String,
    pub consistency_group: String,
    pub pvc_namespace: String,
    pub storage_class: StorageClass,
    pub shared: bool,
}

impl VolumeSpec {
    /// Builds a specification from the request parameters.
    pub fn from_params(params: &std::collections::HashMap<String, String>) -> Result<VolumeSpec> {
        let get = |key: &str| params.get(key).cloned().unwrap_or_default();

        let backend_fs = get(PARAM_VOL_BACKEND_FS);
        if backend_fs.is_empty() {
            return Err(ControllerError::InvalidArgument(format!(
                "{PARAM_VOL_BACKEND_FS} is a required parameter"
            )));
        }

        let storage_class = match params.get(PARAM_VERSION).map(String::as_str) {
            None | Some("") | Some("1") => StorageClass::Classic,
            Some("2") => StorageClass::Advanced,
            Some(other) => {
                return Err(ControllerError::InvalidArgument(format!(
                    "invalid value specified for parameter {PARAM_VERSION}: {other}"
                )));
            }
        };

        let dir_base_path = get(PARAM_VOL_DIR_BASE_PATH);
        let is_fileset_based = dir_base_path.is_empty();

        let fileset_type = match params.get(PARAM_FILESET_TYPE).map(String::as_str) {
            None | Some("") => None,
            Some("independent") => Some(FilesetKind::Independent),
            Some("dependent") => Some(FilesetKind::Dependent),
            Some(other) => {
                return Err(ControllerError::InvalidArgument(format!(
                    "invalid value specified for parameter {PARAM_FILESET_TYPE}: {other}"
                )));
            }
        };

        if !is_fileset_based && fileset_type.is_some() {
            return Err(ControllerError::InvalidArgument(format!(
                "{PARAM_FILESET_TYPE} and {PARAM_VOL_DIR_BASE_PATH} must not be specified together"
            )));
        }

        if storage_class == StorageClass::Advanced {
            if !is_fileset_based {
                return Err(ControllerError::InvalidArgument(format!(
                    "{PARAM_VOL_DIR_BASE_PATH} is not supported with {PARAM_VERSION}=2"
                )));
            }
            if fileset_type.is_some() || params.contains_key(PARAM_PARENT_FILESET) {
                return Err(ControllerError::InvalidArgument(format!(
                    "{PARAM_FILESET_TYPE} and {PARAM_PARENT_FILESET} are not supported with \
                     {PARAM_VERSION}=2"
                )));
            }
        }

        let shared = matches!(
            params.get(PARAM_SHARED).map(String::as_str),
            Some("yes") | Some("true")
        );
        let mut permissions = get(PARAM_PERMISSIONS);
        if permissions.is_empty() && shared {
            permissions = "777".to_string();
        }

        let spec = VolumeSpec {
            name: String::new(),
            size_bytes: 0,
            local_filesystem: backend_fs.clone(),
            backend_filesystem: backend_fs,
            dir_base_path,
            is_fileset_based,
            fileset_type,
            parent_fileset: get(PARAM_PARENT_FILESET),
            uid: get(PARAM_UID),
            gid: get(PARAM_GID),
            permissions,
            inode_limit: get(PARAM_INODE_LIMIT),
            cluster_id: get(PARAM_CLUSTER_ID),
            node_class: get(PARAM_NODE_CLASS),
            tier: get(PARAM_TIER),
            compression: get(PARAM_COMPRESSION),
            consistency_group: get(PARAM_CONSISTENCY_GROUP),
            pvc_namespace: get(PARAM_PVC_NAMESPACE),
            storage_class,
            shared,
        };

        for value in [
            &spec.backend_filesystem,
            &spec.dir_base_path,
            &spec.consistency_group,
            &spec.parent_fileset,
        ] {
            if value.contains(ID_DELIMITER) {
                return Err(ControllerError::InvalidArgument(format!(
                    "volume parameter [{value}] must not contain the character '{ID_DELIMITER}'"
                )));
            }
        }

        Ok(spec)
    }

    /// Applies the requested size, rounding fileset-based volumes up to the
    /// 1 GiB floor.
    pub fn set_requested_size(&mut self, size_bytes: i64) {
        let requested = size_bytes.max(0) as u64;
        self.size_bytes = if self.is_fileset_based && requested < SMALLEST_VOLUME_SIZE {
            SMALLEST_VOLUME_SIZE
        } else {
            requested
        };
    }

    /// Default inode limit when the caller did not specify one.
    pub fn effective_inode_limit(&self) -> String {
        if !self.inode_limit.is_empty() {
            return self.inode_limit.clone();
        }
        if self.size_bytes > 10 * ONE_GIB {
            "200000".to_string()
        } else {
            "100000".to_string()
        }
    }

    /// Tier-bound filesets carry a name suffix the placement policy keys on.
    pub fn apply_tier_suffix(&mut self) {
        if self.is_fileset_based && !self.tier.is_empty() {
            self.name = format!("{}-T{}csi", self.name, self.tier);
        }
    }

    pub fn apply_compression_suffix(&mut self) {
        if self.is_fileset_based && !self.compression.is_empty() {
            self.name = format!(
                "{}-COMPRESS{}csi",
                self.name,
                self.compression.to_uppercase()
            );
        }
    }
}
