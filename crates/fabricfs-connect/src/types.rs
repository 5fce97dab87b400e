use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Comment stamped on every fileset this driver creates; filesets without it
/// are never mutated or deleted.
pub const FILESET_COMMENT: &str = "Fileset created by FabricFS CSI driver";

/// Junction path the backend reports for a fileset that is not linked.
pub const UNLINKED_PATH: &str = "--";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesetKind {
    Independent,
    Dependent,
}

impl std::fmt::Display for FilesetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilesetKind::Independent => write!(f, "independent"),
            FilesetKind::Dependent => write!(f, "dependent"),
        }
    }
}

/// Options applied when creating a fileset. A `None` kind leaves the choice
/// to the backend default.
#[derive(Debug, Clone)]
pub struct FilesetOptions {
    pub kind: Option<FilesetKind>,
    pub parent_fileset: Option<String>,
    pub owner_uid: Option<String>,
    pub owner_gid: Option<String>,
    pub permissions: Option<String>,
    pub inode_limit: Option<String>,
    pub comment: String,
}

impl Default for FilesetOptions {
    fn default() -> Self {
        Self {
            kind: None,
            parent_fileset: None,
            owner_uid: None,
            owner_gid: None,
            permissions: None,
            inode_limit: None,
            comment: FILESET_COMMENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    Mounted,
    NotMounted,
}

/// Mount-level view of a filesystem on the queried cluster.
#[derive(Debug, Clone)]
pub struct FilesystemMount {
    pub mount_point: String,
    pub status: MountStatus,
    /// `owningCluster:filesystemName` for remotely mounted filesystems.
    pub remote_device_name: String,
    /// Admin node names the filesystem is currently mounted on.
    pub nodes_mounted: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FilesystemDetails {
    pub name: String,
    pub uuid: String,
    pub kind: FilesystemKind,
    /// Filesystem format version, e.g. `27.00`.
    pub version: String,
    pub mount: FilesystemMount,
}

/// Backend description of a fileset.
#[derive(Debug, Clone)]
pub struct FilesetInfo {
    pub name: String,
    /// Junction path; empty or [`UNLINKED_PATH`] when unlinked.
    pub path: String,
    pub comment: String,
    pub is_inode_space_owner: bool,
    pub inode_space: u32,
    /// 0 for independent filesets.
    pub parent_id: u32,
    pub max_num_inodes: u64,
}

impl FilesetInfo {
    pub fn is_linked(&self) -> bool {
        !self.path.is_empty() && self.path != UNLINKED_PATH
    }

    pub fn kind(&self) -> FilesetKind {
        if self.is_inode_space_owner {
            FilesetKind::Independent
        } else {
            FilesetKind::Dependent
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
}

/// Result of a directory stat; the link count drives the shared
/// consistency-group snapshot cleanup.
#[derive(Debug, Clone, Copy)]
pub struct DirectoryStat {
    pub nlink: u64,
}

#[derive(Debug, Clone)]
pub struct ClusterSummary {
    pub cluster_name: String,
    pub cluster_id: String,
}

/// Ownership applied to a directory created on the backend.
#[derive(Debug, Clone)]
pub struct DirectoryOwner {
    pub uid: String,
    pub gid: String,
    pub permissions: Option<String>,
}

impl DirectoryOwner {
    pub fn root() -> Self {
        Self {
            uid: "0".to_string(),
            gid: "0".to_string(),
            permissions: None,
        }
    }
}

/// Handle for an asynchronous backend copy job.
#[derive(Debug, Clone)]
pub struct CopyJob {
    pub job_id: u64,
}

/// Terminal state the backend reports for a finished copy job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyJobState {
    Completed,
    Failed,
    /// The backend could not say what happened to the job.
    Unknown,
}

#[derive(Debug, Clone)]
pub struct CopyJobReport {
    pub state: CopyJobState,
    pub message: String,
}

/// Placement-policy rule installed for tiered volumes.
#[derive(Debug, Clone)]
pub struct PlacementPolicy {
    pub policy: String,
    pub priority: i32,
    pub partition: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fileset_is_linked() {
        let mut info = FilesetInfo {
            name: "pvc-1".to_string(),
            path: "/mnt/fs0/pvc-1".to_string(),
            comment: FILESET_COMMENT.to_string(),
            is_inode_space_owner: false,
            inode_space: 5,
            parent_id: 1,
            max_num_inodes: 100096,
        };
        assert!(info.is_linked());

        info.path = UNLINKED_PATH.to_string();
        assert!(!info.is_linked());

        info.path = String::new();
        assert!(!info.is_linked());
    }

    #[test]
    fn test_fileset_kind_follows_inode_space_ownership() {
        let info = FilesetInfo {
            name: "group-a".to_string(),
            path: "/mnt/fs0/group-a".to_string(),
            comment: FILESET_COMMENT.to_string(),
            is_inode_space_owner: true,
            inode_space: 7,
            parent_id: 0,
            max_num_inodes: 1048576,
        };
        assert_eq!(info.kind(), FilesetKind::Independent);
    }
}
