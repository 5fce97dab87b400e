//! FabricFS cluster connector contract.
//!
//! One [`ClusterConnector`] instance fronts the REST management API of a
//! single FabricFS cluster. The provisioning engine consumes this trait
//! only; the HTTP transport behind it lives in its own crate and is not
//! part of the contract.

pub mod error;
pub mod rest;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use error::{ConnectorError, Result};
pub use rest::{RestConnector, RestCredentials};
pub use types::*;

/// Management-API surface of one cluster.
///
/// Every call is a blocking round trip to the cluster management service.
/// Operations are individually idempotent where the backend allows it;
/// failure classification happens on [`ConnectorError`] at the call site.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    // Cluster identity and capabilities.
    async fn cluster_id(&self) -> Result<String>;
    async fn cluster_summary(&self) -> Result<ClusterSummary>;
    /// Reported software version, e.g. `5.1.3-1`.
    async fn cluster_version(&self) -> Result<String>;
    async fn is_valid_node_class(&self, node_class: &str) -> Result<bool>;

    // Filesystems.
    async fn filesystem_details(&self, filesystem: &str) -> Result<FilesystemDetails>;
    async fn filesystem_mount_details(&self, filesystem: &str) -> Result<FilesystemMount>;
    async fn filesystem_name_from_uuid(&self, uuid: &str) -> Result<String>;
    async fn is_quota_enabled(&self, filesystem: &str) -> Result<bool>;
    async fn mount_filesystem(&self, filesystem: &str, node: &str) -> Result<()>;

    // Filesets.
    async fn list_fileset(&self, filesystem: &str, fileset: &str) -> Result<FilesetInfo>;
    async fn create_fileset(
        &self,
        filesystem: &str,
        fileset: &str,
        options: &FilesetOptions,
    ) -> Result<()>;
    async fn link_fileset(
        &self,
        filesystem: &str,
        fileset: &str,
        junction_path: &str,
    ) -> Result<()>;
    async fn update_fileset_inode_limit(
        &self,
        filesystem: &str,
        fileset: &str,
        inode_limit: &str,
    ) -> Result<()>;
    async fn delete_fileset(&self, filesystem: &str, fileset: &str) -> Result<()>;
    async fn filesets_in_inode_space(
        &self,
        filesystem: &str,
        inode_space: u32,
    ) -> Result<Vec<FilesetInfo>>;
    /// Current block quota limit in bytes; 0 when no quota is set.
    async fn fileset_quota(&self, filesystem: &str, fileset: &str) -> Result<u64>;
    async fn set_fileset_quota(&self, filesystem: &str, fileset: &str, bytes: u64) -> Result<()>;
    /// Refreshes fileset visibility after remote-cluster changes.
    async fn run_fileset_refresh(&self) -> Result<()>;

    // Directories and symlinks.
    async fn directory_exists(&self, filesystem: &str, path: &str) -> Result<bool>;
    async fn make_directory(
        &self,
        filesystem: &str,
        path: &str,
        owner: &DirectoryOwner,
    ) -> Result<()>;
    async fn delete_directory(&self, filesystem: &str, path: &str, recursive: bool) -> Result<()>;
    async fn stat_directory(&self, filesystem: &str, path: &str) -> Result<DirectoryStat>;
    async fn create_symlink(
        &self,
        filesystem: &str,
        target_filesystem: &str,
        target_path: &str,
        link_path: &str,
    ) -> Result<()>;
    async fn delete_symlink(&self, filesystem: &str, link_path: &str) -> Result<()>;

    // Snapshots.
    async fn list_fileset_snapshots(
        &self,
        filesystem: &str,
        fileset: &str,
    ) -> Result<Vec<SnapshotEntry>>;
    /// Snapshots ordered most recent first; may return a single entry.
    async fn latest_fileset_snapshots(
        &self,
        filesystem: &str,
        fileset: &str,
    ) -> Result<Vec<SnapshotEntry>>;
    async fn snapshot_exists(
        &self,
        filesystem: &str,
        fileset: &str,
        snapshot: &str,
    ) -> Result<bool>;
    async fn create_snapshot(&self, filesystem: &str, fileset: &str, snapshot: &str) -> Result<()>;
    async fn delete_snapshot(&self, filesystem: &str, fileset: &str, snapshot: &str) -> Result<()>;
    async fn snapshot_create_time(
        &self,
        filesystem: &str,
        fileset: &str,
        snapshot: &str,
    ) -> Result<DateTime<Utc>>;

    // Tiering policy.
    async fn set_filesystem_policy(
        &self,
        filesystem: &str,
        policy: &PlacementPolicy,
    ) -> Result<()>;
    async fn policy_partition_exists(&self, filesystem: &str, partition: &str) -> Result<bool>;
    async fn tier_exists(&self, filesystem: &str, tier: &str) -> Result<bool>;
    async fn first_data_tier(&self, filesystem: &str) -> Result<String>;

    // Asynchronous copy jobs.
    async fn copy_fileset_path(
        &self,
        filesystem: &str,
        fileset: &str,
        source_path: &str,
        target_path: &str,
        node_class: &str,
    ) -> Result<CopyJob>;
    async fn copy_directory_path(
        &self,
        filesystem: &str,
        source_path: &str,
        target_path: &str,
        node_class: &str,
    ) -> Result<CopyJob>;
    async fn copy_snapshot_path(
        &self,
        filesystem: &str,
        fileset: &str,
        snapshot: &str,
        source_path: &str,
        target_path: &str,
        node_class: &str,
    ) -> Result<CopyJob>;
    /// Blocks until the job reaches a terminal state. Cancellation of the
    /// surrounding request must not be reported as job failure.
    async fn wait_for_copy_job(&self, job: &CopyJob) -> Result<CopyJobReport>;
}
