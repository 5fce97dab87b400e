//! In-memory backend double for unit tests.
//!
//! `FakeConnector` implements the full connector contract over plain maps,
//! answering with the same error shapes the real management API uses, and
//! counts mutating calls so tests can assert idempotency.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fabricfs_connect::{
    ClusterConnector, ClusterSummary, ConnectorError, CopyJob, CopyJobReport, CopyJobState,
    DirectoryOwner, DirectoryStat, FilesetInfo, FilesetKind, FilesetOptions, FilesystemDetails,
    FilesystemKind, FilesystemMount, MountStatus, PlacementPolicy, Result, SnapshotEntry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedCopyOutcome {
    Completed,
    Failed,
    Unknown,
    AbortedDuplicate,
    TransportError,
}

#[derive(Default)]
struct State {
    filesystems: HashMap<String, FilesystemDetails>,
    filesets: HashMap<(String, String), FilesetInfo>,
    quotas: HashMap<(String, String), u64>,
    directories: HashSet<(String, String)>,
    dir_links: HashMap<(String, String), u64>,
    symlinks: HashMap<(String, String), (String, String)>,
    snapshots: HashMap<(String, String), Vec<SnapshotEntry>>,
    node_classes: HashSet<String>,
    tiers: HashMap<String, HashSet<String>>,
    policy_partitions: HashMap<String, HashSet<String>>,
    next_inode_space: u32,
    next_job_id: u64,
    copy_outcome: Option<ScriptedCopyOutcome>,
}

pub struct FakeConnector {
    pub cluster_id: String,
    pub cluster_name: String,
    pub version: String,
    pub quota_enabled: bool,
    pub fail_cluster_summary: bool,
    inner: Mutex<State>,
    pub create_fileset_calls: AtomicUsize,
    pub link_fileset_calls: AtomicUsize,
    pub set_quota_calls: AtomicUsize,
    pub make_directory_calls: AtomicUsize,
    pub create_snapshot_calls: AtomicUsize,
    pub copy_launches: AtomicUsize,
}

fn fileset_not_found() -> ConnectorError {
    ConnectorError::Backend {
        code: "400".to_string(),
        message: "Invalid value in 'filesetName'".to_string(),
    }
}

fn directory_absent() -> ConnectorError {
    ConnectorError::Backend {
        code: "EFSSG0264C".to_string(),
        message: "path does not exist".to_string(),
    }
}

// The backend rounds inode limits up to its allocation granularity.
fn parse_inode_limit(limit: Option<&str>) -> u64 {
    match limit {
        Some("1M") => 1_048_576,
        Some(raw) => {
            let requested: u64 = raw.parse().unwrap_or(100_096);
            requested.div_ceil(1024) * 1024
        }
        None => 100_096,
    }
}

impl FakeConnector {
    pub fn new(cluster_id: &str, cluster_name: &str) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            cluster_name: cluster_name.to_string(),
            version: "5.1.9-2".to_string(),
            quota_enabled: true,
            fail_cluster_summary: false,
            inner: Mutex::new(State::default()),
            create_fileset_calls: AtomicUsize::new(0),
            link_fileset_calls: AtomicUsize::new(0),
            set_quota_calls: AtomicUsize::new(0),
            make_directory_calls: AtomicUsize::new(0),
            create_snapshot_calls: AtomicUsize::new(0),
            copy_launches: AtomicUsize::new(0),
        }
    }

    pub fn with_filesystem(self, name: &str, uuid: &str, mount_point: &str) -> Self {
        {
            let mut state = self.inner.lock().unwrap();
            state.filesystems.insert(
                name.to_string(),
                FilesystemDetails {
                    name: name.to_string(),
                    uuid: uuid.to_string(),
                    kind: FilesystemKind::Local,
                    version: "28.00".to_string(),
                    mount: FilesystemMount {
                        mount_point: mount_point.to_string(),
                        status: MountStatus::Mounted,
                        remote_device_name: format!("{}:{}", self.cluster_name, name),
                        nodes_mounted: vec!["node-1".to_string(), "node-2".to_string()],
                    },
                },
            );
        }
        self
    }

    pub fn set_filesystem_version(&self, name: &str, version: &str) {
        let mut state = self.inner.lock().unwrap();
        if let Some(fs) = state.filesystems.get_mut(name) {
            fs.version = version.to_string();
        }
    }

    pub fn add_directory(&self, filesystem: &str, path: &str) {
        let mut state = self.inner.lock().unwrap();
        state
            .directories
            .insert((filesystem.to_string(), path.to_string()));
    }

    pub fn set_directory_links(&self, filesystem: &str, path: &str, nlink: u64) {
        let mut state = self.inner.lock().unwrap();
        state
            .dir_links
            .insert((filesystem.to_string(), path.to_string()), nlink);
    }

    pub fn add_independent_fileset(&self, filesystem: &str, name: &str, path: &str) {
        let mut state = self.inner.lock().unwrap();
        state.next_inode_space += 1;
        let inode_space = state.next_inode_space;
        state.filesets.insert(
            (filesystem.to_string(), name.to_string()),
            FilesetInfo {
                name: name.to_string(),
                path: path.to_string(),
                comment: fabricfs_connect::FILESET_COMMENT.to_string(),
                is_inode_space_owner: true,
                inode_space,
                parent_id: 0,
                max_num_inodes: 100_096,
            },
        );
    }

    pub fn add_dependent_fileset(&self, filesystem: &str, name: &str, path: &str, parent: &str) {
        let mut state = self.inner.lock().unwrap();
        let inode_space = state
            .filesets
            .get(&(filesystem.to_string(), parent.to_string()))
            .map(|p| p.inode_space)
            .unwrap_or(0);
        state.filesets.insert(
            (filesystem.to_string(), name.to_string()),
            FilesetInfo {
                name: name.to_string(),
                path: path.to_string(),
                comment: fabricfs_connect::FILESET_COMMENT.to_string(),
                is_inode_space_owner: false,
                inode_space,
                parent_id: 1,
                max_num_inodes: 100_096,
            },
        );
    }

    pub fn set_fileset_comment(&self, filesystem: &str, name: &str, comment: &str) {
        let mut state = self.inner.lock().unwrap();
        if let Some(info) = state
            .filesets
            .get_mut(&(filesystem.to_string(), name.to_string()))
        {
            info.comment = comment.to_string();
        }
    }

    pub fn set_quota(&self, filesystem: &str, name: &str, bytes: u64) {
        let mut state = self.inner.lock().unwrap();
        state
            .quotas
            .insert((filesystem.to_string(), name.to_string()), bytes);
    }

    pub fn add_snapshot_with_age(&self, filesystem: &str, fileset: &str, name: &str, age_secs: i64) {
        let mut state = self.inner.lock().unwrap();
        let created: DateTime<Utc> = Utc::now() - Duration::seconds(age_secs);
        state
            .snapshots
            .entry((filesystem.to_string(), fileset.to_string()))
            .or_default()
            .push(SnapshotEntry {
                name: name.to_string(),
                created: Some(created),
            });
    }

    pub fn add_node_class(&self, node_class: &str) {
        let mut state = self.inner.lock().unwrap();
        state.node_classes.insert(node_class.to_string());
    }

    pub fn add_tier(&self, filesystem: &str, tier: &str) {
        let mut state = self.inner.lock().unwrap();
        state
            .tiers
            .entry(filesystem.to_string())
            .or_default()
            .insert(tier.to_string());
    }

    pub fn set_copy_outcome(&self, outcome: ScriptedCopyOutcome) {
        let mut state = self.inner.lock().unwrap();
        state.copy_outcome = Some(outcome);
    }

    // Accessors for assertions.

    pub fn fileset(&self, filesystem: &str, name: &str) -> Option<FilesetInfo> {
        let state = self.inner.lock().unwrap();
        state
            .filesets
            .get(&(filesystem.to_string(), name.to_string()))
            .cloned()
    }

    pub fn quota_of(&self, filesystem: &str, name: &str) -> Option<u64> {
        let state = self.inner.lock().unwrap();
        state
            .quotas
            .get(&(filesystem.to_string(), name.to_string()))
            .copied()
    }

    pub fn has_directory(&self, filesystem: &str, path: &str) -> bool {
        let state = self.inner.lock().unwrap();
        state
            .directories
            .contains(&(filesystem.to_string(), path.to_string()))
    }

    pub fn has_symlink(&self, filesystem: &str, link: &str) -> bool {
        let state = self.inner.lock().unwrap();
        state
            .symlinks
            .contains_key(&(filesystem.to_string(), link.to_string()))
    }

    pub fn snapshot_names(&self, filesystem: &str, fileset: &str) -> Vec<String> {
        let state = self.inner.lock().unwrap();
        state
            .snapshots
            .get(&(filesystem.to_string(), fileset.to_string()))
            .map(|entries| entries.iter().map(|e| e.name.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn cluster_id(&self) -> Result<String> {
        Ok(self.cluster_id.clone())
    }

    async fn cluster_summary(&self) -> Result<ClusterSummary> {
        if self.fail_cluster_summary {
            return Err(ConnectorError::Transport("connection refused".to_string()));
        }
        Ok(ClusterSummary {
            cluster_name: self.cluster_name.clone(),
            cluster_id: self.cluster_id.clone(),
        })
    }

    async fn cluster_version(&self) -> Result<String> {
        Ok(self.version.clone())
    }

    async fn is_valid_node_class(&self, node_class: &str) -> Result<bool> {
        let state = self.inner.lock().unwrap();
        if state.node_classes.is_empty() {
            return Ok(true);
        }
        Ok(state.node_classes.contains(node_class))
    }

    async fn filesystem_details(&self, filesystem: &str) -> Result<FilesystemDetails> {
        let state = self.inner.lock().unwrap();
        state.filesystems.get(filesystem).cloned().ok_or_else(|| {
            ConnectorError::Backend {
                code: "400".to_string(),
                message: "Invalid value in filesystemName".to_string(),
            }
        })
    }

    async fn filesystem_mount_details(&self, filesystem: &str) -> Result<FilesystemMount> {
        Ok(self.filesystem_details(filesystem).await?.mount)
    }

    async fn filesystem_name_from_uuid(&self, uuid: &str) -> Result<String> {
        let state = self.inner.lock().unwrap();
        state
            .filesystems
            .values()
            .find(|fs| fs.uuid == uuid)
            .map(|fs| fs.name.clone())
            .ok_or_else(|| {
                ConnectorError::InvalidResponse(format!("no filesystem with uuid {uuid}"))
            })
    }

    async fn is_quota_enabled(&self, _filesystem: &str) -> Result<bool> {
        Ok(self.quota_enabled)
    }

    async fn mount_filesystem(&self, filesystem: &str, node: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if let Some(fs) = state.filesystems.get_mut(filesystem) {
            fs.mount.nodes_mounted.push(node.to_string());
        }
        Ok(())
    }

    async fn list_fileset(&self, filesystem: &str, fileset: &str) -> Result<FilesetInfo> {
        let state = self.inner.lock().unwrap();
        state
            .filesets
            .get(&(filesystem.to_string(), fileset.to_string()))
            .cloned()
            .ok_or_else(fileset_not_found)
    }

    async fn create_fileset(
        &self,
        filesystem: &str,
        fileset: &str,
        options: &FilesetOptions,
    ) -> Result<()> {
        self.create_fileset_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.lock().unwrap();
        let key = (filesystem.to_string(), fileset.to_string());
        if state.filesets.contains_key(&key) {
            return Err(ConnectorError::Backend {
                code: "EFSSG0020C".to_string(),
                message: format!("fileset {fileset} already exists"),
            });
        }
        let independent = !matches!(options.kind, Some(FilesetKind::Dependent));
        let inode_space = if independent {
            state.next_inode_space += 1;
            state.next_inode_space
        } else {
            options
                .parent_fileset
                .as_ref()
                .and_then(|p| {
                    state
                        .filesets
                        .get(&(filesystem.to_string(), p.clone()))
                        .map(|info| info.inode_space)
                })
                .unwrap_or(0)
        };
        state.filesets.insert(
            key,
            FilesetInfo {
                name: fileset.to_string(),
                path: String::new(),
                comment: options.comment.clone(),
                is_inode_space_owner: independent,
                inode_space,
                parent_id: if independent { 0 } else { 1 },
                max_num_inodes: parse_inode_limit(options.inode_limit.as_deref()),
            },
        );
        Ok(())
    }

    async fn link_fileset(
        &self,
        filesystem: &str,
        fileset: &str,
        junction_path: &str,
    ) -> Result<()> {
        self.link_fileset_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.lock().unwrap();
        match state
            .filesets
            .get_mut(&(filesystem.to_string(), fileset.to_string()))
        {
            Some(info) => {
                info.path = junction_path.to_string();
                Ok(())
            }
            None => Err(fileset_not_found()),
        }
    }

    async fn update_fileset_inode_limit(
        &self,
        filesystem: &str,
        fileset: &str,
        inode_limit: &str,
    ) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        match state
            .filesets
            .get_mut(&(filesystem.to_string(), fileset.to_string()))
        {
            Some(info) => {
                info.max_num_inodes = parse_inode_limit(Some(inode_limit));
                Ok(())
            }
            None => Err(fileset_not_found()),
        }
    }

    async fn delete_fileset(&self, filesystem: &str, fileset: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        let key = (filesystem.to_string(), fileset.to_string());
        if state.filesets.remove(&key).is_none() {
            return Err(ConnectorError::Backend {
                code: "EFSSG0072C".to_string(),
                message: format!("fileset {fileset} already deleted"),
            });
        }
        state.quotas.remove(&key);
        state.snapshots.remove(&key);
        Ok(())
    }

    async fn filesets_in_inode_space(
        &self,
        filesystem: &str,
        inode_space: u32,
    ) -> Result<Vec<FilesetInfo>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .filesets
            .iter()
            .filter(|((fs, _), info)| fs == filesystem && info.inode_space == inode_space)
            .map(|(_, info)| info.clone())
            .collect())
    }

    async fn fileset_quota(&self, filesystem: &str, fileset: &str) -> Result<u64> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .quotas
            .get(&(filesystem.to_string(), fileset.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn set_fileset_quota(&self, filesystem: &str, fileset: &str, bytes: u64) -> Result<()> {
        self.set_quota_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.lock().unwrap();
        state
            .quotas
            .insert((filesystem.to_string(), fileset.to_string()), bytes);
        Ok(())
    }

    async fn run_fileset_refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn directory_exists(&self, filesystem: &str, path: &str) -> Result<bool> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .directories
            .contains(&(filesystem.to_string(), path.to_string())))
    }

    async fn make_directory(
        &self,
        filesystem: &str,
        path: &str,
        _owner: &DirectoryOwner,
    ) -> Result<()> {
        self.make_directory_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.lock().unwrap();
        state
            .directories
            .insert((filesystem.to_string(), path.to_string()));
        Ok(())
    }

    async fn delete_directory(&self, filesystem: &str, path: &str, recursive: bool) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        let key = (filesystem.to_string(), path.to_string());
        if !state.directories.remove(&key) {
            return Err(directory_absent());
        }
        if recursive {
            let prefix = format!("{path}/");
            state
                .directories
                .retain(|(fs, p)| fs != filesystem || !p.starts_with(&prefix));
        }
        Ok(())
    }

    async fn stat_directory(&self, filesystem: &str, path: &str) -> Result<DirectoryStat> {
        let state = self.inner.lock().unwrap();
        let key = (filesystem.to_string(), path.to_string());
        if !state.directories.contains(&key) {
            return Err(directory_absent());
        }
        Ok(DirectoryStat {
            nlink: state.dir_links.get(&key).copied().unwrap_or(2),
        })
    }

    async fn create_symlink(
        &self,
        filesystem: &str,
        target_filesystem: &str,
        target_path: &str,
        link_path: &str,
    ) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.symlinks.insert(
            (filesystem.to_string(), link_path.to_string()),
            (target_filesystem.to_string(), target_path.to_string()),
        );
        state
            .directories
            .insert((filesystem.to_string(), link_path.to_string()));
        Ok(())
    }

    async fn delete_symlink(&self, filesystem: &str, link_path: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        let key = (filesystem.to_string(), link_path.to_string());
        state.symlinks.remove(&key);
        state.directories.remove(&key);
        Ok(())
    }

    async fn list_fileset_snapshots(
        &self,
        filesystem: &str,
        fileset: &str,
    ) -> Result<Vec<SnapshotEntry>> {
        let state = self.inner.lock().unwrap();
        if !state
            .filesets
            .contains_key(&(filesystem.to_string(), fileset.to_string()))
        {
            return Err(ConnectorError::Backend {
                code: "EFSSG0072C".to_string(),
                message: format!("fileset {fileset} already deleted"),
            });
        }
        Ok(state
            .snapshots
            .get(&(filesystem.to_string(), fileset.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_fileset_snapshots(
        &self,
        filesystem: &str,
        fileset: &str,
    ) -> Result<Vec<SnapshotEntry>> {
        let mut entries = self.list_fileset_snapshots(filesystem, fileset).await?;
        entries.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(entries)
    }

    async fn snapshot_exists(
        &self,
        filesystem: &str,
        fileset: &str,
        snapshot: &str,
    ) -> Result<bool> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .snapshots
            .get(&(filesystem.to_string(), fileset.to_string()))
            .map(|entries| entries.iter().any(|e| e.name == snapshot))
            .unwrap_or(false))
    }

    async fn create_snapshot(&self, filesystem: &str, fileset: &str, snapshot: &str) -> Result<()> {
        self.create_snapshot_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.lock().unwrap();
        state
            .snapshots
            .entry((filesystem.to_string(), fileset.to_string()))
            .or_default()
            .push(SnapshotEntry {
                name: snapshot.to_string(),
                created: Some(Utc::now()),
            });
        Ok(())
    }

    async fn delete_snapshot(&self, filesystem: &str, fileset: &str, snapshot: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if let Some(entries) = state
            .snapshots
            .get_mut(&(filesystem.to_string(), fileset.to_string()))
        {
            entries.retain(|e| e.name != snapshot);
        }
        Ok(())
    }

    async fn snapshot_create_time(
        &self,
        filesystem: &str,
        fileset: &str,
        snapshot: &str,
    ) -> Result<DateTime<Utc>> {
        let state = self.inner.lock().unwrap();
        state
            .snapshots
            .get(&(filesystem.to_string(), fileset.to_string()))
            .and_then(|entries| entries.iter().find(|e| e.name == snapshot))
            .and_then(|e| e.created)
            .ok_or_else(|| {
                ConnectorError::InvalidResponse(format!("no creation time for snapshot {snapshot}"))
            })
    }

    async fn set_filesystem_policy(
        &self,
        filesystem: &str,
        policy: &PlacementPolicy,
    ) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state
            .policy_partitions
            .entry(filesystem.to_string())
            .or_default()
            .insert(policy.partition.clone());
        Ok(())
    }

    async fn policy_partition_exists(&self, filesystem: &str, partition: &str) -> Result<bool> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .policy_partitions
            .get(filesystem)
            .map(|parts| parts.contains(partition))
            .unwrap_or(false))
    }

    async fn tier_exists(&self, filesystem: &str, tier: &str) -> Result<bool> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .tiers
            .get(filesystem)
            .map(|tiers| tiers.contains(tier))
            .unwrap_or(false))
    }

    async fn first_data_tier(&self, _filesystem: &str) -> Result<String> {
        Ok("system".to_string())
    }

    async fn copy_fileset_path(
        &self,
        _filesystem: &str,
        _fileset: &str,
        _source_path: &str,
        _target_path: &str,
        _node_class: &str,
    ) -> Result<CopyJob> {
        self.copy_launches.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.lock().unwrap();
        state.next_job_id += 1;
        Ok(CopyJob {
            job_id: state.next_job_id,
        })
    }

    async fn copy_directory_path(
        &self,
        _filesystem: &str,
        _source_path: &str,
        _target_path: &str,
        _node_class: &str,
    ) -> Result<CopyJob> {
        self.copy_launches.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.lock().unwrap();
        state.next_job_id += 1;
        Ok(CopyJob {
            job_id: state.next_job_id,
        })
    }

    async fn copy_snapshot_path(
        &self,
        _filesystem: &str,
        _fileset: &str,
        _snapshot: &str,
        _source_path: &str,
        _target_path: &str,
        _node_class: &str,
    ) -> Result<CopyJob> {
        self.copy_launches.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.lock().unwrap();
        state.next_job_id += 1;
        Ok(CopyJob {
            job_id: state.next_job_id,
        })
    }

    async fn wait_for_copy_job(&self, _job: &CopyJob) -> Result<CopyJobReport> {
        let outcome = {
            let state = self.inner.lock().unwrap();
            state.copy_outcome.unwrap_or(ScriptedCopyOutcome::Completed)
        };
        match outcome {
            ScriptedCopyOutcome::Completed => Ok(CopyJobReport {
                state: CopyJobState::Completed,
                message: String::new(),
            }),
            ScriptedCopyOutcome::Failed => Ok(CopyJobReport {
                state: CopyJobState::Failed,
                message: "copy failed".to_string(),
            }),
            ScriptedCopyOutcome::Unknown => Ok(CopyJobReport {
                state: CopyJobState::Unknown,
                message: "job status unknown".to_string(),
            }),
            ScriptedCopyOutcome::AbortedDuplicate => Err(ConnectorError::Backend {
                code: "EFSSG0632C".to_string(),
                message: "Command execution aborted".to_string(),
            }),
            ScriptedCopyOutcome::TransportError => {
                Err(ConnectorError::Transport("connection reset".to_string()))
            }
        }
    }
}
