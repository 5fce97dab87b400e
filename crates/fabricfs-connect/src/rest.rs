//! REST client for the FabricFS cluster management API.
//!
//! One [`RestConnector`] fronts one cluster's management endpoint. Requests
//! authenticate with basic auth; failures surface the management API's
//! stable error code through [`ConnectorError::Backend`] so callers can
//! classify them.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{ConnectorError, Result};
use crate::types::*;
use crate::ClusterConnector;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Basic-auth credentials for the management endpoint, loaded from the
/// secret document the operator mounts for each cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct RestCredentials {
    pub username: String,
    pub password: String,
}

impl RestCredentials {
    pub fn from_file(path: &Path) -> Result<RestCredentials> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ConnectorError::Transport(format!(
                "unable to read credentials {}: {err}",
                path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            ConnectorError::InvalidResponse(format!(
                "unable to parse credentials {}: {err}",
                path.display()
            ))
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    status: ApiStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MountResponse {
    mount_point: String,
    status: String,
    #[serde(default)]
    remote_device_name: String,
    #[serde(default)]
    nodes_mounted: Vec<String>,
}

impl MountResponse {
    fn into_mount(self) -> FilesystemMount {
        FilesystemMount {
            mount_point: self.mount_point,
            status: if self.status == "mounted" {
                MountStatus::Mounted
            } else {
                MountStatus::NotMounted
            },
            remote_device_name: self.remote_device_name,
            nodes_mounted: self.nodes_mounted,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilesystemResponse {
    name: String,
    uuid: String,
    #[serde(rename = "type", default)]
    fs_type: String,
    #[serde(default)]
    version: String,
    mount: MountResponse,
}

impl FilesystemResponse {
    fn into_details(self) -> FilesystemDetails {
        FilesystemDetails {
            name: self.name,
            uuid: self.uuid,
            kind: if self.fs_type == "remote" {
                FilesystemKind::Remote
            } else {
                FilesystemKind::Local
            },
            version: self.version,
            mount: self.mount.into_mount(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilesetResponse {
    fileset_name: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    is_inode_space_owner: bool,
    #[serde(default)]
    inode_space: u32,
    #[serde(default)]
    parent_id: u32,
    #[serde(default)]
    max_num_inodes: u64,
}

impl FilesetResponse {
    fn into_info(self) -> FilesetInfo {
        FilesetInfo {
            name: self.fileset_name,
            path: self.path,
            comment: self.comment,
            is_inode_space_owner: self.is_inode_space_owner,
            inode_space: self.inode_space,
            parent_id: self.parent_id,
            max_num_inodes: self.max_num_inodes,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotResponse {
    snapshot_name: String,
    #[serde(default)]
    created: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResponse {
    job_id: u64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterResponse {
    cluster_id: String,
    cluster_name: String,
    #[serde(default)]
    version: String,
}

/// Connector for one cluster's management endpoint.
pub struct RestConnector {
    client: reqwest::Client,
    base_url: String,
    credentials: RestCredentials,
}

impl RestConnector {
    pub fn new(
        gui_host: &str,
        gui_port: u16,
        credentials: RestCredentials,
        accept_invalid_certs: bool,
    ) -> Result<RestConnector> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|err| ConnectorError::Transport(format!("unable to build client: {err}")))?;
        Ok(RestConnector {
            client,
            base_url: format!("https://{gui_host}:{gui_port}/mgmt/v2"),
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await
            .map_err(|err| ConnectorError::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ConnectorError::Transport(err.to_string()))?;

        if !status.is_success() {
            if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
                return Err(ConnectorError::Backend {
                    code: api_error.status.code,
                    message: api_error.status.message,
                });
            }
            return Err(ConnectorError::Backend {
                code: status.as_u16().to_string(),
                message: body,
            });
        }

        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|err| {
            ConnectorError::InvalidResponse(format!("malformed response body: {err}"))
        })
    }

    async fn get(&self, path: &str) -> Result<Value> {
        debug!(path, "management API GET");
        self.execute(self.client.get(self.url(path))).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        debug!(path, "management API POST");
        self.execute(self.client.post(self.url(path)).json(&body)).await
    }

    async fn put(&self, path: &str, body: Value) -> Result<Value> {
        debug!(path, "management API PUT");
        self.execute(self.client.put(self.url(path)).json(&body)).await
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        debug!(path, "management API DELETE");
        self.execute(self.client.delete(self.url(path))).await
    }

    fn parse<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
        serde_json::from_value(value).map_err(|err| {
            ConnectorError::InvalidResponse(format!("unexpected response shape: {err}"))
        })
    }

    fn encode(component: &str) -> String {
        urlencoding::encode(component).into_owned()
    }

    async fn launch_copy(&self, path: &str, body: Value) -> Result<CopyJob> {
        let value = self.post(path, body).await?;
        let job: JobResponse = Self::parse(value)?;
        Ok(CopyJob { job_id: job.job_id })
    }
}

#[async_trait]
impl ClusterConnector for RestConnector {
    async fn cluster_id(&self) -> Result<String> {
        Ok(self.cluster_summary().await?.cluster_id)
    }

    async fn cluster_summary(&self) -> Result<ClusterSummary> {
        let cluster: ClusterResponse = Self::parse(self.get("cluster").await?)?;
        Ok(ClusterSummary {
            cluster_name: cluster.cluster_name,
            cluster_id: cluster.cluster_id,
        })
    }

    async fn cluster_version(&self) -> Result<String> {
        let cluster: ClusterResponse = Self::parse(self.get("cluster").await?)?;
        Ok(cluster.version)
    }

    async fn is_valid_node_class(&self, node_class: &str) -> Result<bool> {
        match self
            .get(&format!("nodeclasses/{}", Self::encode(node_class)))
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.is_directory_absent() => Ok(false),
            Err(ConnectorError::Backend { code, .. }) if code == "404" => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn filesystem_details(&self, filesystem: &str) -> Result<FilesystemDetails> {
        let fs: FilesystemResponse = Self::parse(
            self.get(&format!("filesystems/{}", Self::encode(filesystem)))
                .await?,
        )?;
        Ok(fs.into_details())
    }

    async fn filesystem_mount_details(&self, filesystem: &str) -> Result<FilesystemMount> {
        Ok(self.filesystem_details(filesystem).await?.mount)
    }

    async fn filesystem_name_from_uuid(&self, uuid: &str) -> Result<String> {
        let value = self
            .get(&format!("filesystems?uuid={}", Self::encode(uuid)))
            .await?;
        let filesystems: Vec<FilesystemResponse> = Self::parse(value)?;
        filesystems
            .into_iter()
            .next()
            .map(|fs| fs.name)
            .ok_or_else(|| {
                ConnectorError::InvalidResponse(format!("no filesystem with uuid {uuid}"))
            })
    }

    async fn is_quota_enabled(&self, filesystem: &str) -> Result<bool> {
        let value = self
            .get(&format!("filesystems/{}/quotas", Self::encode(filesystem)))
            .await?;
        Ok(value
            .get("quotasEnforced")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn mount_filesystem(&self, filesystem: &str, node: &str) -> Result<()> {
        self.put(
            &format!("filesystems/{}/mount", Self::encode(filesystem)),
            json!({ "nodes": [node] }),
        )
        .await?;
        Ok(())
    }

    async fn list_fileset(&self, filesystem: &str, fileset: &str) -> Result<FilesetInfo> {
        let value = self
            .get(&format!(
                "filesystems/{}/filesets/{}",
                Self::encode(filesystem),
                Self::encode(fileset)
            ))
            .await?;
        let fileset: FilesetResponse = Self::parse(value)?;
        Ok(fileset.into_info())
    }

    async fn create_fileset(
        &self,
        filesystem: &str,
        fileset: &str,
        options: &FilesetOptions,
    ) -> Result<()> {
        let mut body = json!({
            "filesetName": fileset,
            "comment": options.comment,
        });
        if let Some(kind) = options.kind {
            body["inodeSpace"] = json!(match kind {
                FilesetKind::Independent => "new",
                FilesetKind::Dependent => "existing",
            });
        }
        if let Some(parent) = &options.parent_fileset {
            body["parentFileset"] = json!(parent);
        }
        if let Some(uid) = &options.owner_uid {
            body["ownerUid"] = json!(uid);
        }
        if let Some(gid) = &options.owner_gid {
            body["ownerGid"] = json!(gid);
        }
        if let Some(permissions) = &options.permissions {
            body["permissions"] = json!(permissions);
        }
        if let Some(inode_limit) = &options.inode_limit {
            body["maxNumInodes"] = json!(inode_limit);
        }
        self.post(
            &format!("filesystems/{}/filesets", Self::encode(filesystem)),
            body,
        )
        .await?;
        Ok(())
    }

    async fn link_fileset(
        &self,
        filesystem: &str,
        fileset: &str,
        junction_path: &str,
    ) -> Result<()> {
        self.post(
            &format!(
                "filesystems/{}/filesets/{}/link",
                Self::encode(filesystem),
                Self::encode(fileset)
            ),
            json!({ "path": junction_path }),
        )
        .await?;
        Ok(())
    }

    async fn update_fileset_inode_limit(
        &self,
        filesystem: &str,
        fileset: &str,
        inode_limit: &str,
    ) -> Result<()> {
        self.put(
            &format!(
                "filesystems/{}/filesets/{}",
                Self::encode(filesystem),
                Self::encode(fileset)
            ),
            json!({ "maxNumInodes": inode_limit }),
        )
        .await?;
        Ok(())
    }

    async fn delete_fileset(&self, filesystem: &str, fileset: &str) -> Result<()> {
        self.delete(&format!(
            "filesystems/{}/filesets/{}",
            Self::encode(filesystem),
            Self::encode(fileset)
        ))
        .await?;
        Ok(())
    }

    async fn filesets_in_inode_space(
        &self,
        filesystem: &str,
        inode_space: u32,
    ) -> Result<Vec<FilesetInfo>> {
        let value = self
            .get(&format!(
                "filesystems/{}/filesets?inodeSpace={inode_space}",
                Self::encode(filesystem)
            ))
            .await?;
        let filesets: Vec<FilesetResponse> = Self::parse(value)?;
        Ok(filesets.into_iter().map(FilesetResponse::into_info).collect())
    }

    async fn fileset_quota(&self, filesystem: &str, fileset: &str) -> Result<u64> {
        let value = self
            .get(&format!(
                "filesystems/{}/filesets/{}/quota",
                Self::encode(filesystem),
                Self::encode(fileset)
            ))
            .await?;
        Ok(value
            .get("blockLimitBytes")
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    async fn set_fileset_quota(&self, filesystem: &str, fileset: &str, bytes: u64) -> Result<()> {
        self.put(
            &format!(
                "filesystems/{}/filesets/{}/quota",
                Self::encode(filesystem),
                Self::encode(fileset)
            ),
            json!({ "blockLimitBytes": bytes }),
        )
        .await?;
        Ok(())
    }

    async fn run_fileset_refresh(&self) -> Result<()> {
        self.post("filesets/refresh", json!({})).await?;
        Ok(())
    }

    async fn directory_exists(&self, filesystem: &str, path: &str) -> Result<bool> {
        match self.stat_directory(filesystem, path).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_directory_absent() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn make_directory(
        &self,
        filesystem: &str,
        path: &str,
        owner: &DirectoryOwner,
    ) -> Result<()> {
        let mut body = json!({
            "path": path,
            "uid": owner.uid,
            "gid": owner.gid,
        });
        if let Some(permissions) = &owner.permissions {
            body["permissions"] = json!(permissions);
        }
        self.post(
            &format!("filesystems/{}/directories", Self::encode(filesystem)),
            body,
        )
        .await?;
        Ok(())
    }

    async fn delete_directory(&self, filesystem: &str, path: &str, recursive: bool) -> Result<()> {
        self.delete(&format!(
            "filesystems/{}/directories/{}?recursive={recursive}",
            Self::encode(filesystem),
            Self::encode(path)
        ))
        .await?;
        Ok(())
    }

    async fn stat_directory(&self, filesystem: &str, path: &str) -> Result<DirectoryStat> {
        let value = self
            .get(&format!(
                "filesystems/{}/directories/{}",
                Self::encode(filesystem),
                Self::encode(path)
            ))
            .await?;
        let nlink = value.get("nlink").and_then(Value::as_u64).ok_or_else(|| {
            ConnectorError::InvalidResponse(format!("missing link count in stat of {path}"))
        })?;
        Ok(DirectoryStat { nlink })
    }

    async fn create_symlink(
        &self,
        filesystem: &str,
        target_filesystem: &str,
        target_path: &str,
        link_path: &str,
    ) -> Result<()> {
        self.post(
            &format!("filesystems/{}/symlinks", Self::encode(filesystem)),
            json!({
                "linkPath": link_path,
                "targetFilesystem": target_filesystem,
                "targetPath": target_path,
            }),
        )
        .await?;
        Ok(())
    }

    async fn delete_symlink(&self, filesystem: &str, link_path: &str) -> Result<()> {
        self.delete(&format!(
            "filesystems/{}/symlinks/{}",
            Self::encode(filesystem),
            Self::encode(link_path)
        ))
        .await?;
        Ok(())
    }

    async fn list_fileset_snapshots(
        &self,
        filesystem: &str,
        fileset: &str,
    ) -> Result<Vec<SnapshotEntry>> {
        let value = self
            .get(&format!(
                "filesystems/{}/filesets/{}/snapshots",
                Self::encode(filesystem),
                Self::encode(fileset)
            ))
            .await?;
        let snapshots: Vec<SnapshotResponse> = Self::parse(value)?;
        Ok(snapshots
            .into_iter()
            .map(|s| SnapshotEntry {
                name: s.snapshot_name,
                created: s.created,
            })
            .collect())
    }

    async fn latest_fileset_snapshots(
        &self,
        filesystem: &str,
        fileset: &str,
    ) -> Result<Vec<SnapshotEntry>> {
        let value = self
            .get(&format!(
                "filesystems/{}/filesets/{}/snapshots?latest=true",
                Self::encode(filesystem),
                Self::encode(fileset)
            ))
            .await?;
        let snapshots: Vec<SnapshotResponse> = Self::parse(value)?;
        Ok(snapshots
            .into_iter()
            .map(|s| SnapshotEntry {
                name: s.snapshot_name,
                created: s.created,
            })
            .collect())
    }

    async fn snapshot_exists(
        &self,
        filesystem: &str,
        fileset: &str,
        snapshot: &str,
    ) -> Result<bool> {
        let snapshots = self.list_fileset_snapshots(filesystem, fileset).await?;
        Ok(snapshots.iter().any(|s| s.name == snapshot))
    }

    async fn create_snapshot(&self, filesystem: &str, fileset: &str, snapshot: &str) -> Result<()> {
        self.post(
            &format!(
                "filesystems/{}/filesets/{}/snapshots",
                Self::encode(filesystem),
                Self::encode(fileset)
            ),
            json!({ "snapshotName": snapshot }),
        )
        .await?;
        Ok(())
    }

    async fn delete_snapshot(&self, filesystem: &str, fileset: &str, snapshot: &str) -> Result<()> {
        self.delete(&format!(
            "filesystems/{}/filesets/{}/snapshots/{}",
            Self::encode(filesystem),
            Self::encode(fileset),
            Self::encode(snapshot)
        ))
        .await?;
        Ok(())
    }

    async fn snapshot_create_time(
        &self,
        filesystem: &str,
        fileset: &str,
        snapshot: &str,
    ) -> Result<DateTime<Utc>> {
        let value = self
            .get(&format!(
                "filesystems/{}/filesets/{}/snapshots/{}",
                Self::encode(filesystem),
                Self::encode(fileset),
                Self::encode(snapshot)
            ))
            .await?;
        let snapshot: SnapshotResponse = Self::parse(value)?;
        snapshot.created.ok_or_else(|| {
            ConnectorError::InvalidResponse(format!(
                "no creation time reported for snapshot {}",
                snapshot.snapshot_name
            ))
        })
    }

    async fn set_filesystem_policy(
        &self,
        filesystem: &str,
        policy: &PlacementPolicy,
    ) -> Result<()> {
        self.put(
            &format!("filesystems/{}/policies", Self::encode(filesystem)),
            json!({
                "policy": policy.policy,
                "priority": policy.priority,
                "partition": policy.partition,
            }),
        )
        .await?;
        Ok(())
    }

    async fn policy_partition_exists(&self, filesystem: &str, partition: &str) -> Result<bool> {
        match self
            .get(&format!(
                "filesystems/{}/policies/partitions/{}",
                Self::encode(filesystem),
                Self::encode(partition)
            ))
            .await
        {
            Ok(_) => Ok(true),
            Err(ConnectorError::Backend { code, .. }) if code == "404" => Ok(false),
            Err(err) if err.is_directory_absent() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn tier_exists(&self, filesystem: &str, tier: &str) -> Result<bool> {
        match self
            .get(&format!(
                "filesystems/{}/pools/{}",
                Self::encode(filesystem),
                Self::encode(tier)
            ))
            .await
        {
            Ok(_) => Ok(true),
            Err(ConnectorError::Backend { code, .. }) if code == "404" => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn first_data_tier(&self, filesystem: &str) -> Result<String> {
        let value = self
            .get(&format!("filesystems/{}/pools", Self::encode(filesystem)))
            .await?;
        let pools: Vec<String> = Self::parse(value)?;
        if pools.is_empty() {
            return Err(ConnectorError::InvalidResponse(format!(
                "no pools reported for {filesystem}"
            )));
        }
        Ok(pools
            .iter()
            .find(|pool| pool.as_str() != "system")
            .cloned()
            .unwrap_or_else(|| pools[0].clone()))
    }

    async fn copy_fileset_path(
        &self,
        filesystem: &str,
        fileset: &str,
        source_path: &str,
        target_path: &str,
        node_class: &str,
    ) -> Result<CopyJob> {
        self.launch_copy(
            &format!(
                "filesystems/{}/filesets/{}/copy",
                Self::encode(filesystem),
                Self::encode(fileset)
            ),
            json!({
                "sourcePath": source_path,
                "targetPath": target_path,
                "nodeClass": node_class,
            }),
        )
        .await
    }

    async fn copy_directory_path(
        &self,
        filesystem: &str,
        source_path: &str,
        target_path: &str,
        node_class: &str,
    ) -> Result<CopyJob> {
        self.launch_copy(
            &format!("filesystems/{}/directorycopy", Self::encode(filesystem)),
            json!({
                "sourcePath": source_path,
                "targetPath": target_path,
                "nodeClass": node_class,
            }),
        )
        .await
    }

    async fn copy_snapshot_path(
        &self,
        filesystem: &str,
        fileset: &str,
        snapshot: &str,
        source_path: &str,
        target_path: &str,
        node_class: &str,
    ) -> Result<CopyJob> {
        self.launch_copy(
            &format!(
                "filesystems/{}/filesets/{}/snapshots/{}/copy",
                Self::encode(filesystem),
                Self::encode(fileset),
                Self::encode(snapshot)
            ),
            json!({
                "sourcePath": source_path,
                "targetPath": target_path,
                "nodeClass": node_class,
            }),
        )
        .await
    }

    async fn wait_for_copy_job(&self, job: &CopyJob) -> Result<CopyJobReport> {
        loop {
            let value = self.get(&format!("jobs/{}", job.job_id)).await?;
            let report: JobResponse = Self::parse(value)?;
            match report.status.as_str() {
                "RUNNING" => {
                    tokio::time::sleep(JOB_POLL_INTERVAL).await;
                }
                "COMPLETED" => {
                    return Ok(CopyJobReport {
                        state: CopyJobState::Completed,
                        message: report.message,
                    });
                }
                "FAILED" => {
                    return Ok(CopyJobReport {
                        state: CopyJobState::Failed,
                        message: report.message,
                    });
                }
                _ => {
                    return Ok(CopyJobReport {
                        state: CopyJobState::Unknown,
                        message: report.message,
                    });
                }
            }
        }
    }
}
