//! Fileset provisioning state machine.
//!
//! A fileset target advances `Absent → Created → Linked → QuotaSet →
//! DirectoryReady`. Every transition is an idempotent check-then-act:
//! [`plan`] is a pure function from the observed backend state to the next
//! action, and [`FilesetEngine::ensure`] drives it in a loop, so a retried
//! call resumes from wherever a prior partial failure stopped instead of
//! restarting. Nothing is ever rolled back.

use std::sync::Arc;

use fabricfs_connect::{
    ClusterConnector, DirectoryOwner, FilesetInfo, FilesetKind, FilesetOptions,
};
use tracing::debug;

use crate::error::{ControllerError, Result};

/// Provisioning states, in order of progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesetState {
    Absent,
    Created,
    Linked,
    QuotaSet,
    DirectoryReady,
}

/// The desired end state for one fileset.
#[derive(Debug, Clone)]
pub struct FilesetTarget {
    pub filesystem: String,
    pub name: String,
    /// Expected independent/dependent nature of an existing fileset; `None`
    /// accepts the backend default and skips the check.
    pub kind: Option<FilesetKind>,
    pub parent: Option<String>,
    pub options: FilesetOptions,
    /// Quota to reconcile, in bytes; 0 skips quota handling entirely.
    pub quota_bytes: u64,
    /// Whether the volume data directory under the junction is part of the
    /// target.
    pub data_dir: bool,
    /// Classic-generation volumes keep their data in a `<name>-data`
    /// subdirectory; consistency-group members use the fileset root.
    pub data_dir_suffix: bool,
    pub dir_owner: DirectoryOwner,
    /// Mount point of the filesystem on its owning cluster.
    pub mount_point: String,
}

/// Backend state relevant to one target, captured in a single pass.
#[derive(Debug, Clone, Default)]
pub struct Observed {
    pub fileset: Option<FilesetInfo>,
    pub parent: Option<FilesetInfo>,
    pub quota_bytes: Option<u64>,
    pub data_dir_exists: Option<bool>,
}

/// Next transition to apply, or proof that the target is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    Create,
    Link { junction: String },
    SetQuota { bytes: u64 },
    CreateDataDir { path: String },
    Done { link_path: String },
}

/// How far along the observation is, for logs and tests.
pub fn observed_state(target: &FilesetTarget, obs: &Observed) -> FilesetState {
    let info = match &obs.fileset {
        None => return FilesetState::Absent,
        Some(i) => i,
    };
    if !info.is_linked() {
        return FilesetState::Created;
    }
    if target.quota_bytes > 0 && obs.quota_bytes.unwrap_or(0) != target.quota_bytes {
        return FilesetState::Linked;
    }
    if target.data_dir && !obs.data_dir_exists.unwrap_or(false) {
        return FilesetState::QuotaSet;
    }
    FilesetState::DirectoryReady
}

/// Pure transition function: observed state in, next action out.
///
/// Fatal conditions (foreign fileset, type mismatch, unlinked parent,
/// conflicting quota) abort here; they are ownership ambiguities no retry
/// can resolve.
pub fn plan(target: &FilesetTarget, obs: &Observed) -> Result<NextAction> {
    let info = match &obs.fileset {
        None => return Ok(NextAction::Create),
        Some(i) => i,
    };

    if info.comment != target.options.comment {
        return Err(ControllerError::Internal(format!(
            "volume:[{}] - the fileset was not created by the FabricFS CSI driver. Cannot use it.",
            target.name
        )));
    }

    if let Some(expected) = target.kind {
        let actual = info.kind();
        if actual != expected {
            return Err(ControllerError::Internal(format!(
                "volume:[{}] - the fileset type is not as expected, got type: [{actual}], expected type: [{expected}]",
                target.name
            )));
        }
    }

    if !info.is_linked() {
        let junction = match &target.parent {
            Some(parent_name) => {
                let parent = obs.parent.as_ref().ok_or_else(|| {
                    ControllerError::Internal(format!(
                        "volume:[{}] - unable to get details of parent fileset [{parent_name}]",
                        target.name
                    ))
                })?;
                if !parent.is_linked() {
                    return Err(ControllerError::Internal(format!(
                        "volume:[{}] - parent fileset [{parent_name}] is not linked",
                        target.name
                    )));
                }
                format!("{}/{}", parent.path, target.name)
            }
            None => format!("{}/{}", target.mount_point, target.name),
        };
        return Ok(NextAction::Link { junction });
    }

    if target.quota_bytes > 0 {
        match obs.quota_bytes {
            Some(current) if current == target.quota_bytes => {}
            Some(0) | None => {
                return Ok(NextAction::SetQuota {
                    bytes: target.quota_bytes,
                })
            }
            Some(current) => {
                return Err(ControllerError::Internal(format!(
                    "fileset {} present but quota {current} does not match with requested size {}",
                    target.name, target.quota_bytes
                )));
            }
        }
    }

    if target.data_dir && !obs.data_dir_exists.unwrap_or(false) {
        let path = data_dir_relative_path(
            &info.path,
            &target.mount_point,
            &target.name,
            target.data_dir_suffix,
        )?;
        return Ok(NextAction::CreateDataDir { path });
    }

    Ok(NextAction::Done {
        link_path: info.path.clone(),
    })
}

/// Relative volume path from the filesystem mount point.
pub fn data_dir_relative_path(
    link_path: &str,
    mount_point: &str,
    name: &str,
    with_data_suffix: bool,
) -> Result<String> {
    if link_path.is_empty() || mount_point.is_empty() {
        return Err(ControllerError::Internal(format!(
            "missing details to generate target path fileset junctionpath: [{link_path}], \
             filesystem mount point: [{mount_point}]"
        )));
    }
    let mut rel = link_path.replacen(mount_point, "", 1);
    if with_data_suffix {
        rel = format!("{rel}/{name}-data");
    }
    Ok(rel.trim_matches(|c| c == '!' || c == '/').to_string())
}

/// Drives fileset targets against one cluster connector.
pub struct FilesetEngine<'a> {
    conn: &'a Arc<dyn ClusterConnector>,
}

impl<'a> FilesetEngine<'a> {
    pub fn new(conn: &'a Arc<dyn ClusterConnector>) -> Self {
        Self { conn }
    }

    async fn observe(&self, target: &FilesetTarget) -> Result<Observed> {
        let fileset = match self.conn.list_fileset(&target.filesystem, &target.name).await {
            Ok(info) => Some(info),
            Err(err) if err.is_fileset_not_found() => None,
            Err(err) => {
                return Err(ControllerError::Internal(format!(
                    "unable to list fileset [{}] in filesystem [{}]. Error: {err}",
                    target.name, target.filesystem
                )));
            }
        };

        let parent = match (&fileset, &target.parent) {
            (Some(info), Some(parent_name)) if !info.is_linked() => {
                match self.conn.list_fileset(&target.filesystem, parent_name).await {
                    Ok(p) => Some(p),
                    Err(err) => {
                        return Err(ControllerError::Internal(format!(
                            "volume:[{}] - unable to get details of parent fileset [{parent_name}] \
                             in filesystem [{}]. Error: {err}",
                            target.name, target.filesystem
                        )));
                    }
                }
            }
            _ => None,
        };

        let quota_bytes = match &fileset {
            Some(info) if info.is_linked() && target.quota_bytes > 0 => {
                match self.conn.fileset_quota(&target.filesystem, &target.name).await {
                    Ok(q) => Some(q),
                    Err(err) if err.is_quota_not_set() => Some(0),
                    Err(err) => {
                        return Err(ControllerError::Internal(format!(
                            "unable to list quota for fileset [{}] in filesystem [{}]. Error [{err}]",
                            target.name, target.filesystem
                        )));
                    }
                }
            }
            _ => None,
        };

        let data_dir_exists = match &fileset {
            Some(info) if info.is_linked() && target.data_dir => {
                let path = data_dir_relative_path(
                    &info.path,
                    &target.mount_point,
                    &target.name,
                    target.data_dir_suffix,
                )?;
                match self.conn.directory_exists(&target.filesystem, &path).await {
                    Ok(exists) => Some(exists),
                    Err(err) => {
                        return Err(ControllerError::Internal(format!(
                            "unable to check if directory path [{path}] exists in filesystem [{}]. \
                             Error : {err}",
                            target.filesystem
                        )));
                    }
                }
            }
            _ => None,
        };

        Ok(Observed {
            fileset,
            parent,
            quota_bytes,
            data_dir_exists,
        })
    }

    /// Brings the target to its end state and returns the relative data
    /// path (empty when the target carries no data directory).
    pub async fn ensure(&self, target: &FilesetTarget) -> Result<String> {
        // One pass per transition plus the final observation; anything more
        // means the backend is not converging.
        for _ in 0..6 {
            let obs = self.observe(target).await?;
            let action = plan(target, &obs)?;
            debug!(
                fileset = %target.name,
                filesystem = %target.filesystem,
                state = ?observed_state(target, &obs),
                action = ?action,
                "fileset provisioning step"
            );
            match action {
                NextAction::Create => {
                    self.conn
                        .create_fileset(&target.filesystem, &target.name, &target.options)
                        .await
                        .map_err(|err| {
                            ControllerError::Internal(format!(
                                "unable to create fileset [{}] in filesystem [{}]. Error: {err}",
                                target.name, target.filesystem
                            ))
                        })?;
                }
                NextAction::Link { junction } => {
                    self.conn
                        .link_fileset(&target.filesystem, &target.name, &junction)
                        .await
                        .map_err(|err| {
                            ControllerError::Internal(format!(
                                "linking fileset [{}] in filesystem [{}] at path [{junction}] \
                                 failed. Error: {err}",
                                target.name, target.filesystem
                            ))
                        })?;
                }
                NextAction::SetQuota { bytes } => {
                    self.conn
                        .set_fileset_quota(&target.filesystem, &target.name, bytes)
                        .await
                        .map_err(|_| {
                            ControllerError::Internal(format!(
                                "unable to set quota [{bytes}] on fileset [{}] of FS [{}]",
                                target.name, target.filesystem
                            ))
                        })?;
                }
                NextAction::CreateDataDir { path } => {
                    self.conn
                        .make_directory(&target.filesystem, &path, &target.dir_owner)
                        .await
                        .map_err(|err| {
                            ControllerError::Internal(format!(
                                "unable to create directory [{path}] in filesystem [{}]. \
                                 Error : {err}",
                                target.filesystem
                            ))
                        })?;
                }
                NextAction::Done { link_path } => {
                    if target.data_dir {
                        return data_dir_relative_path(
                            &link_path,
                            &target.mount_point,
                            &target.name,
                            target.data_dir_suffix,
                        );
                    }
                    return Ok(String::new());
                }
            }
        }
        Err(ControllerError::Internal(format!(
            "fileset provisioning did not converge for [{}] in filesystem [{}]",
            target.name, target.filesystem
        )))
    }
}
