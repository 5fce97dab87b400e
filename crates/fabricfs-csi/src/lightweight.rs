//! Directory-based (lightweight) volumes and the shared directory/symlink
//! helpers.
//!
//! A lightweight volume is just a subdirectory under a pre-existing base
//! directory, plus a symlink from the per-cluster link area into the target
//! path for the classic storage-class generation. No fileset, no quota.

use std::sync::Arc;

use fabricfs_connect::{ClusterConnector, DirectoryOwner};
use tracing::debug;

use crate::error::{ControllerError, Result};

/// Creates a directory if absent, honoring explicit ownership when given.
pub async fn ensure_directory(
    conn: &Arc<dyn ClusterConnector>,
    filesystem: &str,
    path: &str,
    owner: &DirectoryOwner,
) -> Result<()> {
    let exists = conn.directory_exists(filesystem, path).await.map_err(|err| {
        ControllerError::Internal(format!(
            "unable to check if directory path [{path}] exists in filesystem [{filesystem}]. \
             Error : {err}"
        ))
    })?;

    if !exists {
        conn.make_directory(filesystem, path, owner)
            .await
            .map_err(|err| {
                ControllerError::Internal(format!(
                    "unable to create directory [{path}] in filesystem [{filesystem}]. Error : {err}"
                ))
            })?;
    }
    Ok(())
}

/// Creates the lightweight volume directory and returns its relative path.
///
/// The configured base directory must already exist; its absence is an
/// operator error, not something this driver provisions around.
pub async fn create_directory_volume(
    conn: &Arc<dyn ClusterConnector>,
    filesystem: &str,
    base_path: &str,
    volume_name: &str,
    owner: &DirectoryOwner,
) -> Result<String> {
    let base_exists = conn
        .directory_exists(filesystem, base_path)
        .await
        .map_err(|err| {
            ControllerError::Internal(format!(
                "unable to check if DirBasePath {base_path} is present in filesystem \
                 {filesystem}. Error : {err}"
            ))
        })?;
    if !base_exists {
        return Err(ControllerError::Internal(format!(
            "directory base path {base_path} not present in filesystem {filesystem}"
        )));
    }

    let dir_path = format!("{base_path}/{volume_name}");
    debug!(volume = volume_name, path = %dir_path, "creating lightweight volume directory");
    ensure_directory(conn, filesystem, &dir_path, owner).await?;
    Ok(dir_path)
}

/// Creates the per-volume symlink in the primary link area if absent.
pub async fn ensure_symlink(
    primary_conn: &Arc<dyn ClusterConnector>,
    primary_fs: &str,
    target_fs: &str,
    target_path: &str,
    link_rel_path: &str,
) -> Result<()> {
    let exists = primary_conn
        .directory_exists(primary_fs, link_rel_path)
        .await
        .map_err(|err| {
            ControllerError::Internal(format!(
                "unable to check if symlink path [{link_rel_path}] exists in filesystem \
                 [{primary_fs}]. Error: {err}"
            ))
        })?;

    if !exists {
        debug!(
            filesystem = primary_fs,
            target_fs,
            target = target_path,
            link = link_rel_path,
            "creating volume symlink"
        );
        primary_conn
            .create_symlink(primary_fs, target_fs, target_path, link_rel_path)
            .await
            .map_err(|err| {
                ControllerError::Internal(format!(
                    "failed to create symlink [{link_rel_path}] in filesystem [{primary_fs}], \
                     for target [{target_path}] in filesystem [{target_fs}]. Error [{err}]"
                ))
            })?;
    }
    Ok(())
}
