//! Consistency-group snapshot reuse window and shared snapshot metadata.
//!
//! All members of a consistency group share one backend snapshot per point
//! in time. A CreateSnapshot inside the window reuses the newest group
//! snapshot, provided the member's data actually made it into it, and
//! records its caller-visible name in a metadata directory.
//! Deleting a caller-visible snapshot removes only its metadata entry; the
//! shared snapshot goes away once the metadata directory's hard-link count
//! says no references remain.

use std::sync::Arc;

use chrono::{Duration, Utc};
use fabricfs_connect::{ClusterConnector, DirectoryOwner};
use tracing::{debug, info};

use crate::error::{ControllerError, Result};

/// Default reuse window for consistency-group snapshots, in minutes.
pub const DEFAULT_SNAP_WINDOW_MINUTES: i64 = 30;

/// Backend ceiling on snapshots per fileset.
pub const MAX_SNAPSHOTS_PER_FILESET: usize = 256;

/// An empty directory has exactly two links (itself and `.`); more means
/// caller snapshots still reference the shared group snapshot.
const EMPTY_DIR_LINK_COUNT: u64 = 2;

/// Returns the newest group snapshot's name when it falls inside the reuse
/// window, `None` when a new snapshot must be cut.
pub async fn reusable_group_snapshot(
    conn: &Arc<dyn ClusterConnector>,
    filesystem: &str,
    group_fileset: &str,
    window_minutes: i64,
) -> Result<Option<String>> {
    let latest = conn
        .latest_fileset_snapshots(filesystem, group_fileset)
        .await
        .map_err(|err| {
            ControllerError::Internal(format!(
                "getting latest snapshot list failed for fileset: [{filesystem}:{group_fileset}]. \
                 Error: [{err}]"
            ))
        })?;

    let newest = match latest.first() {
        None => return Ok(None),
        Some(entry) => entry,
    };

    let created = conn
        .snapshot_create_time(filesystem, group_fileset, &newest.name)
        .await?;
    let elapsed = Utc::now().signed_duration_since(created);
    debug!(
        fileset = group_fileset,
        snapshot = %newest.name,
        elapsed_secs = elapsed.num_seconds(),
        window_minutes,
        "snapshot window check"
    );

    if elapsed < Duration::minutes(window_minutes) {
        info!(
            fileset = group_fileset,
            snapshot = %newest.name,
            "reusing existing consistency group snapshot"
        );
        Ok(Some(newest.name.clone()))
    } else {
        Ok(None)
    }
}

/// Confirms the member fileset's data is present under the candidate group
/// snapshot. Absence means the member was created after the snapshot was
/// cut; the caller has to wait for the window to expire.
pub async fn confirm_member_in_snapshot(
    conn: &Arc<dyn ClusterConnector>,
    filesystem: &str,
    group_fileset: &str,
    group_snapshot: &str,
    member_fileset: &str,
) -> Result<()> {
    let marker = format!("{group_fileset}/.snapshots/{group_snapshot}/{member_fileset}");
    match conn.stat_directory(filesystem, &marker).await {
        Ok(_) => Ok(()),
        Err(err) if err.is_directory_absent() => Err(ControllerError::Internal(format!(
            "snapshot for volume [{member_fileset}] in filesystem [{filesystem}] is not taken. \
             Wait till current snapWindow expires."
        ))),
        Err(err) => Err(err.into()),
    }
}

/// Records a caller-visible snapshot name against the shared group
/// snapshot: `<group>/<groupSnapshot>/<callerSnapshot>`.
pub async fn make_snapshot_metadata_dir(
    conn: &Arc<dyn ClusterConnector>,
    filesystem: &str,
    group_fileset: &str,
    group_snapshot: &str,
    caller_snapshot: &str,
) -> Result<()> {
    let path = format!("{group_fileset}/{group_snapshot}/{caller_snapshot}");
    debug!(filesystem, path = %path, "creating snapshot metadata directory");
    conn.make_directory(filesystem, &path, &DirectoryOwner::root())
        .await
        .map_err(|err| {
            ControllerError::Internal(format!(
                "unable to create directory [{path}] in filesystem [{filesystem}]. Error : {err}"
            ))
        })?;
    Ok(())
}

/// Removes one caller-visible snapshot's metadata entry and decides whether
/// the shared group snapshot itself may now be deleted.
///
/// Returns `true` when no caller references remain (the metadata directory
/// is gone or its link count is down to the empty-directory minimum).
pub async fn delete_snapshot_metadata(
    conn: &Arc<dyn ClusterConnector>,
    filesystem: &str,
    group_fileset: &str,
    group_snapshot: &str,
    caller_snapshot: &str,
) -> Result<bool> {
    let entry = format!("{group_fileset}/{group_snapshot}/{caller_snapshot}");
    if let Err(err) = conn.delete_directory(filesystem, &entry, false).await {
        if !err.is_directory_absent() {
            return Err(ControllerError::Internal(format!(
                "unable to Delete Dir using FS [{filesystem}] at path [{entry}]. Error [{err}]"
            )));
        }
    }

    let meta_dir = format!("{group_fileset}/{group_snapshot}");
    let stat = match conn.stat_directory(filesystem, &meta_dir).await {
        Ok(stat) => stat,
        Err(err) if err.is_directory_absent() => return Ok(true),
        Err(err) => {
            return Err(ControllerError::Internal(format!(
                "unable to stat directory using FS [{filesystem}] at path [{meta_dir}]. \
                 Error [{err}]"
            )));
        }
    };

    info!(
        filesystem,
        path = %meta_dir,
        nlink = stat.nlink,
        "snapshot metadata directory link count"
    );

    if stat.nlink == EMPTY_DIR_LINK_COUNT {
        if let Err(err) = conn.delete_directory(filesystem, &meta_dir, true).await {
            if !err.is_directory_absent() {
                return Err(ControllerError::Internal(format!(
                    "unable to delete directory for FS [{filesystem}] at path [{meta_dir}]. \
                     Error: [{err}]"
                )));
            }
        }
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeConnector;

    fn group_conn() -> FakeConnector {
        let fake = FakeConnector::new("1", "alpha").with_filesystem("fs0", "UID0", "/mnt/fs0");
        fake.add_independent_fileset("fs0", "group-a", "/mnt/fs0/group-a");
        fake
    }

    #[tokio::test]
    async fn test_no_prior_snapshot_requires_new_one() {
        let conn: Arc<dyn ClusterConnector> = Arc::new(group_conn());
        let reuse = reusable_group_snapshot(&conn, "fs0", "group-a", 30)
            .await
            .unwrap();
        assert!(reuse.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_inside_window_is_reused() {
        let fake = group_conn();
        fake.add_snapshot_with_age("fs0", "group-a", "snap-recent", 10 * 60);
        let conn: Arc<dyn ClusterConnector> = Arc::new(fake);

        let reuse = reusable_group_snapshot(&conn, "fs0", "group-a", 30)
            .await
            .unwrap();
        assert_eq!(reuse, Some("snap-recent".to_string()));
    }

    #[tokio::test]
    async fn test_snapshot_outside_window_is_not_reused() {
        let fake = group_conn();
        fake.add_snapshot_with_age("fs0", "group-a", "snap-old", 40 * 60);
        let conn: Arc<dyn ClusterConnector> = Arc::new(fake);

        let reuse = reusable_group_snapshot(&conn, "fs0", "group-a", 30)
            .await
            .unwrap();
        assert!(reuse.is_none());
    }

    #[tokio::test]
    async fn test_member_marker_missing_asks_caller_to_wait() {
        let conn: Arc<dyn ClusterConnector> = Arc::new(group_conn());
        let err = confirm_member_in_snapshot(&conn, "fs0", "group-a", "snap-1", "pvc-7")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Wait till current snapWindow expires"));
    }

    #[tokio::test]
    async fn test_member_marker_present_is_usable() {
        let fake = group_conn();
        fake.add_directory("fs0", "group-a/.snapshots/snap-1/pvc-7");
        let conn: Arc<dyn ClusterConnector> = Arc::new(fake);
        confirm_member_in_snapshot(&conn, "fs0", "group-a", "snap-1", "pvc-7")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_metadata_keeps_shared_snapshot_while_referenced() {
        let fake = group_conn();
        fake.add_directory("fs0", "group-a/snap-1/caller-1");
        fake.add_directory("fs0", "group-a/snap-1");
        // Two caller references remain after this delete.
        fake.set_directory_links("fs0", "group-a/snap-1", 4);
        let conn: Arc<dyn ClusterConnector> = Arc::new(fake);

        let can_delete = delete_snapshot_metadata(&conn, "fs0", "group-a", "snap-1", "caller-1")
            .await
            .unwrap();
        assert!(!can_delete);
    }

    #[tokio::test]
    async fn test_delete_metadata_releases_shared_snapshot_when_last() {
        let fake = group_conn();
        fake.add_directory("fs0", "group-a/snap-1/caller-1");
        fake.add_directory("fs0", "group-a/snap-1");
        fake.set_directory_links("fs0", "group-a/snap-1", 2);
        let conn: Arc<dyn ClusterConnector> = Arc::new(fake);

        let can_delete = delete_snapshot_metadata(&conn, "fs0", "group-a", "snap-1", "caller-1")
            .await
            .unwrap();
        assert!(can_delete);
    }

    #[tokio::test]
    async fn test_delete_metadata_with_missing_dir_is_success() {
        let conn: Arc<dyn ClusterConnector> = Arc::new(group_conn());
        let can_delete = delete_snapshot_metadata(&conn, "fs0", "group-a", "snap-1", "caller-1")
            .await
            .unwrap();
        assert!(can_delete);
    }
}
