//! Opaque volume and snapshot identifier codec.
//!
//! Identifiers are ordered, semicolon-delimited tuples. Two generations are
//! on the wire: the current long form and a legacy short form emitted by
//! older releases. Decoding dispatches purely on field count; the legacy
//! path is a permanent compatibility contract, not dead code.

use crate::error::{ControllerError, Result};

pub const ID_DELIMITER: char = ';';

/// Storage-class generation, first field of every current identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    /// Directory or standalone-fileset volumes, symlinked through the
    /// primary fileset.
    Classic,
    /// Consistency-group aware generation: one independent fileset per
    /// group, one dependent fileset per volume.
    Advanced,
}

impl StorageClass {
    pub fn wire(&self) -> &'static str {
        match self {
            StorageClass::Classic => "0",
            StorageClass::Advanced => "1",
        }
    }

    fn from_wire(s: &str) -> Result<Self> {
        match s {
            "0" => Ok(StorageClass::Classic),
            "1" => Ok(StorageClass::Advanced),
            other => Err(ControllerError::InvalidArgument(format!(
                "invalid storage class type in identifier: [{other}]"
            ))),
        }
    }
}

/// On-disk shape of the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    Directory,
    DependentFileset,
    IndependentFileset,
}

impl VolumeKind {
    pub fn wire(&self) -> &'static str {
        match self {
            VolumeKind::Directory => "0",
            VolumeKind::DependentFileset => "1",
            VolumeKind::IndependentFileset => "2",
        }
    }

    fn from_wire(s: &str) -> Result<Self> {
        match s {
            "0" => Ok(VolumeKind::Directory),
            "1" => Ok(VolumeKind::DependentFileset),
            "2" => Ok(VolumeKind::IndependentFileset),
            other => Err(ControllerError::InvalidArgument(format!(
                "invalid volume type in identifier: [{other}]"
            ))),
        }
    }
}

/// Decoded volume identifier.
///
/// Current wire form:
/// `storageClass;volumeKind;clusterId;filesystemUUID;consistencyGroup;filesetName;path`
///
/// Legacy wire form (classic generation implied):
/// `clusterId;filesystemUUID;filesetName;path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeId {
    pub storage_class: StorageClass,
    pub kind: VolumeKind,
    pub cluster_id: String,
    pub filesystem_uuid: String,
    pub consistency_group: String,
    pub fileset_name: String,
    pub path: String,
}

impl VolumeId {
    pub fn is_fileset_based(&self) -> bool {
        self.kind != VolumeKind::Directory
    }

    pub fn encode(&self) -> String {
        format!(
            "{};{};{};{};{};{};{}",
            self.storage_class.wire(),
            self.kind.wire(),
            self.cluster_id,
            self.filesystem_uuid,
            self.consistency_group,
            self.fileset_name,
            self.path
        )
    }

    pub fn decode(id: &str) -> Result<VolumeId> {
        let fields: Vec<&str> = id.split(ID_DELIMITER).collect();

        if fields.len() >= 7 {
            return Ok(VolumeId {
                storage_class: StorageClass::from_wire(fields[0])?,
                kind: VolumeKind::from_wire(fields[1])?,
                cluster_id: fields[2].to_string(),
                filesystem_uuid: fields[3].to_string(),
                consistency_group: fields[4].to_string(),
                fileset_name: fields[5].to_string(),
                path: fields[6].to_string(),
            });
        }

        if fields.len() >= 4 {
            // Legacy short form. A volume without a fileset is a plain
            // directory volume; with one it is fileset based.
            let fileset_name = fields[2].to_string();
            let kind = if fileset_name.is_empty() {
                VolumeKind::Directory
            } else {
                VolumeKind::DependentFileset
            };
            return Ok(VolumeId {
                storage_class: StorageClass::Classic,
                kind,
                cluster_id: fields[0].to_string(),
                filesystem_uuid: fields[1].to_string(),
                consistency_group: String::new(),
                fileset_name,
                path: fields[3].to_string(),
            });
        }

        Err(ControllerError::InvalidArgument(format!(
            "invalid volume id: [{id}]"
        )))
    }
}

/// Decoded snapshot identifier.
///
/// Current wire form:
/// `storageClass;volumeKind;clusterId;filesystemUUID;consistencyGroup;filesetName;snapshotName;metaSnapshotName[;path]`
///
/// Legacy wire form (classic generation implied):
/// `clusterId;filesystemUUID;filesetName;snapshotName[;path]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotId {
    pub storage_class: StorageClass,
    pub kind: VolumeKind,
    pub cluster_id: String,
    pub filesystem_uuid: String,
    pub consistency_group: String,
    pub fileset_name: String,
    pub snapshot_name: String,
    pub meta_snapshot_name: String,
    pub path: String,
}

impl SnapshotId {
    pub fn encode(&self) -> String {
        let base = format!(
            "{};{};{};{};{};{};{};{}",
            self.storage_class.wire(),
            self.kind.wire(),
            self.cluster_id,
            self.filesystem_uuid,
            self.consistency_group,
            self.fileset_name,
            self.snapshot_name,
            self.meta_snapshot_name
        );
        match self.storage_class {
            // Advanced snapshots always address the fileset root; the path
            // field is omitted on the wire.
            StorageClass::Advanced => base,
            StorageClass::Classic => format!("{};{}", base, self.path),
        }
    }

    pub fn decode(id: &str) -> Result<SnapshotId> {
        let fields: Vec<&str> = id.split(ID_DELIMITER).collect();

        if fields.len() >= 8 {
            let path = if fields.len() >= 9 && !fields[8].is_empty() {
                fields[8].to_string()
            } else {
                "/".to_string()
            };
            return Ok(SnapshotId {
                storage_class: StorageClass::from_wire(fields[0])?,
                kind: VolumeKind::from_wire(fields[1])?,
                cluster_id: fields[2].to_string(),
                filesystem_uuid: fields[3].to_string(),
                consistency_group: fields[4].to_string(),
                fileset_name: fields[5].to_string(),
                snapshot_name: fields[6].to_string(),
                meta_snapshot_name: fields[7].to_string(),
                path,
            });
        }

        if fields.len() >= 4 {
            let path = if fields.len() >= 5 && !fields[4].is_empty() {
                fields[4].to_string()
            } else {
                "/".to_string()
            };
            return Ok(SnapshotId {
                storage_class: StorageClass::Classic,
                kind: VolumeKind::IndependentFileset,
                cluster_id: fields[0].to_string(),
                filesystem_uuid: fields[1].to_string(),
                consistency_group: String::new(),
                fileset_name: fields[2].to_string(),
                snapshot_name: fields[3].to_string(),
                meta_snapshot_name: String::new(),
                path,
            });
        }

        Err(ControllerError::InvalidArgument(format!(
            "invalid snapshot id: [{id}]"
        )))
    }
}
