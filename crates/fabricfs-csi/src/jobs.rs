//! Tracking for long-running backend copy jobs (clone and restore).
//!
//! The backend copies data out of band; the record here is what makes a
//! retried CreateVolume for the same destination converge instead of
//! launching a second copy. Records live only in memory: losing them is
//! safe because the worst case is re-interrogating the backend.

use dashmap::DashMap;
use fabricfs_connect::{ConnectorError, CopyJobReport, CopyJobState};

use crate::error::{ControllerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    /// The backend refused to start a duplicate copy; a retry is free of
    /// side effects.
    NotStarted,
    Running,
    Completed,
    Failed,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct CopyRecord {
    pub status: CopyStatus,
    /// Identifier of the destination volume, returned verbatim on replay.
    pub volume_id: String,
}

/// What a retried create call should do about an earlier copy attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayDecision {
    /// No terminal record; launch (or re-launch) the copy.
    Launch,
    /// A previous attempt completed; answer with the recorded identifier
    /// without touching the backend.
    AlreadyComplete(String),
}

/// Copy-job records keyed by destination volume name.
#[derive(Default)]
pub struct CopyJobTracker {
    records: DashMap<String, CopyRecord>,
}

impl CopyJobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consults the record for `volume_name` before a (re-)launch.
    ///
    /// Running rejects with retry-later, Failed rejects permanently for
    /// this attempt, Completed replays the stored identifier, Unknown
    /// clears the record so the attempt can start clean.
    pub fn check_replay(&self, volume_name: &str, operation: &str) -> Result<ReplayDecision> {
        let record = match self.records.get(volume_name) {
            Some(r) => r.value().clone(),
            None => return Ok(ReplayDecision::Launch),
        };

        match record.status {
            CopyStatus::Running => Err(ControllerError::Aborted(format!(
                "{operation} request in progress for volume: {volume_name}"
            ))),
            CopyStatus::Failed => Err(ControllerError::Internal(format!(
                "{operation} job had failed for volume: {volume_name}"
            ))),
            CopyStatus::Completed => Ok(ReplayDecision::AlreadyComplete(record.volume_id)),
            CopyStatus::Unknown => {
                self.records.remove(volume_name);
                Ok(ReplayDecision::Launch)
            }
            CopyStatus::NotStarted => Ok(ReplayDecision::Launch),
        }
    }

    pub fn store(&self, volume_name: &str, status: CopyStatus, volume_id: &str) {
        self.records.insert(
            volume_name.to_string(),
            CopyRecord {
                status,
                volume_id: volume_id.to_string(),
            },
        );
    }

    pub fn get(&self, volume_name: &str) -> Option<CopyRecord> {
        self.records.get(volume_name).map(|r| r.value().clone())
    }
}

/// Classifies the outcome of waiting on a copy job.
///
/// The backend refusing a duplicate command (its documented abort code)
/// downgrades to NotStarted so the next retry may relaunch without risking
/// a second copy. An explicit UNKNOWN job status stays Unknown, distinct
/// from a hard failure. Only a clean completion is Completed.
pub fn classify_outcome(
    outcome: &std::result::Result<CopyJobReport, ConnectorError>,
) -> CopyStatus {
    match outcome {
        Err(err) if err.is_command_aborted() => CopyStatus::NotStarted,
        Ok(report) if report.state == CopyJobState::Unknown => CopyStatus::Unknown,
        Err(_) => CopyStatus::Failed,
        Ok(report) if report.state == CopyJobState::Failed => CopyStatus::Failed,
        Ok(_) => CopyStatus::Completed,
    }
}
