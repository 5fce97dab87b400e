use thiserror::Error;

/// Failure reported by a cluster management API call.
///
/// `Backend` carries the management API's stable error code alongside the
/// human-readable message; callers classify on the documented codes only and
/// treat everything else as unclassified.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("backend error {code}: {message}")]
    Backend { code: String, message: String },

    #[error("backend request failed: {0}")]
    Transport(String),

    #[error("unexpected backend response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

impl ConnectorError {
    fn matches(&self, needle: &str) -> bool {
        match self {
            ConnectorError::Backend { code, message } => {
                code.contains(needle) || message.contains(needle)
            }
            ConnectorError::Transport(msg) | ConnectorError::InvalidResponse(msg) => {
                msg.contains(needle)
            }
        }
    }

    /// Fileset absent or already deleted.
    pub fn is_fileset_not_found(&self) -> bool {
        self.matches("EFSSG0072C") || self.matches("Invalid value in 'filesetName'")
    }

    /// Filesystem name unknown to the queried cluster.
    pub fn is_unknown_filesystem(&self) -> bool {
        self.matches("Invalid value in filesystemName")
    }

    /// Directory absent or already deleted.
    pub fn is_directory_absent(&self) -> bool {
        self.matches("EFSSG0264C") || self.matches("does not exist")
    }

    /// The backend aborted a command because an equivalent one is already
    /// running (seen for overlapping copy jobs).
    pub fn is_command_aborted(&self) -> bool {
        self.matches("EFSSG0632C")
    }

    /// Quota record exists but no number is set on it.
    pub fn is_quota_not_set(&self) -> bool {
        self.matches("Invalid number specified")
    }
}
