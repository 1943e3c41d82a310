use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The local cache could not be read or written. Fatal for the operation.
    #[error("local storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Network, auth or quota failure while writing the remote document.
    #[error("remote write failed: {0}")]
    RemoteWriteFailed(String),

    #[error("remote read failed: {0}")]
    RemoteReadFailed(String),

    #[error("cached stats belong to '{found}', active user is '{expected}'")]
    OwnershipMismatch { expected: String, found: String },

    #[error("nothing to remove")]
    NoTrackedEntry,

    #[error("remote document for '{0}' is malformed")]
    MalformedRemoteDocument(String),

    #[error("no user is signed in")]
    NotSignedIn,

    #[error("no user document for '{0}'")]
    UnknownUser(String),

    #[error("no user found with email '{0}'")]
    FriendNotFound(String),

    #[error("'{0}' is already in your friends list")]
    AlreadyFriends(String),

    #[error("you can't add yourself as a friend")]
    SelfFriend,
}

impl SyncError {
    /// Remote failures are recoverable through the pending-sync path.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteWriteFailed(_) | SyncError::RemoteReadFailed(_)
        )
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::StorageUnavailable(err.to_string())
    }
}
