#[derive(Debug, Clone)]
pub enum ChatError {
    /// Transient transport failure. Retried with backoff by the connection
    /// manager; surfaced once the retry ceiling is reached.
    Connection(String),
    /// Credential rejected by the server. Fatal, never retried.
    Auth(String),
    /// History backlog fetch failed. Reported to the caller, the view falls
    /// back to live-only.
    Fetch(String),
    /// Capture device denied or unavailable.
    PermissionDenied(String),
    /// Clip upload failed. Single attempt; the clip stays resendable.
    Upload(String),
    /// Operation not legal in the current state (e.g. start while capturing).
    InvalidState(String),
    /// Malformed frame from the transport.
    InvalidMessage(String),
    Timeout,
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatError::Connection(msg) => write!(f, "Connection failed: {}", msg),
            ChatError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            ChatError::Fetch(msg) => write!(f, "History fetch failed: {}", msg),
            ChatError::PermissionDenied(msg) => write!(f, "Capture permission denied: {}", msg),
            ChatError::Upload(msg) => write!(f, "Upload failed: {}", msg),
            ChatError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            ChatError::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
            ChatError::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl std::error::Error for ChatError {}
