// Error taxonomy for the ingestion pipeline. Every variant here is a
// per-message failure: the orchestrator logs it and drops the message.
// Startup and worker plumbing errors travel as `anyhow::Error` instead.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Topic did not split into enough `/`-delimited segments.
    #[error("malformed topic '{topic}': expected at least {expected} segments, got {found}")]
    ParseFailure {
        topic: String,
        expected: usize,
        found: usize,
    },

    /// Topic has enough segments but the trailing device id is empty.
    #[error("malformed topic '{0}': empty device id")]
    EmptyDeviceId(String),

    #[error("topic '{0}' does not name a known category")]
    UnrecognizedCategory(String),

    /// Image frame header or filename could not be decoded.
    #[error("malformed image frame: {0}")]
    MalformedFrame(String),

    /// Bytes written to storage differ from the frame's declared size.
    #[error("incomplete image write: wrote {written} of {declared} declared bytes")]
    IncompleteWrite { written: u64, declared: u32 },

    /// A step of the device -> mapping -> user chain came back empty.
    #[error("{record} not found for {key}")]
    LookupNotFound { record: &'static str, key: String },

    /// The owning user exists but its name cannot be used as a directory.
    #[error("user {user_id} has a name unusable as a storage directory: '{name}'")]
    UnusableUserName { user_id: i64, name: String },

    /// An image with the same filename is already stored for this user.
    #[error("image already stored at {}", .0.display())]
    ImageExists(std::path::PathBuf),

    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] anyhow::Error),

    #[error("image storage i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn not_found(record: &'static str, key: impl ToString) -> Self {
        GatewayError::LookupNotFound {
            record,
            key: key.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
