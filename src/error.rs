use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HobsError {
    #[error("missing required environment variable {0}")]
    MissingSetting(String),

    #[error("invalid value for {name}: {value}")]
    InvalidSetting { name: String, value: String },

    #[error("failed to read credentials file at {path}")]
    CredentialsRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse credentials file at {path}")]
    CredentialsParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("HOBS request failed: {context}")]
    Http {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HOBS returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unexpected HOBS response: {0}")]
    UnexpectedResponse(String),

    #[error("invalid request id: {0:?}")]
    InvalidRequestId(String),

    #[error("invalid stage: {0:?}")]
    InvalidStage(String),

    #[error("invalid request status: {0:?}")]
    InvalidStatus(String),

    #[error("request {request_id} finished with status ERROR: {detail}")]
    RequestFailed { request_id: String, detail: String },

    #[error("request {request_id} still RUNNING after {attempts} status checks")]
    WaitExhausted { request_id: String, attempts: u32 },

    #[error("failed to retrieve result of request {request_id}")]
    ResultDownload {
        request_id: String,
        #[source]
        source: Box<HobsError>,
    },

    #[error("unreadable result archive")]
    Archive(#[from] zip::result::ZipError),

    #[error("failed to read archive entry {entry}")]
    EntryRead {
        entry: String,
        #[source]
        source: std::io::Error,
    },

    #[error("archive entry {entry} is not valid JSON")]
    EntryJson {
        entry: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed treatment identity {0:?}, expected study___site___treatment___soil")]
    MalformedIdentity(String),

    #[error("CSV entry {entry} could not be parsed")]
    Csv {
        entry: String,
        #[source]
        source: csv::Error,
    },

    #[error("CSV entry {0} has no usable columns")]
    EmptyTable(String),

    #[error("local database error")]
    Database(#[from] rusqlite::Error),

    #[error("object store error for key {key}")]
    ObjectStore {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("config record for {key} could not be encoded")]
    MirrorEncode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("mirrored blob {key} is not a config record")]
    MirrorPayload {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl HobsError {
    /// True for failures that originate on the HOBS side of the wire.
    pub fn is_remote(&self) -> bool {
        match self {
            HobsError::Http { .. }
            | HobsError::Status { .. }
            | HobsError::UnexpectedResponse(_)
            | HobsError::RequestFailed { .. }
            | HobsError::WaitExhausted { .. } => true,
            HobsError::ResultDownload { source, .. } => source.is_remote(),
            _ => false,
        }
    }
}
