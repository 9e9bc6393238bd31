use std::path::PathBuf;

/// Errors surfaced at the driver/memory/persistence boundaries (§7: these
/// always propagate; everything below them — noise filter, router, per-call
/// tool dispatch — is swallowed and turned into a system nudge instead).
#[derive(Debug, thiserror::Error)]
pub enum ConclaveError {
    #[error("chat driver error: {0}")]
    Driver(#[from] conclave_llm::Error),

    #[error("failed to read memory snapshot at {path}: {source}")]
    MemoryLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist memory snapshot at {path}: {source}")]
    MemorySave {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed memory snapshot at {path}: {source}")]
    MemoryDecode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("sandbox write violation: {0}")]
    SandboxWrite(String),

    #[error("scheduler fatal: {0}")]
    Scheduler(String),
}

pub type Result<T> = std::result::Result<T, ConclaveError>;
