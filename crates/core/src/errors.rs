use thiserror::Error;
use uuid::Uuid;

/// Failure decoding a persisted runtime snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("could not decode runtime snapshot of dialog {dialog_id}: {source}")]
    Decode {
        dialog_id: Uuid,
        #[source]
        source: serde_json::Error,
    },
}
