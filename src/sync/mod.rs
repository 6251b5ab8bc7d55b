pub mod ingest;
pub mod snapshot;

pub use ingest::DeltaIngest;
pub use snapshot::{RefreshOutcome, SnapshotLoader};
