use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::OrchestratorError;
use crate::model::{DatabaseId, SourceItem};

/// A source dataset read one row at a time rather than materialized in
/// memory up front.
pub type SourceItemStream = Pin<Box<dyn Stream<Item = Result<SourceItem, OrchestratorError>> + Send>>;

/// Opens and reads rows from one database's source dataset. File-format
/// adapters (accounting export formats) are out of scope: the pipeline only
/// depends on this boundary, implemented by an external collaborator.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Validates the dataset is reachable and well-formed without reading
    /// every row. Returns an error (e.g. the file was deleted after claim)
    /// that the runner maps to a `failed` session outcome.
    async fn open(&self, database_id: DatabaseId) -> Result<(), OrchestratorError>;

    /// Streams rows one at a time rather than materializing the whole
    /// dataset; a multi-million-row source must not be fully buffered
    /// before the first row is filtered.
    async fn read_stream(&self, database_id: DatabaseId) -> Result<SourceItemStream, OrchestratorError>;
}
