mod benchmark;
mod destination;
mod metadata;

pub use benchmark::{BenchmarkStore, InMemoryBenchmarkStore};
pub use destination::{DestinationStore, InMemoryDestinationStore};
pub use metadata::{ClaimOutcome, MetadataStore, SqliteMetadataStore};
