pub mod meilisearch;
pub mod memory;
pub mod memory_index;
pub mod sqlite;

pub use meilisearch::MeilisearchIndex;
pub use memory::MemoryMetadataStore;
pub use memory_index::MemorySearchIndex;
pub use sqlite::SqliteMetadataStore;
