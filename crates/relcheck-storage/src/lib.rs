pub mod adapter;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use adapter::StoreReader;
pub use memory::{InMemoryStore, InMemoryStoreFactory};
pub use postgres::{PostgresStore, PostgresStoreFactory};
pub use traits::{RelationshipStore, SchemaStore, StorageError, StoreFactory};
