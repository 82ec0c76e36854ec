pub mod client;
pub mod delegate;
pub mod error;
pub mod extensions;
pub mod query;
pub mod schema;
pub mod store;
pub mod write;

pub use client::{Client, TransactionClient, TransactionOp};
pub use delegate::{Delegate, Operation};
pub use error::{MirrorDbError, Result};
pub use extensions::{ExtendedClient, ExtendedDelegate, ExtensionSpec, ModelScope};
pub use schema::{parse_schema, parse_schema_str, SchemaDefinition};
pub use store::{Record, Store, StoreData};
