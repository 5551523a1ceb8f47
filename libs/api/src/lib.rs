pub mod error;
pub mod store;
pub mod types;

pub use error::{ErrorKind, StoreError};
pub use store::TabularStore;
pub use types::{Row, TableHandle, merge_header, table_name_for};
