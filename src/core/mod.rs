pub mod dialect;
pub mod fingerprint;
pub mod query_result;

pub use dialect::Dialect;
pub use fingerprint::QueryFingerprint;
pub use query_result::{ErrorKind, QueryError, QueryResult, ResultMetadata, Row, Value};
