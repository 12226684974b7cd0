//! Persistence layer: libSQL-backed cursors, unified messages and bindings.

pub mod cursor;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use cursor::Cursor;
pub use libsql_backend::LibSqlBackend;
pub use traits::{
    Binding, BindingStore, CursorRecord, CursorStore, MessageStore, StoredMessage,
};
