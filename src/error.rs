//! Error types for the tiberius-table-observer crate.

/// Result type alias for observer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while creating, running, or tearing down a
/// table subscription.
///
/// Construction-time and `start`-time errors are returned synchronously;
/// errors that occur inside the background listener are delivered through
/// the registered error callbacks instead of being thrown out of the loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the TDS driver.
   #[error(transparent)]
   Sql(#[from] tiberius::error::Error),

   /// I/O error while connecting to the server.
   #[error("io error: {0}")]
   Io(#[from] std::io::Error),

   /// No change callback was registered before `start`.
   #[error("no change subscriber registered; register at least one changed callback before starting")]
   NoSubscriber,

   /// The target table has no columns.
   #[error("table [{0}] has no columns")]
   NoColumns(String),

   /// The model-to-column mapping is ambiguous, redundant, or references
   /// a column that does not exist.
   #[error("model to table mapping error: {0}")]
   ModelToTableMapper(String),

   /// The update-of column allow-list is empty or references a missing column.
   #[error("update-of column list error: {0}")]
   UpdateOf(String),

   /// A column's declared type cannot travel over the Service Broker wire.
   #[error("column [{column}] has unsupported type [{type_name}]")]
   ColumnTypeNotSupported { column: String, type_name: String },

   /// Database objects already exist under the requested naming convention.
   #[error("database objects already exist for naming convention [{0}]")]
   DbObjectsWithSameName(String),

   /// Service Broker is not enabled on the target database.
   #[error("service broker is not enabled on the target database")]
   ServiceBrokerDisabled,

   /// The engine is too old to support Service Broker.
   #[error("sql server version {0} does not support service broker")]
   UnsupportedEngineVersion(String),

   /// The target table does not exist.
   #[error("table [{0}] does not exist")]
   MissingTable(String),

   /// Before-image tracking needs a primary key to pair update images.
   #[error("table [{0}] has no primary key; before-image tracking requires one")]
   MissingPrimaryKey(String),

   /// The caller is missing a permission required for provisioning.
   #[error("missing required permission: {0}")]
   InsufficientGrants(String),

   /// The queue delivered a Service Broker error message.
   #[error("service broker error message received: {0}")]
   ServiceBrokerErrorMessage(String),

   /// Reattachment was requested but the queue no longer exists.
   #[error("queue [{0}] no longer exists; cannot reattach")]
   QueueMissing(String),

   /// A caller-supplied naming convention has an invalid shape.
   #[error("invalid naming convention {0:?}")]
   InvalidNamingConvention(String),

   /// `start` was called while the listener is already running.
   #[error("subscription already started")]
   AlreadyStarted,

   /// The watchdog timer would fire during a normal blocking receive.
   #[error("watchdog timeout ({watchdog}s) must exceed the receive timeout ({receive}s)")]
   WatchdogTimeout { watchdog: u32, receive: u32 },

   /// The DML-kind mask excludes every operation.
   #[error("the DML filter must enable at least one of insert, update, delete")]
   EmptyDmlFilter,

   /// A column payload could not be decoded to its declared type.
   #[error("failed to decode payload for column [{column}]: {reason}")]
   PayloadDecode { column: String, reason: String },

   /// A reassembled row image could not be decoded into the model type.
   #[error("failed to decode change into model: {0}")]
   ModelDecode(#[from] serde_json::Error),

   /// A stream subscriber fell behind and missed change events.
   #[error("stream subscriber lagged; {0} change events were skipped")]
   Lagged(u64),
}
