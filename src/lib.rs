//! Row-level change notifications for SQL Server tables over Service Broker.
//!
//! Subscribing to a table provisions a scoped set of Service Broker objects
//! (message types, a contract, a queue with an activation procedure, a
//! service, and a standing conversation) plus an `AFTER` trigger that
//! publishes each modified row as one short-lived conversation: a start
//! marker, then one message per watched column. A background listener
//! reassembles those fragments into typed change events and delivers them
//! through callbacks or an async stream.
//!
//! # SQL Server Requirements
//!
//! Service Broker must be enabled on the target database
//! (`ALTER DATABASE ... SET ENABLE_BROKER`), and the connecting principal
//! needs `CREATE` rights for queues, services, contracts, message types,
//! and procedures.
//!
//! # Example
//!
//! ```no_run
//! use serde::Deserialize;
//! use tiberius_table_observer::{SubscriptionConfig, TableDependency, TableModel};
//!
//! #[derive(Debug, Clone, Deserialize)]
//! struct Customer {
//!    id: i64,
//!    name: String,
//! }
//!
//! impl TableModel for Customer {
//!    fn table_name() -> String {
//!       "Customers".to_string()
//!    }
//!
//!    fn field_names() -> Vec<String> {
//!       vec!["id".to_string(), "name".to_string()]
//!    }
//! }
//!
//! # async fn run() -> tiberius_table_observer::Result<()> {
//! let config = SubscriptionConfig::new(
//!    "server=tcp:localhost,1433;user=sa;password=...;database=shop;TrustServerCertificate=true",
//! );
//! let dependency = TableDependency::<Customer>::new(config).await?;
//! dependency.on_changed(|event| {
//!    println!("{:?}: {:?}", event.kind, event.entity);
//! });
//! dependency.start(120, 180).await?;
//! // ...
//! dependency.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Cleanup
//!
//! [`TableDependency::stop`] removes every provisioned object. If the
//! application dies without stopping, the conversation watchdog timer
//! expires, the queue's activation procedure wakes, and the database drops
//! the objects itself.

pub mod change;
pub mod config;
pub mod decode;
pub mod dependency;
pub mod error;
pub mod message;
pub mod model;
pub mod naming;
pub mod schema;
pub mod scripts;
pub mod status;
pub mod stream;

mod backend;
mod bag;
mod listener;
mod provision;
mod teardown;

pub use change::{ChangeEvent, ChangeKind, DmlFilter};
pub use config::{PayloadEncoding, SubscriptionConfig};
pub use dependency::TableDependency;
pub use error::{Error, Result};
pub use model::TableModel;
pub use status::SubscriptionStatus;
pub use stream::ChangeEventStream;
