//! The queue-backend seam.
//!
//! Provisioning, receiving, and teardown are the only backend-specific
//! parts of a subscription; everything above them (schema reconciliation,
//! reassembly, status, delivery) is engine-neutral. The SQL Server
//! implementation speaks Service Broker; an alternate engine's queuing
//! primitive can slot in behind the same trait.

use async_trait::async_trait;
use tiberius::Client;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;
use uuid::Uuid;

use crate::change::DmlFilter;
use crate::error::Result;
use crate::message::{DialogHandle, ProcessableMessageSet, QueueMessage};
use crate::schema::ColumnInfo;
use crate::scripts::ScriptContext;
use crate::{provision, teardown};

pub(crate) type SqlClient = Client<Compat<TcpStream>>;

/// Opens a fresh connection to the server.
pub(crate) async fn connect(config: &tiberius::Config) -> Result<SqlClient> {
   let tcp = TcpStream::connect(config.get_addr()).await?;
   tcp.set_nodelay(true)?;
   let client = Client::connect(config.clone(), tcp.compat_write()).await?;
   Ok(client)
}

/// Backend operations for one subscription's queue objects.
#[async_trait]
pub(crate) trait QueueBackend: Send + Sync + 'static {
   /// The naming convention scoping this subscription's objects.
   fn naming_convention(&self) -> &str;

   /// The message identifiers the listener must recognize.
   fn message_set(&self) -> &ProcessableMessageSet;

   /// The interesting columns, in table order.
   fn columns(&self) -> &[ColumnInfo];

   /// Creates every queue object and the trigger, returning the standing
   /// conversation handle.
   async fn provision(&self, watchdog_secs: u32) -> Result<DialogHandle>;

   /// Reattaches to previously provisioned objects, recovering or
   /// replacing the standing conversation.
   async fn reattach(&self, watchdog_secs: u32) -> Result<DialogHandle>;

   /// Refreshes the watchdog timer and blocks for the next batch of
   /// messages, up to the receive timeout.
   async fn receive_batch(
      &self,
      dialog: DialogHandle,
      timeout_secs: u32,
      watchdog_secs: u32,
   ) -> Result<Vec<QueueMessage>>;

   /// Ends one conversation by handle.
   async fn end_conversation(&self, handle: Uuid) -> Result<()>;

   /// Idempotently removes every provisioned object.
   async fn teardown(&self, dialog: Option<DialogHandle>) -> Result<()>;
}

/// Service Broker implementation of [`QueueBackend`].
pub(crate) struct SqlServerBackend {
   pub sql: tiberius::Config,
   pub schema: String,
   pub table: String,
   pub naming: String,
   pub columns: Vec<ColumnInfo>,
   pub key_columns: Vec<String>,
   pub filter: DmlFilter,
   pub include_old_values: bool,
   pub update_of: Option<Vec<String>>,
   pub activation_principal: String,
   pub service_authorization: Option<String>,
   pub receive_batch_size: usize,
   pub messages: ProcessableMessageSet,
}

impl SqlServerBackend {
   pub(crate) fn script_context(&self) -> ScriptContext<'_> {
      ScriptContext {
         schema: &self.schema,
         table: &self.table,
         naming: &self.naming,
         columns: &self.columns,
         key_columns: &self.key_columns,
         filter: self.filter,
         include_old_values: self.include_old_values,
         update_of: self.update_of.as_deref(),
         activation_principal: &self.activation_principal,
         service_authorization: self.service_authorization.as_deref(),
      }
   }
}

#[async_trait]
impl QueueBackend for SqlServerBackend {
   fn naming_convention(&self) -> &str {
      &self.naming
   }

   fn message_set(&self) -> &ProcessableMessageSet {
      &self.messages
   }

   fn columns(&self) -> &[ColumnInfo] {
      &self.columns
   }

   async fn provision(&self, watchdog_secs: u32) -> Result<DialogHandle> {
      provision::provision(self, watchdog_secs).await
   }

   async fn reattach(&self, watchdog_secs: u32) -> Result<DialogHandle> {
      provision::reattach(self, watchdog_secs).await
   }

   async fn receive_batch(
      &self,
      dialog: DialogHandle,
      timeout_secs: u32,
      watchdog_secs: u32,
   ) -> Result<Vec<QueueMessage>> {
      let mut client = connect(&self.sql).await?;
      let script = crate::scripts::receive_batch(
         &self.script_context(),
         dialog.0,
         self.receive_batch_size,
         timeout_secs,
         watchdog_secs,
      );
      let rows = client.simple_query(&script).await?.into_first_result().await?;

      let mut messages = Vec::with_capacity(rows.len());
      for row in rows {
         let conversation: Uuid = row.try_get(0)?.unwrap_or_default();
         let type_name: &str = row.try_get(1)?.unwrap_or_default();
         let body: Option<&[u8]> = row.try_get(2)?;
         messages.push(QueueMessage {
            conversation,
            type_name: type_name.to_string(),
            body: body.map(<[u8]>::to_vec).unwrap_or_default(),
         });
      }
      debug!(count = messages.len(), "received message batch");
      Ok(messages)
   }

   async fn end_conversation(&self, handle: Uuid) -> Result<()> {
      let mut client = connect(&self.sql).await?;
      let script = crate::scripts::end_conversation(handle);
      client.simple_query(&script).await?.into_results().await?;
      Ok(())
   }

   async fn teardown(&self, dialog: Option<DialogHandle>) -> Result<()> {
      teardown::dispose(self, dialog).await
   }
}
