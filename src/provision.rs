//! Database object provisioning.
//!
//! Provisioning runs inside one explicit transaction and creates, in
//! dependency order: message types, the contract, the change-capture
//! trigger, the activation procedure, the queue, the service, and the
//! standing conversation with its watchdog timer. Any failure rolls the
//! whole set back, so a failed start leaves nothing behind.

use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{SqlClient, SqlServerBackend, connect};
use crate::error::{Error, Result};
use crate::message::DialogHandle;
use crate::scripts;

/// Checks every start precondition that does not require provisioned
/// objects: broker enablement, engine version, table existence, and the
/// grants provisioning needs. All failures surface before any DDL runs.
pub(crate) async fn check_preconditions(
   client: &mut SqlClient,
   backend: &SqlServerBackend,
) -> Result<()> {
   let enabled = client
      .query(
         "SELECT is_broker_enabled FROM sys.databases WHERE database_id = DB_ID()",
         &[],
      )
      .await?
      .into_row()
      .await?
      .and_then(|row| row.try_get::<bool, _>(0).ok().flatten())
      .unwrap_or(false);
   if !enabled {
      return Err(Error::ServiceBrokerDisabled);
   }

   let version: String = client
      .query(
         "SELECT CONVERT(NVARCHAR(128), SERVERPROPERTY('ProductVersion'))",
         &[],
      )
      .await?
      .into_row()
      .await?
      .and_then(|row| row.try_get::<&str, _>(0).ok().flatten().map(str::to_string))
      .unwrap_or_default();
   let major: u32 = version.split('.').next().and_then(|v| v.parse().ok()).unwrap_or(0);
   if major < 9 {
      return Err(Error::UnsupportedEngineVersion(version));
   }

   let table_count = scalar_i32(
      client,
      "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2",
      &[&backend.schema, &backend.table],
   )
   .await?;
   if table_count == 0 {
      return Err(Error::MissingTable(format!(
         "{}.{}",
         backend.schema, backend.table
      )));
   }

   for permission in [
      "CREATE MESSAGE TYPE",
      "CREATE CONTRACT",
      "CREATE QUEUE",
      "CREATE SERVICE",
      "CREATE PROCEDURE",
   ] {
      let granted = scalar_i32(
         client,
         "SELECT ISNULL(HAS_PERMS_BY_NAME(DB_NAME(), 'DATABASE', @P1), 0)",
         &[&permission],
      )
      .await?;
      if granted == 0 {
         return Err(Error::InsufficientGrants(permission.to_string()));
      }
   }

   Ok(())
}

/// Provisions every object for the subscription and opens the standing
/// conversation. Fails with [`Error::DbObjectsWithSameName`] when anything
/// already exists under the naming convention.
pub(crate) async fn provision(
   backend: &SqlServerBackend,
   watchdog_secs: u32,
) -> Result<DialogHandle> {
   let mut client = connect(&backend.sql).await?;

   exec(&mut client, "BEGIN TRANSACTION").await?;
   match provision_objects(&mut client, backend, watchdog_secs).await {
      Ok(handle) => {
         exec(&mut client, "COMMIT").await?;
         debug!(naming = %backend.naming, dialog = %handle, "provisioned subscription objects");
         Ok(handle)
      }
      Err(error) => {
         if let Err(rollback) = exec(&mut client, "IF @@TRANCOUNT > 0 ROLLBACK").await {
            warn!(error = %rollback, "rollback after failed provisioning also failed");
         }
         Err(error)
      }
   }
}

async fn provision_objects(
   client: &mut SqlClient,
   backend: &SqlServerBackend,
   watchdog_secs: u32,
) -> Result<DialogHandle> {
   let ctx = backend.script_context();
   let messages = &backend.messages;

   // Checked inside the transaction so a concurrent provisioner under the
   // same naming convention serializes against this one instead of racing
   // past the check.
   let pattern = format!("{}%", backend.naming);
   let existing = scalar_i32(client, scripts::collision_check(), &[&pattern]).await?;
   if existing > 0 {
      return Err(Error::DbObjectsWithSameName(backend.naming.clone()));
   }

   for statement in scripts::create_message_types(messages) {
      exec(client, &statement).await?;
   }
   exec(client, &scripts::create_contract(&ctx, messages)).await?;
   exec(client, &scripts::create_trigger(&ctx)).await?;
   exec(client, &scripts::create_activation_procedure(&ctx, messages)).await?;
   exec(client, &scripts::create_queue(&ctx)).await?;
   exec(client, &scripts::create_service(&ctx)).await?;

   let handle: Uuid = client
      .simple_query(&scripts::begin_dialog(&ctx, watchdog_secs))
      .await?
      .into_row()
      .await?
      .and_then(|row| row.try_get::<Uuid, _>(0).ok().flatten())
      .ok_or_else(|| Error::ServiceBrokerErrorMessage("begin dialog returned no handle".into()))?;
   Ok(DialogHandle(handle))
}

/// Reattaches to objects left behind by a soft-stopped subscription.
///
/// The queue must still exist. The prior standing conversation is
/// recovered from the server when it survived; otherwise a replacement
/// dialog is begun over the existing service and contract.
pub(crate) async fn reattach(
   backend: &SqlServerBackend,
   watchdog_secs: u32,
) -> Result<DialogHandle> {
   let mut client = connect(&backend.sql).await?;

   let queues = scalar_i32(&mut client, scripts::queue_exists(), &[&backend.naming]).await?;
   if queues == 0 {
      return Err(Error::QueueMissing(backend.naming.clone()));
   }

   let standing = client
      .query(scripts::find_standing_dialog(), &[&backend.naming])
      .await?
      .into_row()
      .await?
      .and_then(|row| row.try_get::<Uuid, _>(0).ok().flatten());

   let handle = match standing {
      Some(handle) => {
         debug!(naming = %backend.naming, dialog = %handle, "recovered standing conversation");
         DialogHandle(handle)
      }
      None => {
         warn!(naming = %backend.naming, "standing conversation lost; beginning a new dialog");
         let ctx = backend.script_context();
         let handle: Uuid = client
            .simple_query(&scripts::begin_dialog(&ctx, watchdog_secs))
            .await?
            .into_row()
            .await?
            .and_then(|row| row.try_get::<Uuid, _>(0).ok().flatten())
            .ok_or_else(|| {
               Error::ServiceBrokerErrorMessage("begin dialog returned no handle".into())
            })?;
         DialogHandle(handle)
      }
   };
   Ok(handle)
}

async fn exec(client: &mut SqlClient, statement: &str) -> Result<()> {
   client.simple_query(statement).await?.into_results().await?;
   Ok(())
}

async fn scalar_i32(
   client: &mut SqlClient,
   sql: &str,
   params: &[&dyn tiberius::ToSql],
) -> Result<i32> {
   let value = client
      .query(sql, params)
      .await?
      .into_row()
      .await?
      .and_then(|row| row.try_get::<i32, _>(0).ok().flatten())
      .unwrap_or(0);
   Ok(value)
}
