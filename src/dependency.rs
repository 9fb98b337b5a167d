//! The public subscription handle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{QueueBackend, SqlServerBackend, connect};
use crate::change::ChangeEvent;
use crate::config::{PayloadEncoding, SubscriptionConfig};
use crate::error::{Error, Result};
use crate::listener::{CallbackRegistry, Listener};
use crate::message::{DialogHandle, ProcessableMessageSet};
use crate::model::TableModel;
use crate::status::{StatusTracker, SubscriptionStatus};
use crate::stream::ChangeEventStream;
use crate::{naming, provision, schema};

enum RunState {
   Idle,
   Starting,
   Running {
      cancel: CancellationToken,
      task: JoinHandle<()>,
      dialog: DialogHandle,
   },
   Stopped,
}

/// A subscription to row-level changes on one SQL Server table.
///
/// Construction introspects the table and reconciles it against the model
/// type; [`start`](Self::start) provisions the Service Broker objects and
/// spawns the background listener; [`stop`](Self::stop) cancels the
/// listener and removes every provisioned object. Dropping a running
/// dependency attempts the same teardown on a best-effort basis, so no
/// orphaned objects accumulate during normal operation.
pub struct TableDependency<T: TableModel> {
   backend: Arc<SqlServerBackend>,
   reattach: bool,
   field_for_column: HashMap<String, String>,
   encoding: PayloadEncoding,
   include_old_values: bool,
   callbacks: Arc<CallbackRegistry<T>>,
   status: Arc<StatusTracker>,
   state: Mutex<RunState>,
}

impl<T: TableModel> std::fmt::Debug for TableDependency<T> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("TableDependency")
         .field("schema", &self.backend.schema)
         .field("table", &self.backend.table)
         .finish_non_exhaustive()
   }
}

impl<T: TableModel> TableDependency<T> {
   /// Creates a subscription for the model type `T`.
   ///
   /// Connects once to read column metadata and resolve each model field
   /// to a table column. Nothing is provisioned yet; the database is not
   /// modified until [`start`](Self::start).
   pub async fn new(config: SubscriptionConfig) -> Result<Self> {
      config.dml_filter.validate()?;

      let raw_table = config.table.clone().unwrap_or_else(T::table_name);
      let (table_schema, table) = schema::parse_table_name(&raw_table)?;
      let schema_name = table_schema.unwrap_or_else(|| config.schema.clone());

      let sql = tiberius::Config::from_ado_string(&config.connection_string)?;
      let mut client = connect(&sql).await?;
      let table_columns = schema::introspect(&mut client, &schema_name, &table).await?;
      let key_columns = schema::introspect_keys(&mut client, &schema_name, &table).await?;
      if config.include_old_values && key_columns.is_empty() {
         return Err(Error::MissingPrimaryKey(format!("{schema_name}.{table}")));
      }
      let fields = T::field_names();
      let mapping = schema::reconcile(
         &fields,
         &config.mapping,
         config.update_of.as_deref(),
         &table_columns,
      )?;

      let (naming, reattach) = match &config.naming_convention {
         Some(existing) => {
            naming::validate(existing)?;
            (existing.clone(), true)
         }
         None => (naming::generate(&table), false),
      };

      let messages = ProcessableMessageSet::new(
         &naming,
         &mapping.columns,
         config.dml_filter,
         config.include_old_values,
      );
      // One change group per receive keeps a close from discarding the
      // head of the next group.
      let receive_batch_size = config.receive_batch_size.unwrap_or_else(|| messages.group_size());

      debug!(
         table = %format!("{schema_name}.{table}"),
         %naming,
         columns = mapping.columns.len(),
         reattach,
         "subscription prepared"
      );

      let backend = Arc::new(SqlServerBackend {
         sql,
         schema: schema_name,
         table,
         naming,
         columns: mapping.columns,
         key_columns,
         filter: config.dml_filter,
         include_old_values: config.include_old_values,
         update_of: mapping.update_of,
         activation_principal: config.activation_principal,
         service_authorization: config.service_authorization,
         receive_batch_size,
         messages,
      });

      Ok(Self {
         backend,
         reattach,
         field_for_column: mapping.field_for_column,
         encoding: config.encoding,
         include_old_values: config.include_old_values,
         callbacks: Arc::new(CallbackRegistry::new(config.channel_capacity)),
         status: Arc::new(StatusTracker::new()),
         state: Mutex::new(RunState::Idle),
      })
   }

   /// The naming convention scoping this subscription's database objects.
   ///
   /// Persist it before [`stop_without_disposing`](Self::stop_without_disposing)
   /// to reattach later via
   /// [`SubscriptionConfig::with_naming_convention`].
   pub fn naming_convention(&self) -> &str {
      self.backend.naming_convention()
   }

   /// The current lifecycle status.
   pub fn status(&self) -> SubscriptionStatus {
      self.status.get()
   }

   /// Registers a callback for decoded change events.
   pub fn on_changed<F>(&self, callback: F)
   where
      F: Fn(&ChangeEvent<T>) + Send + Sync + 'static,
   {
      self.callbacks.on_changed(Box::new(callback));
   }

   /// Registers a callback for listener errors.
   pub fn on_error<F>(&self, callback: F)
   where
      F: Fn(&Error) + Send + Sync + 'static,
   {
      self.callbacks.on_error(Box::new(callback));
   }

   /// Registers a callback for status transitions.
   pub fn on_status<F>(&self, callback: F)
   where
      F: Fn(SubscriptionStatus) + Send + Sync + 'static,
   {
      self.status.on_status(Box::new(callback));
   }

   /// Subscribes to change events as an async stream.
   ///
   /// Counts as a subscriber for the purposes of [`start`](Self::start).
   /// A slow consumer skips ahead rather than blocking the listener; the
   /// gap is delivered to the error callbacks as [`Error::Lagged`].
   pub fn subscribe_stream(&self) -> ChangeEventStream<T> {
      let callbacks = Arc::clone(&self.callbacks);
      ChangeEventStream::new(
         self.callbacks.subscribe(),
         Some(Box::new(move |skipped| {
            callbacks.dispatch_error(&Error::Lagged(skipped));
         })),
      )
   }

   /// Provisions the database objects and starts the background listener.
   ///
   /// `receive_timeout_secs` bounds each blocking receive;
   /// `watchdog_timeout_secs` arms the server-side self-teardown timer and
   /// must exceed the receive timeout, or the watchdog would fire during a
   /// quiet but healthy wait. 120 and 180 are reasonable values.
   ///
   /// At least one change callback or stream subscriber must be registered
   /// first; a subscription nobody observes only burns server resources.
   pub async fn start(&self, receive_timeout_secs: u32, watchdog_timeout_secs: u32) -> Result<()> {
      if watchdog_timeout_secs <= receive_timeout_secs {
         return Err(Error::WatchdogTimeout {
            watchdog: watchdog_timeout_secs,
            receive: receive_timeout_secs,
         });
      }
      if !self.callbacks.has_subscribers() {
         return Err(Error::NoSubscriber);
      }
      {
         let mut state = self.state.lock();
         match *state {
            RunState::Idle | RunState::Stopped => *state = RunState::Starting,
            RunState::Starting | RunState::Running { .. } => return Err(Error::AlreadyStarted),
         }
      }

      match self.start_inner(receive_timeout_secs, watchdog_timeout_secs).await {
         Ok(()) => Ok(()),
         Err(error) => {
            *self.state.lock() = RunState::Idle;
            self.status.set(SubscriptionStatus::StoppedDueToError);
            Err(error)
         }
      }
   }

   async fn start_inner(&self, receive_timeout_secs: u32, watchdog_timeout_secs: u32) -> Result<()> {
      self.status.set(SubscriptionStatus::Starting);

      let mut client = connect(&self.backend.sql).await?;
      provision::check_preconditions(&mut client, &self.backend).await?;
      drop(client);

      let dialog = if self.reattach {
         self.backend.reattach(watchdog_timeout_secs).await?
      } else {
         self.backend.provision(watchdog_timeout_secs).await?
      };

      let cancel = CancellationToken::new();
      let listener = Listener::<T> {
         backend: Arc::clone(&self.backend) as Arc<dyn QueueBackend>,
         dialog,
         field_for_column: self.field_for_column.clone(),
         encoding: self.encoding,
         include_old_values: self.include_old_values,
         receive_timeout_secs,
         watchdog_secs: watchdog_timeout_secs,
         callbacks: Arc::clone(&self.callbacks),
         status: Arc::clone(&self.status),
         cancel: cancel.clone(),
      };
      let task = tokio::spawn(listener.run());

      *self.state.lock() = RunState::Running {
         cancel,
         task,
         dialog,
      };
      info!(naming = self.backend.naming_convention(), "subscription started");
      Ok(())
   }

   /// Stops the listener and removes every provisioned object.
   ///
   /// Idempotent: stopping a never-started or already-stopped subscription
   /// succeeds without touching the database.
   pub async fn stop(&self) -> Result<()> {
      let Some(dialog) = self.halt_listener().await else {
         return Ok(());
      };
      self.backend.teardown(Some(dialog)).await?;
      info!(naming = self.backend.naming_convention(), "subscription stopped and disposed");
      Ok(())
   }

   /// Stops the listener but leaves the database objects in place.
   ///
   /// Returns the naming convention to reattach with. Until a later
   /// reattach or [`stop`](Self::stop), the server-side watchdog is the
   /// only thing bounding the objects' lifetime.
   pub async fn stop_without_disposing(&self) -> Result<String> {
      self.halt_listener().await;
      info!(naming = self.backend.naming_convention(), "subscription stopped; objects retained");
      Ok(self.backend.naming_convention().to_string())
   }

   /// Cancels and awaits the listener task, returning the standing dialog
   /// if one was running.
   async fn halt_listener(&self) -> Option<DialogHandle> {
      let previous = std::mem::replace(&mut *self.state.lock(), RunState::Stopped);
      match previous {
         RunState::Running {
            cancel,
            task,
            dialog,
         } => {
            cancel.cancel();
            if task.await.is_err() {
               warn!("listener task panicked before shutdown");
            }
            Some(dialog)
         }
         _ => None,
      }
   }
}

impl<T: TableModel> Drop for TableDependency<T> {
   /// Best-effort teardown of a still-running subscription.
   ///
   /// Requires an ambient tokio runtime to spawn onto; without one the
   /// server-side watchdog timer remains the cleanup of last resort.
   fn drop(&mut self) {
      let previous = std::mem::replace(&mut *self.state.lock(), RunState::Stopped);
      if let RunState::Running { cancel, dialog, .. } = previous {
         cancel.cancel();
         match Handle::try_current() {
            Ok(handle) => {
               let backend = Arc::clone(&self.backend);
               handle.spawn(async move {
                  if let Err(error) = backend.teardown(Some(dialog)).await {
                     warn!(error = %error, "teardown on drop failed");
                  }
               });
            }
            Err(_) => {
               warn!(
                  naming = self.backend.naming_convention(),
                  "dropped outside a tokio runtime; relying on the watchdog for cleanup"
               );
            }
         }
      }
   }
}
