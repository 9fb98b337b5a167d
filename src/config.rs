//! Subscription configuration.

use std::collections::HashMap;

use crate::change::DmlFilter;

/// Text encoding of column payloads on the Service Broker wire.
///
/// The generated trigger converts every value through `NVARCHAR(MAX)` before
/// casting to `VARBINARY(MAX)`, so the default is UTF-16LE. `Utf8` exists for
/// servers where an outer layer re-encodes payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadEncoding {
   #[default]
   Utf16Le,
   Utf8,
}

/// Configuration for one table subscription.
///
/// Controls where to connect, which table and columns to watch, which DML
/// kinds to deliver, and how the provisioned Service Broker objects are
/// scoped and secured.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
   /// ADO-style connection string for the target server.
   pub connection_string: String,

   /// Target table. Defaults to the model's `table_name()` when `None`.
   /// Accepts plain (`Customers`), schema-qualified (`dbo.Customers`) and
   /// bracket-quoted (`[dbo].[Customers]`) forms.
   pub table: Option<String>,

   /// Schema for the provisioned objects and the default table schema.
   pub schema: String,

   /// Explicit model-field to table-column mapping. Entries take precedence
   /// over case-insensitive name equality.
   pub mapping: HashMap<String, String>,

   /// Optional allow-list of columns whose modification fires update
   /// notifications. `None` means any interesting column.
   pub update_of: Option<Vec<String>>,

   /// DML kinds that generate notifications.
   pub dml_filter: DmlFilter,

   /// Whether update events carry the row's before-image.
   pub include_old_values: bool,

   /// A prior naming convention for reattaching to objects left behind by
   /// a soft-stopped subscription. `None` generates a fresh one.
   pub naming_convention: Option<String>,

   /// Optional `AUTHORIZATION` principal for the created service.
   pub service_authorization: Option<String>,

   /// `EXECUTE AS` principal for the queue's activation procedure.
   /// Defaults to `SELF`.
   pub activation_principal: String,

   /// Encoding used to decode column payloads.
   pub encoding: PayloadEncoding,

   /// Maximum messages pulled per blocking receive. `None` sizes the batch
   /// to exactly one change's message group, which is the safe default.
   pub receive_batch_size: Option<usize>,

   /// Capacity of the broadcast channel behind [`subscribe_stream`].
   ///
   /// Stream subscribers that fall more than this many events behind
   /// observe a `Lagged` gap, exactly like a `tokio::sync::broadcast`
   /// receiver. Callbacks are unaffected. Default: 256.
   ///
   /// [`subscribe_stream`]: crate::TableDependency::subscribe_stream
   pub channel_capacity: usize,
}

impl SubscriptionConfig {
   /// Creates a configuration with default settings for the given
   /// connection string.
   pub fn new(connection_string: impl Into<String>) -> Self {
      Self {
         connection_string: connection_string.into(),
         table: None,
         schema: "dbo".to_string(),
         mapping: HashMap::new(),
         update_of: None,
         dml_filter: DmlFilter::default(),
         include_old_values: false,
         naming_convention: None,
         service_authorization: None,
         activation_principal: "SELF".to_string(),
         encoding: PayloadEncoding::default(),
         receive_batch_size: None,
         channel_capacity: 256,
      }
   }

   /// Sets the target table, overriding the model's default name.
   pub fn with_table(mut self, table: impl Into<String>) -> Self {
      self.table = Some(table.into());
      self
   }

   /// Sets the schema for provisioned objects (default `dbo`).
   pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
      self.schema = schema.into();
      self
   }

   /// Adds an explicit model-field to table-column mapping entry.
   pub fn with_mapping(mut self, field: impl Into<String>, column: impl Into<String>) -> Self {
      self.mapping.insert(field.into(), column.into());
      self
   }

   /// Restricts update notifications to modifications of the given columns.
   pub fn with_update_of<I, S>(mut self, columns: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      self.update_of = Some(columns.into_iter().map(Into::into).collect());
      self
   }

   /// Sets the DML-kind mask.
   pub fn with_dml_filter(mut self, filter: DmlFilter) -> Self {
      self.dml_filter = filter;
      self
   }

   /// Enables before-image tracking for update events.
   pub fn with_old_values(mut self, include: bool) -> Self {
      self.include_old_values = include;
      self
   }

   /// Reattaches to objects provisioned under a prior naming convention.
   pub fn with_naming_convention(mut self, naming: impl Into<String>) -> Self {
      self.naming_convention = Some(naming.into());
      self
   }

   /// Sets the `AUTHORIZATION` principal for the created service.
   pub fn with_service_authorization(mut self, principal: impl Into<String>) -> Self {
      self.service_authorization = Some(principal.into());
      self
   }

   /// Sets the `EXECUTE AS` principal for the activation procedure.
   pub fn with_activation_principal(mut self, principal: impl Into<String>) -> Self {
      self.activation_principal = principal.into();
      self
   }

   /// Sets the payload text encoding.
   pub fn with_encoding(mut self, encoding: PayloadEncoding) -> Self {
      self.encoding = encoding;
      self
   }

   /// Overrides the receive batch size.
   pub fn with_receive_batch_size(mut self, size: usize) -> Self {
      self.receive_batch_size = Some(size);
      self
   }

   /// Sets the broadcast channel capacity for stream subscribers.
   pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
      self.channel_capacity = capacity;
      self
   }
}
