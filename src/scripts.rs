//! Deterministic T-SQL script generation.
//!
//! Every DDL and protocol statement the subscription executes is produced
//! here from the interesting-column list and the naming convention, so the
//! generated scripts can be snapshot-tested and the provisioned objects
//! always match what the listener expects to receive.

use crate::change::{ChangeKind, DmlFilter};
use crate::message::ProcessableMessageSet;
use crate::schema::ColumnInfo;

/// Everything the script builder needs to know about one subscription.
#[derive(Debug, Clone)]
pub struct ScriptContext<'a> {
   pub schema: &'a str,
   pub table: &'a str,
   pub naming: &'a str,
   pub columns: &'a [ColumnInfo],
   /// Primary-key column names, used to pair update images. May be empty.
   pub key_columns: &'a [String],
   pub filter: DmlFilter,
   pub include_old_values: bool,
   /// Update allow-list; `None` means any interesting column.
   pub update_of: Option<&'a [String]>,
   /// `EXECUTE AS` principal for the activation procedure.
   pub activation_principal: &'a str,
   /// Optional `AUTHORIZATION` principal for the service.
   pub service_authorization: Option<&'a str>,
}

impl ScriptContext<'_> {
   fn trigger_name(&self) -> String {
      format!("tr_{}", self.naming)
   }

   fn procedure_name(&self) -> String {
      format!("{}_QueueActivation", self.naming)
   }
}

/// One `CREATE MESSAGE TYPE` statement per message in the processable set,
/// each without payload validation.
pub fn create_message_types(messages: &ProcessableMessageSet) -> Vec<String> {
   messages
      .all_names()
      .into_iter()
      .map(|name| format!("CREATE MESSAGE TYPE [{name}] VALIDATION = NONE;"))
      .collect()
}

/// The contract binding every message type, sent by initiator only.
pub fn create_contract(ctx: &ScriptContext<'_>, messages: &ProcessableMessageSet) -> String {
   let bindings: Vec<String> = messages
      .all_names()
      .into_iter()
      .map(|name| format!("   [{name}] SENT BY INITIATOR"))
      .collect();
   format!(
      "CREATE CONTRACT [{}] (\n{}\n);",
      ctx.naming,
      bindings.join(",\n")
   )
}

/// The change-capture trigger.
///
/// For inserts and deletes the trigger publishes unconditionally. For
/// updates the inserted and deleted images are joined on the table's
/// primary key, and only rows whose filter-column projection differs
/// between the two images are published, unless a rowversion column is
/// interesting, in which case every updated row is published (a rowversion
/// always changes). On a table without a primary key the images cannot be
/// paired row-by-row, so the whole statement is gated on a set-level
/// difference instead and before-image capture is unavailable.
///
/// Each modified row yields one conversation carrying the start marker,
/// one message per interesting column (`0x` when null), and the
/// before-image messages for tracked updates. No trailing end-of-group
/// marker is sent; the receiving side closes a group once every expected
/// column slot is filled.
pub fn create_trigger(ctx: &ScriptContext<'_>) -> String {
   let cols = ctx.columns;
   // Before-images come from the key-joined deleted alias, so tracking is
   // meaningful only when key columns exist to join on.
   let track_old = ctx.include_old_values && !ctx.key_columns.is_empty();

   let after_kinds: Vec<&str> = ctx
      .filter
      .kinds()
      .iter()
      .map(|kind| match kind {
         ChangeKind::Insert => "INSERT",
         ChangeKind::Update => "UPDATE",
         ChangeKind::Delete => "DELETE",
      })
      .collect();

   // @rows holds one row per modified record, in scalar-friendly columns.
   let mut row_decls: Vec<String> = vec!["[__rown] INT IDENTITY(1, 1) PRIMARY KEY".to_string()];
   for (i, col) in cols.iter().enumerate() {
      row_decls.push(format!("[c{i}] {}", col.sql_declaration()));
   }
   if track_old {
      for (i, col) in cols.iter().enumerate() {
         row_decls.push(format!("[o{i}] {}", col.sql_declaration()));
      }
   }

   let new_targets: Vec<String> = (0..cols.len()).map(|i| format!("[c{i}]")).collect();
   let old_targets: Vec<String> = (0..cols.len()).map(|i| format!("[o{i}]")).collect();
   let source_expr = |col: &ColumnInfo, alias: &str| {
      let qualified = if alias.is_empty() {
         format!("[{}]", col.name)
      } else {
         format!("{alias}.[{}]", col.name)
      };
      if col.is_row_version() {
         format!("CONVERT(BINARY(8), {qualified})")
      } else {
         qualified
      }
   };
   let source_cols: Vec<String> = cols.iter().map(|col| source_expr(col, "")).collect();

   let mut body = String::new();
   body.push_str(&format!(
      "CREATE TRIGGER [{schema}].[{trigger}] ON [{schema}].[{table}]\n\
       WITH EXECUTE AS SELF\n\
       AFTER {kinds} AS\n\
       BEGIN\n\
       \x20\x20\x20SET NOCOUNT ON;\n\n\
       \x20\x20\x20DECLARE @dml_kind NVARCHAR(6);\n\
       \x20\x20\x20IF EXISTS (SELECT 1 FROM INSERTED)\n\
       \x20\x20\x20BEGIN\n\
       \x20\x20\x20\x20\x20\x20IF EXISTS (SELECT 1 FROM DELETED) SET @dml_kind = N'Update'\n\
       \x20\x20\x20\x20\x20\x20ELSE SET @dml_kind = N'Insert'\n\
       \x20\x20\x20END\n\
       \x20\x20\x20ELSE IF EXISTS (SELECT 1 FROM DELETED) SET @dml_kind = N'Delete'\n\
       \x20\x20\x20ELSE RETURN;\n\n",
      schema = ctx.schema,
      trigger = ctx.trigger_name(),
      table = ctx.table,
      kinds = after_kinds.join(", "),
   ));

   let enabled: Vec<String> = ctx
      .filter
      .kinds()
      .iter()
      .map(|kind| format!("N'{kind}'"))
      .collect();
   body.push_str(&format!(
      "   IF @dml_kind NOT IN ({}) RETURN;\n\n",
      enabled.join(", ")
   ));

   body.push_str(&format!("   DECLARE @rows TABLE ({});\n\n", row_decls.join(", ")));

   // Row collection per kind. Deletes read the deleted image, inserts the
   // inserted image; updates pair both images and keep only rows whose
   // filter-column projection actually changed.
   body.push_str(&format!(
      "   IF @dml_kind = N'Insert'\n\
       \x20\x20\x20\x20\x20\x20INSERT INTO @rows ({new_targets})\n\
       \x20\x20\x20\x20\x20\x20SELECT {sources} FROM INSERTED;\n",
      new_targets = new_targets.join(", "),
      sources = source_cols.join(", "),
   ));
   body.push_str(&format!(
      "   ELSE IF @dml_kind = N'Delete'\n\
       \x20\x20\x20\x20\x20\x20INSERT INTO @rows ({new_targets})\n\
       \x20\x20\x20\x20\x20\x20SELECT {sources} FROM DELETED;\n",
      new_targets = new_targets.join(", "),
      sources = source_cols.join(", "),
   ));

   let filter_columns: Vec<&str> = match ctx.update_of {
      Some(names) => names.iter().map(String::as_str).collect(),
      None => cols.iter().map(|c| c.name.as_str()).collect(),
   };
   let has_row_version = cols.iter().any(ColumnInfo::is_row_version);
   let ins_sources: Vec<String> = cols.iter().map(|col| source_expr(col, "ins")).collect();
   let del_sources: Vec<String> = cols.iter().map(|col| source_expr(col, "del")).collect();
   let update_targets = if track_old {
      format!("{}, {}", new_targets.join(", "), old_targets.join(", "))
   } else {
      new_targets.join(", ")
   };
   let update_sources = if track_old {
      format!("{}, {}", ins_sources.join(", "), del_sources.join(", "))
   } else {
      ins_sources.join(", ")
   };
   let changed_predicate = if has_row_version {
      String::new()
   } else {
      let ins_filter: Vec<String> = filter_columns
         .iter()
         .map(|c| format!("ins.[{c}]"))
         .collect();
      let del_filter: Vec<String> = filter_columns
         .iter()
         .map(|c| format!("del.[{c}]"))
         .collect();
      format!(
         "\n      WHERE EXISTS (SELECT {} EXCEPT SELECT {})",
         ins_filter.join(", "),
         del_filter.join(", ")
      )
   };
   if !ctx.key_columns.is_empty() {
      let key_join: Vec<String> = ctx
         .key_columns
         .iter()
         .map(|k| format!("ins.[{k}] = del.[{k}]"))
         .collect();
      body.push_str(&format!(
         "   ELSE\n\
          \x20\x20\x20BEGIN\n\
          \x20\x20\x20\x20\x20\x20INSERT INTO @rows ({update_targets})\n\
          \x20\x20\x20\x20\x20\x20SELECT {update_sources}\n\
          \x20\x20\x20\x20\x20\x20FROM INSERTED ins JOIN DELETED del ON {join}{changed_predicate};\n\
          \x20\x20\x20END\n\n",
         join = key_join.join(" AND "),
      ));
   } else if has_row_version {
      body.push_str(&format!(
         "   ELSE\n\
          \x20\x20\x20BEGIN\n\
          \x20\x20\x20\x20\x20\x20INSERT INTO @rows ({new_targets})\n\
          \x20\x20\x20\x20\x20\x20SELECT {sources} FROM INSERTED ins;\n\
          \x20\x20\x20END\n\n",
         new_targets = new_targets.join(", "),
         sources = ins_sources.join(", "),
      ));
   } else {
      // Keyless images cannot be paired row-by-row, so the whole statement
      // is gated on a set-level difference over the filter columns.
      let ins_filter: Vec<String> = filter_columns
         .iter()
         .map(|c| format!("ins.[{c}]"))
         .collect();
      let del_filter: Vec<String> = filter_columns
         .iter()
         .map(|c| format!("del.[{c}]"))
         .collect();
      body.push_str(&format!(
         "   ELSE IF EXISTS (SELECT {ins_f} FROM INSERTED ins EXCEPT SELECT {del_f} FROM DELETED del)\n\
          \x20\x20\x20BEGIN\n\
          \x20\x20\x20\x20\x20\x20INSERT INTO @rows ({new_targets})\n\
          \x20\x20\x20\x20\x20\x20SELECT {sources} FROM INSERTED ins;\n\
          \x20\x20\x20END\n\n",
         ins_f = ins_filter.join(", "),
         del_f = del_filter.join(", "),
         new_targets = new_targets.join(", "),
         sources = ins_sources.join(", "),
      ));
   }

   // Scalar variables, one per slot, reloaded per modified row.
   let mut var_decls: Vec<String> = Vec::new();
   for (i, col) in cols.iter().enumerate() {
      var_decls.push(format!("@new{i} {}", col.sql_declaration()));
   }
   if track_old {
      for (i, col) in cols.iter().enumerate() {
         var_decls.push(format!("@old{i} {}", col.sql_declaration()));
      }
   }
   body.push_str(&format!("   DECLARE {};\n", var_decls.join(", ")));
   body.push_str(
      "   DECLARE @current INT = 1;\n\
       \x20\x20\x20DECLARE @total INT = (SELECT COUNT(*) FROM @rows);\n\
       \x20\x20\x20DECLARE @h UNIQUEIDENTIFIER;\n\n\
       \x20\x20\x20WHILE @current <= @total\n\
       \x20\x20\x20BEGIN\n",
   );

   let mut assignments: Vec<String> = (0..cols.len())
      .map(|i| format!("@new{i} = [c{i}]"))
      .collect();
   if track_old {
      assignments.extend((0..cols.len()).map(|i| format!("@old{i} = [o{i}]")));
   }
   body.push_str(&format!(
      "      SELECT {} FROM @rows WHERE [__rown] = @current;\n\n",
      assignments.join(", ")
   ));

   body.push_str(&format!(
      "      BEGIN DIALOG CONVERSATION @h\n\
       \x20\x20\x20\x20\x20\x20\x20\x20\x20FROM SERVICE [{naming}] TO SERVICE '{naming}'\n\
       \x20\x20\x20\x20\x20\x20\x20\x20\x20ON CONTRACT [{naming}] WITH ENCRYPTION = OFF, LIFETIME = 60;\n\n",
      naming = ctx.naming,
   ));

   for kind in ctx.filter.kinds() {
      body.push_str(&format!(
         "      IF @dml_kind = N'{kind}'\n\
          \x20\x20\x20\x20\x20\x20BEGIN\n\
          \x20\x20\x20\x20\x20\x20\x20\x20\x20SEND ON CONVERSATION @h MESSAGE TYPE [{naming}/StartDialog/{kind}];\n\
          \x20\x20\x20\x20\x20\x20END\n",
         naming = ctx.naming,
      ));
   }
   body.push('\n');

   // A null column value travels as the empty binary marker 0x.
   for (i, col) in cols.iter().enumerate() {
      body.push_str(&format!(
         "      SEND ON CONVERSATION @h MESSAGE TYPE [{naming}/{col}] (ISNULL(CONVERT(VARBINARY(MAX), {expr}), 0x));\n",
         naming = ctx.naming,
         col = col.name,
         expr = wire_expr(col, &format!("@new{i}")),
      ));
   }

   if track_old {
      body.push('\n');
      for (i, col) in cols.iter().enumerate() {
         body.push_str(&format!(
            "      IF @dml_kind = N'Update'\n\
             \x20\x20\x20\x20\x20\x20BEGIN\n\
             \x20\x20\x20\x20\x20\x20\x20\x20\x20SEND ON CONVERSATION @h MESSAGE TYPE [{naming}/{col}/old] (ISNULL(CONVERT(VARBINARY(MAX), {expr}), 0x));\n\
             \x20\x20\x20\x20\x20\x20END\n",
            naming = ctx.naming,
            col = col.name,
            expr = wire_expr(col, &format!("@old{i}")),
         ));
      }
   }

   body.push_str(
      "\n      END CONVERSATION @h;\n\
       \x20\x20\x20\x20\x20\x20SET @current = @current + 1;\n\
       \x20\x20\x20END\n\
       END;",
   );
   body
}

/// Portable textual representation of one column variable.
///
/// Dates travel as ISO 8601, floats in round-trip scientific notation,
/// binary as hex without the `0x` prefix, and everything else through the
/// server's default `CONVERT` to `NVARCHAR`.
fn wire_expr(col: &ColumnInfo, var: &str) -> String {
   match col.type_name.as_str() {
      "date" | "time" | "datetime" | "datetime2" | "smalldatetime" => {
         format!("CONVERT(NVARCHAR(MAX), {var}, 126)")
      }
      "datetimeoffset" => format!("CONVERT(NVARCHAR(MAX), {var}, 127)"),
      "float" | "real" => format!("CONVERT(NVARCHAR(MAX), {var}, 2)"),
      "binary" | "varbinary" | "rowversion" | "timestamp" => {
         format!("CONVERT(NVARCHAR(MAX), {var}, 2)")
      }
      _ => format!("CONVERT(NVARCHAR(MAX), {var})"),
   }
}

/// The activation procedure invoked by the queue.
///
/// The procedure shares the queue with the listener, so every receive runs
/// inside a transaction: teardown messages (dispose, expired watchdog
/// timer) commit their drops, end-of-dialog sentinels commit their
/// `END CONVERSATION`, and anything else is a data message destined for
/// the listener, which is rolled back onto the queue untouched before the
/// procedure exits. On a dispose or timer message it drops every object
/// under the naming convention (itself last) and closes the conversation,
/// so the database self-cleans even if the application never comes back.
pub fn create_activation_procedure(
   ctx: &ScriptContext<'_>,
   messages: &ProcessableMessageSet,
) -> String {
   let drops = drop_statements(ctx, messages, true)
      .into_iter()
      .map(|stmt| format!("         {stmt}"))
      .collect::<Vec<_>>()
      .join("\n");
   format!(
      "CREATE PROCEDURE [{schema}].[{proc}] AS\n\
       BEGIN\n\
       \x20\x20\x20SET NOCOUNT ON;\n\
       \x20\x20\x20DECLARE @h UNIQUEIDENTIFIER;\n\
       \x20\x20\x20DECLARE @mt SYSNAME;\n\n\
       \x20\x20\x20WHILE (1 = 1)\n\
       \x20\x20\x20BEGIN\n\
       \x20\x20\x20\x20\x20\x20BEGIN TRANSACTION;\n\
       \x20\x20\x20\x20\x20\x20WAITFOR (RECEIVE TOP (1) @h = [conversation_handle], @mt = [message_type_name]\n\
       \x20\x20\x20\x20\x20\x20\x20\x20\x20FROM [{schema}].[{queue}]), TIMEOUT 500;\n\
       \x20\x20\x20\x20\x20\x20IF @@ROWCOUNT = 0\n\
       \x20\x20\x20\x20\x20\x20BEGIN\n\
       \x20\x20\x20\x20\x20\x20\x20\x20\x20ROLLBACK;\n\
       \x20\x20\x20\x20\x20\x20\x20\x20\x20RETURN;\n\
       \x20\x20\x20\x20\x20\x20END\n\n\
       \x20\x20\x20\x20\x20\x20IF @mt = N'{dispose}' OR @mt = N'{timer}'\n\
       \x20\x20\x20\x20\x20\x20BEGIN\n\
       \x20\x20\x20\x20\x20\x20\x20\x20\x20END CONVERSATION @h WITH CLEANUP;\n\
       {drops}\n\
       \x20\x20\x20\x20\x20\x20\x20\x20\x20COMMIT;\n\
       \x20\x20\x20\x20\x20\x20\x20\x20\x20RETURN;\n\
       \x20\x20\x20\x20\x20\x20END\n\
       \x20\x20\x20\x20\x20\x20ELSE IF @mt = N'{end_dialog}'\n\
       \x20\x20\x20\x20\x20\x20BEGIN\n\
       \x20\x20\x20\x20\x20\x20\x20\x20\x20END CONVERSATION @h;\n\
       \x20\x20\x20\x20\x20\x20\x20\x20\x20COMMIT;\n\
       \x20\x20\x20\x20\x20\x20END\n\
       \x20\x20\x20\x20\x20\x20ELSE\n\
       \x20\x20\x20\x20\x20\x20BEGIN\n\
       \x20\x20\x20\x20\x20\x20\x20\x20\x20ROLLBACK;\n\
       \x20\x20\x20\x20\x20\x20\x20\x20\x20RETURN;\n\
       \x20\x20\x20\x20\x20\x20END\n\
       \x20\x20\x20END\n\
       END;",
      schema = ctx.schema,
      proc = ctx.procedure_name(),
      queue = ctx.naming,
      dispose = messages.dispose_name(),
      timer = crate::message::DIALOG_TIMER_MESSAGE_TYPE,
      end_dialog = crate::message::END_DIALOG_MESSAGE_TYPE,
   )
}

/// The queue bound to the activation procedure, single reader.
///
/// Poison-message handling is disabled: the activation procedure rolls
/// data messages back, and five consecutive rollbacks would otherwise
/// disable the queue.
pub fn create_queue(ctx: &ScriptContext<'_>) -> String {
   let principal = match ctx.activation_principal {
      "SELF" | "OWNER" => ctx.activation_principal.to_string(),
      other => format!("N'{}'", escape_literal(other)),
   };
   format!(
      "CREATE QUEUE [{schema}].[{queue}] WITH STATUS = ON, RETENTION = OFF,\n\
       \x20\x20\x20ACTIVATION (STATUS = ON, PROCEDURE_NAME = [{schema}].[{proc}],\n\
       \x20\x20\x20MAX_QUEUE_READERS = 1, EXECUTE AS {principal}),\n\
       \x20\x20\x20POISON_MESSAGE_HANDLING (STATUS = OFF);",
      schema = ctx.schema,
      queue = ctx.naming,
      proc = ctx.procedure_name(),
   )
}

/// The service addressing the queue over the contract.
pub fn create_service(ctx: &ScriptContext<'_>) -> String {
   let authorization = match ctx.service_authorization {
      Some(principal) => format!(" AUTHORIZATION [{principal}]"),
      None => String::new(),
   };
   format!(
      "CREATE SERVICE [{naming}]{authorization} ON QUEUE [{schema}].[{naming}] ([{naming}]);",
      naming = ctx.naming,
      schema = ctx.schema,
   )
}

/// Opens the standing conversation, arms the watchdog timer, and returns
/// the handle.
pub fn begin_dialog(ctx: &ScriptContext<'_>, watchdog_secs: u32) -> String {
   format!(
      "DECLARE @h UNIQUEIDENTIFIER;\n\
       BEGIN DIALOG CONVERSATION @h\n\
       \x20\x20\x20FROM SERVICE [{naming}] TO SERVICE '{naming}'\n\
       \x20\x20\x20ON CONTRACT [{naming}] WITH ENCRYPTION = OFF;\n\
       BEGIN CONVERSATION TIMER (@h) TIMEOUT = {watchdog_secs};\n\
       SELECT @h AS [conversation_handle];",
      naming = ctx.naming,
   )
}

/// One receive iteration: refresh the watchdog, then block for up to
/// `timeout_secs` waiting for up to `batch` messages.
pub fn receive_batch(
   ctx: &ScriptContext<'_>,
   dialog: uuid::Uuid,
   batch: usize,
   timeout_secs: u32,
   watchdog_secs: u32,
) -> String {
   format!(
      "BEGIN CONVERSATION TIMER ('{dialog}') TIMEOUT = {watchdog_secs};\n\
       WAITFOR (RECEIVE TOP ({batch}) [conversation_handle], [message_type_name], [message_body]\n\
       \x20\x20\x20FROM [{schema}].[{queue}]), TIMEOUT {timeout_ms};",
      schema = ctx.schema,
      queue = ctx.naming,
      timeout_ms = u64::from(timeout_secs) * 1000,
   )
}

/// Publishes the dispose message on the standing conversation and ends it
/// locally; the activation procedure performs the server-side teardown.
pub fn send_dispose(messages: &ProcessableMessageSet, dialog: uuid::Uuid) -> String {
   format!(
      "DECLARE @h UNIQUEIDENTIFIER = '{dialog}';\n\
       SEND ON CONVERSATION @h MESSAGE TYPE [{dispose}];\n\
       END CONVERSATION @h;",
      dispose = messages.dispose_name(),
   )
}

/// Ends one conversation by handle.
pub fn end_conversation(handle: uuid::Uuid) -> String {
   format!(
      "DECLARE @h UNIQUEIDENTIFIER = '{handle}';\n\
       END CONVERSATION @h;"
   )
}

/// Idempotent drop statements in reverse dependency order: trigger,
/// service, queue, contract, message types, then (optionally) the
/// activation procedure itself.
pub fn drop_statements(
   ctx: &ScriptContext<'_>,
   messages: &ProcessableMessageSet,
   include_procedure: bool,
) -> Vec<String> {
   let mut statements = vec![
      format!(
         "IF OBJECT_ID(N'[{schema}].[{trigger}]', N'TR') IS NOT NULL DROP TRIGGER [{schema}].[{trigger}];",
         schema = ctx.schema,
         trigger = ctx.trigger_name(),
      ),
      format!(
         "IF EXISTS (SELECT 1 FROM sys.services WHERE name = N'{naming}') DROP SERVICE [{naming}];",
         naming = ctx.naming,
      ),
      format!(
         "IF EXISTS (SELECT 1 FROM sys.service_queues WHERE name = N'{naming}') DROP QUEUE [{schema}].[{naming}];",
         naming = ctx.naming,
         schema = ctx.schema,
      ),
      format!(
         "IF EXISTS (SELECT 1 FROM sys.service_contracts WHERE name = N'{naming}') DROP CONTRACT [{naming}];",
         naming = ctx.naming,
      ),
   ];
   for name in messages.all_names() {
      statements.push(format!(
         "IF EXISTS (SELECT 1 FROM sys.service_message_types WHERE name = N'{name}') DROP MESSAGE TYPE [{name}];"
      ));
   }
   if include_procedure {
      statements.push(format!(
         "IF OBJECT_ID(N'[{schema}].[{proc}]', N'P') IS NOT NULL DROP PROCEDURE [{schema}].[{proc}];",
         schema = ctx.schema,
         proc = ctx.procedure_name(),
      ));
   }
   statements
}

/// Counts objects already provisioned under a naming convention. Any hit
/// makes provisioning fail rather than silently adopt foreign objects.
pub fn collision_check() -> &'static str {
   "SELECT COUNT(*) FROM (\
      SELECT name FROM sys.objects WHERE name LIKE @P1 \
      UNION ALL SELECT name FROM sys.service_queues WHERE name LIKE @P1 \
      UNION ALL SELECT name FROM sys.services WHERE name LIKE @P1 \
      UNION ALL SELECT name FROM sys.service_contracts WHERE name LIKE @P1 \
      UNION ALL SELECT name COLLATE DATABASE_DEFAULT FROM sys.service_message_types WHERE name LIKE @P1\
   ) AS existing"
}

/// Checks the queue for a naming convention still exists (reattachment).
pub fn queue_exists() -> &'static str {
   "SELECT COUNT(*) FROM sys.service_queues WHERE name = @P1"
}

/// Finds the standing conversation for a service (reattachment). Trigger
/// conversations are short-lived; the standing dialog is the surviving
/// initiator endpoint.
pub fn find_standing_dialog() -> &'static str {
   "SELECT TOP (1) [conversation_handle] FROM sys.conversation_endpoints \
    WHERE far_service = @P1 AND is_initiator = 1 AND state IN ('SO', 'CO') \
    ORDER BY security_timestamp DESC"
}

fn escape_literal(raw: &str) -> String {
   raw.replace('\'', "''")
}
