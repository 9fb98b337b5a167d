//! Tests for the generated T-SQL scripts.
//!
//! Tests verify:
//! - Provisioning DDL: message types, contract, queue, service shapes
//! - Trigger body: kind gating, update image pairing, null markers
//! - Teardown: idempotent drops in reverse dependency order
//! - Protocol scripts: dialog, watchdog timer, batched receive

use std::sync::LazyLock;

use tiberius_table_observer::change::{ChangeKind, DmlFilter};
use tiberius_table_observer::message::ProcessableMessageSet;
use tiberius_table_observer::schema::{ColumnInfo, SizeSpec};
use tiberius_table_observer::scripts::{self, ScriptContext};

fn columns() -> Vec<ColumnInfo> {
   vec![
      ColumnInfo {
         name: "Id".to_string(),
         type_name: "int".to_string(),
         size: SizeSpec::None,
      },
      ColumnInfo {
         name: "Name".to_string(),
         type_name: "nvarchar".to_string(),
         size: SizeSpec::Length(200),
      },
      ColumnInfo {
         name: "UpdatedAt".to_string(),
         type_name: "datetime2".to_string(),
         size: SizeSpec::Scale(7),
      },
   ]
}

static PRIMARY_KEY: LazyLock<Vec<String>> = LazyLock::new(|| vec!["Id".to_string()]);

fn ctx<'a>(columns: &'a [ColumnInfo], filter: DmlFilter, old: bool) -> ScriptContext<'a> {
   ScriptContext {
      schema: "dbo",
      table: "Customers",
      naming: "Customers_abc123",
      columns,
      key_columns: &PRIMARY_KEY,
      filter,
      include_old_values: old,
      update_of: None,
      activation_principal: "SELF",
      service_authorization: None,
   }
}

fn message_set(columns: &[ColumnInfo], filter: DmlFilter, old: bool) -> ProcessableMessageSet {
   ProcessableMessageSet::new("Customers_abc123", columns, filter, old)
}

// ============================================================================
// Provisioning DDL
// ============================================================================

#[test]
fn test_message_types_cover_processable_set() {
   let columns = columns();
   let set = message_set(&columns, DmlFilter::default(), true);
   let statements = scripts::create_message_types(&set);

   assert_eq!(statements.len(), set.all_names().len());
   for (statement, name) in statements.iter().zip(set.all_names()) {
      assert!(statement.contains(&format!("[{name}]")));
      assert!(statement.contains("VALIDATION = NONE"));
   }
}

#[test]
fn test_contract_binds_every_message_type_as_initiator() {
   let columns = columns();
   let set = message_set(&columns, DmlFilter::default(), false);
   let contract = scripts::create_contract(&ctx(&columns, DmlFilter::default(), false), &set);

   assert!(contract.starts_with("CREATE CONTRACT [Customers_abc123]"));
   for name in set.all_names() {
      assert!(contract.contains(&format!("[{name}] SENT BY INITIATOR")));
   }
}

#[test]
fn test_queue_binds_activation_procedure() {
   let columns = columns();
   let queue = scripts::create_queue(&ctx(&columns, DmlFilter::default(), false));

   assert!(queue.contains("CREATE QUEUE [dbo].[Customers_abc123]"));
   assert!(queue.contains("PROCEDURE_NAME = [dbo].[Customers_abc123_QueueActivation]"));
   assert!(queue.contains("MAX_QUEUE_READERS = 1"));
   assert!(queue.contains("EXECUTE AS SELF"));
}

#[test]
fn test_queue_disables_poison_message_handling() {
   let columns = columns();
   let queue = scripts::create_queue(&ctx(&columns, DmlFilter::default(), false));
   // The activation procedure rolls data messages back; repeated rollbacks
   // must not disable the queue.
   assert!(queue.contains("POISON_MESSAGE_HANDLING (STATUS = OFF)"));
}

#[test]
fn test_queue_quotes_custom_activation_principal() {
   let columns = columns();
   let mut context = ctx(&columns, DmlFilter::default(), false);
   context.activation_principal = "broker_user";
   let queue = scripts::create_queue(&context);
   assert!(queue.contains("EXECUTE AS N'broker_user'"));
}

#[test]
fn test_service_authorization_is_optional() {
   let columns = columns();
   let plain = scripts::create_service(&ctx(&columns, DmlFilter::default(), false));
   assert!(!plain.contains("AUTHORIZATION"));

   let mut context = ctx(&columns, DmlFilter::default(), false);
   context.service_authorization = Some("broker_owner");
   let owned = scripts::create_service(&context);
   assert!(owned.contains("CREATE SERVICE [Customers_abc123] AUTHORIZATION [broker_owner]"));
}

// ============================================================================
// Trigger Body
// ============================================================================

#[test]
fn test_trigger_covers_enabled_kinds_only() {
   let columns = columns();
   let filter = DmlFilter::only([ChangeKind::Insert, ChangeKind::Delete]);
   let trigger = scripts::create_trigger(&ctx(&columns, filter, false));

   assert!(trigger.contains("AFTER INSERT, DELETE AS"));
   assert!(trigger.contains("IF @dml_kind NOT IN (N'Insert', N'Delete') RETURN;"));
   assert!(trigger.contains("[Customers_abc123/StartDialog/Insert]"));
   assert!(!trigger.contains("StartDialog/Update"));
}

#[test]
fn test_trigger_publishes_null_marker_per_column() {
   let columns = columns();
   let trigger = scripts::create_trigger(&ctx(&columns, DmlFilter::default(), false));

   for column in &columns {
      assert!(trigger.contains(&format!("MESSAGE TYPE [Customers_abc123/{}]", column.name)));
   }
   // Null values travel as the empty binary marker.
   assert!(trigger.contains("ISNULL(CONVERT(VARBINARY(MAX),"));
   assert!(trigger.contains(", 0x)"));
}

#[test]
fn test_trigger_update_pairs_images_on_primary_key() {
   let columns = columns();
   let trigger = scripts::create_trigger(&ctx(&columns, DmlFilter::default(), true));

   assert!(trigger.contains("FROM INSERTED ins JOIN DELETED del ON ins.[Id] = del.[Id]"));
   // Pairing comes from the key join alone; nothing positional.
   assert!(!trigger.contains("ROW_NUMBER"));
}

#[test]
fn test_trigger_update_joins_on_every_key_column() {
   let columns = columns();
   let keys = vec!["Id".to_string(), "Name".to_string()];
   let mut context = ctx(&columns, DmlFilter::default(), false);
   context.key_columns = &keys;
   let trigger = scripts::create_trigger(&context);

   assert!(trigger.contains("ON ins.[Id] = del.[Id] AND ins.[Name] = del.[Name]"));
}

#[test]
fn test_trigger_update_filters_unchanged_rows() {
   let columns = columns();
   let trigger = scripts::create_trigger(&ctx(&columns, DmlFilter::default(), false));
   assert!(trigger.contains(
      "WHERE EXISTS (SELECT ins.[Id], ins.[Name], ins.[UpdatedAt] \
       EXCEPT SELECT del.[Id], del.[Name], del.[UpdatedAt])"
   ));
}

#[test]
fn test_trigger_keyless_update_gates_on_set_difference() {
   let columns = columns();
   let mut context = ctx(&columns, DmlFilter::default(), false);
   context.key_columns = &[];
   let trigger = scripts::create_trigger(&context);

   // Without a key the images cannot be paired row-by-row, so the whole
   // statement is gated instead of each row.
   assert!(trigger.contains("ELSE IF EXISTS (SELECT ins.[Id], ins.[Name], ins.[UpdatedAt] \
      FROM INSERTED ins EXCEPT SELECT del.[Id], del.[Name], del.[UpdatedAt] FROM DELETED del)"));
   assert!(!trigger.contains("JOIN DELETED"));
}

#[test]
fn test_trigger_keyless_update_suppresses_old_images() {
   let columns = columns();
   let mut context = ctx(&columns, DmlFilter::default(), true);
   context.key_columns = &[];
   let trigger = scripts::create_trigger(&context);
   assert!(!trigger.contains("/old]"));
}

#[test]
fn test_trigger_update_of_narrows_change_detection() {
   let columns = columns();
   let update_of = vec!["Name".to_string()];
   let mut context = ctx(&columns, DmlFilter::default(), false);
   context.update_of = Some(&update_of);
   let trigger = scripts::create_trigger(&context);

   assert!(trigger.contains("WHERE EXISTS (SELECT ins.[Name] EXCEPT SELECT del.[Name])"));
}

#[test]
fn test_trigger_rowversion_column_skips_change_detection() {
   let mut cols = columns();
   cols.push(ColumnInfo {
      name: "Version".to_string(),
      type_name: "rowversion".to_string(),
      size: SizeSpec::None,
   });
   let trigger = scripts::create_trigger(&ctx(&cols, DmlFilter::default(), false));

   // A rowversion changes on every write, so the EXCEPT filter is dropped
   // and the column is captured via a binary(8) conversion.
   assert!(!trigger.contains("EXCEPT"));
   assert!(trigger.contains("CONVERT(BINARY(8), ins.[Version])"));
}

#[test]
fn test_trigger_old_values_sent_only_for_updates() {
   let columns = columns();
   let trigger = scripts::create_trigger(&ctx(&columns, DmlFilter::default(), true));

   assert!(trigger.contains("[Customers_abc123/Name/old]"));
   let old_send = trigger
      .find("[Customers_abc123/Id/old]")
      .expect("old-image send present");
   let guard = trigger[..old_send]
      .rfind("IF @dml_kind = N'Update'")
      .expect("old-image send is kind-guarded");
   assert!(old_send - guard < 120);
}

#[test]
fn test_trigger_is_deterministic() {
   let columns = columns();
   let context = ctx(&columns, DmlFilter::default(), true);
   assert_eq!(scripts::create_trigger(&context), scripts::create_trigger(&context));
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_drop_statements_are_guarded_and_reverse_ordered() {
   let columns = columns();
   let set = message_set(&columns, DmlFilter::default(), false);
   let drops = scripts::drop_statements(&ctx(&columns, DmlFilter::default(), false), &set, true);

   for statement in &drops {
      assert!(
         statement.starts_with("IF OBJECT_ID") || statement.starts_with("IF EXISTS"),
         "unguarded drop: {statement}"
      );
   }
   assert!(drops[0].contains("DROP TRIGGER"));
   assert!(drops[1].contains("DROP SERVICE"));
   assert!(drops[2].contains("DROP QUEUE"));
   assert!(drops[3].contains("DROP CONTRACT"));
   assert!(drops.last().unwrap().contains("DROP PROCEDURE"));
}

#[test]
fn test_activation_procedure_self_cleans() {
   let columns = columns();
   let set = message_set(&columns, DmlFilter::default(), false);
   let procedure =
      scripts::create_activation_procedure(&ctx(&columns, DmlFilter::default(), false), &set);

   assert!(procedure.contains("[Customers_abc123/Dispose]"));
   assert!(procedure.contains("http://schemas.microsoft.com/SQL/ServiceBroker/DialogTimer"));
   assert!(procedure.contains("END CONVERSATION @h WITH CLEANUP;"));
   // The procedure drops itself last.
   assert!(procedure.contains("DROP PROCEDURE [dbo].[Customers_abc123_QueueActivation]"));
}

#[test]
fn test_activation_procedure_returns_data_messages_to_the_queue() {
   let columns = columns();
   let set = message_set(&columns, DmlFilter::default(), false);
   let procedure =
      scripts::create_activation_procedure(&ctx(&columns, DmlFilter::default(), false), &set);

   // The procedure shares the queue with the listener, so every receive is
   // transactional and anything that is not a teardown message rolls back
   // onto the queue instead of being consumed.
   assert!(procedure.contains("BEGIN TRANSACTION;"));
   let else_branch = procedure.rfind("ELSE\n").expect("fallthrough branch present");
   assert!(procedure[else_branch..].contains("ROLLBACK;"));

   // Teardown branches commit their work.
   let dispose_branch = procedure.find("IF @mt = N'Customers_abc123/Dispose'").unwrap();
   let dispose_commit = procedure[dispose_branch..].find("COMMIT;").unwrap();
   let dispose_rollback = procedure[dispose_branch..].find("ROLLBACK;").unwrap();
   assert!(dispose_commit < dispose_rollback);
}

// ============================================================================
// Protocol Scripts
// ============================================================================

#[test]
fn test_begin_dialog_arms_watchdog() {
   let columns = columns();
   let script = scripts::begin_dialog(&ctx(&columns, DmlFilter::default(), false), 180);
   assert!(script.contains("BEGIN DIALOG CONVERSATION @h"));
   assert!(script.contains("BEGIN CONVERSATION TIMER (@h) TIMEOUT = 180;"));
   assert!(script.contains("SELECT @h AS [conversation_handle];"));
}

#[test]
fn test_receive_batch_refreshes_watchdog_and_converts_timeout() {
   let columns = columns();
   let dialog = uuid::Uuid::nil();
   let script =
      scripts::receive_batch(&ctx(&columns, DmlFilter::default(), false), dialog, 4, 120, 180);
   assert!(script.contains("TIMEOUT = 180;"));
   assert!(script.contains("RECEIVE TOP (4)"));
   assert!(script.contains("TIMEOUT 120000;"));
}

#[test]
fn test_send_dispose_targets_dispose_message_type() {
   let columns = columns();
   let set = message_set(&columns, DmlFilter::default(), false);
   let script = scripts::send_dispose(&set, uuid::Uuid::nil());
   assert!(script.contains("MESSAGE TYPE [Customers_abc123/Dispose]"));
   assert!(script.contains("END CONVERSATION @h;"));
}
