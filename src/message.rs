//! Message identities and classification.
//!
//! The trigger can only publish message types that were created at
//! provisioning time, and the listener recognizes exactly that set; both
//! sides derive their names from the same [`ProcessableMessageSet`], so the
//! two can never drift apart.

use std::collections::HashMap;

use uuid::Uuid;

use crate::change::{ChangeKind, DmlFilter};
use crate::schema::ColumnInfo;

/// System message type delivered when the far end reports a protocol error.
pub const ERROR_MESSAGE_TYPE: &str = "http://schemas.microsoft.com/SQL/ServiceBroker/Error";

/// System message type marking the end of a conversation.
pub const END_DIALOG_MESSAGE_TYPE: &str = "http://schemas.microsoft.com/SQL/ServiceBroker/EndDialog";

/// System message type fired by an expired conversation timer.
pub const DIALOG_TIMER_MESSAGE_TYPE: &str =
   "http://schemas.microsoft.com/SQL/ServiceBroker/DialogTimer";

/// The 128-bit handle of the standing conversation opened at provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialogHandle(pub Uuid);

impl std::fmt::Display for DialogHandle {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      self.0.fmt(f)
   }
}

/// One raw message pulled off the queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
   pub conversation: Uuid,
   pub type_name: String,
   pub body: Vec<u8>,
}

/// Classification of an incoming message against the processable set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass<'a> {
   /// `N/StartDialog/<kind>`: a new change group begins.
   Start(ChangeKind),
   /// `N/<column>`: a new-image column fragment.
   Column(&'a str),
   /// `N/<column>/old`: a before-image column fragment.
   OldColumn(&'a str),
   /// `N/Dispose`: teardown has been requested.
   Dispose,
   /// System end-of-dialog sentinel.
   EndDialog,
   /// System conversation-timer (watchdog) message.
   DialogTimer,
   /// System protocol-error message.
   BrokerError,
   /// Not a member of the processable set.
   Unknown,
}

/// The full set of message identifiers one subscription can publish and
/// must recognize. Computed once at provisioning time, read-only after.
#[derive(Debug, Clone)]
pub struct ProcessableMessageSet {
   naming: String,
   starters: HashMap<String, ChangeKind>,
   columns: HashMap<String, String>,
   old_columns: HashMap<String, String>,
   dispose: String,
}

impl ProcessableMessageSet {
   /// Derives the message set from the interesting-column list.
   pub fn new(
      naming: &str,
      columns: &[ColumnInfo],
      filter: DmlFilter,
      include_old_values: bool,
   ) -> Self {
      let starters = filter
         .kinds()
         .into_iter()
         .map(|kind| (format!("{naming}/StartDialog/{kind}"), kind))
         .collect();
      let column_names: HashMap<String, String> = columns
         .iter()
         .map(|c| (format!("{naming}/{}", c.name), c.name.clone()))
         .collect();
      let old_columns = if include_old_values {
         columns
            .iter()
            .map(|c| (format!("{naming}/{}/old", c.name), c.name.clone()))
            .collect()
      } else {
         HashMap::new()
      };
      Self {
         naming: naming.to_string(),
         starters,
         columns: column_names,
         old_columns,
         dispose: format!("{naming}/Dispose"),
      }
   }

   /// The naming convention the set is scoped to.
   pub fn naming(&self) -> &str {
      &self.naming
   }

   /// The dispose message type name.
   pub fn dispose_name(&self) -> &str {
      &self.dispose
   }

   /// Every custom message type to create, in deterministic order:
   /// start markers, dispose, per-column, then per-column before-image.
   pub fn all_names(&self) -> Vec<String> {
      let mut names: Vec<String> = Vec::new();
      for kind in ChangeKind::ALL {
         let name = format!("{}/StartDialog/{kind}", self.naming);
         if self.starters.contains_key(&name) {
            names.push(name);
         }
      }
      names.push(self.dispose.clone());
      let mut columns: Vec<&String> = self.columns.keys().collect();
      columns.sort();
      names.extend(columns.into_iter().cloned());
      let mut old: Vec<&String> = self.old_columns.keys().collect();
      old.sort();
      names.extend(old.into_iter().cloned());
      names
   }

   /// Total messages in one change group: the start marker, one per
   /// column, and (for tracked updates) one per before-image column.
   pub fn group_size(&self) -> usize {
      1 + self.columns.len() + self.old_columns.len()
   }

   /// Classifies an incoming message type name.
   pub fn classify<'a>(&'a self, type_name: &str) -> MessageClass<'a> {
      match type_name {
         ERROR_MESSAGE_TYPE => return MessageClass::BrokerError,
         END_DIALOG_MESSAGE_TYPE => return MessageClass::EndDialog,
         DIALOG_TIMER_MESSAGE_TYPE => return MessageClass::DialogTimer,
         _ => {}
      }
      if type_name == self.dispose {
         return MessageClass::Dispose;
      }
      if let Some(kind) = self.starters.get(type_name) {
         return MessageClass::Start(*kind);
      }
      if let Some(column) = self.old_columns.get(type_name) {
         return MessageClass::OldColumn(column);
      }
      if let Some(column) = self.columns.get(type_name) {
         return MessageClass::Column(column);
      }
      MessageClass::Unknown
   }
}
