//! Change kinds, DML filtering, and the delivered change event.

use crate::error::{Error, Result};

/// The kind of row change a notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
   Insert,
   Update,
   Delete,
}

impl ChangeKind {
   /// All kinds, in the order the trigger enumerates them.
   pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];

   /// The marker used in message-type names and trigger branches.
   pub fn as_str(&self) -> &'static str {
      match self {
         ChangeKind::Insert => "Insert",
         ChangeKind::Update => "Update",
         ChangeKind::Delete => "Delete",
      }
   }
}

impl std::fmt::Display for ChangeKind {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.write_str(self.as_str())
   }
}

/// Mask selecting which DML kinds generate notifications.
///
/// An excluded kind is filtered out at the trigger, so excluded operations
/// cost nothing on the wire. The mask must enable at least one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmlFilter {
   pub insert: bool,
   pub update: bool,
   pub delete: bool,
}

impl Default for DmlFilter {
   fn default() -> Self {
      Self {
         insert: true,
         update: true,
         delete: true,
      }
   }
}

impl DmlFilter {
   /// A filter enabling every DML kind.
   pub fn all() -> Self {
      Self::default()
   }

   /// A filter enabling only the given kinds.
   pub fn only<I>(kinds: I) -> Self
   where
      I: IntoIterator<Item = ChangeKind>,
   {
      let mut filter = Self {
         insert: false,
         update: false,
         delete: false,
      };
      for kind in kinds {
         match kind {
            ChangeKind::Insert => filter.insert = true,
            ChangeKind::Update => filter.update = true,
            ChangeKind::Delete => filter.delete = true,
         }
      }
      filter
   }

   /// Checks whether a kind is enabled.
   pub fn contains(&self, kind: ChangeKind) -> bool {
      match kind {
         ChangeKind::Insert => self.insert,
         ChangeKind::Update => self.update,
         ChangeKind::Delete => self.delete,
      }
   }

   /// The enabled kinds, in trigger order.
   pub fn kinds(&self) -> Vec<ChangeKind> {
      ChangeKind::ALL
         .into_iter()
         .filter(|kind| self.contains(*kind))
         .collect()
   }

   /// Fails when the mask excludes every kind.
   pub(crate) fn validate(&self) -> Result<()> {
      if self.kinds().is_empty() {
         return Err(Error::EmptyDmlFilter);
      }
      Ok(())
   }
}

/// Notification of one row change, decoded into the subscriber's model type.
///
/// `old_entity` is populated only for updates, and only when before-image
/// tracking is enabled on the subscription. It is `None` otherwise, never a
/// zero-valued instance.
#[derive(Debug, Clone)]
pub struct ChangeEvent<T> {
   pub kind: ChangeKind,
   pub entity: T,
   pub old_entity: Option<T>,
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn default_filter_enables_all_kinds() {
      let filter = DmlFilter::default();
      assert_eq!(filter.kinds(), ChangeKind::ALL.to_vec());
   }

   #[test]
   fn only_restricts_kinds() {
      let filter = DmlFilter::only([ChangeKind::Delete]);
      assert!(!filter.contains(ChangeKind::Insert));
      assert!(!filter.contains(ChangeKind::Update));
      assert!(filter.contains(ChangeKind::Delete));
   }

   #[test]
   fn empty_filter_is_rejected() {
      let filter = DmlFilter::only([]);
      assert!(matches!(filter.validate(), Err(Error::EmptyDmlFilter)));
   }
}
