//! Per-change reassembly of column fragments (the "message bag").
//!
//! Messages belonging to one row change arrive contiguously: a start
//! marker, one fragment per interesting column, and (for tracked updates)
//! one before-image fragment per column. The bag accumulates fragments
//! until every expected slot is filled, then yields the reconstructed row
//! images exactly once. A fresh bag is opened for the next change, so no
//! state leaks between changes.

use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::change::ChangeKind;
use crate::schema::ColumnInfo;

#[derive(Debug, Clone, PartialEq)]
enum Slot {
   Missing,
   Filled(JsonValue),
}

/// Transient reassembly buffer for the one in-flight change.
#[derive(Debug)]
pub struct MessageBag {
   kind: ChangeKind,
   columns: Vec<String>,
   new_image: Vec<Slot>,
   old_image: Option<Vec<Slot>>,
   closed: bool,
}

impl MessageBag {
   /// Opens a bag for one change of the given kind.
   ///
   /// Before-image slots are expected only for updates with old-value
   /// tracking enabled; for every other kind the previous image is absent.
   pub fn new(kind: ChangeKind, columns: &[ColumnInfo], track_old_values: bool) -> Self {
      let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
      let slots = vec![Slot::Missing; names.len()];
      let old_image = (track_old_values && kind == ChangeKind::Update).then(|| slots.clone());
      Self {
         kind,
         columns: names,
         new_image: slots,
         old_image,
         closed: false,
      }
   }

   /// The change kind this bag was opened for.
   pub fn kind(&self) -> ChangeKind {
      self.kind
   }

   /// Whether every expected slot has been filled.
   pub fn is_closed(&self) -> bool {
      self.closed
   }

   /// Stores a decoded new-image fragment into its column slot.
   pub fn set_column(&mut self, column: &str, value: JsonValue) {
      self.set(column, value, false);
   }

   /// Stores a decoded before-image fragment into its column slot.
   pub fn set_old_column(&mut self, column: &str, value: JsonValue) {
      self.set(column, value, true);
   }

   fn set(&mut self, column: &str, value: JsonValue, old: bool) {
      if self.closed {
         warn!(column, "fragment received after bag closed; discarding");
         return;
      }
      let Some(index) = self
         .columns
         .iter()
         .position(|name| name.eq_ignore_ascii_case(column))
      else {
         warn!(column, "fragment for unknown column; discarding");
         return;
      };
      let image = if old {
         match self.old_image.as_mut() {
            Some(image) => image,
            None => {
               warn!(column, "before-image fragment without old-value tracking; discarding");
               return;
            }
         }
      } else {
         &mut self.new_image
      };
      image[index] = Slot::Filled(value);
      self.closed = self.complete();
   }

   fn complete(&self) -> bool {
      let new_done = self.new_image.iter().all(|s| matches!(s, Slot::Filled(_)));
      let old_done = self
         .old_image
         .as_ref()
         .is_none_or(|image| image.iter().all(|s| matches!(s, Slot::Filled(_))));
      new_done && old_done
   }

   /// Consumes the closed bag, yielding the column-keyed row images.
   ///
   /// The second image is present only when before-image slots were
   /// expected and filled.
   pub fn into_images(self) -> (Map<String, JsonValue>, Option<Map<String, JsonValue>>) {
      let to_map = |columns: &[String], image: Vec<Slot>| {
         let mut map = Map::with_capacity(columns.len());
         for (name, slot) in columns.iter().zip(image) {
            let value = match slot {
               Slot::Filled(value) => value,
               Slot::Missing => JsonValue::Null,
            };
            map.insert(name.clone(), value);
         }
         map
      };
      let old = self.old_image.map(|image| to_map(&self.columns, image));
      let new = to_map(&self.columns, self.new_image);
      (new, old)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::schema::SizeSpec;

   fn columns() -> Vec<ColumnInfo> {
      ["Id", "Name"]
         .into_iter()
         .map(|name| ColumnInfo {
            name: name.to_string(),
            type_name: "int".to_string(),
            size: SizeSpec::None,
         })
         .collect()
   }

   #[test]
   fn closes_when_all_columns_filled() {
      let mut bag = MessageBag::new(ChangeKind::Insert, &columns(), false);
      assert!(!bag.is_closed());
      bag.set_column("Id", JsonValue::from(1));
      assert!(!bag.is_closed());
      bag.set_column("Name", JsonValue::from("a"));
      assert!(bag.is_closed());

      let (new, old) = bag.into_images();
      assert_eq!(new["Id"], JsonValue::from(1));
      assert_eq!(new["Name"], JsonValue::from("a"));
      assert!(old.is_none());
   }

   #[test]
   fn update_with_tracking_waits_for_old_image() {
      let mut bag = MessageBag::new(ChangeKind::Update, &columns(), true);
      bag.set_column("Id", JsonValue::from(1));
      bag.set_column("Name", JsonValue::from("after"));
      assert!(!bag.is_closed());
      bag.set_old_column("Id", JsonValue::from(1));
      bag.set_old_column("Name", JsonValue::from("before"));
      assert!(bag.is_closed());

      let (new, old) = bag.into_images();
      assert_eq!(new["Name"], JsonValue::from("after"));
      assert_eq!(old.unwrap()["Name"], JsonValue::from("before"));
   }

   #[test]
   fn insert_never_expects_old_image() {
      let mut bag = MessageBag::new(ChangeKind::Insert, &columns(), true);
      bag.set_column("Id", JsonValue::from(1));
      bag.set_column("Name", JsonValue::Null);
      assert!(bag.is_closed());
      let (_, old) = bag.into_images();
      assert!(old.is_none());
   }

   #[test]
   fn ignores_fragments_after_close() {
      let mut bag = MessageBag::new(ChangeKind::Insert, &columns(), false);
      bag.set_column("Id", JsonValue::from(1));
      bag.set_column("Name", JsonValue::from("a"));
      assert!(bag.is_closed());
      bag.set_column("Name", JsonValue::from("late"));
      let (new, _) = bag.into_images();
      assert_eq!(new["Name"], JsonValue::from("a"));
   }

   #[test]
   fn column_lookup_is_case_insensitive() {
      let mut bag = MessageBag::new(ChangeKind::Delete, &columns(), false);
      bag.set_column("id", JsonValue::from(2));
      bag.set_column("NAME", JsonValue::from("x"));
      assert!(bag.is_closed());
   }
}
