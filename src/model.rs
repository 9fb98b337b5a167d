//! The subscriber's data-model seam.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

use crate::Result;

/// A type that can receive decoded row changes from a watched table.
///
/// The field list drives schema reconciliation: each field is resolved to
/// exactly one table column (explicit mapping first, then case-insensitive
/// name equality), and the resolved columns become the "interesting columns"
/// the trigger publishes.
///
/// # Example
///
/// ```
/// use serde::Deserialize;
/// use tiberius_table_observer::TableModel;
///
/// #[derive(Debug, Clone, Deserialize)]
/// struct Customer {
///    id: i64,
///    name: String,
/// }
///
/// impl TableModel for Customer {
///    fn table_name() -> String {
///       "Customers".to_string()
///    }
///
///    fn field_names() -> Vec<String> {
///       vec!["id".to_string(), "name".to_string()]
///    }
/// }
/// ```
pub trait TableModel: DeserializeOwned + Clone + Send + 'static {
   /// The default table name for this model. A table set on the
   /// subscription config takes precedence.
   fn table_name() -> String;

   /// The model's field names, used for column reconciliation and for
   /// rebuilding records from reassembled row images.
   fn field_names() -> Vec<String>;
}

/// Rekeys a column-keyed row image by model field name and decodes it.
///
/// `field_for_column` maps lowercase column names to model field names;
/// both are produced by schema reconciliation, so every image key is
/// expected to resolve.
pub(crate) fn decode_record<T: TableModel>(
   image: Map<String, JsonValue>,
   field_for_column: &HashMap<String, String>,
) -> Result<T> {
   let mut by_field = Map::with_capacity(image.len());
   for (column, value) in image {
      let Some(field) = field_for_column.get(&column.to_lowercase()) else {
         continue;
      };
      by_field.insert(field.clone(), value);
   }
   Ok(serde_json::from_value(JsonValue::Object(by_field))?)
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde::Deserialize;

   #[derive(Debug, Clone, PartialEq, Deserialize)]
   struct Person {
      id: i64,
      full_name: Option<String>,
   }

   impl TableModel for Person {
      fn table_name() -> String {
         "People".to_string()
      }

      fn field_names() -> Vec<String> {
         vec!["id".to_string(), "full_name".to_string()]
      }
   }

   #[test]
   fn decodes_record_through_field_mapping() {
      let mut image = Map::new();
      image.insert("Id".to_string(), JsonValue::from(7));
      image.insert("FullName".to_string(), JsonValue::from("Ada"));

      let mut mapping = HashMap::new();
      mapping.insert("id".to_string(), "id".to_string());
      mapping.insert("fullname".to_string(), "full_name".to_string());

      let person: Person = decode_record(image, &mapping).unwrap();
      assert_eq!(
         person,
         Person {
            id: 7,
            full_name: Some("Ada".to_string())
         }
      );
   }

   #[test]
   fn null_column_decodes_to_none() {
      let mut image = Map::new();
      image.insert("Id".to_string(), JsonValue::from(1));
      image.insert("FullName".to_string(), JsonValue::Null);

      let mut mapping = HashMap::new();
      mapping.insert("id".to_string(), "id".to_string());
      mapping.insert("fullname".to_string(), "full_name".to_string());

      let person: Person = decode_record(image, &mapping).unwrap();
      assert_eq!(person.full_name, None);
   }
}
