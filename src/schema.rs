//! Table introspection and model-to-column reconciliation.
//!
//! Column metadata is read once per subscription and drives everything
//! downstream: the trigger body, the message-type set, and the decode
//! table all derive from the same `ColumnInfo` list, which is what keeps
//! the published and recognized message sets consistent.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::backend::SqlClient;
use crate::error::{Error, Result};

/// Declared types that cannot be converted to a portable textual payload.
/// Large-object, spatial, hierarchical, and variant types.
const UNSUPPORTED_TYPES: [&str; 8] = [
   "text",
   "ntext",
   "image",
   "xml",
   "geography",
   "geometry",
   "hierarchyid",
   "sql_variant",
];

/// Size or precision descriptor for a column's declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSpec {
   /// Type takes no size argument (`int`, `bit`, `uniqueidentifier`, ...).
   None,
   /// Character or binary length in units of the type.
   Length(i32),
   /// `(max)` character or binary length.
   Max,
   /// Decimal precision and scale.
   Decimal(u8, u8),
   /// Fractional-second scale for `time`/`datetime2`/`datetimeoffset`.
   Scale(u8),
}

/// Metadata for one interesting column. Immutable once computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
   /// Column name as declared in the table.
   pub name: String,
   /// Lowercase declared type name (`nvarchar`, `datetime2`, ...).
   pub type_name: String,
   /// Size/precision descriptor.
   pub size: SizeSpec,
}

impl ColumnInfo {
   /// The type expression used to declare trigger variables for this column.
   ///
   /// `rowversion`/`timestamp` columns are declared as `binary(8)` because
   /// the rowversion type cannot be re-declared in a table variable.
   pub fn sql_declaration(&self) -> String {
      if matches!(self.type_name.as_str(), "rowversion" | "timestamp") {
         return "binary(8)".to_string();
      }
      match self.size {
         SizeSpec::None => self.type_name.clone(),
         SizeSpec::Length(n) => format!("{}({})", self.type_name, n),
         SizeSpec::Max => format!("{}(max)", self.type_name),
         SizeSpec::Decimal(p, s) => format!("{}({}, {})", self.type_name, p, s),
         SizeSpec::Scale(s) => format!("{}({})", self.type_name, s),
      }
   }

   /// Whether this column's value changes on every write, making update
   /// set-difference filtering unnecessary.
   pub fn is_row_version(&self) -> bool {
      matches!(self.type_name.as_str(), "rowversion" | "timestamp")
   }

   fn ensure_supported(&self) -> Result<()> {
      if UNSUPPORTED_TYPES.contains(&self.type_name.as_str()) {
         return Err(Error::ColumnTypeNotSupported {
            column: self.name.clone(),
            type_name: self.type_name.clone(),
         });
      }
      Ok(())
   }
}

/// Output of reconciliation: the interesting columns plus the lookup tables
/// the listener needs to rebuild model records.
#[derive(Debug, Clone)]
pub struct TableMapping {
   /// Interesting columns, in table ordinal order, de-duplicated.
   pub columns: Vec<ColumnInfo>,
   /// Lowercase column name to model field name.
   pub field_for_column: HashMap<String, String>,
   /// Update allow-list resolved to declared column names.
   pub update_of: Option<Vec<String>>,
}

static TABLE_NAME: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"^(?:(?:\[(?P<qs>[^\]]+)\]|(?P<s>[^.\[\]]+))\.)?(?:\[(?P<qt>[^\]]+)\]|(?P<t>[^.\[\]]+))$")
      .expect("valid regex")
});

/// Splits an optionally schema-qualified, optionally bracket-quoted table
/// name into `(schema, table)`.
pub fn parse_table_name(raw: &str) -> Result<(Option<String>, String)> {
   let captures = TABLE_NAME
      .captures(raw.trim())
      .ok_or_else(|| Error::MissingTable(raw.to_string()))?;
   let schema = captures
      .name("qs")
      .or_else(|| captures.name("s"))
      .map(|m| m.as_str().to_string());
   let table = captures
      .name("qt")
      .or_else(|| captures.name("t"))
      .map(|m| m.as_str().to_string())
      .ok_or_else(|| Error::MissingTable(raw.to_string()))?;
   Ok((schema, table))
}

/// Reads column metadata for a table, in ordinal order.
pub(crate) async fn introspect(
   client: &mut SqlClient,
   schema: &str,
   table: &str,
) -> Result<Vec<ColumnInfo>> {
   const SQL: &str = "SELECT COLUMN_NAME, DATA_TYPE, CHARACTER_MAXIMUM_LENGTH, \
      NUMERIC_PRECISION, NUMERIC_SCALE, DATETIME_PRECISION \
      FROM INFORMATION_SCHEMA.COLUMNS \
      WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2 \
      ORDER BY ORDINAL_POSITION";

   let rows = client
      .query(SQL, &[&schema, &table])
      .await?
      .into_first_result()
      .await?;

   let mut columns = Vec::with_capacity(rows.len());
   for row in rows {
      let name: &str = row.try_get(0)?.unwrap_or_default();
      let type_name: &str = row.try_get(1)?.unwrap_or_default();
      let char_len: Option<i32> = row.try_get(2)?;
      let precision: Option<u8> = row.try_get(3)?;
      let scale: Option<i32> = row.try_get(4)?;
      let datetime_precision: Option<i16> = row.try_get(5)?;

      let type_name = type_name.to_lowercase();
      let size = match type_name.as_str() {
         "char" | "varchar" | "nchar" | "nvarchar" | "binary" | "varbinary" => match char_len {
            Some(-1) => SizeSpec::Max,
            Some(n) => SizeSpec::Length(n),
            None => SizeSpec::None,
         },
         "decimal" | "numeric" => {
            SizeSpec::Decimal(precision.unwrap_or(18), scale.unwrap_or(0) as u8)
         }
         "time" | "datetime2" | "datetimeoffset" => {
            SizeSpec::Scale(datetime_precision.unwrap_or(7) as u8)
         }
         _ => SizeSpec::None,
      };

      columns.push(ColumnInfo {
         name: name.to_string(),
         type_name,
         size,
      });
   }

   if columns.is_empty() {
      return Err(Error::NoColumns(format!("{schema}.{table}")));
   }
   Ok(columns)
}

/// Reads the table's primary-key column names, in key ordinal order.
///
/// Empty for heap tables without a primary key; update images can then
/// only be gated at statement level and before-image tracking is
/// unavailable.
pub(crate) async fn introspect_keys(
   client: &mut SqlClient,
   schema: &str,
   table: &str,
) -> Result<Vec<String>> {
   const SQL: &str = "SELECT kcu.COLUMN_NAME \
      FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
      JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
         ON kcu.CONSTRAINT_NAME = tc.CONSTRAINT_NAME \
         AND kcu.CONSTRAINT_SCHEMA = tc.CONSTRAINT_SCHEMA \
      WHERE tc.TABLE_SCHEMA = @P1 AND tc.TABLE_NAME = @P2 \
         AND tc.CONSTRAINT_TYPE = 'PRIMARY KEY' \
      ORDER BY kcu.ORDINAL_POSITION";

   let rows = client
      .query(SQL, &[&schema, &table])
      .await?
      .into_first_result()
      .await?;

   let mut keys = Vec::with_capacity(rows.len());
   for row in rows {
      let name: &str = row.try_get(0)?.unwrap_or_default();
      keys.push(name.to_string());
   }
   Ok(keys)
}

/// Reconciles the model's field list against the table's columns.
///
/// Explicit mapping entries win over case-insensitive name equality. Model
/// fields that resolve to no column are skipped with a warning; if none
/// resolve, reconciliation fails. Resolved columns are validated against
/// the unsupported-type list, and the update allow-list (when present) is
/// resolved against the table's columns.
pub fn reconcile(
   model_fields: &[String],
   mapping: &HashMap<String, String>,
   update_of: Option<&[String]>,
   table_columns: &[ColumnInfo],
) -> Result<TableMapping> {
   if table_columns.is_empty() {
      return Err(Error::NoColumns("(unknown)".to_string()));
   }

   let by_lower: HashMap<String, &ColumnInfo> = table_columns
      .iter()
      .map(|c| (c.name.to_lowercase(), c))
      .collect();

   // Validate the explicit mapping before resolving anything through it.
   let field_set: HashSet<String> = model_fields.iter().map(|f| f.to_lowercase()).collect();
   let mut mapped_columns: HashSet<String> = HashSet::new();
   for (field, column) in mapping {
      if !field_set.contains(&field.to_lowercase()) {
         return Err(Error::ModelToTableMapper(format!(
            "mapping references unknown model field [{field}]"
         )));
      }
      if !by_lower.contains_key(&column.to_lowercase()) {
         return Err(Error::ModelToTableMapper(format!(
            "mapping for field [{field}] references non-existent column [{column}]"
         )));
      }
      if !mapped_columns.insert(column.to_lowercase()) {
         return Err(Error::ModelToTableMapper(format!(
            "mapping is ambiguous: column [{column}] is mapped by more than one field"
         )));
      }
   }

   let mapping_lower: HashMap<String, String> = mapping
      .iter()
      .map(|(f, c)| (f.to_lowercase(), c.clone()))
      .collect();

   let mut field_for_column: HashMap<String, String> = HashMap::new();
   for field in model_fields {
      let column = match mapping_lower.get(&field.to_lowercase()) {
         Some(column) => column.clone(),
         None => field.clone(),
      };
      match by_lower.get(&column.to_lowercase()) {
         Some(info) => {
            if let Some(previous) =
               field_for_column.insert(info.name.to_lowercase(), field.clone())
            {
               return Err(Error::ModelToTableMapper(format!(
                  "mapping is redundant: fields [{previous}] and [{field}] both resolve to column [{}]",
                  info.name
               )));
            }
         }
         None => {
            warn!(field = %field, "model field matches no table column; skipping");
         }
      }
   }

   if field_for_column.is_empty() {
      return Err(Error::ModelToTableMapper(
         "no model field resolves to a table column".to_string(),
      ));
   }

   // Interesting columns in table ordinal order.
   let columns: Vec<ColumnInfo> = table_columns
      .iter()
      .filter(|c| field_for_column.contains_key(&c.name.to_lowercase()))
      .cloned()
      .collect();
   for column in &columns {
      column.ensure_supported()?;
   }

   let update_of = match update_of {
      None => None,
      Some([]) => {
         return Err(Error::UpdateOf(
            "the update-of allow-list is empty".to_string(),
         ));
      }
      Some(names) => {
         let mut resolved = Vec::with_capacity(names.len());
         let mut seen = HashSet::new();
         for name in names {
            let Some(info) = by_lower.get(&name.to_lowercase()) else {
               return Err(Error::UpdateOf(format!(
                  "update-of references missing column [{name}]"
               )));
            };
            if seen.insert(info.name.clone()) {
               resolved.push(info.name.clone());
            }
         }
         Some(resolved)
      }
   };

   Ok(TableMapping {
      columns,
      field_for_column,
      update_of,
   })
}
