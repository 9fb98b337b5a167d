//! Wire-payload decoding.
//!
//! The trigger converts every column value through `NVARCHAR(MAX)` before
//! casting to `VARBINARY(MAX)`, so a payload is always text in the
//! configured encoding. This module turns that text into a JSON value
//! matching the column's declared type, ready for serde decoding into the
//! subscriber's model.

use serde_json::Value as JsonValue;
use time::format_description::well_known::Iso8601;
use time::{Date, OffsetDateTime, PrimitiveDateTime};
use tracing::warn;

use crate::config::PayloadEncoding;
use crate::error::{Error, Result};
use crate::schema::ColumnInfo;

/// Decodes one column payload.
///
/// An empty payload is the `0x` null marker and decodes to `Null`. Note
/// that an empty string in a character column also converts to an empty
/// binary on the wire, so it is indistinguishable from NULL and decodes
/// to `Null` as well.
pub fn decode_payload(
   column: &ColumnInfo,
   body: &[u8],
   encoding: PayloadEncoding,
) -> Result<JsonValue> {
   if body.is_empty() {
      return Ok(JsonValue::Null);
   }
   let text = decode_text(column, body, encoding)?;

   let value = match column.type_name.as_str() {
      "int" | "bigint" | "smallint" | "tinyint" => {
         let parsed: i64 = text.trim().parse().map_err(|_| decode_error(column, &text))?;
         JsonValue::from(parsed)
      }
      "bit" => match text.trim() {
         "0" => JsonValue::Bool(false),
         "1" => JsonValue::Bool(true),
         _ => return Err(decode_error(column, &text)),
      },
      "decimal" | "numeric" | "money" | "smallmoney" | "float" | "real" => {
         let parsed: f64 = text.trim().parse().map_err(|_| decode_error(column, &text))?;
         JsonValue::from(parsed)
      }
      "date" => {
         if Date::parse(text.trim(), &Iso8601::DEFAULT).is_err() {
            warn!(column = %column.name, value = %text, "date payload is not ISO 8601");
         }
         JsonValue::String(text)
      }
      "datetime" | "datetime2" | "smalldatetime" => {
         if PrimitiveDateTime::parse(text.trim(), &Iso8601::DEFAULT).is_err() {
            warn!(column = %column.name, value = %text, "datetime payload is not ISO 8601");
         }
         JsonValue::String(text)
      }
      "datetimeoffset" => {
         if OffsetDateTime::parse(text.trim(), &Iso8601::DEFAULT).is_err() {
            warn!(column = %column.name, value = %text, "datetimeoffset payload is not ISO 8601");
         }
         JsonValue::String(text)
      }
      "binary" | "varbinary" | "rowversion" | "timestamp" => {
         JsonValue::String(text.trim().to_lowercase())
      }
      "uniqueidentifier" => JsonValue::String(text.trim().to_lowercase()),
      _ => JsonValue::String(text),
   };
   Ok(value)
}

fn decode_text(column: &ColumnInfo, body: &[u8], encoding: PayloadEncoding) -> Result<String> {
   match encoding {
      PayloadEncoding::Utf16Le => {
         if body.len() % 2 != 0 {
            return Err(Error::PayloadDecode {
               column: column.name.clone(),
               reason: format!("odd utf-16 payload length {}", body.len()),
            });
         }
         let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
         String::from_utf16(&units).map_err(|_| Error::PayloadDecode {
            column: column.name.clone(),
            reason: "invalid utf-16 payload".to_string(),
         })
      }
      PayloadEncoding::Utf8 => String::from_utf8(body.to_vec()).map_err(|_| Error::PayloadDecode {
         column: column.name.clone(),
         reason: "invalid utf-8 payload".to_string(),
      }),
   }
}

fn decode_error(column: &ColumnInfo, text: &str) -> Error {
   Error::PayloadDecode {
      column: column.name.clone(),
      reason: format!("cannot parse {:?} as {}", text, column.type_name),
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::schema::SizeSpec;

   fn col(type_name: &str) -> ColumnInfo {
      ColumnInfo {
         name: "c".to_string(),
         type_name: type_name.to_string(),
         size: SizeSpec::None,
      }
   }

   fn utf16(text: &str) -> Vec<u8> {
      text.encode_utf16().flat_map(u16::to_le_bytes).collect()
   }

   #[test]
   fn empty_payload_is_null() {
      assert_eq!(
         decode_payload(&col("nvarchar"), &[], PayloadEncoding::Utf16Le).unwrap(),
         JsonValue::Null
      );
   }

   #[test]
   fn decodes_text_round_trip() {
      let body = utf16("Spiacente");
      assert_eq!(
         decode_payload(&col("nvarchar"), &body, PayloadEncoding::Utf16Le).unwrap(),
         JsonValue::from("Spiacente")
      );
   }

   #[test]
   fn decodes_long_text_at_chunk_boundary() {
      let long = "*".repeat(4000);
      let body = utf16(&long);
      let value = decode_payload(&col("nvarchar"), &body, PayloadEncoding::Utf16Le).unwrap();
      assert_eq!(value, JsonValue::from(long));
   }

   #[test]
   fn decodes_numbers_and_bools() {
      assert_eq!(
         decode_payload(&col("int"), &utf16("42"), PayloadEncoding::Utf16Le).unwrap(),
         JsonValue::from(42)
      );
      assert_eq!(
         decode_payload(&col("bit"), &utf16("1"), PayloadEncoding::Utf16Le).unwrap(),
         JsonValue::Bool(true)
      );
      assert_eq!(
         decode_payload(&col("float"), &utf16("1.5E+000"), PayloadEncoding::Utf16Le).unwrap(),
         JsonValue::from(1.5)
      );
   }

   #[test]
   fn rejects_malformed_numbers() {
      assert!(decode_payload(&col("int"), &utf16("x"), PayloadEncoding::Utf16Le).is_err());
      assert!(decode_payload(&col("bit"), &utf16("2"), PayloadEncoding::Utf16Le).is_err());
   }

   #[test]
   fn binary_normalizes_to_lowercase_hex() {
      assert_eq!(
         decode_payload(&col("varbinary"), &utf16("00FFA0"), PayloadEncoding::Utf16Le).unwrap(),
         JsonValue::from("00ffa0")
      );
   }

   #[test]
   fn datetime_passes_through_as_string() {
      let body = utf16("2024-06-01T12:30:45.1234567");
      assert_eq!(
         decode_payload(&col("datetime2"), &body, PayloadEncoding::Utf16Le).unwrap(),
         JsonValue::from("2024-06-01T12:30:45.1234567")
      );
   }

   #[test]
   fn rejects_odd_length_utf16() {
      assert!(decode_payload(&col("nvarchar"), &[0x41], PayloadEncoding::Utf16Le).is_err());
   }

   #[test]
   fn utf8_encoding_option() {
      assert_eq!(
         decode_payload(&col("nvarchar"), b"hi", PayloadEncoding::Utf8).unwrap(),
         JsonValue::from("hi")
      );
   }
}
