//! Naming-convention generation for provisioned database objects.
//!
//! Every object created for one subscription (message types, contract,
//! queue, service, trigger, activation procedure) is scoped by a single
//! unique prefix, so teardown can enumerate exactly what provisioning
//! created and two subscriptions never collide.

use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Shape accepted for caller-supplied (reattachment) naming conventions.
static NAMING_SHAPE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,99}$").expect("valid regex"));

/// Generates a fresh naming convention for a table subscription.
///
/// The table name is folded into the prefix for operator readability; the
/// uuid suffix provides uniqueness. Collision against existing objects is
/// still checked at provisioning time.
pub fn generate(table: &str) -> String {
   let mut prefix = sanitize(table);
   // Leave room for the uuid suffix within sysname's 128-char limit and
   // the shape accepted by `validate`.
   prefix.truncate(60);
   format!("{}_{}", prefix, Uuid::new_v4().simple())
}

/// Validates a caller-supplied naming convention for reattachment.
pub fn validate(naming: &str) -> Result<()> {
   if NAMING_SHAPE.is_match(naming) {
      Ok(())
   } else {
      Err(Error::InvalidNamingConvention(naming.to_string()))
   }
}

/// Replaces characters that cannot appear in an unquoted identifier.
fn sanitize(table: &str) -> String {
   let mut out: String = table
      .chars()
      .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
      .collect();
   if out.chars().next().is_none_or(|c| c.is_ascii_digit()) {
      out.insert(0, 't');
   }
   out
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn generated_names_are_unique_and_valid() {
      let a = generate("Customers");
      let b = generate("Customers");
      assert_ne!(a, b);
      assert!(a.starts_with("Customers_"));
      validate(&a).unwrap();
   }

   #[test]
   fn sanitizes_awkward_table_names() {
      let naming = generate("Order Details");
      assert!(naming.starts_with("Order_Details_"));
      validate(&naming).unwrap();

      let leading_digit = generate("1099Forms");
      assert!(leading_digit.starts_with("t1099Forms_"));
   }

   #[test]
   fn rejects_malformed_reattachment_names() {
      assert!(validate("Customers_0f8fad5bd9cb469fa16570867728950e7").is_ok());
      assert!(validate("bad name").is_err());
      assert!(validate("semi;colon").is_err());
      assert!(validate("").is_err());
   }
}
