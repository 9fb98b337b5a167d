//! Idempotent removal of provisioned objects.

use tracing::debug;

use crate::backend::{SqlServerBackend, connect};
use crate::error::Result;
use crate::scripts;

/// Tears down every object provisioned for the subscription.
///
/// The dispose message is sent first when the standing conversation is
/// known, waking the activation procedure so it can clean up server-side
/// as well. Every drop statement is guarded, so running teardown against
/// partially removed or already absent objects succeeds quietly.
pub(crate) async fn dispose(
   backend: &SqlServerBackend,
   dialog: Option<crate::message::DialogHandle>,
) -> Result<()> {
   let mut client = connect(&backend.sql).await?;
   let ctx = backend.script_context();

   if let Some(handle) = dialog {
      let script = scripts::send_dispose(&backend.messages, handle.0);
      match client.simple_query(&script).await {
         Ok(stream) => {
            stream.into_results().await?;
         }
         Err(error) => {
            // The conversation may already be gone; drops below still run.
            debug!(dialog = %handle, error = %error, "dispose send failed");
         }
      }
   }

   for statement in scripts::drop_statements(&ctx, &backend.messages, true) {
      client.simple_query(&statement).await?.into_results().await?;
   }
   debug!(naming = %backend.naming, "subscription objects dropped");
   Ok(())
}
