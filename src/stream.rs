//! Async stream delivery of change events.
//!
//! The stream sits on the same broadcast channel the callbacks feed, so a
//! slow stream consumer never blocks the listener; it skips ahead instead
//! and the gap is surfaced through the subscription's error callbacks.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use crate::change::{ChangeEvent, DmlFilter};
use crate::model::TableModel;

pub(crate) type LaggedHook = Box<dyn Fn(u64) + Send + Sync>;

/// A stream of reassembled change events for one subscription.
///
/// Obtained from
/// [`TableDependency::subscribe_stream`](crate::TableDependency::subscribe_stream).
/// The stream ends when the subscription is dropped.
pub struct ChangeEventStream<T: TableModel> {
   inner: BroadcastStream<ChangeEvent<T>>,
   filter: DmlFilter,
   lagged: Option<LaggedHook>,
}

impl<T: TableModel> ChangeEventStream<T> {
   pub(crate) fn new(
      rx: broadcast::Receiver<ChangeEvent<T>>,
      lagged: Option<LaggedHook>,
   ) -> Self {
      Self {
         inner: BroadcastStream::new(rx),
         filter: DmlFilter::all(),
         lagged,
      }
   }

   /// Restricts the stream to the kinds the filter enables.
   ///
   /// This is a consumer-side view; the subscription's own
   /// [`DmlFilter`] still decides what reaches the queue at all.
   pub fn with_filter(mut self, filter: DmlFilter) -> Self {
      self.filter = filter;
      self
   }
}

impl<T: TableModel> Stream for ChangeEventStream<T> {
   type Item = ChangeEvent<T>;

   fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      let this = self.get_mut();
      loop {
         match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => {
               if !this.filter.contains(event.kind) {
                  continue;
               }
               return Poll::Ready(Some(event));
            }
            Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
               warn!(skipped, "change stream lagged; consider a larger channel_capacity");
               if let Some(hook) = &this.lagged {
                  hook(skipped);
               }
               continue;
            }
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => return Poll::Pending,
         }
      }
   }
}
