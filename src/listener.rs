//! The queue listener task.
//!
//! One listener runs per started subscription. Each iteration refreshes
//! the watchdog timer, blocks on the queue for up to the receive timeout,
//! and feeds whatever arrived through the reassembly bag. A bag survives
//! across iterations, so a change group split over two receive calls is
//! still delivered whole. The loop exits on cancellation, on a dispose
//! message, or on a genuine fault.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backend::QueueBackend;
use crate::bag::MessageBag;
use crate::change::ChangeEvent;
use crate::config::PayloadEncoding;
use crate::decode::decode_payload;
use crate::error::{Error, Result};
use crate::message::{DialogHandle, MessageClass, QueueMessage};
use crate::model::{TableModel, decode_record};
use crate::schema::ColumnInfo;
use crate::status::{StatusTracker, SubscriptionStatus};

type ChangeCallback<T> = Box<dyn Fn(&ChangeEvent<T>) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&Error) + Send + Sync>;

/// Registered observers for one subscription.
///
/// Change events go to every closure callback and to the broadcast
/// channel backing [`ChangeEventStream`](crate::stream::ChangeEventStream).
/// A panicking callback is logged and absorbed.
pub(crate) struct CallbackRegistry<T: TableModel> {
   changed: Mutex<Vec<ChangeCallback<T>>>,
   errors: Mutex<Vec<ErrorCallback>>,
   sender: broadcast::Sender<ChangeEvent<T>>,
}

impl<T: TableModel> CallbackRegistry<T> {
   pub fn new(channel_capacity: usize) -> Self {
      let (sender, _) = broadcast::channel(channel_capacity);
      Self {
         changed: Mutex::new(Vec::new()),
         errors: Mutex::new(Vec::new()),
         sender,
      }
   }

   pub fn on_changed(&self, callback: ChangeCallback<T>) {
      self.changed.lock().push(callback);
   }

   pub fn on_error(&self, callback: ErrorCallback) {
      self.errors.lock().push(callback);
   }

   pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent<T>> {
      self.sender.subscribe()
   }

   /// Whether anything would observe a change event.
   pub fn has_subscribers(&self) -> bool {
      !self.changed.lock().is_empty() || self.sender.receiver_count() > 0
   }

   pub fn dispatch_change(&self, event: ChangeEvent<T>) {
      let callbacks = self.changed.lock();
      for callback in callbacks.iter() {
         if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
            error!("change callback panicked");
         }
      }
      drop(callbacks);
      // Nobody listening on the stream side is fine.
      let _ = self.sender.send(event);
   }

   pub fn dispatch_error(&self, error: &Error) {
      let callbacks = self.errors.lock();
      for callback in callbacks.iter() {
         if catch_unwind(AssertUnwindSafe(|| callback(error))).is_err() {
            error!("error callback panicked");
         }
      }
   }
}

/// Why the listener loop stopped.
enum Exit {
   Cancelled,
   Failed(Error),
}

pub(crate) struct Listener<T: TableModel> {
   pub backend: Arc<dyn QueueBackend>,
   pub dialog: DialogHandle,
   pub field_for_column: HashMap<String, String>,
   pub encoding: PayloadEncoding,
   pub include_old_values: bool,
   pub receive_timeout_secs: u32,
   pub watchdog_secs: u32,
   pub callbacks: Arc<CallbackRegistry<T>>,
   pub status: Arc<StatusTracker>,
   pub cancel: CancellationToken,
}

impl<T: TableModel> Listener<T> {
   /// Runs the receive loop to completion, setting the terminal status on
   /// the way out.
   pub async fn run(self) {
      self.status.set(SubscriptionStatus::Started);
      let exit = self.receive_loop().await;
      match exit {
         Exit::Cancelled => {
            debug!(naming = self.backend.naming_convention(), "listener cancelled");
            self.status.set(SubscriptionStatus::StoppedDueToCancellation);
         }
         Exit::Failed(error) => {
            error!(naming = self.backend.naming_convention(), error = %error, "listener stopped on error");
            // The standing dialog is dead weight after a fault; close it
            // rather than waiting for the watchdog to reap it.
            self.end_conversation(self.dialog.0);
            self.callbacks.dispatch_error(&error);
            self.status.set(SubscriptionStatus::StoppedDueToError);
         }
      }
   }

   async fn receive_loop(&self) -> Exit {
      let mut bag: Option<MessageBag> = None;

      loop {
         self.status.set(SubscriptionStatus::WaitingForNotification);
         let batch = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Exit::Cancelled,
            batch = self.backend.receive_batch(
               self.dialog,
               self.receive_timeout_secs,
               self.watchdog_secs,
            ) => batch,
         };
         let batch = match batch {
            Ok(batch) => batch,
            // A receive torn down underneath a concurrent stop is a
            // cancellation, not a fault.
            Err(_) if self.cancel.is_cancelled() => return Exit::Cancelled,
            Err(error) => return Exit::Failed(error),
         };

         match self.process_batch(batch, &mut bag) {
            Ok(ControlFlow::Continue) => {}
            Ok(ControlFlow::Disposed) => return Exit::Cancelled,
            Err(error) => return Exit::Failed(error),
         }
      }
   }

   fn process_batch(
      &self,
      batch: Vec<QueueMessage>,
      bag: &mut Option<MessageBag>,
   ) -> Result<ControlFlow> {
      let messages = self.backend.message_set();
      let mut delivered = false;

      for message in batch {
         if delivered {
            // One change per batch by sizing; anything extra waits on the
            // queue, so a leftover here was read and must not be dropped
            // silently.
            warn!(type_name = %message.type_name, "unprocessed message after delivery; discarding");
            continue;
         }
         match messages.classify(&message.type_name) {
            MessageClass::Start(kind) => {
               if let Some(open) = bag.take() {
                  warn!(kind = %open.kind(), "start marker arrived before prior change completed; discarding partial change");
               }
               *bag = Some(MessageBag::new(
                  kind,
                  self.backend.columns(),
                  self.include_old_values,
               ));
            }
            MessageClass::Column(column) => {
               self.fill_slot(bag, column, &message.body, false)?;
            }
            MessageClass::OldColumn(column) => {
               self.fill_slot(bag, column, &message.body, true)?;
            }
            MessageClass::Dispose => {
               debug!("dispose message received; stopping listener");
               return Ok(ControlFlow::Disposed);
            }
            MessageClass::EndDialog => {
               self.end_conversation(message.conversation);
            }
            MessageClass::DialogTimer => {
               // The next receive iteration re-arms the timer.
               debug!(conversation = %message.conversation, "watchdog timer message discarded");
            }
            MessageClass::BrokerError => {
               let text = broker_error_text(&message.body);
               return Err(Error::ServiceBrokerErrorMessage(text));
            }
            MessageClass::Unknown => {
               warn!(type_name = %message.type_name, "unrecognized message type; discarding");
            }
         }

         if let Some(closed) = bag.take_if(|open| open.is_closed()) {
            match self.deliver(closed) {
               Ok(()) => delivered = true,
               // A change that cannot decode is reported and skipped;
               // later changes are unaffected.
               Err(error) => {
                  warn!(error = %error, "dropping undecodable change");
                  self.callbacks.dispatch_error(&error);
               }
            }
         }
      }
      Ok(ControlFlow::Continue)
   }

   fn fill_slot(
      &self,
      bag: &mut Option<MessageBag>,
      column: &str,
      body: &[u8],
      old: bool,
   ) -> Result<()> {
      let Some(open) = bag.as_mut() else {
         warn!(column, "column fragment without an open change; discarding");
         return Ok(());
      };
      let Some(info) = find_column(self.backend.columns(), column) else {
         warn!(column, "fragment for unknown column; discarding");
         return Ok(());
      };
      match decode_payload(info, body, self.encoding) {
         Ok(value) => {
            if old {
               open.set_old_column(column, value);
            } else {
               open.set_column(column, value);
            }
            Ok(())
         }
         Err(error) => {
            // Poisoned change: drop the whole bag, report, keep listening.
            warn!(column, error = %error, "payload decode failed; discarding change");
            self.callbacks.dispatch_error(&error);
            *bag = None;
            Ok(())
         }
      }
   }

   fn deliver(&self, bag: MessageBag) -> Result<()> {
      let kind = bag.kind();
      let (new, old) = bag.into_images();
      let entity: T = decode_record(new, &self.field_for_column)?;
      let old_entity: Option<T> = old
         .map(|image: JsonMap<String, JsonValue>| decode_record(image, &self.field_for_column))
         .transpose()?;

      self.status.set(SubscriptionStatus::MessageReadyToBeNotified);
      self.callbacks.dispatch_change(ChangeEvent {
         kind,
         entity,
         old_entity,
      });
      self.status.set(SubscriptionStatus::MessageSent);
      Ok(())
   }

   fn end_conversation(&self, conversation: uuid::Uuid) {
      let backend = Arc::clone(&self.backend);
      tokio::spawn(async move {
         if let Err(error) = backend.end_conversation(conversation).await {
            debug!(%conversation, error = %error, "end conversation failed");
         }
      });
   }
}

enum ControlFlow {
   Continue,
   Disposed,
}

fn find_column<'a>(columns: &'a [ColumnInfo], name: &str) -> Option<&'a ColumnInfo> {
   columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}

/// Best-effort text of a broker error payload (UTF-8 or UTF-16LE XML).
fn broker_error_text(body: &[u8]) -> String {
   if body.is_empty() {
      return "service broker error with empty payload".to_string();
   }
   if body.len() % 2 == 0 {
      let units: Vec<u16> = body
         .chunks_exact(2)
         .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
         .collect();
      if let Ok(text) = String::from_utf16(&units) {
         if !text.contains('\u{0}') {
            return text;
         }
      }
   }
   String::from_utf8_lossy(body).into_owned()
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::message::ProcessableMessageSet;
   use serde::Deserialize;

   #[derive(Debug, Clone, Deserialize, PartialEq)]
   struct Person {
      id: i64,
      name: Option<String>,
   }

   impl TableModel for Person {
      fn table_name() -> String {
         "People".to_string()
      }

      fn field_names() -> Vec<String> {
         vec!["id".to_string(), "name".to_string()]
      }
   }

   #[test]
   fn registry_dispatches_to_all_callbacks() {
      use std::sync::atomic::{AtomicUsize, Ordering};

      let registry: CallbackRegistry<Person> = CallbackRegistry::new(8);
      let seen = Arc::new(AtomicUsize::new(0));
      for _ in 0..2 {
         let seen = Arc::clone(&seen);
         registry.on_changed(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
         }));
      }
      registry.dispatch_change(ChangeEvent {
         kind: crate::change::ChangeKind::Insert,
         entity: Person {
            id: 1,
            name: None,
         },
         old_entity: None,
      });
      assert_eq!(seen.load(Ordering::SeqCst), 2);
   }

   #[test]
   fn registry_absorbs_panicking_callback() {
      let registry: CallbackRegistry<Person> = CallbackRegistry::new(8);
      registry.on_changed(Box::new(|_| panic!("bad subscriber")));
      registry.dispatch_change(ChangeEvent {
         kind: crate::change::ChangeKind::Delete,
         entity: Person {
            id: 2,
            name: Some("x".to_string()),
         },
         old_entity: None,
      });
   }

   #[test]
   fn subscriber_presence() {
      let registry: CallbackRegistry<Person> = CallbackRegistry::new(8);
      assert!(!registry.has_subscribers());
      registry.on_changed(Box::new(|_| {}));
      assert!(registry.has_subscribers());

      let registry: CallbackRegistry<Person> = CallbackRegistry::new(8);
      let _receiver = registry.subscribe();
      assert!(registry.has_subscribers());
   }

   #[test]
   fn broker_error_text_decodes_utf16() {
      let body: Vec<u8> = "broken".encode_utf16().flat_map(u16::to_le_bytes).collect();
      assert_eq!(broker_error_text(&body), "broken");
      assert_eq!(broker_error_text(b"plain"), "plain");
   }

   use std::collections::VecDeque;
   use std::sync::atomic::{AtomicUsize, Ordering};

   use crate::change::{ChangeKind, DmlFilter};
   use crate::schema::SizeSpec;

   /// Backend fed from a scripted list of batches. Once the script runs
   /// dry it serves a dispose message so the listener exits cleanly.
   struct ScriptedBackend {
      messages: ProcessableMessageSet,
      columns: Vec<ColumnInfo>,
      batches: parking_lot::Mutex<VecDeque<Vec<QueueMessage>>>,
      ended: AtomicUsize,
   }

   impl ScriptedBackend {
      fn new(batches: Vec<Vec<QueueMessage>>, include_old_values: bool) -> Self {
         let columns = vec![
            ColumnInfo {
               name: "Id".to_string(),
               type_name: "int".to_string(),
               size: SizeSpec::None,
            },
            ColumnInfo {
               name: "Name".to_string(),
               type_name: "nvarchar".to_string(),
               size: SizeSpec::Max,
            },
         ];
         Self {
            messages: ProcessableMessageSet::new(
               "N",
               &columns,
               DmlFilter::default(),
               include_old_values,
            ),
            columns,
            batches: parking_lot::Mutex::new(batches.into()),
            ended: AtomicUsize::new(0),
         }
      }
   }

   #[async_trait::async_trait]
   impl QueueBackend for ScriptedBackend {
      fn naming_convention(&self) -> &str {
         "N"
      }

      fn message_set(&self) -> &ProcessableMessageSet {
         &self.messages
      }

      fn columns(&self) -> &[ColumnInfo] {
         &self.columns
      }

      async fn provision(&self, _watchdog_secs: u32) -> crate::Result<DialogHandle> {
         unimplemented!("scripted backend is never provisioned")
      }

      async fn reattach(&self, _watchdog_secs: u32) -> crate::Result<DialogHandle> {
         unimplemented!("scripted backend is never provisioned")
      }

      async fn receive_batch(
         &self,
         _dialog: DialogHandle,
         _timeout_secs: u32,
         _watchdog_secs: u32,
      ) -> crate::Result<Vec<QueueMessage>> {
         Ok(self.batches.lock().pop_front().unwrap_or_else(|| {
            vec![message("N/Dispose", Vec::new())]
         }))
      }

      async fn end_conversation(&self, _handle: uuid::Uuid) -> crate::Result<()> {
         self.ended.fetch_add(1, Ordering::SeqCst);
         Ok(())
      }

      async fn teardown(&self, _dialog: Option<DialogHandle>) -> crate::Result<()> {
         Ok(())
      }
   }

   fn message(type_name: &str, body: Vec<u8>) -> QueueMessage {
      QueueMessage {
         conversation: uuid::Uuid::new_v4(),
         type_name: type_name.to_string(),
         body,
      }
   }

   fn utf16(text: &str) -> Vec<u8> {
      text.encode_utf16().flat_map(u16::to_le_bytes).collect()
   }

   async fn run_scripted(
      batches: Vec<Vec<QueueMessage>>,
      include_old_values: bool,
   ) -> (Vec<ChangeEvent<Person>>, SubscriptionStatus) {
      let backend = Arc::new(ScriptedBackend::new(batches, include_old_values));
      let callbacks: Arc<CallbackRegistry<Person>> = Arc::new(CallbackRegistry::new(8));
      let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
      let sink = Arc::clone(&events);
      callbacks.on_changed(Box::new(move |event| sink.lock().push(event.clone())));

      let status = Arc::new(StatusTracker::new());
      let listener = Listener::<Person> {
         backend,
         dialog: DialogHandle(uuid::Uuid::new_v4()),
         field_for_column: HashMap::from([
            ("id".to_string(), "id".to_string()),
            ("name".to_string(), "name".to_string()),
         ]),
         encoding: PayloadEncoding::Utf16Le,
         include_old_values,
         receive_timeout_secs: 1,
         watchdog_secs: 2,
         callbacks,
         status: Arc::clone(&status),
         cancel: CancellationToken::new(),
      };
      listener.run().await;
      let collected = events.lock().clone();
      (collected, status.get())
   }

   #[tokio::test]
   async fn delivers_reassembled_insert() {
      let batches = vec![vec![
         message("N/StartDialog/Insert", Vec::new()),
         message("N/Id", utf16("7")),
         message("N/Name", utf16("Ada")),
      ]];
      let (events, status) = run_scripted(batches, false).await;
      assert_eq!(events.len(), 1);
      assert_eq!(events[0].kind, ChangeKind::Insert);
      assert_eq!(
         events[0].entity,
         Person {
            id: 7,
            name: Some("Ada".to_string())
         }
      );
      assert!(events[0].old_entity.is_none());
      assert_eq!(status, SubscriptionStatus::StoppedDueToCancellation);
   }

   #[tokio::test]
   async fn reassembles_group_split_across_batches() {
      let batches = vec![
         vec![
            message("N/StartDialog/Update", Vec::new()),
            message("N/Id", utf16("1")),
         ],
         vec![message("N/Name", utf16("after"))],
      ];
      let (events, _) = run_scripted(batches, false).await;
      assert_eq!(events.len(), 1);
      assert_eq!(events[0].kind, ChangeKind::Update);
      assert_eq!(events[0].entity.name.as_deref(), Some("after"));
   }

   #[tokio::test]
   async fn update_carries_old_entity_when_tracked() {
      let batches = vec![vec![
         message("N/StartDialog/Update", Vec::new()),
         message("N/Id", utf16("1")),
         message("N/Name", utf16("after")),
         message("N/Id/old", utf16("1")),
         message("N/Name/old", utf16("before")),
      ]];
      let (events, _) = run_scripted(batches, true).await;
      assert_eq!(events.len(), 1);
      let old = events[0].old_entity.as_ref().unwrap();
      assert_eq!(old.name.as_deref(), Some("before"));
      assert_eq!(events[0].entity.name.as_deref(), Some("after"));
   }

   #[tokio::test]
   async fn null_marker_decodes_to_none() {
      let batches = vec![vec![
         message("N/StartDialog/Delete", Vec::new()),
         message("N/Id", utf16("3")),
         message("N/Name", Vec::new()),
      ]];
      let (events, _) = run_scripted(batches, false).await;
      assert_eq!(events.len(), 1);
      assert_eq!(events[0].kind, ChangeKind::Delete);
      assert!(events[0].entity.name.is_none());
   }

   #[tokio::test]
   async fn broker_error_stops_with_error_status() {
      let body = utf16("dialog fault");
      let batches = vec![vec![message(crate::message::ERROR_MESSAGE_TYPE, body)]];
      let (events, status) = run_scripted(batches, false).await;
      assert!(events.is_empty());
      assert_eq!(status, SubscriptionStatus::StoppedDueToError);
   }

   #[tokio::test]
   async fn partial_group_discarded_on_new_start() {
      let batches = vec![
         vec![
            message("N/StartDialog/Insert", Vec::new()),
            message("N/Id", utf16("1")),
         ],
         vec![
            message("N/StartDialog/Insert", Vec::new()),
            message("N/Id", utf16("2")),
            message("N/Name", utf16("kept")),
         ],
      ];
      let (events, _) = run_scripted(batches, false).await;
      assert_eq!(events.len(), 1);
      assert_eq!(events[0].entity.id, 2);
   }

   #[tokio::test]
   async fn cancellation_wins_over_receive() {
      let backend = Arc::new(ScriptedBackend::new(Vec::new(), false));
      let callbacks: Arc<CallbackRegistry<Person>> = Arc::new(CallbackRegistry::new(8));
      callbacks.on_changed(Box::new(|_| {}));
      let status = Arc::new(StatusTracker::new());
      let cancel = CancellationToken::new();
      cancel.cancel();
      let listener = Listener::<Person> {
         backend,
         dialog: DialogHandle(uuid::Uuid::new_v4()),
         field_for_column: HashMap::new(),
         encoding: PayloadEncoding::Utf16Le,
         include_old_values: false,
         receive_timeout_secs: 1,
         watchdog_secs: 2,
         callbacks,
         status: Arc::clone(&status),
         cancel,
      };
      listener.run().await;
      assert_eq!(status.get(), SubscriptionStatus::StoppedDueToCancellation);
   }
}
