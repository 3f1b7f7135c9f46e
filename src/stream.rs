//! Output channel decoupling a flow's production of text fragments from
//! a consumer delivering them to a transport.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// One item on the channel: a text fragment, or the end-of-stream
/// sentinel. The sentinel is put exactly once per task and is always
/// the last item a consumer observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Fragment(String),
    Done,
}

/// Unbounded FIFO queue of stream items. Handles are cheap clones of
/// the same underlying queue; producers call [`put`](Self::put),
/// the single logical consumer loops on [`get`](Self::get) until it
/// sees [`StreamItem::Done`].
#[derive(Clone)]
pub struct OutputChannel {
    tx: UnboundedSender<StreamItem>,
    rx: Arc<Mutex<UnboundedReceiver<StreamItem>>>,
}

impl OutputChannel {
    pub fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self { tx, rx: Arc::new(Mutex::new(rx)) }
    }

    /// Append an item. Never blocks; a send after the consumer side is
    /// gone is silently dropped.
    pub fn put(&self, item: StreamItem) {
        let _ = self.tx.send(item);
    }

    pub fn put_fragment(&self, text: impl Into<String>) {
        self.put(StreamItem::Fragment(text.into()));
    }

    /// Wait for the next item. A closed empty channel yields
    /// [`StreamItem::Done`] so a consumer can never block forever.
    pub async fn get(&self) -> StreamItem {
        let mut rx = self.rx.lock().await;
        rx.recv().await.unwrap_or(StreamItem::Done)
    }
}

impl Default for OutputChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OutputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputChannel").finish()
    }
}
