//! Single-producer, many-consumer latest-frame slot.
//!
//! The producer overwrites one shared slot and never waits for readers.
//! Each consumer parks until the slot changes and then clones the `Arc`
//! out of it, so encoding runs outside the slot and a reader can never
//! observe a half-written frame. Slow consumers skip frames; none of them
//! sees frames out of order because each wake-up yields the newest value.

use std::sync::Arc;

use futures_util::Stream;
use tokio::sync::watch;
use tracing::debug;
use video_ingest::Frame;

use crate::imaging::EncodeError;

pub struct FrameBroadcaster {
    tx: watch::Sender<Option<Arc<Frame>>>,
}

impl Default for FrameBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Replace the held frame. Never blocks, even with no subscribers.
    pub fn publish(&self, frame: Frame) {
        self.publish_shared(Arc::new(frame));
    }

    pub fn publish_shared(&self, frame: Arc<Frame>) {
        self.tx.send_replace(Some(frame));
    }

    /// Most recently published frame, if any.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> FrameSubscriber {
        FrameSubscriber {
            rx: self.tx.subscribe(),
            primed: false,
        }
    }

    /// Live subscribers. Playback feeders stop once this drops to zero.
    pub fn consumer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[derive(Debug)]
pub struct FrameSubscriber {
    rx: watch::Receiver<Option<Arc<Frame>>>,
    primed: bool,
}

impl FrameSubscriber {
    /// Wait for a frame this subscriber has not seen yet.
    ///
    /// The first call returns the current frame straight away when one is
    /// held. Returns `None` once the broadcaster is gone and its last frame
    /// has been delivered.
    pub async fn next_frame(&mut self) -> Option<Arc<Frame>> {
        if !self.primed {
            self.primed = true;
            let current = self.rx.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
        }
        loop {
            self.rx.changed().await.ok()?;
            let frame = self.rx.borrow_and_update().clone();
            if frame.is_some() {
                return frame;
            }
        }
    }
}

/// Turn a subscription into a stream of encoded frames.
///
/// A frame that fails to encode is skipped for this consumer only. The
/// stream ends when the broadcaster is dropped; dropping the stream
/// unsubscribes.
pub fn consume_stream<F>(
    mut subscriber: FrameSubscriber,
    mut encode: F,
) -> impl Stream<Item = Vec<u8>> + Send + 'static
where
    F: FnMut(&Frame) -> Result<Vec<u8>, EncodeError> + Send + 'static,
{
    async_stream::stream! {
        while let Some(frame) = subscriber.next_frame().await {
            match encode(&frame) {
                Ok(bytes) => yield bytes,
                Err(err) => debug!(timestamp_ms = frame.timestamp_ms, "dropping frame: {err}"),
            }
        }
    }
}
