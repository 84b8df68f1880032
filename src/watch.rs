use log::{debug, warn};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::gpio::GpioBackend;

/// A value change observed on an exported pin.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    /// Channel as the caller passed it to `setup`.
    pub channel: u32,
    pub pin: u32,
    pub value: String,
    pub timestamp_ms: u64,
}

/// Fans change events out to subscribers and keeps a short per-channel
/// history.
pub struct ChangeDispatcher {
    event_tx: broadcast::Sender<ChangeEvent>,
    event_history: RwLock<FxHashMap<u32, VecDeque<ChangeEvent>>>,
    event_history_capacity: usize,
}

impl ChangeDispatcher {
    pub fn new(broadcast_capacity: usize, event_history_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(broadcast_capacity);
        Self {
            event_tx,
            event_history: RwLock::new(FxHashMap::default()),
            event_history_capacity,
        }
    }

    pub fn dispatch(&self, event: ChangeEvent) {
        if self.event_history_capacity > 0 {
            let mut history = self.event_history.write();
            let entries = history.entry(event.channel).or_default();
            while entries.len() >= self.event_history_capacity {
                entries.pop_front();
            }
            entries.push_back(event.clone());
        }
        // no receivers is not an error
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.event_tx.subscribe()
    }

    /// Most recent events for `channel`, oldest first, at most `limit`.
    pub fn recent(&self, channel: u32, limit: Option<usize>) -> Vec<ChangeEvent> {
        let history = self.event_history.read();
        let Some(entries) = history.get(&channel) else {
            return Vec::new();
        };
        let skip = limit.map(|l| entries.len().saturating_sub(l)).unwrap_or(0);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Drops the retained events of `channel`.
    pub fn clear(&self, channel: u32) {
        self.event_history.write().remove(&channel);
    }

    pub fn last(&self, channel: u32) -> Option<ChangeEvent> {
        self.event_history
            .read()
            .get(&channel)
            .and_then(|d| d.back().cloned())
    }
}

/// Change events for a single channel.
///
/// A subscriber that falls more than `broadcast_capacity` events behind
/// loses the oldest ones: the gap is logged and the stream resumes with the
/// newest events. The per-channel history still holds what was missed.
pub struct ChangeStream {
    inner: BroadcastStream<ChangeEvent>,
    channel: u32,
}

impl ChangeStream {
    pub fn new(rx: broadcast::Receiver<ChangeEvent>, channel: u32) -> Self {
        Self {
            inner: BroadcastStream::new(rx),
            channel,
        }
    }
}

impl Stream for ChangeStream {
    type Item = ChangeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if event.channel == this.channel {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(n)))) => {
                    warn!("change stream for channel {} lagged by {n} events", this.channel);
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Identity of a value file's last write: modification time, length and
/// inode. Two writes of the same text still yield different stamps on a
/// filesystem that records them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueStamp {
    pub modified: Option<SystemTime>,
    pub len: u64,
    pub inode: u64,
}

/// Background task reporting one pin's value changes.
///
/// Backends that push every write (see `GpioBackend::watch_value`) get one
/// event per write. Otherwise the value file is polled and an event fires
/// when its text or its `ValueStamp` differs from the previous poll; writes
/// landing within one poll period may then collapse into a single event.
pub struct ChangeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ChangeListener {
    /// Subscribes or reads the polling baseline before returning, so any
    /// change made after this call is reported.
    pub async fn start<B: GpioBackend>(
        channel: u32,
        pin: u32,
        backend: Arc<B>,
        dispatcher: Arc<ChangeDispatcher>,
        poll_interval: Duration,
    ) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();

        let handle = match backend.watch_value(pin) {
            Some(rx) => {
                debug!("pin {pin} watched through backend notifications");
                tokio::spawn(forward_writes(channel, pin, rx, dispatcher, cancel_flag))
            }
            None => {
                let stamp = backend.value_stamp(pin).await;
                let baseline = match backend.read_value(pin).await {
                    Ok(v) => Some(v),
                    Err(e) => {
                        debug!("no baseline value for pin {pin} yet: {e}");
                        None
                    }
                };
                tokio::spawn(poll_value(
                    PollTarget {
                        channel,
                        pin,
                        backend,
                        dispatcher,
                        cancel: cancel_flag,
                    },
                    poll_interval,
                    baseline,
                    stamp,
                ))
            }
        };

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stops polling and waits for the task, so nothing is dispatched for
    /// this pin once this returns.
    pub async fn stop(mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn forward_writes(
    channel: u32,
    pin: u32,
    mut rx: mpsc::UnboundedReceiver<String>,
    dispatcher: Arc<ChangeDispatcher>,
    cancel: Arc<AtomicBool>,
) {
    while let Some(value) = rx.recv().await {
        if cancel.load(Ordering::Acquire) {
            break;
        }
        dispatcher.dispatch(ChangeEvent {
            channel,
            pin,
            value,
            timestamp_ms: epoch_millis(),
        });
    }
    debug!("value notifications for pin {pin} ended");
}

struct PollTarget<B: GpioBackend> {
    channel: u32,
    pin: u32,
    backend: Arc<B>,
    dispatcher: Arc<ChangeDispatcher>,
    cancel: Arc<AtomicBool>,
}

async fn poll_value<B: GpioBackend>(
    target: PollTarget<B>,
    poll_interval: Duration,
    mut last: Option<String>,
    mut last_stamp: Option<ValueStamp>,
) {
    let PollTarget {
        channel,
        pin,
        backend,
        dispatcher,
        cancel,
    } = target;
    let mut failing = false;
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;

    while !cancel.load(Ordering::Acquire) {
        ticker.tick().await;

        let stamp = backend.value_stamp(pin).await;
        let value = match backend.read_value(pin).await {
            Ok(v) => {
                failing = false;
                v
            }
            Err(e) => {
                if !failing {
                    warn!("watch read error for pin {pin}: {e}");
                    failing = true;
                }
                continue;
            }
        };

        let rewritten = stamp.is_some() && stamp != last_stamp;
        let changed = rewritten || last.as_deref() != Some(value.as_str());
        let had_baseline = last.is_some();
        last = Some(value.clone());
        last_stamp = stamp;
        if !changed || !had_baseline || cancel.load(Ordering::Acquire) {
            continue;
        }

        dispatcher.dispatch(ChangeEvent {
            channel,
            pin,
            value,
            timestamp_ms: epoch_millis(),
        });
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(channel: u32, value: &str) -> ChangeEvent {
        ChangeEvent {
            channel,
            pin: channel,
            value: value.into(),
            timestamp_ms: 0,
        }
    }

    #[test]
    fn history_is_bounded_per_channel() {
        let dispatcher = ChangeDispatcher::new(8, 2);
        dispatcher.dispatch(event(1, "1"));
        dispatcher.dispatch(event(1, "0"));
        dispatcher.dispatch(event(1, "1"));
        dispatcher.dispatch(event(2, "1"));

        let values: Vec<String> = dispatcher.recent(1, None).into_iter().map(|e| e.value).collect();
        assert_eq!(values, vec!["0", "1"]);
        assert_eq!(dispatcher.recent(2, None).len(), 1);
        assert_eq!(dispatcher.last(1).unwrap().value, "1");
        assert!(dispatcher.last(3).is_none());
    }

    #[test]
    fn recent_honours_limit() {
        let dispatcher = ChangeDispatcher::new(8, 8);
        for v in ["0", "1", "0", "1"] {
            dispatcher.dispatch(event(7, v));
        }
        let values: Vec<String> = dispatcher
            .recent(7, Some(3))
            .into_iter()
            .map(|e| e.value)
            .collect();
        assert_eq!(values, vec!["1", "0", "1"]);
    }

    #[test]
    fn zero_history_capacity_keeps_nothing() {
        let dispatcher = ChangeDispatcher::new(8, 0);
        let mut rx = dispatcher.subscribe();
        dispatcher.dispatch(event(1, "1"));
        assert!(dispatcher.recent(1, None).is_empty());
        assert_eq!(rx.try_recv().unwrap().value, "1");
    }

    #[test]
    fn clear_forgets_one_channel() {
        let dispatcher = ChangeDispatcher::new(8, 8);
        dispatcher.dispatch(event(1, "1"));
        dispatcher.dispatch(event(2, "1"));

        dispatcher.clear(1);
        assert!(dispatcher.recent(1, None).is_empty());
        assert!(dispatcher.last(1).is_none());
        assert_eq!(dispatcher.recent(2, None).len(), 1);
    }

    #[tokio::test]
    async fn lagging_stream_skips_to_newest_events() {
        use tokio_stream::StreamExt;

        let dispatcher = ChangeDispatcher::new(2, 8);
        let mut stream = ChangeStream::new(dispatcher.subscribe(), 3);
        for v in ["1", "0", "1", "0"] {
            dispatcher.dispatch(event(3, v));
        }

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!((first.value.as_str(), second.value.as_str()), ("1", "0"));
        assert_eq!(dispatcher.recent(3, None).len(), 4);
    }

    #[tokio::test]
    async fn stream_filters_by_channel() {
        use tokio_stream::StreamExt;

        let dispatcher = ChangeDispatcher::new(8, 0);
        let mut stream = ChangeStream::new(dispatcher.subscribe(), 2);
        dispatcher.dispatch(event(1, "1"));
        dispatcher.dispatch(event(2, "0"));

        let got = stream.next().await.unwrap();
        assert_eq!(got.channel, 2);
        assert_eq!(got.value, "0");
    }
}
