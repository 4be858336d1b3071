use crate::telemetry::{ChannelValues, NodeKey, Reading, SensorChannel, CHANNEL_COUNT};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

/// Values collected for one node since the last drain.
#[derive(Clone, Debug)]
pub struct WindowBuffer {
    key: NodeKey,
    started_at: Instant,
    window_start: DateTime<Utc>,
    values: [Vec<f64>; CHANNEL_COUNT],
}

impl WindowBuffer {
    fn new(key: NodeKey) -> Self {
        Self {
            key,
            started_at: Instant::now(),
            window_start: Utc::now(),
            values: Default::default(),
        }
    }

    fn append(&mut self, values: &ChannelValues) {
        for (channel, value) in values.present() {
            self.values[channel.index()].push(value);
        }
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    pub fn values(&self, channel: SensorChannel) -> &[f64] {
        &self.values[channel.index()]
    }

    /// Length of the first non-empty channel sequence. Nodes report a stable
    /// channel set, so this stands in for the number of readings; a node that
    /// drops channels mid-window will skew it.
    pub fn reading_count(&self) -> usize {
        self.values
            .iter()
            .find(|seq| !seq.is_empty())
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Live windows keyed by `(greenhouse_id, node_id)`. One lock covers the map
/// and every buffer inside it; both critical sections are short.
#[derive(Debug, Default)]
pub struct WindowAccumulator {
    buffers: Mutex<HashMap<NodeKey, WindowBuffer>>,
}

impl WindowAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeKey, WindowBuffer>> {
        // Appends and the swap never leave the map half-updated, so a
        // poisoned guard still holds a consistent map.
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_reading(&self, reading: &Reading) {
        let mut buffers = self.lock();
        if let Some(buffer) = buffers.get_mut(&reading.key) {
            buffer.append(&reading.values);
            return;
        }

        let mut buffer = WindowBuffer::new(reading.key.clone());
        buffer.append(&reading.values);
        buffers.insert(reading.key.clone(), buffer);
    }

    /// Swaps in an empty map and hands back every buffer that was live.
    pub fn drain_all(&self) -> Vec<WindowBuffer> {
        let drained = std::mem::take(&mut *self.lock());
        drained.into_values().collect()
    }

    pub fn count_pending(&self) -> usize {
        self.lock().values().map(WindowBuffer::reading_count).sum()
    }

    pub fn key_count(&self) -> usize {
        self.lock().len()
    }
}
