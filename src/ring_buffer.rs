use crate::frame::FrameData;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Default number of frames held for zero-shutter-lag capture
pub const DEFAULT_CAPACITY: usize = 10;

/// Fixed-capacity circular buffer holding the most recent camera frames
///
/// Slots and the write cursor live behind a single mutex that is held only
/// while a slot is swapped or cloned. Readers get clones whose pixel data is
/// immutable, so the camera callback can keep pushing while a capture job
/// works on an earlier snapshot.
pub struct RingBuffer {
    /// Slot arena and cursor
    inner: Mutex<Slots>,
    /// Total capacity of the buffer
    capacity: usize,
    /// Frame counter for generating unique IDs
    frame_counter: AtomicU64,
    /// Statistics
    stats: RingBufferStats,
}

struct Slots {
    frames: Vec<Option<FrameData>>,
    /// Next slot to write
    write_index: usize,
    /// Number of occupied slots
    len: usize,
}

impl Slots {
    /// Slot index of the `offset`-th oldest held frame
    fn index_from_oldest(&self, offset: usize) -> usize {
        let capacity = self.frames.len();
        (self.write_index + capacity - self.len + offset) % capacity
    }
}

/// Statistics for ring buffer performance monitoring
#[derive(Debug)]
pub struct RingBufferStats {
    /// Total frames pushed to buffer
    pub frames_pushed: AtomicU64,
    /// Total frames retrieved from buffer
    pub frames_retrieved: AtomicU64,
    /// Number of buffer overruns (old frames overwritten)
    pub buffer_overruns: AtomicU64,
    /// Current buffer utilization (0-100)
    pub utilization_percent: AtomicU64,
}

impl RingBufferStats {
    fn new() -> Self {
        Self {
            frames_pushed: AtomicU64::new(0),
            frames_retrieved: AtomicU64::new(0),
            buffer_overruns: AtomicU64::new(0),
            utilization_percent: AtomicU64::new(0),
        }
    }

    /// Get current statistics as a snapshot
    pub fn snapshot(&self) -> RingBufferStatsSnapshot {
        RingBufferStatsSnapshot {
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_retrieved: self.frames_retrieved.load(Ordering::Relaxed),
            buffer_overruns: self.buffer_overruns.load(Ordering::Relaxed),
            utilization_percent: self.utilization_percent.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of ring buffer statistics
#[derive(Debug, Clone)]
pub struct RingBufferStatsSnapshot {
    pub frames_pushed: u64,
    pub frames_retrieved: u64,
    pub buffer_overruns: u64,
    pub utilization_percent: u64,
}

impl RingBuffer {
    /// Create a new ring buffer with the specified capacity
    ///
    /// # Example
    /// ```
    /// use pocketcam::ring_buffer::RingBuffer;
    ///
    /// let buffer = RingBuffer::new(10);
    /// assert!(buffer.is_empty());
    /// ```
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            panic!("Ring buffer capacity must be greater than 0");
        }

        debug!("Created ring buffer with capacity {}", capacity);

        Self {
            inner: Mutex::new(Slots {
                frames: vec![None; capacity],
                write_index: 0,
                len: 0,
            }),
            capacity,
            frame_counter: AtomicU64::new(0),
            stats: RingBufferStats::new(),
        }
    }

    /// Push a new frame, evicting the oldest one when full
    ///
    /// Safe to call from the camera callback: the critical section is a slot
    /// swap, and the evicted frame is dropped after the lock is released.
    pub fn push_frame(&self, frame: FrameData) {
        let frame_id = frame.id;

        let (evicted, index, len) = {
            let mut slots = self.inner.lock();
            let index = slots.write_index;
            let evicted = slots.frames[index].replace(frame);
            slots.write_index = (index + 1) % self.capacity;
            if evicted.is_none() {
                slots.len += 1;
            }
            (evicted, index, slots.len)
        };

        if let Some(old) = evicted {
            self.stats.buffer_overruns.fetch_add(1, Ordering::Relaxed);
            trace!("Evicted frame {} from slot {}", old.id, index);
        }

        trace!("Pushed frame {} to buffer slot {}", frame_id, index);

        self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .utilization_percent
            .store((len * 100 / self.capacity) as u64, Ordering::Relaxed);
    }

    /// Get the most recently pushed frame
    ///
    /// # Returns
    /// * `Some(FrameData)` - The latest frame if available
    /// * `None` - If the buffer is empty
    pub fn latest(&self) -> Option<FrameData> {
        let frame = {
            let slots = self.inner.lock();
            if slots.len == 0 {
                return None;
            }
            let index = (slots.write_index + self.capacity - 1) % self.capacity;
            slots.frames[index].clone()
        };

        if let Some(ref f) = frame {
            self.stats.frames_retrieved.fetch_add(1, Ordering::Relaxed);
            trace!("Retrieved latest frame {}", f.id);
        }
        frame
    }

    /// Get up to `n` of the most recent frames, oldest first
    pub fn recent(&self, n: usize) -> Vec<FrameData> {
        let frames: Vec<FrameData> = {
            let slots = self.inner.lock();
            let take = n.min(slots.len);
            let skip = slots.len - take;
            (skip..slots.len)
                .filter_map(|offset| slots.frames[slots.index_from_oldest(offset)].clone())
                .collect()
        };

        self.stats
            .frames_retrieved
            .fetch_add(frames.len() as u64, Ordering::Relaxed);
        debug!("Collected {} recent frames (requested {})", frames.len(), n);
        frames
    }

    /// Get the current buffer capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of frames currently held
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get current buffer statistics
    pub fn stats(&self) -> RingBufferStatsSnapshot {
        self.stats.snapshot()
    }

    /// Clear all frames from the buffer
    pub fn clear(&self) {
        debug!("Clearing ring buffer");

        let dropped: Vec<FrameData> = {
            let mut slots = self.inner.lock();
            slots.write_index = 0;
            slots.len = 0;
            slots.frames.iter_mut().filter_map(Option::take).collect()
        };

        self.stats.utilization_percent.store(0, Ordering::Relaxed);
        debug!("Ring buffer cleared ({} frames dropped)", dropped.len());
    }

    /// Get the next frame ID for new frames
    pub fn next_frame_id(&self) -> u64 {
        self.frame_counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Builder for creating ring buffers with custom configuration
pub struct RingBufferBuilder {
    capacity: Option<usize>,
}

impl RingBufferBuilder {
    /// Create a new ring buffer builder
    pub fn new() -> Self {
        Self { capacity: None }
    }

    /// Set the buffer capacity
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Build the ring buffer with specified configuration
    pub fn build(self) -> Result<RingBuffer, crate::error::PocketcamError> {
        let capacity = self.capacity.ok_or_else(|| {
            crate::error::PocketcamError::system("Ring buffer capacity must be specified")
        })?;

        if capacity == 0 {
            return Err(crate::error::PocketcamError::system(
                "Ring buffer capacity must be greater than 0",
            ));
        }

        Ok(RingBuffer::new(capacity))
    }
}

impl Default for RingBufferBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameFormat;
    use std::sync::Arc;
    use std::time::SystemTime;

    fn create_test_frame(id: u64) -> FrameData {
        FrameData::new(id, SystemTime::now(), vec![id as u8; 12], 2, 2, FrameFormat::Rgb24)
    }

    #[test]
    fn test_ring_buffer_creation() {
        let buffer = RingBuffer::new(10);
        assert_eq!(buffer.capacity(), 10);
        assert!(buffer.is_empty());
        assert_eq!(RingBuffer::default().capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn test_latest_on_empty_buffer() {
        let buffer = RingBuffer::new(5);
        assert!(buffer.latest().is_none());
        assert!(buffer.recent(3).is_empty());
    }

    #[test]
    fn test_push_and_get_latest() {
        let buffer = RingBuffer::new(5);
        buffer.push_frame(create_test_frame(1));

        let latest = buffer.latest();
        assert_eq!(latest.unwrap().id, 1);
    }

    #[test]
    fn test_fifteen_frames_into_capacity_ten() {
        let buffer = RingBuffer::new(10);
        for i in 0..15 {
            buffer.push_frame(create_test_frame(i));
        }

        assert_eq!(buffer.len(), 10);
        let ids: Vec<u64> = buffer.recent(10).iter().map(|f| f.id).collect();
        assert_eq!(ids, (5..15).collect::<Vec<_>>());
        assert_eq!(buffer.latest().unwrap().id, 14);
        assert_eq!(buffer.stats().buffer_overruns, 5);
        assert_eq!(buffer.stats().utilization_percent, 100);
    }

    #[test]
    fn test_recent_returns_fewer_when_short() {
        let buffer = RingBuffer::new(10);
        for i in 0..3 {
            buffer.push_frame(create_test_frame(i));
        }

        let ids: Vec<u64> = buffer.recent(6).iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        let ids: Vec<u64> = buffer.recent(2).iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let buffer = RingBuffer::new(3);
        for i in 0..50 {
            buffer.push_frame(create_test_frame(i));
            assert!(buffer.len() <= 3);
        }
        assert_eq!(buffer.recent(100).len(), 3);
    }

    #[test]
    fn test_clear_buffer() {
        let buffer = RingBuffer::new(5);
        for i in 1..=3 {
            buffer.push_frame(create_test_frame(i));
        }

        buffer.clear();

        assert!(buffer.latest().is_none());
        assert_eq!(buffer.len(), 0);

        buffer.push_frame(create_test_frame(9));
        assert_eq!(buffer.recent(5).len(), 1);
    }

    #[test]
    fn test_builder_validation() {
        assert!(RingBufferBuilder::new().build().is_err());
        assert!(RingBufferBuilder::new().capacity(0).build().is_err());

        let buffer = RingBufferBuilder::new().capacity(20).build().unwrap();
        assert_eq!(buffer.capacity(), 20);
    }

    #[test]
    fn test_single_producer_many_readers() {
        let buffer = Arc::new(RingBuffer::new(10));

        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for i in 0..500 {
                    buffer.push_frame(create_test_frame(i));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let recent = buffer.recent(6);
                        assert!(recent.len() <= 6);
                        assert!(recent.windows(2).all(|w| w[0].id < w[1].id));
                        let _ = buffer.latest();
                    }
                })
            })
            .collect();

        producer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }

        assert_eq!(buffer.stats().frames_pushed, 500);
        assert_eq!(buffer.latest().unwrap().id, 499);
    }
}
