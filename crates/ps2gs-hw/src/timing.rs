//! GPU frame timing through a small ring of timestamp queries.
//!
//! Each ring entry brackets one frame: it is begun ("kicked") when a frame
//! starts and ended ("popped") when the next pop runs, after which its
//! result is polled without blocking. A full ring skips new begins instead
//! of stalling the render thread.

use tracing::{debug, trace};

use crate::error::GsError;
use crate::hal::{GsBackend, TimestampReadback};

pub const NUM_TIMESTAMP_QUERIES: usize = 5;

#[derive(Debug, Default)]
pub struct GpuTimer {
    created: bool,
    started: bool,
    read: usize,
    write: usize,
    waiting: usize,
    accumulated_ms: f64,
}

impl GpuTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.created
    }

    /// Entries ended but not yet read back.
    pub fn waiting(&self) -> usize {
        self.waiting
    }

    pub fn create<B: GsBackend + ?Sized>(&mut self, backend: &mut B) -> Result<(), GsError> {
        if self.created {
            return Ok(());
        }
        backend.create_timestamp_queries(NUM_TIMESTAMP_QUERIES)?;
        self.created = true;
        debug!(queries = NUM_TIMESTAMP_QUERIES, "created timestamp ring");
        self.kick(backend);
        Ok(())
    }

    pub fn destroy<B: GsBackend + ?Sized>(&mut self, backend: &mut B) {
        if !self.created {
            return;
        }
        if self.started {
            backend.end_timestamp_query(self.write);
        }
        backend.destroy_timestamp_queries();
        *self = Self {
            accumulated_ms: self.accumulated_ms,
            ..Self::default()
        };
    }

    /// Begins timing into the write slot, unless one is already open or the
    /// ring has no free entry.
    pub fn kick<B: GsBackend + ?Sized>(&mut self, backend: &mut B) {
        if self.started || !self.created || self.waiting == NUM_TIMESTAMP_QUERIES {
            return;
        }
        backend.begin_timestamp_query(self.write);
        self.started = true;
    }

    /// Collects finished entries, then ends the open one.
    pub fn pop<B: GsBackend + ?Sized>(&mut self, backend: &mut B) {
        while self.waiting > 0 {
            match backend.read_timestamp_query(self.read) {
                TimestampReadback::NotReady => break,
                TimestampReadback::Disjoint => {
                    debug!(pending = self.waiting, "timestamp clock was disjoint, dropping ring");
                    self.read = 0;
                    self.write = 0;
                    self.waiting = 0;
                    self.started = false;
                }
                TimestampReadback::Ready { start, end, frequency } => {
                    if frequency > 0 {
                        let ms = end.saturating_sub(start) as f64 / (frequency as f64 / 1000.0);
                        trace!(slot = self.read, ms, "timestamp ready");
                        self.accumulated_ms += ms;
                    }
                    self.read = (self.read + 1) % NUM_TIMESTAMP_QUERIES;
                    self.waiting -= 1;
                }
            }
        }

        if self.started {
            backend.end_timestamp_query(self.write);
            self.write = (self.write + 1) % NUM_TIMESTAMP_QUERIES;
            self.started = false;
            self.waiting += 1;
        }
    }

    /// Milliseconds of GPU time collected since the last call.
    pub fn take_accumulated(&mut self) -> f32 {
        std::mem::take(&mut self.accumulated_ms) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{NativeCall, RecordingBackend};
    use crate::hal::GsFeatures;

    fn timing_backend() -> RecordingBackend {
        RecordingBackend::new().with_features(GsFeatures {
            timestamp_queries: true,
            ..GsFeatures::default()
        })
    }

    fn begins(backend: &RecordingBackend) -> usize {
        backend.count_calls(|c| matches!(c, NativeCall::BeginTimestampQuery(_)))
    }

    #[test]
    fn unsupported_backend_reports_error() {
        let mut backend = RecordingBackend::new();
        let mut timer = GpuTimer::new();
        assert!(matches!(timer.create(&mut backend), Err(GsError::Unsupported(_))));
        assert!(!timer.is_enabled());
    }

    #[test]
    fn full_ring_skips_begins() {
        let mut backend = timing_backend();
        let mut timer = GpuTimer::new();
        timer.create(&mut backend).unwrap();

        for _ in 0..10 {
            timer.pop(&mut backend);
            timer.kick(&mut backend);
        }

        assert_eq!(begins(&backend), NUM_TIMESTAMP_QUERIES);
        assert_eq!(timer.waiting(), NUM_TIMESTAMP_QUERIES);
    }

    #[test]
    fn ready_entries_accumulate_milliseconds() {
        let mut backend = timing_backend();
        let mut timer = GpuTimer::new();
        timer.create(&mut backend).unwrap();
        timer.pop(&mut backend);
        timer.kick(&mut backend);

        backend.push_timestamp_readback(TimestampReadback::Ready {
            start: 1_000,
            end: 2_501_000,
            frequency: 1_000_000_000,
        });
        timer.pop(&mut backend);

        assert!((timer.take_accumulated() - 2.5).abs() < 1e-6);
        assert_eq!(timer.take_accumulated(), 0.0);
        assert_eq!(timer.waiting(), 1);
    }

    #[test]
    fn disjoint_readback_resets_ring() {
        let mut backend = timing_backend();
        let mut timer = GpuTimer::new();
        timer.create(&mut backend).unwrap();
        for _ in 0..3 {
            timer.pop(&mut backend);
            timer.kick(&mut backend);
        }
        assert_eq!(timer.waiting(), 3);

        backend.push_timestamp_readback(TimestampReadback::Disjoint);
        backend.take_calls();
        timer.pop(&mut backend);
        assert_eq!(timer.waiting(), 0);

        timer.kick(&mut backend);
        assert_eq!(backend.take_calls(), vec![NativeCall::BeginTimestampQuery(0)]);
    }

    #[test]
    fn destroy_ends_open_query() {
        let mut backend = timing_backend();
        let mut timer = GpuTimer::new();
        timer.create(&mut backend).unwrap();
        backend.take_calls();

        timer.destroy(&mut backend);
        assert_eq!(
            backend.take_calls(),
            vec![NativeCall::EndTimestampQuery(0), NativeCall::DestroyTimestampQueries]
        );
        assert!(!timer.is_enabled());
        assert_eq!(backend.timestamp_queries(), None);
    }
}
