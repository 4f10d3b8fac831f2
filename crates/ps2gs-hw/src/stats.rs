use std::sync::atomic::{AtomicU64, Ordering};

/// Per-device counters for the render path.
///
/// Cheap to bump from the render thread and safe to read from another thread
/// (the device hands out an `Arc<GsStats>`).
#[derive(Debug, Default)]
pub struct GsStats {
    draw_calls: AtomicU64,
    render_passes: AtomicU64,
    texture_copies: AtomicU64,
    /// Bytes written through the streams and texture uploads.
    upload_bytes: AtomicU64,
    /// Target copies standing in for a texture barrier.
    barriers: AtomicU64,
    dispatches: AtomicU64,
    stream_discards: AtomicU64,
    abandoned_draws: AtomicU64,
    presents: AtomicU64,
}

impl GsStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_draw_calls(&self) {
        self.draw_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_render_passes(&self) {
        self.render_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_texture_copies(&self) {
        self.texture_copies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_upload_bytes(&self, bytes: u64) {
        self.upload_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_barriers(&self) {
        self.barriers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dispatches(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stream_discards(&self) {
        self.stream_discards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_abandoned_draws(&self) {
        self.abandoned_draws.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_presents(&self) {
        self.presents.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GsStatsSnapshot {
        GsStatsSnapshot {
            draw_calls: self.draw_calls.load(Ordering::Relaxed),
            render_passes: self.render_passes.load(Ordering::Relaxed),
            texture_copies: self.texture_copies.load(Ordering::Relaxed),
            upload_bytes: self.upload_bytes.load(Ordering::Relaxed),
            barriers: self.barriers.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            stream_discards: self.stream_discards.load(Ordering::Relaxed),
            abandoned_draws: self.abandoned_draws.load(Ordering::Relaxed),
            presents: self.presents.load(Ordering::Relaxed),
        }
    }

    /// Returns a JSON object as a string.
    pub fn to_json(&self) -> String {
        self.snapshot().to_json()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GsStatsSnapshot {
    pub draw_calls: u64,
    pub render_passes: u64,
    pub texture_copies: u64,
    pub upload_bytes: u64,
    pub barriers: u64,
    pub dispatches: u64,
    pub stream_discards: u64,
    pub abandoned_draws: u64,
    pub presents: u64,
}

impl GsStatsSnapshot {
    /// Counter deltas since `earlier`.
    pub fn since(self, earlier: GsStatsSnapshot) -> GsStatsSnapshot {
        GsStatsSnapshot {
            draw_calls: self.draw_calls - earlier.draw_calls,
            render_passes: self.render_passes - earlier.render_passes,
            texture_copies: self.texture_copies - earlier.texture_copies,
            upload_bytes: self.upload_bytes - earlier.upload_bytes,
            barriers: self.barriers - earlier.barriers,
            dispatches: self.dispatches - earlier.dispatches,
            stream_discards: self.stream_discards - earlier.stream_discards,
            abandoned_draws: self.abandoned_draws - earlier.abandoned_draws,
            presents: self.presents - earlier.presents,
        }
    }

    pub fn to_json(self) -> String {
        format!(
            "{{\"draw_calls\":{},\"render_passes\":{},\"texture_copies\":{},\"upload_bytes\":{},\"barriers\":{},\"dispatches\":{},\"stream_discards\":{},\"abandoned_draws\":{},\"presents\":{}}}",
            self.draw_calls,
            self.render_passes,
            self.texture_copies,
            self.upload_bytes,
            self.barriers,
            self.dispatches,
            self.stream_discards,
            self.abandoned_draws,
            self.presents,
        )
    }
}
