//! Frame presentation and the GPU timing hooks around it.

use tracing::{debug, error, info};

use crate::config::VsyncMode;
use crate::device::GsDevice;
use crate::error::GsError;
use crate::hal::{GsBackend, TextureDesc};
use crate::texture::{Texture, TextureFormat, TextureType};

/// Clear color of the window before the display output is drawn.
pub const PRESENT_CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentResult {
    Ok,
    /// Nothing was bound; the host should not draw or call `end_frame`.
    FrameSkipped,
}

/// Conditions the host has to react to, drained with
/// [`GsDevice::drain_events`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GsEvent {
    /// Fall back to windowed presentation.
    ExclusiveFullscreenLost,
    DeviceLost(String),
}

impl<B: GsBackend> GsDevice<B> {
    /// Binds the window surface, cleared, as the render target.
    pub fn present_frame(&mut self, skip: bool) -> Result<PresentResult, GsError> {
        if skip || !self.backend.has_surface() {
            return Ok(PresentResult::FrameSkipped);
        }

        if self.backend.exclusive_fullscreen_lost() {
            info!("lost exclusive fullscreen");
            self.events.push_back(GsEvent::ExclusiveFullscreenLost);
            return Ok(PresentResult::FrameSkipped);
        }

        if self.config.vsync.is_enabled() && self.timer.is_enabled() {
            self.timer.pop(&mut self.backend);
        }

        let id = self.backend.surface_texture()?;
        let (width, height) = self.backend.surface_size();
        let surface = Texture::new(
            id,
            TextureDesc {
                width,
                height,
                levels: 1,
                format: TextureFormat::Color,
                ty: TextureType::RenderTarget,
            },
        );
        self.clear_render_target(&surface, PRESENT_CLEAR_COLOR);
        self.state.set_render_targets(&mut self.backend, Some(&surface), None, None);
        Ok(PresentResult::Ok)
    }

    /// Presents the surface bound by [`Self::present_frame`].
    ///
    /// A failed present is not returned; it queues [`GsEvent::DeviceLost`].
    pub fn end_frame(&mut self) {
        let vsync = self.config.vsync.is_enabled();
        if !vsync && self.timer.is_enabled() {
            self.timer.pop(&mut self.backend);
        }

        match self.backend.present(vsync) {
            Ok(()) => self.stats.inc_presents(),
            Err(err) => {
                error!(%err, "present failed");
                self.events.push_back(GsEvent::DeviceLost(err.to_string()));
            }
        }

        if self.timer.is_enabled() {
            self.timer.kick(&mut self.backend);
        }

        self.state.set_render_targets(&mut self.backend, None, None, None);
    }

    pub fn resize_window(&mut self, width: u32, height: u32) {
        if !self.backend.has_surface() || self.backend.surface_size() == (width, height) {
            return;
        }
        debug!(width, height, "resizing window surface");
        self.backend.resize_surface(width, height);
    }

    pub fn set_vsync(&mut self, mode: VsyncMode) {
        if self.config.vsync != mode {
            debug!(?mode, "vsync changed");
            self.config.vsync = mode;
        }
    }

    pub fn drain_events(&mut self) -> Vec<GsEvent> {
        self.events.drain(..).collect()
    }

    /// Creates or destroys the timestamp ring.
    pub fn set_gpu_timing_enabled(&mut self, enabled: bool) -> Result<(), GsError> {
        if enabled {
            self.timer.create(&mut self.backend)
        } else {
            self.timer.destroy(&mut self.backend);
            Ok(())
        }
    }

    /// GPU milliseconds measured since the previous call.
    pub fn take_accumulated_gpu_time(&mut self) -> f32 {
        self.timer.take_accumulated()
    }
}
