//! Device configuration.
//!
//! [`GsDeviceConfig::default`] matches the stock renderer settings;
//! [`GsDeviceConfig::from_env`] layers a handful of developer toggles on top.

use crate::shader::FeatureLevel;

/// Forward debug groups and markers to the backend.
pub const DEBUG_MARKERS_ENV: &str = "PS2GS_DEBUG_MARKERS";
/// Create the timestamp ring at device creation.
pub const GPU_TIMING_ENV: &str = "PS2GS_GPU_TIMING";
/// Recompile shader variants instead of reusing memoized handles.
pub const DISABLE_SHADER_CACHE_ENV: &str = "PS2GS_DISABLE_SHADER_CACHE";

pub const DEFAULT_VERTEX_BUFFER_SIZE: u32 = 32 * 1024 * 1024;
pub const DEFAULT_INDEX_BUFFER_SIZE: u32 = 16 * 1024 * 1024;
/// Index bytes needed to expand 16383 quads into two triangles each.
pub const EXPAND_INDEX_BUFFER_SIZE: u32 = 2 * 16383 * 6;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VsyncMode {
    #[default]
    Off,
    On,
    /// Tear instead of waiting when a frame misses the interval.
    Adaptive,
}

impl VsyncMode {
    pub fn is_enabled(self) -> bool {
        self != VsyncMode::Off
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GsDeviceConfig {
    pub vertex_buffer_size: u32,
    pub index_buffer_size: u32,
    /// Structured vertex buffer used by shader-side expansion.
    pub expand_buffer_size: u32,
    pub vsync: VsyncMode,
    pub gpu_timing: bool,
    pub debug_markers: bool,
    pub disable_shader_cache: bool,
    /// Sample display circuits with linear filtering when PCRTC offsets are applied.
    pub pcrtc_offsets: bool,
    pub disable_interlace_offset: bool,
    pub shade_boost_brightness: u8,
    pub shade_boost_contrast: u8,
    pub shade_boost_saturation: u8,
    /// 0..=100, mapped onto the CAS sharpness range.
    pub cas_sharpness: u8,
    pub max_anisotropy: u8,
    pub max_texture_size: u32,
    pub prefer_new_textures: bool,
    pub feature_level: FeatureLevel,
}

impl Default for GsDeviceConfig {
    fn default() -> Self {
        Self {
            vertex_buffer_size: DEFAULT_VERTEX_BUFFER_SIZE,
            index_buffer_size: DEFAULT_INDEX_BUFFER_SIZE,
            expand_buffer_size: DEFAULT_VERTEX_BUFFER_SIZE,
            vsync: VsyncMode::Off,
            gpu_timing: false,
            debug_markers: false,
            disable_shader_cache: false,
            pcrtc_offsets: false,
            disable_interlace_offset: false,
            shade_boost_brightness: 50,
            shade_boost_contrast: 50,
            shade_boost_saturation: 50,
            cas_sharpness: 50,
            max_anisotropy: 0,
            max_texture_size: 8192,
            prefer_new_textures: false,
            feature_level: FeatureLevel::Level11_0,
        }
    }
}

impl GsDeviceConfig {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if env_var_truthy(DEBUG_MARKERS_ENV) {
            self.debug_markers = true;
        }
        if env_var_truthy(GPU_TIMING_ENV) {
            self.gpu_timing = true;
        }
        if env_var_truthy(DISABLE_SHADER_CACHE_ENV) {
            self.disable_shader_cache = true;
        }
    }

    /// Shade boost parameters as consumed by the shade boost shader.
    pub fn shade_boost_params(&self) -> [f32; 4] {
        const SCALE: f32 = 1.0 / 50.0;
        [
            f32::from(self.shade_boost_brightness) * SCALE,
            f32::from(self.shade_boost_contrast) * SCALE,
            f32::from(self.shade_boost_saturation) * SCALE,
            0.0,
        ]
    }
}

pub(crate) fn env_var_truthy(name: &str) -> bool {
    let Ok(raw) = std::env::var(name) else {
        return false;
    };

    let v = raw.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stock_sizes() {
        let config = GsDeviceConfig::default();
        assert_eq!(config.vertex_buffer_size, 32 << 20);
        assert_eq!(config.index_buffer_size, 16 << 20);
        assert_eq!(EXPAND_INDEX_BUFFER_SIZE, 196_596);
        assert!(!config.vsync.is_enabled());
    }

    #[test]
    fn neutral_shade_boost_is_identity() {
        let config = GsDeviceConfig::default();
        assert_eq!(config.shade_boost_params(), [1.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn truthy_values() {
        const VAR: &str = "PS2GS_TEST_TRUTHY_VALUE";
        for (value, expected) in [("1", true), (" On ", true), ("YES", true), ("0", false), ("nope", false)] {
            std::env::set_var(VAR, value);
            assert_eq!(env_var_truthy(VAR), expected, "{value:?}");
        }
        std::env::remove_var(VAR);
        assert!(!env_var_truthy(VAR));
    }
}
