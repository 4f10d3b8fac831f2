//! Per-frame display chain: merge, deinterlace, then the optional filters.
//!
//! The chain owns one render target per stage and tracks which of them holds
//! the latest output. Filters that read and write the same size ping-pong
//! between the temp and merge targets.

use tracing::{debug, error, warn};

use crate::device::GsDevice;
use crate::error::GsError;
use crate::hal::{GsBackend, IntRect, RectF};
use crate::postfx::{cas_setup, GsRegExtbuf, GsRegPmode, InterlaceConstants};
use crate::shader::{ShaderConvert, ShaderInterlace};
use crate::texture::{Texture, TextureFormat, TextureType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainTarget {
    Merge,
    WeaveBob,
    Blend,
    Mad,
    Temp,
    Cas,
}

impl ChainTarget {
    const COUNT: usize = 6;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterlaceMode {
    Weave,
    Bob,
    Blend,
    /// Motion adaptive, keeps four fields in a double-height target.
    Mad,
}

impl InterlaceMode {
    /// Maps the renderer's mode index; anything unknown disables deinterlacing.
    pub fn from_index(mode: u32) -> Option<Self> {
        match mode {
            0 => Some(InterlaceMode::Weave),
            1 => Some(InterlaceMode::Bob),
            2 => Some(InterlaceMode::Blend),
            3 => Some(InterlaceMode::Mad),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct DisplayChain {
    targets: [Option<Texture>; ChainTarget::COUNT],
    current: Option<ChainTarget>,
    mad_buf_idx: u32,
}

impl DisplayChain {
    pub fn target(&self, slot: ChainTarget) -> Option<&Texture> {
        self.targets[slot as usize].as_ref()
    }

    pub fn current(&self) -> Option<ChainTarget> {
        self.current
    }

    pub fn current_texture(&self) -> Option<&Texture> {
        self.current.and_then(|slot| self.target(slot))
    }

    /// Field history index of the MAD deinterlacer.
    pub fn mad_buffer_index(&self) -> u32 {
        self.mad_buf_idx
    }

    fn advance_mad(&mut self, field: u32) -> u32 {
        self.mad_buf_idx = (((self.mad_buf_idx + 1) & !1) | (field & 1)) & 3;
        self.mad_buf_idx
    }

    /// Destination for a same-size filter pass.
    fn ping_pong_target(&self) -> ChainTarget {
        if self.current == Some(ChainTarget::Temp) {
            ChainTarget::Merge
        } else {
            ChainTarget::Temp
        }
    }
}

/// Destination of an interlace pass into a `width` x `height` target.
///
/// The MAD buffer step fills one half of its double-height history: the top
/// for `buf_idx` 0 and 1, the bottom for 2 and 3.
pub(crate) fn interlace_dst_rect(shader: ShaderInterlace, buf_idx: u32, width: f32, height: f32, yoffset: f32) -> RectF {
    let mut rect = RectF::new(0.0, yoffset, width, height + yoffset);
    if shader == ShaderInterlace::MadBuffer {
        let half = height * 0.5;
        if buf_idx >> 1 == 1 {
            rect.top += half;
        } else {
            rect.bottom -= half;
        }
    }
    rect
}

impl<B: GsBackend> GsDevice<B> {
    pub fn display_chain(&self) -> &DisplayChain {
        &self.chain
    }

    pub fn current(&self) -> Option<&Texture> {
        self.chain.current_texture()
    }

    /// Releases every chain target.
    pub fn clear_current(&mut self) {
        for slot in 0..ChainTarget::COUNT {
            if let Some(texture) = self.chain.targets[slot].take() {
                self.destroy_texture(texture);
            }
        }
        self.chain.current = None;
    }

    /// Makes the chain target `slot` a `width` x `height` render target.
    ///
    /// A target of the right size is kept (and invalidated unless
    /// `preserve`). Otherwise a new one is fetched with the old format, the
    /// old contents are stretched into it when `preserve`, and the old
    /// target is recycled or destroyed.
    pub fn resize_render_target(
        &mut self,
        slot: ChainTarget,
        width: u32,
        height: u32,
        preserve: bool,
        recycle: bool,
    ) -> Result<Texture, GsError> {
        let orig = self.chain.targets[slot as usize];
        if let Some(orig) = orig {
            if orig.size() == (width, height) {
                if !preserve {
                    self.invalidate_render_target(&orig);
                }
                return Ok(orig);
            }
        }

        let format = orig.map_or(TextureFormat::Color, |t| t.format());
        let really_preserve = preserve && orig.is_some();
        let new = self
            .fetch_surface(TextureType::RenderTarget, width, height, 1, format, !really_preserve, true)
            .inspect_err(|err| error!(?slot, width, height, %err, "chain target allocation failed"))?;

        if let Some(orig) = orig {
            if really_preserve {
                self.stretch_rect(&orig, RectF::UNIT, &new, orig.rect().to_f32(), ShaderConvert::Copy, true)?;
            }
            if recycle {
                self.recycle(orig);
            } else {
                self.destroy_texture(orig);
            }
        }

        debug!(?slot, width, height, "resized chain target");
        self.chain.targets[slot as usize] = Some(new);
        Ok(new)
    }

    /// Composites the display circuits into a `fs` sized merge target and
    /// makes it current.
    #[allow(clippy::too_many_arguments)]
    pub fn merge(
        &mut self,
        src: [Option<&Texture>; 3],
        s_rect: [RectF; 3],
        d_rect: [RectF; 3],
        fs: (u32, u32),
        pmode: GsRegPmode,
        extbuf: GsRegExtbuf,
        c: [f32; 4],
    ) -> Result<(), GsError> {
        let merge = self.resize_render_target(ChainTarget::Merge, fs.0, fs.1, false, false)?;
        let linear = self.config.pcrtc_offsets;
        self.do_merge(src, s_rect, &merge, d_rect, pmode, extbuf, c, linear)?;
        self.chain.current = Some(ChainTarget::Merge);
        Ok(())
    }

    fn interlace_pass(
        &mut self,
        src: &Texture,
        dst: &Texture,
        shader: ShaderInterlace,
        linear: bool,
        yoffset: f32,
        buf_idx: u32,
    ) -> Result<(), GsError> {
        let (w, h) = (dst.width() as f32, dst.height() as f32);
        let d_rect = interlace_dst_rect(shader, buf_idx, w, h, yoffset);
        let cb = InterlaceConstants::new(buf_idx, h);
        self.do_interlace(src, RectF::UNIT, dst, d_rect, shader, linear, &cb)
    }

    /// Deinterlaces the merge target into a `ds` sized output.
    ///
    /// `mode` follows [`InterlaceMode::from_index`]; unknown modes leave the
    /// merge target current.
    pub fn interlace(&mut self, ds: (u32, u32), field: u32, mode: u32, yoffset: f32) -> Result<(), GsError> {
        let Some(merge) = self.chain.target(ChainTarget::Merge).copied() else {
            debug!("no merge output to deinterlace");
            return Ok(());
        };
        let field = field & 1;
        let offset = if self.config.disable_interlace_offset {
            0.0
        } else {
            yoffset * field as f32
        };
        let (w, h) = ds;

        let current = match InterlaceMode::from_index(mode) {
            Some(InterlaceMode::Weave) => {
                let weave = self.resize_render_target(ChainTarget::WeaveBob, w, h, true, false)?;
                self.interlace_pass(&merge, &weave, ShaderInterlace::Weave, false, offset, field)?;
                ChainTarget::WeaveBob
            }
            Some(InterlaceMode::Bob) => {
                let bob = self.resize_render_target(ChainTarget::WeaveBob, w, h, true, false)?;
                let offset = yoffset * (1 - field) as f32;
                self.interlace_pass(&merge, &bob, ShaderInterlace::Bob, true, offset, 0)?;
                ChainTarget::WeaveBob
            }
            Some(InterlaceMode::Blend) => {
                let weave = self.resize_render_target(ChainTarget::WeaveBob, w, h, true, false)?;
                self.interlace_pass(&merge, &weave, ShaderInterlace::Weave, false, offset, field)?;
                let blend = self.resize_render_target(ChainTarget::Blend, w, h, true, false)?;
                self.interlace_pass(&weave, &blend, ShaderInterlace::Blend, false, 0.0, 0)?;
                ChainTarget::Blend
            }
            Some(InterlaceMode::Mad) => {
                let buf_idx = self.chain.advance_mad(field);
                let mad = self.resize_render_target(ChainTarget::Mad, w, h * 2, true, false)?;
                self.interlace_pass(&merge, &mad, ShaderInterlace::MadBuffer, false, offset, buf_idx)?;
                let blend = self.resize_render_target(ChainTarget::Blend, w, h, true, false)?;
                self.interlace_pass(&mad, &blend, ShaderInterlace::MadReconstruct, false, 0.0, buf_idx)?;
                ChainTarget::Blend
            }
            None => ChainTarget::Merge,
        };
        self.chain.current = Some(current);
        Ok(())
    }

    pub fn fxaa(&mut self) -> Result<(), GsError> {
        let Some(src) = self.chain.current_texture().copied() else {
            return Ok(());
        };
        let slot = self.chain.ping_pong_target();
        let dst = self.resize_render_target(slot, src.width(), src.height(), false, false)?;
        self.do_fxaa(&src, &dst)?;
        self.chain.current = Some(slot);
        Ok(())
    }

    pub fn shade_boost(&mut self) -> Result<(), GsError> {
        let Some(src) = self.chain.current_texture().copied() else {
            return Ok(());
        };
        let slot = self.chain.ping_pong_target();
        let dst = self.resize_render_target(slot, src.width(), src.height(), false, false)?;
        let params = self.config.shade_boost_params();
        self.do_shade_boost(&src, &dst, params)?;
        self.chain.current = Some(slot);
        Ok(())
    }

    /// Upscales the current output by the smallest integer multiple that
    /// covers `width` x `height`.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), GsError> {
        let Some(src) = self.chain.current_texture().copied() else {
            return Ok(());
        };
        let (base_w, base_h) = src.size();
        let mut multiplier = 1;
        let (mut w, mut h) = (base_w, base_h);
        while width > w || height > h {
            multiplier += 1;
            w = base_w * multiplier;
            h = base_h * multiplier;
        }

        let slot = self.chain.ping_pong_target();
        let dst = self.resize_render_target(slot, w, h, false, false)?;
        self.stretch_rect(&src, RectF::UNIT, &dst, RectF::from_size(w, h), ShaderConvert::Copy, false)?;
        self.chain.current = Some(slot);
        Ok(())
    }

    /// Sharpens (and with `sharpen_only == false`, upscales to `draw_rect`)
    /// the display texture before presentation.
    ///
    /// On success `tex`, `src_rect` and `src_uv` describe the whole CAS
    /// output; on any failure they are left untouched.
    pub fn cas(
        &mut self,
        tex: &mut Texture,
        src_rect: &mut IntRect,
        src_uv: &mut RectF,
        draw_rect: RectF,
        sharpen_only: bool,
    ) {
        let (dst_width, dst_height) = if sharpen_only {
            (src_rect.width().max(1) as u32, src_rect.height().max(1) as u32)
        } else {
            (
                draw_rect.width().ceil().max(1.0) as u32,
                draw_rect.height().ceil().max(1.0) as u32,
            )
        };

        let slot = ChainTarget::Cas as usize;
        let cas = match self.chain.targets[slot] {
            Some(cas) if cas.size() == (dst_width, dst_height) => cas,
            existing => {
                if let Some(old) = existing {
                    self.chain.targets[slot] = None;
                    self.destroy_texture(old);
                }
                match self.create_surface(TextureType::RWTexture, dst_width, dst_height, 1, TextureFormat::Color) {
                    Ok(cas) => {
                        self.chain.targets[slot] = Some(cas);
                        cas
                    }
                    Err(err) => {
                        error!(dst_width, dst_height, %err, "failed to allocate CAS target");
                        return;
                    }
                }
            }
        };

        let sharpness = f32::from(self.config.cas_sharpness) * 0.01;
        let mut consts = cas_setup(
            sharpness,
            src_rect.width() as f32,
            src_rect.height() as f32,
            dst_width as f32,
            dst_height as f32,
        );
        consts[8] = src_rect.left as u32;
        consts[9] = src_rect.top as u32;

        if let Err(err) = self.do_cas(tex, &cas, sharpen_only, &consts) {
            warn!(%err, "failed to apply CAS");
            return;
        }

        *tex = cas;
        *src_rect = IntRect::from_size(dst_width, dst_height);
        *src_uv = RectF::UNIT;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mad_index_follows_field() {
        let mut chain = DisplayChain::default();
        let seen: Vec<u32> = [0, 1, 0, 1, 1].iter().map(|&f| chain.advance_mad(f)).collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 1]);
    }

    #[test]
    fn ping_pong_avoids_reading_destination() {
        let mut chain = DisplayChain::default();
        assert_eq!(chain.ping_pong_target(), ChainTarget::Temp);
        chain.current = Some(ChainTarget::Temp);
        assert_eq!(chain.ping_pong_target(), ChainTarget::Merge);
    }

    #[test]
    fn mad_buffer_writes_one_half() {
        let top = interlace_dst_rect(ShaderInterlace::MadBuffer, 1, 64.0, 64.0, 0.0);
        assert_eq!(top, RectF::new(0.0, 0.0, 64.0, 32.0));
        let bottom = interlace_dst_rect(ShaderInterlace::MadBuffer, 2, 64.0, 64.0, 0.5);
        assert_eq!(bottom, RectF::new(0.0, 32.5, 64.0, 64.5));
        let weave = interlace_dst_rect(ShaderInterlace::Weave, 3, 64.0, 32.0, 0.0);
        assert_eq!(weave, RectF::new(0.0, 0.0, 64.0, 32.0));
    }

    #[test]
    fn unknown_interlace_mode() {
        assert_eq!(InterlaceMode::from_index(3), Some(InterlaceMode::Mad));
        assert_eq!(InterlaceMode::from_index(7), None);
    }
}
