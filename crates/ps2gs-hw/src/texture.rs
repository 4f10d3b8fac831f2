//! Texture handles and the recycling pool.

use std::collections::VecDeque;

use crate::hal::{IntRect, TextureDesc, TextureId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureType {
    RenderTarget,
    DepthStencil,
    Texture,
    /// Storage texture written by compute passes.
    RWTexture,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// RGBA8 unorm.
    Color,
    /// RGBA16 float, used for colclip emulation.
    HDRColor,
    DepthStencil,
    UNorm8,
    UInt16,
    UInt32,
    /// Single-channel float holding the first primitive that passed.
    PrimID,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::Color => 4,
            TextureFormat::HDRColor => 8,
            TextureFormat::DepthStencil => 4,
            TextureFormat::UNorm8 => 1,
            TextureFormat::UInt16 => 2,
            TextureFormat::UInt32 => 4,
            TextureFormat::PrimID => 4,
        }
    }

    pub fn is_depth(self) -> bool {
        self == TextureFormat::DepthStencil
    }
}

/// Upper bound on generated mip chains.
pub const MAXIMUM_TEXTURE_MIPMAP_LEVELS: u32 = 7;

/// Number of levels for an automatically mipmapped texture of the given size.
pub fn mipmap_levels_for_size(width: u32, height: u32) -> u32 {
    let largest = width.max(height).max(1);
    (largest.ilog2() + 1).min(MAXIMUM_TEXTURE_MIPMAP_LEVELS)
}

/// A live backend texture.
///
/// Handles are plain values; ownership is tracked by the device and its pool,
/// which destroy the backing object when a texture ages out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Texture {
    pub(crate) id: TextureId,
    pub(crate) desc: TextureDesc,
}

impl Texture {
    pub(crate) fn new(id: TextureId, desc: TextureDesc) -> Self {
        Self { id, desc }
    }

    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn size(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    pub fn levels(&self) -> u32 {
        self.desc.levels
    }

    pub fn format(&self) -> TextureFormat {
        self.desc.format
    }

    pub fn ty(&self) -> TextureType {
        self.desc.ty
    }

    pub fn is_render_target(&self) -> bool {
        self.desc.ty == TextureType::RenderTarget
    }

    pub fn is_depth_stencil(&self) -> bool {
        self.desc.ty == TextureType::DepthStencil
    }

    pub fn rect(&self) -> IntRect {
        IntRect::from_size(self.desc.width, self.desc.height)
    }

    pub fn mem_usage(&self) -> u64 {
        let mut total = 0u64;
        let (mut w, mut h) = (u64::from(self.desc.width), u64::from(self.desc.height));
        for _ in 0..self.desc.levels.max(1) {
            total += w * h * u64::from(self.desc.format.bytes_per_pixel());
            w = (w / 2).max(1);
            h = (h / 2).max(1);
        }
        total
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_textures: usize,
    pub max_targets: usize,
    /// Frames a plain texture may sit unused before it is destroyed.
    pub max_texture_age: u32,
    pub max_target_age: u32,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_textures: 300,
            max_targets: 200,
            max_texture_age: 10,
            max_target_age: 20,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct PoolEntry {
    texture: Texture,
    last_frame_used: u32,
}

const TEXTURE_POOL: usize = 0;
const TARGET_POOL: usize = 1;

fn pool_index(ty: TextureType) -> usize {
    match ty {
        TextureType::Texture => TEXTURE_POOL,
        TextureType::RenderTarget | TextureType::DepthStencil | TextureType::RWTexture => TARGET_POOL,
    }
}

/// Frame-aged free lists of textures waiting to be reused.
///
/// The pool never talks to the backend; calls that drop entries hand the
/// evicted textures back so the device can destroy them.
#[derive(Debug, Default)]
pub struct TexturePool {
    pools: [VecDeque<PoolEntry>; 2],
    frame: u32,
    memory_usage: u64,
    limits: PoolLimits,
}

impl TexturePool {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    /// Bytes held by pooled textures.
    pub fn memory_usage(&self) -> u64 {
        self.memory_usage
    }

    pub fn len(&self, ty: TextureType) -> usize {
        self.pools[pool_index(ty)].len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.iter().all(VecDeque::is_empty)
    }

    fn max_size(&self, pool: usize) -> usize {
        if pool == TEXTURE_POOL {
            self.limits.max_textures
        } else {
            self.limits.max_targets
        }
    }

    fn max_age(&self, pool: usize) -> u32 {
        if pool == TEXTURE_POOL {
            self.limits.max_texture_age
        } else {
            self.limits.max_target_age
        }
    }

    /// Removes and returns a pooled texture matching `desc`.
    ///
    /// With `prefer_new`, entries already used this frame are passed over
    /// unless the pool is at capacity, so uploads do not stall on textures the
    /// GPU may still be reading.
    pub fn take(&mut self, desc: &TextureDesc, prefer_new: bool) -> Option<Texture> {
        let pool = pool_index(desc.ty);
        let frame = self.frame;
        let full = self.pools[pool].len() >= self.max_size(pool);
        let entries = &mut self.pools[pool];

        let mut fallback = None;
        let mut found = None;
        for (index, entry) in entries.iter().enumerate() {
            if entry.texture.desc != *desc {
                continue;
            }
            if prefer_new && entry.last_frame_used == frame {
                fallback.get_or_insert(index);
                continue;
            }
            found = Some(index);
            break;
        }

        let index = found.or(if full { fallback } else { None })?;
        let entry = entries.remove(index)?;
        self.memory_usage = self.memory_usage.saturating_sub(entry.texture.mem_usage());
        Some(entry.texture)
    }

    /// Returns `texture` to the pool, handing back entries trimmed to stay
    /// under the size limit.
    #[must_use]
    pub fn recycle(&mut self, texture: Texture) -> Vec<Texture> {
        let pool = pool_index(texture.ty());
        let max_size = self.max_size(pool);
        let max_age = self.max_age(pool);
        let frame = self.frame;

        self.memory_usage += texture.mem_usage();
        self.pools[pool].push_front(PoolEntry {
            texture,
            last_frame_used: frame,
        });

        let mut evicted = Vec::new();
        while self.pools[pool].len() > max_size {
            let Some(back) = self.pools[pool].back() else {
                break;
            };
            if frame.wrapping_sub(back.last_frame_used) < max_age {
                break;
            }
            if let Some(entry) = self.pools[pool].pop_back() {
                self.memory_usage = self.memory_usage.saturating_sub(entry.texture.mem_usage());
                evicted.push(entry.texture);
            }
        }
        evicted
    }

    /// Advances the frame counter and hands back entries that aged out.
    #[must_use]
    pub fn age(&mut self) -> Vec<Texture> {
        self.frame = self.frame.wrapping_add(1);
        let frame = self.frame;

        let mut evicted = Vec::new();
        for pool in [TEXTURE_POOL, TARGET_POOL] {
            let max_age = self.max_age(pool);
            while let Some(back) = self.pools[pool].back() {
                if frame.wrapping_sub(back.last_frame_used) < max_age {
                    break;
                }
                if let Some(entry) = self.pools[pool].pop_back() {
                    evicted.push(entry.texture);
                }
            }
        }
        for texture in &evicted {
            self.memory_usage = self.memory_usage.saturating_sub(texture.mem_usage());
        }
        evicted
    }

    /// Empties both pools.
    #[must_use]
    pub fn purge(&mut self) -> Vec<Texture> {
        self.memory_usage = 0;
        self.pools
            .iter_mut()
            .flat_map(|pool| pool.drain(..))
            .map(|entry| entry.texture)
            .collect()
    }
}
