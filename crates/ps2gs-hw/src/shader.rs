//! Shader permutations, the compiled-variant cache and shader source lookup.

use std::fmt;
use std::path::PathBuf;

use hashbrown::HashMap;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_128;

use crate::error::GsError;
use crate::hal::{GsBackend, ShaderId};

/// Bumped whenever the shader interface changes in a way that invalidates
/// externally cached binaries.
pub const SHADER_CACHE_VERSION: u32 = 44;

/// Resource names read at device creation.
pub const REQUIRED_SHADER_SOURCES: [&str; 6] = ["tfx", "convert", "present", "merge", "interlace", "shadeboost"];
/// Compiled lazily on first use.
pub const FXAA_SHADER_SOURCE: &str = "common/fxaa";
/// Optional; CAS is reported as unsupported when missing.
pub const CAS_SHADER_SOURCE: &str = "cas";
const CAS_INCLUDES: [(&str, &str); 2] = [
    ("#include \"ffx_a.h\"", "common/ffx_a"),
    ("#include \"ffx_cas.h\"", "common/ffx_cas"),
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeatureLevel {
    Level10_0,
    Level10_1,
    #[default]
    Level11_0,
}

impl FeatureLevel {
    /// Value of the `SHADER_MODEL` macro.
    pub fn shader_model(self) -> u32 {
        match self {
            FeatureLevel::Level10_0 => 0x400,
            FeatureLevel::Level10_1 => 0x401,
            FeatureLevel::Level11_0 => 0x500,
        }
    }

    pub fn supports_compute(self) -> bool {
        self >= FeatureLevel::Level11_0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
    Compute,
}

/// Ordered preprocessor definitions passed alongside a shader source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ShaderMacros {
    defines: Vec<(String, String)>,
}

impl ShaderMacros {
    /// Empty list without a `SHADER_MODEL` entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// List seeded with `SHADER_MODEL` for `level`.
    pub fn for_level(level: FeatureLevel) -> Self {
        let mut macros = Self::new();
        macros.add("SHADER_MODEL", format_args!("{:#x}", level.shader_model()));
        macros
    }

    pub fn add(&mut self, name: &str, value: impl fmt::Display) -> &mut Self {
        self.defines.push((name.to_owned(), value.to_string()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.defines
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.defines.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.defines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defines.is_empty()
    }

    fn hash(&self) -> u128 {
        let mut flat = String::new();
        for (name, value) in &self.defines {
            flat.push_str(name);
            flat.push('=');
            flat.push_str(value);
            flat.push('\n');
        }
        xxh3_128(flat.as_bytes())
    }
}

/// Identity of one compiled shader variant.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderCacheKey {
    pub source_hash: u128,
    pub source_length: usize,
    pub macro_hash: u128,
    pub entry_point: String,
    pub stage: ShaderStage,
    pub level: FeatureLevel,
}

impl ShaderCacheKey {
    pub fn new(
        stage: ShaderStage,
        level: FeatureLevel,
        source: &str,
        macros: &ShaderMacros,
        entry_point: &str,
    ) -> Self {
        Self {
            source_hash: xxh3_128(source.as_bytes()),
            source_length: source.len(),
            macro_hash: macros.hash(),
            entry_point: entry_point.to_owned(),
            stage,
            level,
        }
    }
}

/// Memoizes compiled shader handles by [`ShaderCacheKey`].
#[derive(Debug)]
pub struct ShaderCache {
    level: FeatureLevel,
    entries: HashMap<ShaderCacheKey, ShaderId>,
    /// Variants compiled while the cache is disabled, kept for release.
    uncached: Vec<ShaderId>,
    disabled: bool,
    hits: u64,
    misses: u64,
}

impl ShaderCache {
    pub fn new(level: FeatureLevel, disabled: bool) -> Self {
        if disabled {
            debug!("shader variant cache disabled");
        }
        Self {
            level,
            entries: HashMap::new(),
            uncached: Vec::new(),
            disabled,
            hits: 0,
            misses: 0,
        }
    }

    pub fn feature_level(&self) -> FeatureLevel {
        self.level
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Live compiled variants.
    pub fn len(&self) -> usize {
        self.entries.len() + self.uncached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_or_compile<B: GsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        stage: ShaderStage,
        source: &str,
        macros: &ShaderMacros,
        entry_point: &str,
    ) -> Result<ShaderId, GsError> {
        let key = ShaderCacheKey::new(stage, self.level, source, macros, entry_point);
        if !self.disabled {
            if let Some(id) = self.entries.get(&key) {
                self.hits += 1;
                return Ok(*id);
            }
        }

        self.misses += 1;
        let id = backend.compile_shader(stage, source, macros, entry_point).map_err(|err| {
            warn!(entry_point, ?stage, %err, "shader compilation failed");
            err
        })?;
        debug!(entry_point, ?stage, shader = %id, "compiled shader variant");
        if self.disabled {
            self.uncached.push(id);
        } else {
            self.entries.insert(key, id);
        }
        Ok(id)
    }

    /// Destroys every cached shader.
    pub fn clear<B: GsBackend + ?Sized>(&mut self, backend: &mut B) {
        for (_, id) in self.entries.drain() {
            backend.destroy_shader(id);
        }
        for id in self.uncached.drain(..) {
            backend.destroy_shader(id);
        }
    }
}

/// Shader text lookup by resource name (`"tfx"`, `"common/fxaa"`, ...).
pub trait ShaderSource {
    fn read(&self, name: &str) -> Option<String>;
}

/// Reads `<root>/<name>.<ext>`, with the `common/` sources resolved relative
/// to `root`'s parent.
#[derive(Clone, Debug)]
pub struct DirShaderSource {
    root: PathBuf,
    ext: String,
}

impl DirShaderSource {
    pub fn new(root: impl Into<PathBuf>, ext: &str) -> Self {
        Self {
            root: root.into(),
            ext: ext.trim_start_matches('.').to_owned(),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        match name.strip_prefix("common/") {
            Some(common) => {
                let base = self.root.parent().unwrap_or(&self.root);
                base.join("common").join(common)
            }
            None => self.root.join(name),
        }
    }
}

impl ShaderSource for DirShaderSource {
    fn read(&self, name: &str) -> Option<String> {
        let stem = self.path_for(name);
        for ext in [self.ext.as_str(), "fx", "hlsl", "h"] {
            let path = stem.with_extension(ext);
            match std::fs::read_to_string(&path) {
                Ok(text) => return Some(text),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to read shader source");
                    return None;
                }
            }
        }
        None
    }
}

/// In-memory sources, mostly for tests and embedded builds.
#[derive(Clone, Debug, Default)]
pub struct MemoryShaderSource {
    sources: HashMap<String, String>,
}

impl MemoryShaderSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every source the device needs, each a one-line placeholder.
    pub fn with_placeholders() -> Self {
        let mut sources = Self::new();
        for name in REQUIRED_SHADER_SOURCES
            .into_iter()
            .chain([FXAA_SHADER_SOURCE, CAS_SHADER_SOURCE])
            .chain(CAS_INCLUDES.map(|(_, name)| name))
        {
            sources.insert(name, format!("// {name}\n"));
        }
        if let Some(cas) = sources.sources.get_mut(CAS_SHADER_SOURCE) {
            for (directive, _) in CAS_INCLUDES {
                cas.push_str(directive);
                cas.push('\n');
            }
        }
        sources
    }

    pub fn insert(&mut self, name: &str, text: impl Into<String>) -> &mut Self {
        self.sources.insert(name.to_owned(), text.into());
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.sources.remove(name)
    }
}

impl ShaderSource for MemoryShaderSource {
    fn read(&self, name: &str) -> Option<String> {
        self.sources.get(name).cloned()
    }
}

/// Reads the CAS compute source with its FidelityFX headers inlined.
pub fn cas_shader_source(sources: &dyn ShaderSource) -> Result<String, GsError> {
    let mut text = sources
        .read(CAS_SHADER_SOURCE)
        .ok_or_else(|| GsError::MissingShaderSource(CAS_SHADER_SOURCE.to_owned()))?;
    for (directive, name) in CAS_INCLUDES {
        let Some(pos) = text.find(directive) else {
            continue;
        };
        let header = sources
            .read(name)
            .ok_or_else(|| GsError::MissingShaderSource(name.to_owned()))?;
        text.replace_range(pos..pos + directive.len(), &header);
    }
    Ok(text)
}

/// Entry points of the conversion shader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShaderConvert {
    Copy,
    Rgba8To16Bits,
    Datm1,
    Datm0,
    HdrInit,
    HdrResolve,
    TransparencyFilter,
    Float32To16Bits,
    Float32To32Bits,
    Float32ToRgba8,
    Float16ToRgb5a1,
    Rgba8ToFloat32,
    Rgba8ToFloat24,
    Rgba8ToFloat16,
    Rgb5a1ToFloat16,
    Rgba8ToFloat32Biln,
    Rgba8ToFloat24Biln,
    Rgba8ToFloat16Biln,
    Rgb5a1ToFloat16Biln,
    DepthCopy,
    RgbaTo8I,
    Clut4,
    Clut8,
    Yuv,
}

impl ShaderConvert {
    pub const ALL: [ShaderConvert; 24] = [
        ShaderConvert::Copy,
        ShaderConvert::Rgba8To16Bits,
        ShaderConvert::Datm1,
        ShaderConvert::Datm0,
        ShaderConvert::HdrInit,
        ShaderConvert::HdrResolve,
        ShaderConvert::TransparencyFilter,
        ShaderConvert::Float32To16Bits,
        ShaderConvert::Float32To32Bits,
        ShaderConvert::Float32ToRgba8,
        ShaderConvert::Float16ToRgb5a1,
        ShaderConvert::Rgba8ToFloat32,
        ShaderConvert::Rgba8ToFloat24,
        ShaderConvert::Rgba8ToFloat16,
        ShaderConvert::Rgb5a1ToFloat16,
        ShaderConvert::Rgba8ToFloat32Biln,
        ShaderConvert::Rgba8ToFloat24Biln,
        ShaderConvert::Rgba8ToFloat16Biln,
        ShaderConvert::Rgb5a1ToFloat16Biln,
        ShaderConvert::DepthCopy,
        ShaderConvert::RgbaTo8I,
        ShaderConvert::Clut4,
        ShaderConvert::Clut8,
        ShaderConvert::Yuv,
    ];

    pub fn entry_point(self) -> &'static str {
        match self {
            ShaderConvert::Copy => "ps_copy",
            ShaderConvert::Rgba8To16Bits => "ps_convert_rgba8_16bits",
            ShaderConvert::Datm1 => "ps_datm1",
            ShaderConvert::Datm0 => "ps_datm0",
            ShaderConvert::HdrInit => "ps_hdr_init",
            ShaderConvert::HdrResolve => "ps_hdr_resolve",
            ShaderConvert::TransparencyFilter => "ps_filter_transparency",
            // The 16 bit variant shares the 32 bit entry point.
            ShaderConvert::Float32To16Bits => "ps_convert_float32_32bits",
            ShaderConvert::Float32To32Bits => "ps_convert_float32_32bits",
            ShaderConvert::Float32ToRgba8 => "ps_convert_float32_rgba8",
            ShaderConvert::Float16ToRgb5a1 => "ps_convert_float16_rgb5a1",
            ShaderConvert::Rgba8ToFloat32 => "ps_convert_rgba8_float32",
            ShaderConvert::Rgba8ToFloat24 => "ps_convert_rgba8_float24",
            ShaderConvert::Rgba8ToFloat16 => "ps_convert_rgba8_float16",
            ShaderConvert::Rgb5a1ToFloat16 => "ps_convert_rgb5a1_float16",
            ShaderConvert::Rgba8ToFloat32Biln => "ps_convert_rgba8_float32_biln",
            ShaderConvert::Rgba8ToFloat24Biln => "ps_convert_rgba8_float24_biln",
            ShaderConvert::Rgba8ToFloat16Biln => "ps_convert_rgba8_float16_biln",
            ShaderConvert::Rgb5a1ToFloat16Biln => "ps_convert_rgb5a1_float16_biln",
            ShaderConvert::DepthCopy => "ps_depth_copy",
            ShaderConvert::RgbaTo8I => "ps_convert_rgba_8i",
            ShaderConvert::Clut4 => "ps_convert_clut_4",
            ShaderConvert::Clut8 => "ps_convert_clut_8",
            ShaderConvert::Yuv => "ps_yuv",
        }
    }

    /// Writes depth instead of color.
    pub fn has_depth_output(self) -> bool {
        matches!(
            self,
            ShaderConvert::Rgba8ToFloat32
                | ShaderConvert::Rgba8ToFloat24
                | ShaderConvert::Rgba8ToFloat16
                | ShaderConvert::Rgb5a1ToFloat16
                | ShaderConvert::Rgba8ToFloat32Biln
                | ShaderConvert::Rgba8ToFloat24Biln
                | ShaderConvert::Rgba8ToFloat16Biln
                | ShaderConvert::Rgb5a1ToFloat16Biln
                | ShaderConvert::DepthCopy
        )
    }

    /// May be used with a linear sampler.
    pub fn supports_bilinear(self) -> bool {
        matches!(
            self,
            ShaderConvert::Copy
                | ShaderConvert::Rgba8ToFloat32Biln
                | ShaderConvert::Rgba8ToFloat24Biln
                | ShaderConvert::Rgba8ToFloat16Biln
                | ShaderConvert::Rgb5a1ToFloat16Biln
                | ShaderConvert::TransparencyFilter
                | ShaderConvert::Yuv
        )
    }

    /// May be used with a point sampler.
    pub fn supports_nearest(self) -> bool {
        !matches!(
            self,
            ShaderConvert::Rgba8ToFloat32Biln
                | ShaderConvert::Rgba8ToFloat24Biln
                | ShaderConvert::Rgba8ToFloat16Biln
                | ShaderConvert::Rgb5a1ToFloat16Biln
        )
    }
}

/// Entry points of the presentation shader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PresentShader {
    Copy,
    Scanline,
    DiagonalFilter,
    TriangularFilter,
    ComplexFilter,
    LottesFilter,
}

impl PresentShader {
    pub const ALL: [PresentShader; 6] = [
        PresentShader::Copy,
        PresentShader::Scanline,
        PresentShader::DiagonalFilter,
        PresentShader::TriangularFilter,
        PresentShader::ComplexFilter,
        PresentShader::LottesFilter,
    ];

    pub fn entry_point(self) -> &'static str {
        match self {
            PresentShader::Copy => "ps_copy",
            PresentShader::Scanline => "ps_filter_scanlines",
            PresentShader::DiagonalFilter => "ps_filter_diagonal",
            PresentShader::TriangularFilter => "ps_filter_triangular",
            PresentShader::ComplexFilter => "ps_filter_complex",
            PresentShader::LottesFilter => "ps_filter_lottes",
        }
    }
}

/// Deinterlacing shaders, compiled from `ps_main0` through `ps_main4`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShaderInterlace {
    Weave,
    Bob,
    Blend,
    MadBuffer,
    MadReconstruct,
}

impl ShaderInterlace {
    pub const ALL: [ShaderInterlace; 5] = [
        ShaderInterlace::Weave,
        ShaderInterlace::Bob,
        ShaderInterlace::Blend,
        ShaderInterlace::MadBuffer,
        ShaderInterlace::MadReconstruct,
    ];

    pub fn entry_point(self) -> String {
        format!("ps_main{}", self as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordingBackend;
    use pretty_assertions::assert_eq;

    #[test]
    fn shader_model_macro() {
        let macros = ShaderMacros::for_level(FeatureLevel::Level10_1);
        assert_eq!(macros.get("SHADER_MODEL"), Some("0x401"));
        assert_eq!(ShaderMacros::for_level(FeatureLevel::Level11_0).get("SHADER_MODEL"), Some("0x500"));
        assert_eq!(FeatureLevel::Level10_0.shader_model(), 0x400);
    }

    #[test]
    fn cache_key_covers_every_input() {
        let mut macros = ShaderMacros::for_level(FeatureLevel::Level11_0);
        macros.add("PS_FOG", 1);
        let base = ShaderCacheKey::new(ShaderStage::Pixel, FeatureLevel::Level11_0, "src", &macros, "ps_main");

        let mut other = macros.clone();
        other.add("PS_DATE", 3);
        assert_ne!(
            base,
            ShaderCacheKey::new(ShaderStage::Pixel, FeatureLevel::Level11_0, "src", &other, "ps_main")
        );
        assert_ne!(
            base,
            ShaderCacheKey::new(ShaderStage::Pixel, FeatureLevel::Level11_0, "src2", &macros, "ps_main")
        );
        assert_ne!(
            base,
            ShaderCacheKey::new(ShaderStage::Vertex, FeatureLevel::Level11_0, "src", &macros, "ps_main")
        );
        assert_eq!(
            base,
            ShaderCacheKey::new(ShaderStage::Pixel, FeatureLevel::Level11_0, "src", &macros, "ps_main")
        );
    }

    #[test]
    fn cache_compiles_once_per_variant() {
        let mut backend = RecordingBackend::new();
        let mut cache = ShaderCache::new(FeatureLevel::Level11_0, false);
        let macros = ShaderMacros::for_level(FeatureLevel::Level11_0);

        let a = cache
            .get_or_compile(&mut backend, ShaderStage::Pixel, "src", &macros, "ps_copy")
            .unwrap();
        let b = cache
            .get_or_compile(&mut backend, ShaderStage::Pixel, "src", &macros, "ps_copy")
            .unwrap();
        assert_eq!(a, b);
        assert_eq!((cache.hits(), cache.misses()), (1, 1));

        cache.clear(&mut backend);
        assert!(cache.is_empty());
    }

    #[test]
    fn disabled_cache_recompiles() {
        let mut backend = RecordingBackend::new();
        let mut cache = ShaderCache::new(FeatureLevel::Level11_0, true);
        let macros = ShaderMacros::new();
        let a = cache
            .get_or_compile(&mut backend, ShaderStage::Compute, "src", &macros, "main")
            .unwrap();
        let b = cache
            .get_or_compile(&mut backend, ShaderStage::Compute, "src", &macros, "main")
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.misses(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn cas_headers_are_inlined() {
        let mut sources = MemoryShaderSource::new();
        sources
            .insert("cas", "#include \"ffx_a.h\"\n#include \"ffx_cas.h\"\nvoid main() {}\n")
            .insert("common/ffx_a", "// a")
            .insert("common/ffx_cas", "// cas");
        assert_eq!(cas_shader_source(&sources).unwrap(), "// a\n// cas\nvoid main() {}\n");

        sources.remove("common/ffx_cas");
        assert!(matches!(
            cas_shader_source(&sources),
            Err(GsError::MissingShaderSource(name)) if name == "common/ffx_cas"
        ));
    }

    #[test]
    fn entry_point_names() {
        assert_eq!(ShaderConvert::Float32To16Bits.entry_point(), "ps_convert_float32_32bits");
        assert_eq!(ShaderConvert::Rgb5a1ToFloat16Biln.entry_point(), "ps_convert_rgb5a1_float16_biln");
        assert!(ShaderConvert::DepthCopy.has_depth_output());
        assert!(!ShaderConvert::Rgba8ToFloat16Biln.supports_nearest());
        assert_eq!(PresentShader::LottesFilter.entry_point(), "ps_filter_lottes");
        assert_eq!(ShaderInterlace::MadReconstruct.entry_point(), "ps_main4");
        assert_eq!(ShaderConvert::ALL.len(), 24);
    }
}
