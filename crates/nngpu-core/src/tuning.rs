//! Shader configuration cache.
//!
//! Maps an operator-shape signature to a tuned dispatch configuration
//! (local workgroup size and output tile block size). The cache is seeded
//! lazily, on first lookup, from an ordered list of `TuningSource`s; the
//! process-wide instance returned by [`TuningCache::global`] is seeded from
//! the built-in table only.

use crate::types::OperationType;
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};
use tracing::{debug, warn};

/// Tuned dispatch configuration for one operator shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShaderConfig {
    pub local_size_x: u32,
    pub local_size_y: u32,
    pub local_size_z: u32,
    pub block_width: u32,
    pub block_height: u32,
    pub block_depth: u32,
}

impl ShaderConfig {
    pub const fn new(local_size: [u32; 3], block: [u32; 3]) -> Self {
        Self {
            local_size_x: local_size[0],
            local_size_y: local_size[1],
            local_size_z: local_size[2],
            block_width: block[0],
            block_height: block[1],
            block_depth: block[2],
        }
    }

    /// All-zero configuration produced for strings that do not parse.
    pub const UNUSABLE: ShaderConfig = ShaderConfig::new([0; 3], [0; 3]);

    /// Parse a `type<N>_lsz<x>_<y>_<z>_block<bw>_<bh>_<bd>` configuration string.
    ///
    /// No error is raised: any deviation from the grammar (missing or extra
    /// token, wrong tag, non-numeric field) yields [`ShaderConfig::UNUSABLE`].
    /// Check [`ShaderConfig::is_usable`] before using the result as a divisor.
    pub fn parse(text: &str) -> Self {
        const GRAMMAR: [&str; 7] = ["type", "lsz", "", "", "block", "", ""];

        let tokens: Vec<&str> = text.split('_').collect();
        if tokens.len() != GRAMMAR.len() {
            return Self::UNUSABLE;
        }

        let mut values = [0u32; 7];
        for ((value, token), tag) in values.iter_mut().zip(&tokens).zip(GRAMMAR) {
            match token.strip_prefix(tag).and_then(|digits| digits.parse().ok()) {
                Some(parsed) => *value = parsed,
                None => return Self::UNUSABLE,
            }
        }

        // The kernel-type number does not affect the dispatch.
        let [_kernel_type, lx, ly, lz, bw, bh, bd] = values;
        Self::new([lx, ly, lz], [bw, bh, bd])
    }

    /// Whether every field is positive.
    pub fn is_usable(&self) -> bool {
        self.local_size().iter().all(|&v| v > 0) && self.block().iter().all(|&v| v > 0)
    }

    pub fn local_size(&self) -> [u32; 3] {
        [self.local_size_x, self.local_size_y, self.local_size_z]
    }

    pub fn block(&self) -> [u32; 3] {
        [self.block_width, self.block_height, self.block_depth]
    }
}

impl fmt::Display for ShaderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type0_lsz{}_{}_{}_block{}_{}_{}",
            self.local_size_x,
            self.local_size_y,
            self.local_size_z,
            self.block_width,
            self.block_height,
            self.block_depth
        )
    }
}

/// The shape/parameter tuple that identifies a tuned configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderSignature {
    pub op_type: OperationType,
    pub batch: u32,
    pub in_h: u32,
    pub in_w: u32,
    pub in_c: u32,
    pub out_h: u32,
    pub out_w: u32,
    pub out_c: u32,
    pub filter_h: u32,
    pub filter_w: u32,
    pub pad_h: u32,
    pub pad_w: u32,
    pub stride_h: u32,
    pub stride_w: u32,
    pub activation: u32,
    pub has_bias: bool,
}

impl ShaderSignature {
    /// Canonical cache key. Depends on the signature fields only.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ShaderSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "optype{}_batch{}_in{}x{}x{}_out{}x{}x{}_filter{}x{}_pad{}x{}_stride{}x{}_act{}_bias{}",
            self.op_type.code(),
            self.batch,
            self.in_h,
            self.in_w,
            self.in_c,
            self.out_h,
            self.out_w,
            self.out_c,
            self.filter_h,
            self.filter_w,
            self.pad_h,
            self.pad_w,
            self.stride_h,
            self.stride_w,
            self.activation,
            u8::from(self.has_bias)
        )
    }
}

/// Built-in `(signature, configuration)` table compiled into the driver.
///
/// Shapes are the MobileNet-v1 224x224 stem and a few depthwise stages.
/// The last entry repeats a key; the first entry for a key wins.
pub const BUILTIN_TUNING_TABLE: &[(&str, &str)] = &[
    (
        "optype3_batch1_in224x224x3_out112x112x32_filter3x3_pad0x0_stride2x2_act0_bias1",
        "type0_lsz1_64_1_block4_4_1",
    ),
    (
        "optype3_batch1_in112x112x32_out112x112x64_filter1x1_pad0x0_stride1x1_act0_bias1",
        "type0_lsz4_32_1_block4_4_1",
    ),
    (
        "optype3_batch1_in56x56x128_out56x56x128_filter1x1_pad0x0_stride1x1_act0_bias1",
        "type0_lsz8_16_1_block4_4_1",
    ),
    (
        "optype3_batch1_in28x28x256_out28x28x256_filter1x1_pad0x0_stride1x1_act0_bias1",
        "type0_lsz8_16_1_block4_2_1",
    ),
    (
        "optype3_batch1_in14x14x512_out14x14x512_filter1x1_pad0x0_stride1x1_act0_bias1",
        "type0_lsz16_8_1_block4_2_1",
    ),
    (
        "optype3_batch1_in7x7x1024_out7x7x1024_filter1x1_pad0x0_stride1x1_act0_bias1",
        "type0_lsz16_4_1_block4_1_1",
    ),
    (
        "optype4_batch1_in112x112x32_out112x112x32_filter3x3_pad1x1_stride1x1_act0_bias1",
        "type1_lsz8_8_4_block1_1_1",
    ),
    (
        "optype4_batch1_in56x56x128_out56x56x128_filter3x3_pad1x1_stride1x1_act0_bias1",
        "type1_lsz8_8_4_block1_1_1",
    ),
    (
        "optype4_batch1_in14x14x512_out14x14x512_filter3x3_pad1x1_stride1x1_act0_bias1",
        "type1_lsz4_4_16_block1_1_1",
    ),
    (
        "optype25_batch1_in1x1x1001_out1x1x1001_filter0x0_pad0x0_stride0x0_act0_bias0",
        "type2_lsz1_1_1_block1_1_1",
    ),
    (
        "optype3_batch1_in224x224x3_out112x112x32_filter3x3_pad0x0_stride2x2_act0_bias1",
        "type0_lsz1_16_1_block1_1_1",
    ),
];

/// A source of `(signature, configuration-string)` pairs.
pub trait TuningSource: Send + Sync {
    /// Name used in log messages.
    fn name(&self) -> &str;

    /// All pairs, in priority order.
    fn entries(&self) -> Result<Vec<(String, String)>>;
}

/// In-memory table source.
pub struct TableSource {
    name: String,
    entries: Vec<(String, String)>,
}

impl TableSource {
    pub fn new(name: &str, entries: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            entries: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// The table compiled into the driver.
    pub fn builtin() -> Self {
        Self::new("builtin", BUILTIN_TUNING_TABLE)
    }
}

impl TuningSource for TableSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn entries(&self) -> Result<Vec<(String, String)>> {
        Ok(self.entries.clone())
    }
}

/// Text file source: one `<signature> <configuration>` pair per line,
/// blank lines and `#` comments ignored.
pub struct FileSource {
    path: PathBuf,
    name: String,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path.display().to_string();
        Self { path, name }
    }
}

impl TuningSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn entries(&self) -> Result<Vec<(String, String)>> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::InvalidArgument(format!(
                "cannot read tuning file {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(parse_tuning_lines(&text))
    }
}

fn parse_tuning_lines(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (Some(signature), Some(config)) => {
                    Some((signature.to_string(), config.to_string()))
                }
                _ => {
                    warn!(line, "skipping malformed tuning line");
                    None
                }
            }
        })
        .collect()
}

/// Lazily seeded signature → configuration map.
///
/// Seeding happens once, under the write lock, on the first lookup; later
/// lookups only take the read lock.
pub struct TuningCache {
    sources: Vec<Box<dyn TuningSource>>,
    map: RwLock<Option<HashMap<String, ShaderConfig>>>,
}

static GLOBAL_CACHE: OnceLock<Arc<TuningCache>> = OnceLock::new();

impl TuningCache {
    /// Cache seeded from `sources`, in order.
    pub fn new(sources: Vec<Box<dyn TuningSource>>) -> Self {
        Self {
            sources,
            map: RwLock::new(None),
        }
    }

    /// Cache seeded from the built-in table.
    pub fn builtin() -> Self {
        Self::new(vec![Box::new(TableSource::builtin())])
    }

    /// Cache with no entries; every lookup misses.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// The process-wide cache, seeded from the built-in table.
    pub fn global() -> Arc<TuningCache> {
        Arc::clone(GLOBAL_CACHE.get_or_init(|| Arc::new(TuningCache::builtin())))
    }

    fn load(&self) -> HashMap<String, ShaderConfig> {
        let mut map = HashMap::new();
        for source in &self.sources {
            let entries = match source.entries() {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(source = source.name(), error = %e, "skipping tuning source");
                    continue;
                }
            };
            let before = map.len();
            for (signature, config) in entries {
                map.entry(signature)
                    .or_insert_with(|| ShaderConfig::parse(&config));
            }
            debug!(
                source = source.name(),
                added = map.len() - before,
                "loaded tuning source"
            );
        }
        map
    }

    fn with_map<T>(&self, f: impl Fn(&HashMap<String, ShaderConfig>) -> T) -> T {
        if let Ok(guard) = self.map.read()
            && let Some(map) = guard.as_ref()
        {
            return f(map);
        }

        let mut guard = self.map.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let map = guard.get_or_insert_with(|| self.load());
        f(map)
    }

    /// Look up the configuration recorded for a signature.
    ///
    /// The returned configuration is as parsed; it may contain zero fields.
    pub fn lookup(&self, signature: &str) -> Option<ShaderConfig> {
        self.with_map(|map| map.get(signature).copied())
    }

    /// Look up a signature, falling back to `default` on a miss or when the
    /// recorded configuration is unusable.
    pub fn lookup_or(&self, signature: &str, default: ShaderConfig) -> ShaderConfig {
        match self.lookup(signature) {
            Some(config) if config.is_usable() => config,
            Some(config) => {
                warn!(signature, %config, "tuned configuration has zero fields, using default");
                default
            }
            None => {
                debug!(signature, %default, "tuning cache miss");
                default
            }
        }
    }

    /// Number of distinct signatures (seeds the cache if needed).
    pub fn len(&self) -> usize {
        self.with_map(HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
