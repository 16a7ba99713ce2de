//! Engine settings plus the per-game `config.yaml` override layer.
//!
//! [`CacheSettings`] is what the frontend hands the engine; its embedded
//! [`Configuration`] carries the tunables a game directory may override.
//! Overrides are sparse: only keys present in the file replace the global
//! value.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{error, warn};

/// Tunables that a per-game `config.yaml` can override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub dump_texture_pages: bool,
    pub dump_full_texture_pages: bool,
    pub dump_texture_force_alpha_channel: bool,
    pub dump_vram_write_force_alpha_channel: bool,
    pub dump_c16_textures: bool,
    pub reduce_palette_range: bool,
    pub convert_copies_to_writes: bool,
    pub replacement_scale_linear_filter: bool,
    pub max_hash_cache_entries: u32,
    pub max_hash_cache_vram_usage_mb: u32,
    pub max_vram_write_splits: u32,
    pub max_vram_write_coalesce_width: u32,
    pub max_vram_write_coalesce_height: u32,
    pub texture_dump_width_threshold: u32,
    pub texture_dump_height_threshold: u32,
    pub vram_write_dump_width_threshold: u32,
    pub vram_write_dump_height_threshold: u32,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            dump_texture_pages: false,
            dump_full_texture_pages: false,
            dump_texture_force_alpha_channel: false,
            dump_vram_write_force_alpha_channel: true,
            dump_c16_textures: false,
            reduce_palette_range: true,
            convert_copies_to_writes: false,
            replacement_scale_linear_filter: false,
            max_hash_cache_entries: 1200,
            max_hash_cache_vram_usage_mb: 2048,
            max_vram_write_splits: 0,
            max_vram_write_coalesce_width: 0,
            max_vram_write_coalesce_height: 0,
            texture_dump_width_threshold: 16,
            texture_dump_height_threshold: 16,
            vram_write_dump_width_threshold: 128,
            vram_write_dump_height_threshold: 128,
        }
    }
}

/// Everything the engine needs from the frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub enable_texture_replacements: bool,
    pub enable_vram_write_replacements: bool,
    /// Track CPU->VRAM uploads even when nothing currently consumes them.
    pub always_track_uploads: bool,
    /// Decode every replacement image up front instead of on first use.
    pub preload_textures: bool,
    pub dump_textures: bool,
    /// Dump textures that already have a replacement on disk.
    pub dump_replaced_textures: bool,
    pub dump_vram_writes: bool,
    /// Root under which per-game directories live.
    pub textures_root: std::path::PathBuf,
    pub config: Configuration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            enable_texture_replacements: false,
            enable_vram_write_replacements: false,
            always_track_uploads: false,
            preload_textures: false,
            dump_textures: false,
            dump_replaced_textures: true,
            dump_vram_writes: false,
            textures_root: std::path::PathBuf::from("textures"),
            config: Configuration::default(),
        }
    }
}

/// Sparse on-disk form. Key casing follows the established file format, so
/// each field is renamed explicitly.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct LocalConfiguration {
    #[serde(rename = "DumpTexturePages")]
    pub dump_texture_pages: Option<bool>,
    #[serde(rename = "DumpFullTexturePages")]
    pub dump_full_texture_pages: Option<bool>,
    #[serde(rename = "DumpTextureForceAlphaChannel")]
    pub dump_texture_force_alpha_channel: Option<bool>,
    #[serde(rename = "DumpVRAMWriteForceAlphaChannel")]
    pub dump_vram_write_force_alpha_channel: Option<bool>,
    #[serde(rename = "DumpC16Textures")]
    pub dump_c16_textures: Option<bool>,
    #[serde(rename = "ReducePaletteRange")]
    pub reduce_palette_range: Option<bool>,
    #[serde(rename = "ConvertCopiesToWrites")]
    pub convert_copies_to_writes: Option<bool>,
    #[serde(rename = "ReplacementScaleLinearFilter")]
    pub replacement_scale_linear_filter: Option<bool>,
    #[serde(rename = "MaxHashCacheEntries")]
    pub max_hash_cache_entries: Option<u32>,
    #[serde(rename = "MaxHashCacheVRAMUsageMB")]
    pub max_hash_cache_vram_usage_mb: Option<u32>,
    #[serde(rename = "MaxVRAMWriteSplits")]
    pub max_vram_write_splits: Option<u32>,
    #[serde(rename = "MaxVRAMWriteCoalesceWidth")]
    pub max_vram_write_coalesce_width: Option<u32>,
    #[serde(rename = "MaxVRAMWriteCoalesceHeight")]
    pub max_vram_write_coalesce_height: Option<u32>,
    #[serde(rename = "DumpTextureWidthThreshold")]
    pub texture_dump_width_threshold: Option<u32>,
    #[serde(rename = "DumpTextureHeightThreshold")]
    pub texture_dump_height_threshold: Option<u32>,
    #[serde(rename = "DumpVRAMWriteWidthThreshold")]
    pub vram_write_dump_width_threshold: Option<u32>,
    #[serde(rename = "DumpVRAMWriteHeightThreshold")]
    pub vram_write_dump_height_threshold: Option<u32>,
    /// Short name -> real replacement filename.
    #[serde(rename = "Aliases")]
    pub aliases: Option<BTreeMap<String, String>>,
}

impl Configuration {
    /// Applies a sparse override on top of `self`. Returns true if anything
    /// changed.
    pub(crate) fn apply(&mut self, local: &LocalConfiguration) -> bool {
        let before = self.clone();
        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = local.$field { self.$field = v; })*
            };
        }
        merge!(
            dump_texture_pages,
            dump_full_texture_pages,
            dump_texture_force_alpha_channel,
            dump_vram_write_force_alpha_channel,
            dump_c16_textures,
            reduce_palette_range,
            convert_copies_to_writes,
            replacement_scale_linear_filter,
            max_hash_cache_entries,
            max_hash_cache_vram_usage_mb,
            max_vram_write_splits,
            max_vram_write_coalesce_width,
            max_vram_write_coalesce_height,
            texture_dump_width_threshold,
            texture_dump_height_threshold,
            vram_write_dump_width_threshold,
            vram_write_dump_height_threshold,
        );
        *self != before
    }

    /// Commented template written into freshly created game directories.
    /// Every key is present but commented out, showing the global default.
    pub fn yaml_template(&self) -> String {
        let mut out = String::new();
        out.push_str("# Texture replacement configuration.\n");
        out.push_str("# Uncomment a key to override the global setting for this game.\n\n");
        macro_rules! key {
            ($name:literal, $value:expr, $doc:literal) => {
                out.push_str(concat!("# ", $doc, "\n"));
                out.push_str(&format!(concat!("#", $name, ": {}\n\n"), $value));
            };
        }
        key!("DumpTexturePages", self.dump_texture_pages,
            "Dump whole 256x256 texture pages instead of individual uploads.");
        key!("DumpFullTexturePages", self.dump_full_texture_pages,
            "Dump the full page even when only part of it was sampled.");
        key!("DumpTextureForceAlphaChannel", self.dump_texture_force_alpha_channel,
            "Force alpha opaque in dumped textures.");
        key!("DumpVRAMWriteForceAlphaChannel", self.dump_vram_write_force_alpha_channel,
            "Force alpha opaque in dumped VRAM writes.");
        key!("DumpC16Textures", self.dump_c16_textures,
            "Dump direct-color (C16) textures as well as paletted ones.");
        key!("ReducePaletteRange", self.reduce_palette_range,
            "Restrict dumped palettes to the range of indices actually used.");
        key!("ConvertCopiesToWrites", self.convert_copies_to_writes,
            "Treat VRAM-to-VRAM copies as uploads for tracking purposes.");
        key!("ReplacementScaleLinearFilter", self.replacement_scale_linear_filter,
            "Use bilinear filtering when scaling replacement base pages.");
        key!("MaxHashCacheEntries", self.max_hash_cache_entries,
            "Hash cache entry budget before forced eviction.");
        key!("MaxHashCacheVRAMUsageMB", self.max_hash_cache_vram_usage_mb,
            "Hash cache memory budget in mebibytes.");
        key!("MaxVRAMWriteSplits", self.max_vram_write_splits,
            "Number of times a tracked upload may be split before being dropped.");
        key!("MaxVRAMWriteCoalesceWidth", self.max_vram_write_coalesce_width,
            "Maximum width of an upload merged into its predecessor.");
        key!("MaxVRAMWriteCoalesceHeight", self.max_vram_write_coalesce_height,
            "Maximum height of an upload merged into its predecessor.");
        key!("DumpTextureWidthThreshold", self.texture_dump_width_threshold,
            "Minimum width for a texture to be dumped.");
        key!("DumpTextureHeightThreshold", self.texture_dump_height_threshold,
            "Minimum height for a texture to be dumped.");
        key!("DumpVRAMWriteWidthThreshold", self.vram_write_dump_width_threshold,
            "Minimum width for a VRAM write to be dumped.");
        key!("DumpVRAMWriteHeightThreshold", self.vram_write_dump_height_threshold,
            "Minimum height for a VRAM write to be dumped.");
        out.push_str("# Alias short names to replacement filenames.\n");
        out.push_str("#Aliases:\n");
        out.push_str("#  mytex: texupload-P4-ABCDEF0123456789-0123456789ABCDEF-256x256-0-0-128x128\n");
        out
    }
}

/// Parses a game directory's `config.yaml`, if present. Malformed files log
/// and count as absent.
pub(crate) fn load_local_configuration(path: &Path) -> Option<LocalConfiguration> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!("failed to read {}: {err}", path.display());
            return None;
        }
    };
    // A file of nothing but comments deserializes as a null document.
    match serde_yaml::from_str::<Option<LocalConfiguration>>(&text) {
        Ok(local) => Some(local.unwrap_or_default()),
        Err(err) => {
            error!("failed to parse {}: {err}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_shipping_values() {
        let c = Configuration::default();
        assert!(c.dump_vram_write_force_alpha_channel);
        assert!(c.reduce_palette_range);
        assert_eq!(c.max_vram_write_splits, 0);
        assert_eq!(c.max_hash_cache_entries, 1200);
        assert_eq!(c.texture_dump_width_threshold, 16);
        assert_eq!(c.vram_write_dump_width_threshold, 128);
    }

    #[test]
    fn sparse_override_only_touches_present_keys() {
        let local: LocalConfiguration = serde_yaml::from_str(
            "DumpTexturePages: true\nMaxVRAMWriteCoalesceWidth: 256\n",
        )
        .unwrap();
        let mut config = Configuration::default();
        assert!(config.apply(&local));
        assert!(config.dump_texture_pages);
        assert_eq!(config.max_vram_write_coalesce_width, 256);
        // Untouched key keeps its global value.
        assert!(config.reduce_palette_range);
    }

    #[test]
    fn apply_reports_no_change_for_identical_values() {
        let local: LocalConfiguration =
            serde_yaml::from_str("ReducePaletteRange: true\n").unwrap();
        let mut config = Configuration::default();
        assert!(!config.apply(&local));
    }

    #[test]
    fn aliases_parse() {
        let local: LocalConfiguration = serde_yaml::from_str(
            "Aliases:\n  boss: vram-write-00112233445566778899AABBCCDDEEFF\n",
        )
        .unwrap();
        let aliases = local.aliases.unwrap();
        assert_eq!(
            aliases.get("boss").map(String::as_str),
            Some("vram-write-00112233445566778899AABBCCDDEEFF")
        );
    }

    #[test]
    fn template_is_fully_commented_yaml() {
        let template = Configuration::default().yaml_template();
        // Parses as an empty (null) override document.
        let local = serde_yaml::from_str::<Option<LocalConfiguration>>(&template)
            .unwrap()
            .unwrap_or_default();
        assert!(local.dump_texture_pages.is_none());
        assert!(template.contains("#DumpVRAMWriteForceAlphaChannel: true"));
        assert!(template.contains("#MaxVRAMWriteSplits: 0"));
    }
}
