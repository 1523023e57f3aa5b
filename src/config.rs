use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::pixel::PixelFormat;
use crate::render::WidthNormalization;

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub render: RenderConfig,
    pub cache: CacheConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    pub worker_threads: usize,
    pub tile_width: u32,
    pub tile_height: u32,
    pub pixel_format: PixelFormat,
    pub width_normalization: WidthNormalization,
    pub grayscale: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            tile_width: 512,
            tile_height: 512,
            pixel_format: PixelFormat::Bgra32,
            width_normalization: WidthNormalization::Off,
            grayscale: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub page_handle_capacity: usize,
    pub tile_cache_max_entries: usize,
    pub tile_cache_memory_budget_mb: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_handle_capacity: 10,
            tile_cache_max_entries: 256,
            tile_cache_memory_budget_mb: 64,
        }
    }
}

impl CacheConfig {
    const MEBIBYTE: usize = 1024 * 1024;

    pub fn tile_cache_memory_budget_bytes(&self) -> usize {
        self.tile_cache_memory_budget_mb
            .saturating_mul(Self::MEBIBYTE)
            .max(1)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    pub fn load() -> AppResult<Self> {
        let Some(path) = default_config_path() else {
            return Ok(Self::default());
        };
        Self::load_from_path(path)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        if !path.is_file() {
            return Err(AppError::invalid_argument(format!(
                "config path is not a regular file: {}",
                path.display()
            )));
        }

        let raw = fs::read_to_string(path).map_err(|source| {
            AppError::io_with_context(source, format!("failed to read config: {}", path.display()))
        })?;
        let parsed = toml::from_str::<Self>(&raw).map_err(|source| {
            AppError::invalid_argument(format!(
                "failed to parse config {}: {source}",
                path.display()
            ))
        })?;
        Ok(parsed.sanitized())
    }

    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        self.render.worker_threads = self.render.worker_threads.max(1);
        if self.render.tile_width == 0 {
            self.render.tile_width = defaults.render.tile_width;
        }
        if self.render.tile_height == 0 {
            self.render.tile_height = defaults.render.tile_height;
        }
        self.cache.page_handle_capacity = self.cache.page_handle_capacity.max(1);
        self.cache.tile_cache_max_entries = self.cache.tile_cache_max_entries.max(1);
        self.cache.tile_cache_memory_budget_mb = self.cache.tile_cache_memory_budget_mb.max(1);
        let level = self.log.level.trim().to_ascii_lowercase();
        self.log.level = if level.is_empty() {
            defaults.log.level
        } else {
            level
        };
        self
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    if let Some(explicit) = std::env::var_os("PVT_CONFIG_PATH")
        && !explicit.is_empty()
    {
        return Some(PathBuf::from(explicit));
    }

    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME")
        && !xdg.is_empty()
    {
        return Some(PathBuf::from(xdg).join("pvt").join("config.toml"));
    }
    if let Some(home) = std::env::var_os("HOME")
        && !home.is_empty()
    {
        return Some(
            PathBuf::from(home)
                .join(".config")
                .join("pvt")
                .join("config.toml"),
        );
    }
    if let Some(appdata) = std::env::var_os("APPDATA")
        && !appdata.is_empty()
    {
        return Some(PathBuf::from(appdata).join("pvt").join("config.toml"));
    }
    None
}
