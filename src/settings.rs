use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::render::{Budget, FitMode, PagePart, RenderConfig, ViewportSize};

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "slide-cache";
const BYTES_PER_MIB: i64 = 1 << 20;

/// External rendering program, see [`crate::render::ExternalRenderer`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RendererSettings {
    pub command: String,

    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Background render threads per cache
    #[serde(default = "default_render_threads")]
    pub render_threads: usize,

    /// Memory for all cached frames together, negative for unlimited
    #[serde(default = "default_memory_mib")]
    pub memory_mib: i64,

    /// Frames kept per cache, negative for unlimited
    #[serde(default = "default_cache_pages")]
    pub cache_pages: i32,

    #[serde(default)]
    pub fit_mode: FitMode,

    #[serde(default)]
    pub page_part: PagePart,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renderer: Option<RendererSettings>,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_render_threads() -> usize {
    2
}

fn default_memory_mib() -> i64 {
    100
}

fn default_cache_pages() -> i32 {
    -1
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            render_threads: default_render_threads(),
            memory_mib: default_memory_mib(),
            cache_pages: default_cache_pages(),
            fit_mode: FitMode::default(),
            page_part: PagePart::default(),
            renderer: None,
        }
    }
}

impl Settings {
    /// Memory limit in bytes, `None` when unlimited
    #[must_use]
    pub fn memory_bytes(&self) -> Option<i64> {
        (self.memory_mib >= 0).then(|| self.memory_mib.saturating_mul(BYTES_PER_MIB))
    }

    /// Budget for a single cache owning the whole memory allowance
    #[must_use]
    pub fn budget(&self) -> Budget {
        Budget::new(self.memory_bytes(), Some(self.cache_pages))
    }

    #[must_use]
    pub fn render_config(&self, viewport: ViewportSize) -> RenderConfig {
        RenderConfig::new(self.fit_mode, self.page_part, viewport)
    }
}

pub fn preferred_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

/// Load settings from `path`, or from the default location.
///
/// A missing default file is created with default values. Unreadable or
/// malformed files are logged and replaced by defaults in memory.
pub fn load_settings(path: Option<&Path>) -> Settings {
    if let Some(path) = path {
        return load_settings_from_path(path).unwrap_or_default();
    }

    let Some(path) = preferred_config_path() else {
        warn!("Could not determine config directory, using default settings");
        return Settings::default();
    };
    if path.exists() {
        return load_settings_from_path(&path).unwrap_or_default();
    }

    info!("Settings file not found, creating with defaults at {path:?}");
    let settings = Settings::default();
    save_settings_to_file(&settings, &path);
    settings
}

pub fn load_settings_from_path(path: &Path) -> Option<Settings> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            error!("Failed to read settings file {path:?}: {e}");
            return None;
        }
    };

    match serde_yaml::from_str::<Settings>(&content) {
        Ok(mut settings) => {
            debug!("Loaded settings from {path:?}");
            if settings.version < CURRENT_VERSION {
                migrate_settings(&mut settings);
                save_settings_to_file(&settings, path);
            }
            Some(settings)
        }
        Err(e) => {
            error!("Failed to parse settings file {path:?}: {e}");
            None
        }
    }
}

fn migrate_settings(settings: &mut Settings) {
    info!(
        "Migrating settings from v{} to v{}",
        settings.version, CURRENT_VERSION
    );
    settings.version = CURRENT_VERSION;
}

pub fn save_settings_to_file(settings: &Settings, path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create config directory {parent:?}: {e}");
                return;
            }
        }
    }

    let body = match serde_yaml::to_string(settings) {
        Ok(body) => body,
        Err(e) => {
            error!("Failed to serialize settings: {e}");
            return;
        }
    };

    match fs::write(path, format!("{SETTINGS_HEADER}{body}")) {
        Ok(()) => debug!("Saved settings to {path:?}"),
        Err(e) => error!("Failed to save settings to {path:?}: {e}"),
    }
}

const SETTINGS_HEADER: &str = r#"# ============================================================================
# slide-cache settings
# ============================================================================
# memory_mib and cache_pages accept -1 for "unlimited".
# fit_mode: page | width | height
# page_part: full_page | left_half | right_half
#
# External renderer example (must print a PNG to stdout):
#   renderer:
#     command: mutool
#     arguments: ["draw", "-F", "png", "-o", "-", "-r", "%dpi", "%file", "%page"]
#
# %page is zero-based; add one in a wrapper script for one-based tools.

"#;
