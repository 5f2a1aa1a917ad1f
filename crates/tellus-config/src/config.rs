//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level renderer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Planet surface rendering settings.
    pub surface: SurfaceConfig,
    /// Empirical LOD tuning constants.
    pub tuning: TuningConfig,
}

/// Planet surface rendering configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SurfaceConfig {
    /// Enable specular reflection from water surfaces.
    pub surface_reflect: bool,
    /// Enable specular ripple animation (only meaningful with `surface_reflect`).
    pub surface_ripple: bool,
    /// Enable night-side city light masks.
    pub surface_lights: bool,
    /// Allocate tile textures in the managed pool instead of the default pool.
    pub managed_tiles: bool,
    /// Eagerly load all high-resolution tile textures at startup.
    pub preload_mode: bool,
    /// Background tile loader wake-up rate in Hz.
    pub planet_load_frequency: u32,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            surface_reflect: true,
            surface_ripple: false,
            surface_lights: true,
            managed_tiles: true,
            preload_mode: false,
            planet_load_frequency: 20,
        }
    }
}

/// Empirical constants of the LOD traversal.
///
/// The tilt and rate-limit coefficients were tuned on real planetary data
/// sets; they are exposed here so they can be adjusted for different
/// hardware without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TuningConfig {
    /// Maximum supported patch subdivision level (hard cap 14).
    pub max_patch_level: u32,
    /// Capacity of the asynchronous tile load queue.
    pub load_queue_size: usize,
    /// Obliqueness factor above which descent stops (`adist > rad·(f·ctilt + bias)`).
    pub tilt_descend_factor: f64,
    /// Obliqueness factor above which the coarse ancestor texture is used.
    pub tilt_coarse_factor: f64,
    /// Additive bias term of both obliqueness thresholds.
    pub tilt_bias: f64,
    /// Initial coefficient of the camera-motion rate limiter
    /// (`limit = coeff · 2^(-max_patch_level)`).
    pub rate_limit_coeff: f64,
    /// Suppress specular reflection on tiles past the terminator.
    pub night_side_specular_cutoff: bool,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            max_patch_level: 14,
            load_queue_size: 16,
            tilt_descend_factor: 2.0,
            tilt_coarse_factor: 4.2,
            tilt_bias: 0.3,
            rate_limit_coeff: 5.12,
            night_side_specular_cutoff: false,
        }
    }
}

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("tellus.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            tracing::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            tracing::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `tellus.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("tellus.ron");
        let pretty = ron::ser::PrettyConfig::new().depth_limit(2);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(2))
                .unwrap();
        assert!(ron_str.contains("planet_load_frequency: 20"));
        assert!(ron_str.contains("max_patch_level: 14"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        // Config missing the `tuning` section entirely
        let ron_str = "(surface: ())";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.tuning, TuningConfig::default());
    }

    #[test]
    fn test_tuning_defaults_match_shipped_constants() {
        let tuning = TuningConfig::default();
        assert_eq!(tuning.tilt_descend_factor, 2.0);
        assert_eq!(tuning.tilt_coarse_factor, 4.2);
        assert_eq!(tuning.tilt_bias, 0.3);
        assert_eq!(tuning.rate_limit_coeff, 5.12);
    }

    #[test]
    fn test_load_or_create_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let created = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(created, Config::default());
        assert!(dir.path().join("tellus.ron").exists());

        // second call reads the file back
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(loaded, created);
    }

    #[test]
    fn test_save_and_reload_custom_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.surface.preload_mode = true;
        config.tuning.load_queue_size = 10;
        config.save(dir.path()).unwrap();

        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert!(loaded.surface.preload_mode);
        assert_eq!(loaded.tuning.load_queue_size, 10);
    }
}
