use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const SETTINGS_FILE_NAME: &str = "fluid_settings.json";

pub const DEGRADED_DYE_RESOLUTION: u32 = 512;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid fluid config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to access settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("fluid config overrides must be a JSON object")]
    NotAnObject,
    #[error("invalid hex color {0:?}, expected #rrggbb")]
    InvalidHexColor(String),
    #[error("unknown quality preset {0:?}, expected low, medium or high")]
    UnknownQuality(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BackColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl BackColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn normalized(self) -> [f32; 4] {
        [
            self.r as f32 / 255.0,
            self.g as f32 / 255.0,
            self.b as f32 / 255.0,
            1.0,
        ]
    }
}

impl FromStr for BackColor {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::InvalidHexColor(s.to_string()));
        }
        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| ConfigError::InvalidHexColor(s.to_string()))
        };
        Ok(Self::new(channel(0)?, channel(2)?, channel(4)?))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColorInput {
    Hex(String),
    Rgb(BackColor),
}

impl ColorInput {
    pub fn resolve(self) -> Result<BackColor, ConfigError> {
        match self {
            Self::Hex(hex) => hex.parse(),
            Self::Rgb(color) => Ok(color),
        }
    }
}

impl From<&str> for ColorInput {
    fn from(s: &str) -> Self {
        Self::Hex(s.to_string())
    }
}

impl From<String> for ColorInput {
    fn from(s: String) -> Self {
        Self::Hex(s)
    }
}

impl From<BackColor> for ColorInput {
    fn from(color: BackColor) -> Self {
        Self::Rgb(color)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityPreset {
    pub sim_resolution: u32,
    pub dye_resolution: u32,
}

impl Quality {
    pub fn preset(self) -> QualityPreset {
        match self {
            Self::Low => QualityPreset {
                sim_resolution: 64,
                dye_resolution: 512,
            },
            Self::Medium => QualityPreset {
                sim_resolution: 128,
                dye_resolution: 1024,
            },
            Self::High => QualityPreset {
                sim_resolution: 256,
                dye_resolution: 2048,
            },
        }
    }
}

impl FromStr for Quality {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(ConfigError::UnknownQuality(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FluidConfig {
    pub sim_resolution: u32,
    pub dye_resolution: u32,
    pub capture_resolution: u32,
    pub density_dissipation: f32,
    pub velocity_dissipation: f32,
    pub pressure: f32,
    pub pressure_iterations: u32,
    pub curl: f32,
    pub splat_radius: f32,
    pub splat_force: f32,
    pub shading: bool,
    pub colorful: bool,
    pub color_update_speed: f32,
    pub paused: bool,
    pub back_color: BackColor,
    pub transparent: bool,
    pub bloom: bool,
    pub bloom_iterations: u32,
    pub bloom_resolution: u32,
    pub bloom_intensity: f32,
    pub bloom_threshold: f32,
    pub bloom_soft_knee: f32,
    pub sunrays: bool,
    pub sunrays_resolution: u32,
    pub sunrays_weight: f32,
}

impl Default for FluidConfig {
    fn default() -> Self {
        Self {
            sim_resolution: 128,
            dye_resolution: 1024,
            capture_resolution: 512,
            density_dissipation: 1.0,
            velocity_dissipation: 0.2,
            pressure: 0.8,
            pressure_iterations: 20,
            curl: 30.0,
            splat_radius: 0.25,
            splat_force: 6000.0,
            shading: true,
            colorful: true,
            color_update_speed: 10.0,
            paused: false,
            back_color: BackColor::new(0, 0, 0),
            transparent: false,
            bloom: true,
            bloom_iterations: 8,
            bloom_resolution: 256,
            bloom_intensity: 0.8,
            bloom_threshold: 0.6,
            bloom_soft_knee: 0.7,
            sunrays: true,
            sunrays_resolution: 196,
            sunrays_weight: 1.0,
        }
    }
}

impl FluidConfig {
    /// Defaults with every key present in `overrides` replaced wholesale.
    /// Keys the config doesn't know are logged and dropped.
    pub fn merged(overrides: &Value) -> Result<Self, ConfigError> {
        let mut base = serde_json::to_value(Self::default())?;
        match (overrides, &mut base) {
            (Value::Null, _) => {}
            (Value::Object(supplied), Value::Object(defaults)) => {
                for (key, value) in supplied {
                    if defaults.contains_key(key) {
                        defaults.insert(key.clone(), value.clone());
                    } else {
                        warn!("Ignoring unknown fluid config key {key:?}");
                    }
                }
            }
            _ => return Err(ConfigError::NotAnObject),
        }
        Ok(serde_json::from_value(base)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let overrides: Value = serde_json::from_str(json)?;
        Self::merged(&overrides)
    }

    pub fn apply_quality(&mut self, quality: Quality) {
        let preset = quality.preset();
        self.sim_resolution = preset.sim_resolution;
        self.dye_resolution = preset.dye_resolution;
    }

    pub fn degrade_for_missing_linear_filtering(&mut self) {
        self.dye_resolution = self.dye_resolution.min(DEGRADED_DYE_RESOLUTION);
        self.shading = false;
        self.bloom = false;
        self.sunrays = false;
    }

    /// Repairs only values no frame could run with: zero resolutions or
    /// iteration counts and non-finite numbers. Everything else is kept as
    /// supplied.
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        for resolution in [
            &mut self.sim_resolution,
            &mut self.dye_resolution,
            &mut self.capture_resolution,
            &mut self.bloom_resolution,
            &mut self.sunrays_resolution,
        ] {
            *resolution = (*resolution).max(1);
        }
        self.pressure_iterations = self.pressure_iterations.max(1);
        self.bloom_iterations = self.bloom_iterations.max(1);

        let pairs = [
            (&mut self.density_dissipation, defaults.density_dissipation),
            (&mut self.velocity_dissipation, defaults.velocity_dissipation),
            (&mut self.pressure, defaults.pressure),
            (&mut self.curl, defaults.curl),
            (&mut self.splat_radius, defaults.splat_radius),
            (&mut self.splat_force, defaults.splat_force),
            (&mut self.color_update_speed, defaults.color_update_speed),
            (&mut self.bloom_intensity, defaults.bloom_intensity),
            (&mut self.bloom_threshold, defaults.bloom_threshold),
            (&mut self.bloom_soft_knee, defaults.bloom_soft_knee),
            (&mut self.sunrays_weight, defaults.sunrays_weight),
        ];
        for (value, fallback) in pairs {
            if !value.is_finite() {
                warn!("Replacing non-finite fluid config value {value} with {fallback}");
                *value = fallback;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostSettings {
    pub quality: Option<Quality>,
    pub interaction: bool,
    pub simulation: Value,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            quality: None,
            interaction: true,
            simulation: Value::Object(Default::default()),
        }
    }
}

impl HostSettings {
    pub fn default_path() -> PathBuf {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(SETTINGS_FILE_NAME)
    }

    pub fn load_from_disk(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&data)?;
        Ok(settings)
    }

    pub fn save_to_disk(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn fluid_config(&self) -> Result<FluidConfig, ConfigError> {
        let mut config = FluidConfig::merged(&self.simulation)?;
        if let Some(quality) = self.quality {
            config.apply_quality(quality);
        }
        config.sanitize();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_overrides_yield_defaults() {
        assert_eq!(FluidConfig::merged(&json!({})).unwrap(), FluidConfig::default());
        assert_eq!(FluidConfig::merged(&Value::Null).unwrap(), FluidConfig::default());
    }

    #[test]
    fn supplied_keys_override_and_others_keep_defaults() {
        let merged = FluidConfig::merged(&json!({
            "SIM_RESOLUTION": 64,
            "CURL": 12.5,
            "BLOOM": false,
            "BACK_COLOR": { "r": 10, "g": 20, "b": 30 },
        }))
        .unwrap();

        let expected = FluidConfig {
            sim_resolution: 64,
            curl: 12.5,
            bloom: false,
            back_color: BackColor::new(10, 20, 30),
            ..FluidConfig::default()
        };
        assert_eq!(merged, expected);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let merged = FluidConfig::merged(&json!({ "NOT_A_KEY": 1, "PAUSED": true })).unwrap();
        assert!(merged.paused);
        assert_eq!(
            FluidConfig {
                paused: false,
                ..merged
            },
            FluidConfig::default()
        );
    }

    #[test]
    fn non_object_overrides_are_rejected() {
        assert!(matches!(
            FluidConfig::merged(&json!([1, 2, 3])),
            Err(ConfigError::NotAnObject)
        ));
        assert!(matches!(
            FluidConfig::merged(&json!({ "CURL": "lots" })),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn hex_colors_parse_per_channel() {
        let color: BackColor = "#1a2b3c".parse().unwrap();
        assert_eq!(color, BackColor::new(26, 43, 60));
        let bare: BackColor = "FF0080".parse().unwrap();
        assert_eq!(bare, BackColor::new(255, 0, 128));
        assert!("#12345".parse::<BackColor>().is_err());
        assert!("#zz0000".parse::<BackColor>().is_err());
    }

    #[test]
    fn quality_names_map_to_presets() {
        assert_eq!("low".parse::<Quality>().unwrap().preset().sim_resolution, 64);
        assert_eq!("HIGH".parse::<Quality>().unwrap().preset().dye_resolution, 2048);
        assert!("ultra".parse::<Quality>().is_err());
    }

    #[test]
    fn degrade_turns_effects_off() {
        let mut config = FluidConfig::default();
        config.degrade_for_missing_linear_filtering();
        assert_eq!(config.dye_resolution, DEGRADED_DYE_RESOLUTION);
        assert!(!config.shading && !config.bloom && !config.sunrays);
    }

    #[test]
    fn sanitize_only_repairs_degenerate_values() {
        let mut config = FluidConfig::default();
        config.sanitize();
        assert_eq!(config, FluidConfig::default());

        let mut unusual = FluidConfig::from_json_str(
            r#"{"SIM_RESOLUTION":4,"CURL":150,"PRESSURE":1.2,"SPLAT_FORCE":60000,"SUNRAYS_WEIGHT":3.0}"#,
        )
        .unwrap();
        let supplied = unusual.clone();
        unusual.sanitize();
        assert_eq!(unusual, supplied);

        config.pressure_iterations = 0;
        config.dye_resolution = 0;
        config.curl = f32::NAN;
        config.bloom_intensity = f32::INFINITY;
        config.sanitize();
        assert_eq!(config.pressure_iterations, 1);
        assert_eq!(config.dye_resolution, 1);
        assert_eq!(config.curl, FluidConfig::default().curl);
        assert_eq!(config.bloom_intensity, FluidConfig::default().bloom_intensity);
    }

    #[test]
    fn conversions_keep_the_underlying_error() {
        fn read(path: &Path) -> Result<String, ConfigError> {
            Ok(fs::read_to_string(path)?)
        }
        let missing = std::env::temp_dir().join("fluid-backdrop-missing/none.json");
        let err = read(&missing).unwrap_err();
        assert!(matches!(&err, ConfigError::Io(io) if io.kind() == std::io::ErrorKind::NotFound));
        assert!(err.to_string().starts_with("failed to access settings file: "));
        assert!(std::error::Error::source(&err).is_some());

        let err = FluidConfig::from_json_str("{ nope").unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
        assert!(err.to_string().starts_with("invalid fluid config: "));
        assert_eq!(
            ConfigError::InvalidHexColor("#12".into()).to_string(),
            "invalid hex color \"#12\", expected #rrggbb"
        );
    }

    #[test]
    fn host_settings_survive_disk() {
        let dir = std::env::temp_dir().join(format!("fluid-backdrop-{}", std::process::id()));
        let path = dir.join("settings.json");
        let settings = HostSettings {
            quality: Some(Quality::Low),
            interaction: false,
            simulation: json!({ "SUNRAYS": false }),
        };
        settings.save_to_disk(&path).unwrap();
        let loaded = HostSettings::load_from_disk(&path).unwrap();
        let _ = std::fs::remove_dir_all(&dir);

        let config = loaded.fluid_config().unwrap();
        assert!(!loaded.interaction);
        assert!(!config.sunrays);
        assert_eq!(config.sim_resolution, 64);
        assert_eq!(config.dye_resolution, 512);
    }
}
