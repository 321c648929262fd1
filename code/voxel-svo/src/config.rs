//! Runtime configuration, loadable from TOML. Every section has defaults so
//! a partial file (or none) is valid.

use crate::error::{Result, SvoError};
use crate::tracer::ViewMode;
use crate::{MAX_LEVEL, check_level};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub build: BuildConfig,
    pub tracer: TracerConfig,
    pub camera: CameraConfig,
}

/// Voxelization and octree construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Level used when none is given on the command line.
    pub level: u32,
    /// Multiplier on the per-triangle coverage bound.
    pub fragment_coverage_factor: f64,
    pub min_fragment_capacity: u64,
    pub max_fragment_capacity: u64,
    /// Upper bound on the node pool allocation.
    pub max_node_pool_bytes: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            level: 10,
            fragment_coverage_factor: 1.0,
            min_fragment_capacity: 1 << 10,
            max_fragment_capacity: 1 << 24,
            max_node_pool_bytes: 1 << 28,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    pub view_mode: ViewMode,
    pub beam_enable: bool,
    /// Pixels per beam tile edge.
    pub beam_size: u32,
    /// Frames in flight.
    pub frame_count: u32,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            view_mode: ViewMode::Diffuse,
            beam_enable: true,
            beam_size: 8,
            frame_count: 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub position: [f32; 3],
    /// Radians around +Y; zero looks down +Z.
    pub yaw: f32,
    pub pitch: f32,
    /// Vertical field of view in degrees.
    pub fov: f32,
    pub speed: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            position: [0.5, 0.5, 2.5],
            yaw: std::f32::consts::PI,
            pitch: 0.0,
            fov: 60.0,
            speed: 0.0625,
        }
    }
}

impl Config {
    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SvoError::Config(format!("{}: {e}", path.display())))?;
        let config = Self::from_toml(&text)?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| SvoError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_level(self.build.level).map_err(|_| {
            SvoError::Config(format!("build.level must be in 1..={MAX_LEVEL}, got {}", self.build.level))
        })?;
        let b = &self.build;
        if !(b.fragment_coverage_factor > 0.0) {
            return Err(SvoError::Config("build.fragment_coverage_factor must be positive".into()));
        }
        if b.min_fragment_capacity > b.max_fragment_capacity {
            return Err(SvoError::Config(
                "build.min_fragment_capacity exceeds build.max_fragment_capacity".into(),
            ));
        }
        if b.max_fragment_capacity > u32::MAX as u64 {
            return Err(SvoError::Config("build.max_fragment_capacity must fit in 32 bits".into()));
        }
        if self.tracer.beam_size == 0 {
            return Err(SvoError::Config("tracer.beam_size must be non-zero".into()));
        }
        if self.tracer.frame_count == 0 {
            return Err(SvoError::Config("tracer.frame_count must be non-zero".into()));
        }
        if !(1.0..=179.0).contains(&self.camera.fov) {
            return Err(SvoError::Config(format!("camera.fov {} outside 1..=179", self.camera.fov)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::from_toml("[build]\nlevel = 6\n[tracer]\nview_mode = \"normal\"\n").unwrap();
        assert_eq!(config.build.level, 6);
        assert_eq!(config.build.max_fragment_capacity, BuildConfig::default().max_fragment_capacity);
        assert_eq!(config.tracer.view_mode, ViewMode::Normal);
        assert!(config.tracer.beam_enable);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(matches!(Config::from_toml("[build]\nlevel = 13\n"), Err(SvoError::Config(_))));
        assert!(matches!(Config::from_toml("[tracer]\nbeam_size = 0\n"), Err(SvoError::Config(_))));
        assert!(matches!(Config::from_toml("[build]\nlevel = \"x\"\n"), Err(SvoError::Config(_))));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        assert_eq!(Config::from_toml(&text).unwrap(), config);
    }
}
