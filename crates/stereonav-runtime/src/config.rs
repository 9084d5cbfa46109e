//! Steersman configuration, persisted as TOML.
//!
//! ```toml
//! [geometry]
//! name = "robot"
//! body_width_mm = 450.0
//! # ...
//! [[geometry.cameras]]
//! baseline_mm = 120.0
//! # ...
//! [sampling]
//! radius_major_mm = 400.0
//! # ...
//! [buffer]
//! no_of_grids = 2
//! grid_type = "simple"
//! # ...
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use stereonav_memory::MetagridConfig;
use stereonav_perception::{RobotGeometry, SamplingEnvelope};
use stereonav_perception::geometry::DEFAULT_DISPARITY_SIGMA_PX;
use stereonav_types::NavError;

/// Everything a [`Steersman`][crate::Steersman] needs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SteersmanConfig {
    #[serde(default)]
    pub geometry: RobotGeometry,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub buffer: MetagridConfig,
}

/// Candidate sampling and scoring parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_radius_major")]
    pub radius_major_mm: f32,
    #[serde(default = "default_radius_minor")]
    pub radius_minor_mm: f32,
    #[serde(default = "default_sample_count")]
    pub sample_count: usize,
    #[serde(default = "default_max_pan_var")]
    pub max_pan_var_deg: f32,
    #[serde(default)]
    pub max_tilt_var_deg: f32,
    #[serde(default)]
    pub max_roll_var_deg: f32,
    /// Disparity noise used when a caller passes no uncertainty.
    #[serde(default = "default_disparity_sigma")]
    pub disparity_sigma_px: f32,
    /// Localisation is refused when the owning slot holds fewer evidence
    /// cells than this.
    #[serde(default = "default_min_evidence")]
    pub min_evidence_cells: usize,
    /// Minimum `(peak - mean) / peak` of the score field.
    #[serde(default = "default_min_peak_contrast")]
    pub min_peak_contrast: f32,
    /// Scoring threads; `0` shares rayon's global pool.
    #[serde(default)]
    pub worker_threads: usize,
    /// Fixed rng seed for reproducible sampling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_radius_major() -> f32 {
    400.0
}
fn default_radius_minor() -> f32 {
    300.0
}
fn default_sample_count() -> usize {
    400
}
fn default_max_pan_var() -> f32 {
    2.0
}
fn default_disparity_sigma() -> f32 {
    DEFAULT_DISPARITY_SIGMA_PX
}
fn default_min_evidence() -> usize {
    50
}
fn default_min_peak_contrast() -> f32 {
    0.1
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            radius_major_mm: default_radius_major(),
            radius_minor_mm: default_radius_minor(),
            sample_count: default_sample_count(),
            max_pan_var_deg: default_max_pan_var(),
            max_tilt_var_deg: 0.0,
            max_roll_var_deg: 0.0,
            disparity_sigma_px: default_disparity_sigma(),
            min_evidence_cells: default_min_evidence(),
            min_peak_contrast: default_min_peak_contrast(),
            worker_threads: 0,
            seed: None,
        }
    }
}

impl SamplingConfig {
    pub fn envelope(&self) -> SamplingEnvelope {
        SamplingEnvelope {
            radius_major_mm: self.radius_major_mm,
            radius_minor_mm: self.radius_minor_mm,
            max_pan_var: self.max_pan_var_deg.to_radians(),
            max_tilt_var: self.max_tilt_var_deg.to_radians(),
            max_roll_var: self.max_roll_var_deg.to_radians(),
        }
    }

    pub fn validate(&self) -> Result<(), NavError> {
        self.envelope().validate()?;
        if self.sample_count == 0 {
            return Err(NavError::invalid("sample count must be at least 1"));
        }
        if !(self.disparity_sigma_px.is_finite() && self.disparity_sigma_px > 0.0) {
            return Err(NavError::invalid("disparity sigma must be positive"));
        }
        if !(0.0..1.0).contains(&self.min_peak_contrast) {
            return Err(NavError::invalid("minimum peak contrast must lie in [0, 1)"));
        }
        Ok(())
    }
}

impl SteersmanConfig {
    pub fn validate(&self) -> Result<(), NavError> {
        self.geometry.validate()?;
        self.sampling.validate()?;
        self.buffer.validate()
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(raw: &str) -> Result<Self, NavError> {
        let cfg: Self = toml::from_str(raw).map_err(|e| NavError::Config(format!("failed to parse config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml_string(&self) -> Result<String, NavError> {
        toml::to_string_pretty(self).map_err(|e| NavError::Config(format!("failed to serialise config: {e}")))
    }

    pub fn load_from(path: &Path) -> Result<Self, NavError> {
        let raw = fs::read_to_string(path).map_err(|e| NavError::io(path, e))?;
        Self::from_toml_str(&raw)
    }

    /// Write the configuration, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<(), NavError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| NavError::io(parent, e))?;
        }
        let raw = self.to_toml_string()?;
        fs::write(path, raw).map_err(|e| NavError::io(path, e))
    }
}
