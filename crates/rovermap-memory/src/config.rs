//! Memory configuration.
//!
//! All recognized options with their effects; persisted as TOML.  Defaults
//! follow the behaviour of a mapping (incremental) session with a bounded
//! STM and asynchronous persistence.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::MemoryError;

/// Persisted memory configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum number of non-intermediate signatures held in STM; excess
    /// migrates to WM.  0 migrates every insert immediately.
    #[serde(default = "default_stm_size")]
    pub stm_size: usize,

    /// Cosine similarity threshold in `[0, 1]` for rehearsal merges;
    /// 1.0 disables merging.
    #[serde(default = "default_rehearsal_similarity")]
    pub rehearsal_similarity: f32,

    /// Mapping mode (`true`) grows the memory; localization mode (`false`)
    /// only updates weights.
    #[serde(default = "default_true")]
    pub incremental_memory: bool,

    /// Collapse a migrating STM node into a lower-id peer it loop-closed
    /// with, redirecting its links.
    #[serde(default)]
    pub reduce_graph: bool,

    /// Fraction of WM protected as the "recent" window above the last
    /// global loop closure.
    #[serde(default = "default_recent_wm_ratio")]
    pub recent_wm_ratio: f32,

    /// Which side survives a full rehearsal merge: the newer signature
    /// (`true`) or the older one (`false`).
    #[serde(default)]
    pub rehearsal_id_updated_to_new_one: bool,

    /// Ignore weight updates while the robot moves faster than the
    /// linear/angular thresholds.
    #[serde(default)]
    pub rehearsal_weight_ignored_while_moving: bool,

    /// Translation threshold (metres) above which the robot counts as
    /// moving during rehearsal.
    #[serde(default = "default_linear_update")]
    pub linear_update: f32,

    /// Rotation threshold (radians) above which the robot counts as moving
    /// during rehearsal.
    #[serde(default = "default_angular_update")]
    pub angular_update: f32,

    /// Allocate ids internally (`true`) or trust the source's ids.
    #[serde(default = "default_true")]
    pub generate_ids: bool,

    /// Drop feature-poor observations instead of keeping them.
    #[serde(default)]
    pub bad_signatures_ignored: bool,

    /// Auto-label the first node of each map `"map<N>"`.
    #[serde(default = "default_true")]
    pub map_labels_added: bool,

    /// Integer decimation (≥ 1) applied to retained imagery.
    #[serde(default = "default_one")]
    pub image_decimation: u32,

    /// Subsampling stride (≥ 1) for retained laser scans.
    #[serde(default = "default_one")]
    pub laser_scan_downsample_step_size: u32,

    /// Keep raw (uncompressed) sensor buffers on the signature.
    #[serde(default)]
    pub raw_data_kept: bool,

    /// Keep compressed sensor payloads on the signature.
    #[serde(default = "default_true")]
    pub bin_data_kept: bool,

    /// Convert float depth to 16-bit millimetres before compression.
    #[serde(default)]
    pub save_depth_16_format: bool,

    /// Persist trashed orphan nodes instead of freeing them.
    #[serde(default = "default_true")]
    pub not_linked_nodes_kept: bool,

    /// On init, load every node into WM instead of only the last session.
    #[serde(default)]
    pub init_wm_with_all_nodes: bool,

    /// Sort transfer candidates by weight and id only, ignoring age.
    #[serde(default)]
    pub transfer_sorting_by_weight_id: bool,

    // ── feature/keypoint options ────────────────────────────────────────────
    /// Maximum keypoints extracted per observation; negative disables
    /// extraction.
    #[serde(default = "default_max_features")]
    pub kp_max_features: i32,

    /// Minimum keypoint depth in metres (0 disables the bound).
    #[serde(default)]
    pub kp_min_depth: f32,

    /// Maximum keypoint depth in metres (0 disables the bound).
    #[serde(default)]
    pub kp_max_depth: f32,

    /// `"L R T B"` extraction ROI ratios, each in `[0, 1)`.
    #[serde(default = "default_roi_ratios")]
    pub kp_roi_ratios: String,

    /// An observation with fewer descriptors than this ratio of the mean
    /// words-per-location is a bad signature.
    #[serde(default = "default_bad_sign_ratio")]
    pub kp_bad_sign_ratio: f32,

    /// Use TF-IDF likelihood instead of raw similarity.
    #[serde(default = "default_true")]
    pub kp_tfidf_likelihood_used: bool,

    /// Rebuild the dictionary index concurrently with feature extraction.
    #[serde(default = "default_true")]
    pub kp_parallelized: bool,

    /// Allocate new words on quantization misses.
    #[serde(default = "default_true")]
    pub kp_incremental_dictionary: bool,

    /// Maximum descriptor distance for a quantization match.
    #[serde(default = "default_nn_distance")]
    pub kp_nn_distance: f32,

    /// Sub-pixel refinement window half-size; 0 disables.
    #[serde(default)]
    pub kp_sub_pix_win_size: i32,

    /// Sub-pixel refinement iterations; 0 disables.
    #[serde(default)]
    pub kp_sub_pix_iterations: i32,

    /// Sub-pixel refinement convergence epsilon.
    #[serde(default = "default_sub_pix_eps")]
    pub kp_sub_pix_eps: f32,
}

fn default_stm_size() -> usize {
    10
}
fn default_rehearsal_similarity() -> f32 {
    0.6
}
fn default_recent_wm_ratio() -> f32 {
    0.2
}
fn default_linear_update() -> f32 {
    0.1
}
fn default_angular_update() -> f32 {
    0.1
}
fn default_one() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_max_features() -> i32 {
    400
}
fn default_roi_ratios() -> String {
    "0 0 0 0".to_string()
}
fn default_bad_sign_ratio() -> f32 {
    0.5
}
fn default_nn_distance() -> f32 {
    0.2
}
fn default_sub_pix_eps() -> f32 {
    0.02
}

impl Default for MemoryConfig {
    fn default() -> Self {
        // Round-trips every default_* function through serde.
        toml::from_str("").expect("defaults are valid")
    }
}

impl MemoryConfig {
    /// Check cross-field constraints; called once when the memory is built.
    pub fn validate(&self) -> Result<(), MemoryError> {
        if !(0.0..=1.0).contains(&self.rehearsal_similarity) {
            return Err(MemoryError::Config(format!(
                "rehearsal_similarity {} outside [0, 1]",
                self.rehearsal_similarity
            )));
        }
        if !(0.0..=1.0).contains(&self.recent_wm_ratio) {
            return Err(MemoryError::Config(format!(
                "recent_wm_ratio {} outside [0, 1]",
                self.recent_wm_ratio
            )));
        }
        if self.image_decimation == 0 || self.laser_scan_downsample_step_size == 0 {
            return Err(MemoryError::Config(
                "decimation and downsample steps must be >= 1".to_string(),
            ));
        }
        rovermap_vision::feature::parse_roi_ratios(&self.kp_roi_ratios)
            .map_err(|e| MemoryError::Config(e.to_string()))?;
        Ok(())
    }

    /// Load a config from a TOML file.  Returns `None` if the file does not
    /// exist.
    pub fn load_from(path: &Path) -> Result<Option<Self>, MemoryError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)
            .map_err(|e| MemoryError::Config(format!("read {}: {e}", path.display())))?;
        let config: MemoryConfig =
            toml::from_str(&raw).map_err(|e| MemoryError::Config(format!("parse: {e}")))?;
        Ok(Some(config))
    }

    /// Save the config as TOML, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<(), MemoryError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| MemoryError::Config(format!("create {}: {e}", parent.display())))?;
        }
        let raw = toml::to_string_pretty(self)
            .map_err(|e| MemoryError::Config(format!("serialize: {e}")))?;
        fs::write(path, raw)
            .map_err(|e| MemoryError::Config(format!("write {}: {e}", path.display())))
    }
}
