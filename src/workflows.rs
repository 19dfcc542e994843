//! Workflow recipe registry.
//!
//! A workflow pairs a graph JSON file (consumed verbatim by the upstream
//! peer) with override metadata: which node takes the prompt, where the
//! seed lives, ControlNet slot wiring, LoRA slots, and UI hints. The
//! metadata lives in `<workflow_dir>/workflows.json`, keyed by workflow
//! id, and is reloadable at runtime; graph content is opaque here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Width/height preset for one aspect ratio.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SizePreset {
    /// Latent width in pixels.
    pub width: u32,
    /// Latent height in pixels.
    pub height: u32,
}

/// Default strength/start/end for the single-slot ControlNet path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ControlDefaults {
    /// Default strength.
    #[serde(default)]
    pub strength: f64,
    /// Default start percent.
    #[serde(default)]
    pub start_percent: f64,
    /// Default end percent.
    #[serde(default = "default_end_percent")]
    pub end_percent: f64,
}

fn default_end_percent() -> f64 {
    0.33
}

impl Default for ControlDefaults {
    fn default() -> Self {
        Self {
            strength: 0.0,
            start_percent: 0.0,
            end_percent: default_end_percent(),
        }
    }
}

/// Single-slot ControlNet wiring.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControlNetConfig {
    /// Whether the workflow supports ControlNet at all.
    #[serde(default)]
    pub enabled: bool,
    /// Node receiving strength/start/end.
    #[serde(default)]
    pub apply_node: Option<String>,
    /// LoadImage node receiving the reference filename.
    #[serde(default)]
    pub image_node: Option<String>,
    /// Defaults when the request leaves parameters unset.
    #[serde(default)]
    pub defaults: ControlDefaults,
}

/// Min/max/default for one slot parameter slider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct UiRange {
    /// Lower bound.
    #[serde(default)]
    pub min: Option<f64>,
    /// Upper bound.
    #[serde(default)]
    pub max: Option<f64>,
    /// Slider step.
    #[serde(default)]
    pub step: Option<f64>,
    /// Default value.
    #[serde(default)]
    pub default: Option<f64>,
}

impl UiRange {
    /// Clamp a requested value into this range, falling back to the
    /// declared default (or `fallback`) when unset.
    #[must_use]
    pub fn clamp_or(&self, requested: Option<f64>, fallback: f64) -> f64 {
        let lo = self.min.unwrap_or(f64::MIN);
        let hi = self.max.unwrap_or(f64::MAX);
        requested
            .or(self.default)
            .unwrap_or(fallback)
            .clamp(lo, hi)
    }
}

/// Parameter ranges declared per control slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct SlotUi {
    /// Strength slider.
    #[serde(default)]
    pub strength: UiRange,
    /// Start percent slider.
    #[serde(default)]
    pub start_percent: UiRange,
    /// End percent slider.
    #[serde(default)]
    pub end_percent: UiRange,
}

/// A named ControlNet slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSlot {
    /// Node receiving strength/start/end.
    pub apply_node: String,
    /// LoadImage node receiving the reference filename.
    pub image_node: String,
    /// Display label.
    #[serde(default)]
    pub label: Option<String>,
    /// Control type hint (scribble, depth, ...).
    #[serde(rename = "type", default)]
    pub control_type: Option<String>,
    /// Parameter ranges and defaults.
    #[serde(default)]
    pub ui: SlotUi,
}

/// A named LoRA slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraSlot {
    /// LoraLoader node id.
    pub node: String,
    /// Input key for the UNet strength.
    #[serde(default = "default_unet_input")]
    pub unet_input: String,
    /// Input key for the CLIP strength.
    #[serde(default = "default_clip_input")]
    pub clip_input: String,
    /// Input key for the LoRA file name.
    #[serde(default = "default_name_input")]
    pub name_input: String,
    /// Display label.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_unet_input() -> String {
    "strength_model".to_owned()
}

fn default_clip_input() -> String {
    "strength_clip".to_owned()
}

fn default_name_input() -> String {
    "lora_name".to_owned()
}

/// Image-to-image input wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInputConfig {
    /// Node whose input receives the uploaded filename.
    pub image_node: String,
    /// Input key on that node.
    #[serde(default = "default_input_field")]
    pub input_field: String,
}

fn default_input_field() -> String {
    "image".to_owned()
}

/// Background-removal parameter wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmbgConfig {
    /// Node receiving `mask_blur` / `mask_offset`.
    pub node: String,
}

/// One workflow's override recipe.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowConfig {
    /// Human-readable name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Description shown in the workflow picker.
    #[serde(default)]
    pub description: Option<String>,
    /// Hidden workflows are skipped in listings but remain invokable.
    #[serde(default)]
    pub hidden: bool,
    /// Prefilled user prompt.
    #[serde(default)]
    pub default_user_prompt: String,
    /// Fixed style tokens merged into the prompt.
    #[serde(default)]
    pub style_prompt: String,
    /// Negative prompt.
    #[serde(default)]
    pub negative_prompt: String,
    /// Recommended prompt shown to users.
    #[serde(default)]
    pub recommended_prompt: String,
    /// Node taking the positive prompt.
    #[serde(default)]
    pub prompt_node: Option<String>,
    /// Input key on the prompt node.
    #[serde(default)]
    pub prompt_input_key: Option<String>,
    /// Node taking the negative prompt.
    #[serde(default)]
    pub negative_prompt_node: Option<String>,
    /// Input key on the negative prompt node.
    #[serde(default)]
    pub negative_prompt_input_key: Option<String>,
    /// Node taking the seed.
    #[serde(default)]
    pub seed_node: Option<String>,
    /// Input key on the seed node.
    #[serde(default)]
    pub seed_input_key: Option<String>,
    /// EmptyLatentImage node taking width/height.
    #[serde(default)]
    pub latent_image_node: Option<String>,
    /// Aspect-ratio presets.
    #[serde(default)]
    pub sizes: Option<BTreeMap<String, SizePreset>>,
    /// Single-slot ControlNet wiring.
    #[serde(default)]
    pub controlnet: Option<ControlNetConfig>,
    /// Multi-slot ControlNet wiring.
    #[serde(default)]
    pub control_slots: Option<BTreeMap<String, ControlSlot>>,
    /// LoRA slots.
    #[serde(default)]
    pub loras: Option<BTreeMap<String, LoraSlot>>,
    /// LoRA slider hint for the frontend.
    #[serde(default)]
    pub lora_hint: Option<Value>,
    /// Image-to-image wiring; when set, a resolved input is mandatory.
    #[serde(default)]
    pub image_input: Option<ImageInputConfig>,
    /// Background-removal wiring.
    #[serde(default)]
    pub rmbg: Option<RmbgConfig>,
    /// Opaque UI schema forwarded to the frontend.
    #[serde(default)]
    pub ui: Value,
}

impl WorkflowConfig {
    /// Node the user's extra prompt merges into, when the UI declares one.
    #[must_use]
    pub fn additional_prompt_target_node(&self) -> Option<&str> {
        self.ui
            .get("additionalPromptTargetNode")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Whether prompt text passes through unmerged (natural-language
    /// template workflows).
    #[must_use]
    pub fn natural_template_mode(&self) -> bool {
        self.ui
            .get("templateMode")
            .and_then(Value::as_str)
            .is_some_and(|mode| mode.eq_ignore_ascii_case("natural"))
    }

    /// Range declared for one RMBG parameter under `ui.rmbgParams`.
    #[must_use]
    pub fn rmbg_range(&self, key: &str) -> UiRange {
        self.ui
            .get("rmbgParams")
            .and_then(|params| params.get(key))
            .and_then(|range| serde_json::from_value(range.clone()).ok())
            .unwrap_or_default()
    }
}

/// Merge user and style prompt tokens.
///
/// Comma-separated tokens, user tokens first, case-insensitive
/// de-duplication across the whole sequence.
#[must_use]
pub fn merge_prompt_tokens(user_prompt: &str, style_prompt: &str) -> String {
    let mut seen: Vec<String> = Vec::new();
    let mut merged: Vec<&str> = Vec::new();
    for token in user_prompt.split(',').chain(style_prompt.split(',')) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let key = token.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        merged.push(token);
    }
    merged.join(", ")
}

/// Single-slot control application, resolved by the pipeline.
#[derive(Debug, Clone, Default)]
pub struct SingleControl {
    /// Effective strength; forced to 0 without an image.
    pub strength: f64,
    /// Upstream-resident reference filename.
    pub image_filename: Option<String>,
}

/// Build the base node overrides for a request: prompt, negative, seed,
/// latent size, and the single-slot control path.
///
/// An aspect ratio missing from the workflow's presets simply skips the
/// latent size override; image-transform workflows have no presets.
#[must_use]
pub fn compose_overrides(
    cfg: &WorkflowConfig,
    user_prompt: &str,
    aspect_ratio: &str,
    seed: i64,
    control: Option<&SingleControl>,
) -> Map<String, Value> {
    let mut overrides = Map::new();

    // Natural-language template workflows take the user's text verbatim;
    // tag-style workflows merge it with the fixed style tokens.
    let positive = if cfg.natural_template_mode() {
        user_prompt.to_owned()
    } else {
        merge_prompt_tokens(user_prompt, &cfg.style_prompt)
    };
    if let Some(node) = &cfg.prompt_node {
        let key = cfg.prompt_input_key.as_deref().unwrap_or("text");
        overrides.insert(node.clone(), node_inputs(key, Value::String(positive)));
    }
    if let Some(node) = &cfg.negative_prompt_node {
        let key = cfg.negative_prompt_input_key.as_deref().unwrap_or("text");
        overrides.insert(
            node.clone(),
            node_inputs(key, Value::String(cfg.negative_prompt.clone())),
        );
    }
    if let Some(node) = &cfg.seed_node {
        let key = cfg.seed_input_key.as_deref().unwrap_or("seed");
        overrides.insert(node.clone(), node_inputs(key, json!(seed)));
    }
    if let (Some(node), Some(sizes)) = (&cfg.latent_image_node, &cfg.sizes) {
        if let Some(preset) = sizes.get(aspect_ratio) {
            overrides.insert(
                node.clone(),
                json!({ "inputs": { "width": preset.width, "height": preset.height } }),
            );
        }
    }

    if let (Some(control), Some(cn)) = (control, &cfg.controlnet) {
        if cn.enabled {
            if let Some(apply_node) = &cn.apply_node {
                overrides.insert(
                    apply_node.clone(),
                    json!({ "inputs": {
                        "strength": control.strength,
                        "start_percent": cn.defaults.start_percent,
                        "end_percent": cn.defaults.end_percent,
                    }}),
                );
            }
            if let (Some(image_node), Some(filename)) = (&cn.image_node, &control.image_filename) {
                overrides.insert(image_node.clone(), json!({ "inputs": { "image": filename } }));
            }
        }
    }

    overrides
}

/// A `{"inputs": {key: value}}` override with a dynamic key.
#[must_use]
pub fn node_inputs(key: &str, value: Value) -> Value {
    let mut inputs = Map::new();
    inputs.insert(key.to_owned(), value);
    json!({ "inputs": inputs })
}

/// Seed used when the request carries none: time-derived, matching the
/// upstream's expectations for a positive integer seed.
#[must_use]
pub fn default_seed() -> i64 {
    chrono::Utc::now().timestamp_millis() % 1_000_000_000_000_000
}

/// Reloadable map of workflow id to recipe, plus graph file resolution.
#[derive(Debug)]
pub struct WorkflowRegistry {
    dir: PathBuf,
    configs: RwLock<HashMap<String, WorkflowConfig>>,
}

impl WorkflowRegistry {
    /// Load `workflows.json` from `dir`. A missing or unreadable file
    /// leaves the registry empty so the server can still come up.
    #[must_use]
    pub fn load(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let configs = Self::read_configs(&dir);
        Self {
            dir,
            configs: RwLock::new(configs),
        }
    }

    fn read_configs(dir: &Path) -> HashMap<String, WorkflowConfig> {
        let path = dir.join("workflows.json");
        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(configs) => configs,
                Err(err) => {
                    tracing::error!(path = %path.display(), error = %err, "workflows.json invalid");
                    HashMap::new()
                }
            },
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "workflows.json not readable");
                HashMap::new()
            }
        }
    }

    /// Re-read `workflows.json`; returns how many workflows are defined.
    pub fn reload(&self) -> usize {
        let configs = Self::read_configs(&self.dir);
        let count = configs.len();
        *self
            .configs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = configs;
        tracing::info!(count, "workflow registry reloaded");
        count
    }

    /// Look up one workflow's recipe.
    #[must_use]
    pub fn get(&self, workflow_id: &str) -> Option<WorkflowConfig> {
        self.configs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(workflow_id)
            .cloned()
    }

    /// All workflows, sorted by id.
    #[must_use]
    pub fn list(&self) -> Vec<(String, WorkflowConfig)> {
        let mut entries: Vec<(String, WorkflowConfig)> = self
            .configs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(id, cfg)| (id.clone(), cfg.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Path of the workflow's graph JSON file.
    #[must_use]
    pub fn graph_path(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{workflow_id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_config() -> WorkflowConfig {
        serde_json::from_value(json!({
            "display_name": "Pixel Art",
            "style_prompt": "masterpiece, best quality, pixel_art",
            "negative_prompt": "bad quality, blurry",
            "prompt_node": "6",
            "negative_prompt_node": "7",
            "seed_node": "3",
            "latent_image_node": "5",
            "sizes": {
                "square": { "width": 800, "height": 800 },
                "landscape": { "width": 1024, "height": 576 }
            },
            "controlnet": {
                "enabled": true,
                "apply_node": "23",
                "image_node": "28",
                "defaults": { "strength": 0, "start_percent": 0.0, "end_percent": 0.33 }
            }
        }))
        .expect("config parses")
    }

    #[test]
    fn test_merge_keeps_user_tokens_first() {
        let merged = merge_prompt_tokens("1girl, solo", "masterpiece, solo, pixel_art");
        assert_eq!(merged, "1girl, solo, masterpiece, pixel_art");
    }

    #[test]
    fn test_merge_dedup_is_case_insensitive() {
        let merged = merge_prompt_tokens("Pixel_Art, castle", "pixel_art, sky");
        assert_eq!(merged, "Pixel_Art, castle, sky");
    }

    #[test]
    fn test_merge_empty_user_prompt() {
        assert_eq!(merge_prompt_tokens("", "a, b"), "a, b");
        assert_eq!(merge_prompt_tokens("a, b", ""), "a, b");
    }

    #[test]
    fn test_compose_sets_prompt_seed_and_size() {
        let cfg = sample_config();
        let overrides = compose_overrides(&cfg, "1girl", "square", 42, None);
        assert_eq!(
            overrides["6"]["inputs"]["text"],
            "1girl, masterpiece, best quality, pixel_art"
        );
        assert_eq!(overrides["7"]["inputs"]["text"], "bad quality, blurry");
        assert_eq!(overrides["3"]["inputs"]["seed"], 42);
        assert_eq!(overrides["5"]["inputs"]["width"], 800);
    }

    #[test]
    fn test_compose_unknown_aspect_skips_size() {
        let cfg = sample_config();
        let overrides = compose_overrides(&cfg, "x", "ultrawide", 1, None);
        assert!(!overrides.contains_key("5"));
        assert!(overrides.contains_key("6"));
    }

    #[test]
    fn test_compose_control_without_image_forces_strength() {
        let cfg = sample_config();
        let control = SingleControl {
            strength: 0.0,
            image_filename: None,
        };
        let overrides = compose_overrides(&cfg, "x", "square", 1, Some(&control));
        assert_eq!(overrides["23"]["inputs"]["strength"], 0.0);
        assert!(!overrides.contains_key("28"), "no image node without a file");
    }

    #[test]
    fn test_compose_control_with_image() {
        let cfg = sample_config();
        let control = SingleControl {
            strength: 1.0,
            image_filename: Some("ref_abc.png".into()),
        };
        let overrides = compose_overrides(&cfg, "x", "square", 1, Some(&control));
        assert_eq!(overrides["23"]["inputs"]["strength"], 1.0);
        assert_eq!(overrides["28"]["inputs"]["image"], "ref_abc.png");
    }

    #[test]
    fn test_ui_range_clamps() {
        let range = UiRange {
            min: Some(0.0),
            max: Some(1.5),
            step: None,
            default: Some(0.5),
        };
        assert_eq!(range.clamp_or(Some(2.0), 0.0), 1.5);
        assert_eq!(range.clamp_or(Some(-1.0), 0.0), 0.0);
        assert_eq!(range.clamp_or(None, 0.0), 0.5);
    }

    #[test]
    fn test_registry_load_and_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("workflows.json");
        std::fs::write(&path, r#"{ "PixelArt": { "style_prompt": "pixel" } }"#).expect("write");

        let registry = WorkflowRegistry::load(dir.path());
        assert!(registry.get("PixelArt").is_some());
        assert!(registry.get("Missing").is_none());
        assert_eq!(
            registry.graph_path("PixelArt"),
            dir.path().join("PixelArt.json")
        );

        std::fs::write(
            &path,
            r#"{ "PixelArt": {}, "Photo": { "hidden": true } }"#,
        )
        .expect("write");
        assert_eq!(registry.reload(), 2);
        assert!(registry.get("Photo").expect("photo").hidden);
    }

    #[test]
    fn test_registry_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = WorkflowRegistry::load(dir.path());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_compose_natural_mode_passes_prompt_through() {
        let mut cfg = sample_config();
        cfg.ui = json!({ "templateMode": "natural" });
        let overrides = compose_overrides(&cfg, "A fox drinking tea, calmly", "square", 1, None);
        assert_eq!(
            overrides["6"]["inputs"]["text"],
            "A fox drinking tea, calmly"
        );
    }

    #[test]
    fn test_natural_template_mode_flag() {
        let cfg: WorkflowConfig = serde_json::from_value(json!({
            "ui": { "templateMode": "natural", "additionalPromptTargetNode": "63" }
        }))
        .expect("parses");
        assert!(cfg.natural_template_mode());
        assert_eq!(cfg.additional_prompt_target_node(), Some("63"));
    }
}
