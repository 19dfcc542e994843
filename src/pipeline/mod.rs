//! Per-job generation pipeline.
//!
//! Turns a [`GenerateRequest`] into a fully-specified upstream call:
//! resolve and upload reference images, compose node overrides, drive
//! the upstream session, persist the winning image through the media
//! store. Upstream-resident files uploaded for the job are cleaned up
//! on every exit path. The pipeline never retries the upstream call —
//! re-enqueue is the caller's move.

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::comfy::{ComfyClient, ComfyTimeouts};
use crate::core::{Job, Processor, ProcessorContext};
use crate::media::{MediaKind, MediaStore, Provenance};
use crate::workflows::{
    ControlDefaults, ControlSlot, LoraSlot, SingleControl, WorkflowConfig, WorkflowRegistry,
    compose_overrides, default_seed, merge_prompt_tokens,
};

/// A generation job's payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// The user's prompt text.
    pub user_prompt: String,
    /// `square`, `landscape`, or `portrait`.
    pub aspect_ratio: String,
    /// Workflow to run.
    pub workflow_id: String,
    /// Fixed seed; time-derived when absent.
    #[serde(default)]
    pub seed: Option<i64>,
    /// Background-removal mask blur.
    #[serde(default)]
    pub rmbg_mask_blur: Option<i64>,
    /// Background-removal mask offset.
    #[serde(default)]
    pub rmbg_mask_offset: Option<i64>,
    /// Stored image id to use as the image-to-image input.
    #[serde(default)]
    pub input_image_id: Option<String>,
    /// Upstream-resident filename to use directly (skips upload).
    #[serde(default)]
    pub input_image_filename: Option<String>,
    /// Whether ControlNet should engage.
    #[serde(default)]
    pub control_enabled: Option<bool>,
    /// Single-slot control reference id.
    #[serde(default)]
    pub control_image_id: Option<String>,
    /// Multi-slot control references.
    #[serde(default)]
    pub controls: Option<Vec<ControlRequest>>,
    /// LoRA strength overrides.
    #[serde(default)]
    pub loras: Option<Vec<LoraRequest>>,
}

/// One multi-slot control entry. Entries missing a slot or image id are
/// ignored rather than rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Slot name declared by the workflow.
    #[serde(default)]
    pub slot: Option<String>,
    /// Control reference id in the owner's store.
    #[serde(default)]
    pub image_id: Option<String>,
    /// Requested strength.
    #[serde(default)]
    pub strength: Option<f64>,
    /// Requested start percent.
    #[serde(default)]
    pub start_percent: Option<f64>,
    /// Requested end percent.
    #[serde(default)]
    pub end_percent: Option<f64>,
}

/// One LoRA strength entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraRequest {
    /// Slot name declared by the workflow.
    #[serde(default)]
    pub slot: Option<String>,
    /// Single strength applied to both UNet and CLIP.
    #[serde(default)]
    pub value: Option<f64>,
    /// UNet strength.
    #[serde(default)]
    pub unet: Option<f64>,
    /// CLIP strength.
    #[serde(default)]
    pub clip: Option<f64>,
    /// LoRA file name override.
    #[serde(default)]
    pub name: Option<String>,
}

/// The fully-resolved plan for one upstream call.
#[derive(Debug, Default)]
struct PlannedRun {
    overrides: Map<String, Value>,
    /// Upstream-resident filenames this job uploaded (server-chosen).
    uploaded: Vec<String>,
    /// Filenames we asked for (cleanup catches server-side renames).
    requested_names: Vec<String>,
}

const UPLOAD_ATTEMPTS: u32 = 3;
const UPLOAD_BACKOFF: Duration = Duration::from_millis(150);

/// Processor for `generate` jobs.
pub struct GenerationProcessor {
    comfy_address: String,
    timeouts: ComfyTimeouts,
    comfy_input_dir: Option<PathBuf>,
    media: MediaStore,
    workflows: Arc<WorkflowRegistry>,
}

impl std::fmt::Debug for GenerationProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationProcessor")
            .field("comfy_address", &self.comfy_address)
            .finish_non_exhaustive()
    }
}

impl GenerationProcessor {
    /// Assemble the processor from its collaborators.
    #[must_use]
    pub fn new(
        comfy_address: String,
        timeouts: ComfyTimeouts,
        comfy_input_dir: Option<PathBuf>,
        media: MediaStore,
        workflows: Arc<WorkflowRegistry>,
    ) -> Self {
        Self {
            comfy_address,
            timeouts,
            comfy_input_dir,
            media,
            workflows,
        }
    }

    fn upload_with_retry(
        &self,
        ctx: &ProcessorContext<'_>,
        client: &ComfyClient,
        filename: &str,
        bytes: &[u8],
    ) -> Option<String> {
        for attempt in 1..=UPLOAD_ATTEMPTS {
            let stored = ctx
                .runtime
                .block_on(client.upload_image(filename, bytes.to_vec(), "image/png"));
            if let Some(stored) = stored {
                self.wait_for_input_visibility(&stored);
                return Some(stored);
            }
            tracing::warn!(filename = %filename, attempt, "reference upload failed");
            std::thread::sleep(UPLOAD_BACKOFF);
        }
        None
    }

    /// Wait briefly for an uploaded file to appear in the shared input
    /// directory; some platforms surface it a beat after the response.
    fn wait_for_input_visibility(&self, filename: &str) {
        let Some(dir) = &self.comfy_input_dir else { return };
        let target = dir.join(filename);
        let deadline = std::time::Instant::now() + Duration::from_millis(1500);
        while std::time::Instant::now() < deadline {
            if target.exists() {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn plan(
        &self,
        job: &Job,
        request: &GenerateRequest,
        cfg: &WorkflowConfig,
        client: &ComfyClient,
        ctx: &ProcessorContext<'_>,
        run: &mut PlannedRun,
    ) -> anyhow::Result<()> {
        let control_enabled = request.control_enabled.unwrap_or(false);

        // Multi-slot controls first; fall back to the single-slot path.
        let mut single_control = SingleControl::default();
        let provided_controls: Vec<&ControlRequest> = request
            .controls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|c| c.slot.is_some() && c.image_id.is_some())
            .collect();
        let mut multi_uploads: Vec<(String, String)> = Vec::new(); // (slot, stored filename)

        if control_enabled {
            if let (Some(slots), false) = (&cfg.control_slots, provided_controls.is_empty()) {
                for control in &provided_controls {
                    let (Some(slot), Some(image_id)) =
                        (control.slot.as_deref(), control.image_id.as_deref())
                    else {
                        continue;
                    };
                    if !slots.contains_key(slot) {
                        continue;
                    }
                    let Some(png) = self.media.locate_png(&job.owner_id, MediaKind::Control, image_id)
                    else {
                        tracing::warn!(job_id = %job.id, slot = %slot, image_id = %image_id, "control image missing");
                        continue;
                    };
                    let bytes = std::fs::read(&png)
                        .with_context(|| format!("read control image {}", png.display()))?;
                    let requested = format!("{image_id}_{}.png", job.id);
                    run.requested_names.push(requested.clone());
                    match self.upload_with_retry(ctx, client, &requested, &bytes) {
                        Some(stored) => {
                            run.uploaded.push(stored.clone());
                            multi_uploads.push((slot.to_owned(), stored));
                        }
                        None => {
                            tracing::warn!(job_id = %job.id, slot = %slot, "control upload gave up");
                        }
                    }
                }
            } else if let Some(image_id) = request.control_image_id.as_deref() {
                if let Some(png) = self.media.locate_png(&job.owner_id, MediaKind::Control, image_id)
                {
                    let bytes = std::fs::read(&png)
                        .with_context(|| format!("read control image {}", png.display()))?;
                    let requested = format!("{image_id}_{}.png", job.id);
                    run.requested_names.push(requested.clone());
                    if let Some(stored) = self.upload_with_retry(ctx, client, &requested, &bytes) {
                        run.uploaded.push(stored.clone());
                        single_control = SingleControl {
                            strength: 1.0,
                            image_filename: Some(stored),
                        };
                    }
                }
            }
        }

        let seed = request.seed.unwrap_or_else(default_seed);
        // The multi-slot path owns the control nodes entirely; the
        // single-slot override only applies outside it.
        let use_multi =
            control_enabled && cfg.control_slots.is_some() && !provided_controls.is_empty();
        let control_arg = if use_multi { None } else { Some(&single_control) };
        run.overrides = compose_overrides(
            cfg,
            &request.user_prompt,
            &request.aspect_ratio,
            seed,
            control_arg,
        );

        apply_multi_control_overrides(
            &mut run.overrides,
            cfg,
            request.controls.as_deref().unwrap_or_default(),
            &multi_uploads,
        );
        apply_lora_overrides(
            &mut run.overrides,
            cfg.loras.as_ref(),
            request.loras.as_deref().unwrap_or_default(),
        );
        apply_rmbg_overrides(&mut run.overrides, cfg, request);
        self.apply_image_input(job, request, cfg, client, ctx, run)?;
        apply_additional_prompt(&mut run.overrides, cfg, &request.user_prompt);

        Ok(())
    }

    /// Resolve and wire the image-to-image input, in order: pre-uploaded
    /// filename, inputs store, generated artifacts, controls store, then
    /// a bare-filename pass-through. A workflow that declares
    /// `image_input` fails fast when nothing resolves.
    fn apply_image_input(
        &self,
        job: &Job,
        request: &GenerateRequest,
        cfg: &WorkflowConfig,
        client: &ComfyClient,
        ctx: &ProcessorContext<'_>,
        run: &mut PlannedRun,
    ) -> anyhow::Result<()> {
        let Some(io_cfg) = &cfg.image_input else {
            return Ok(());
        };

        let mut image_filename = request
            .input_image_filename
            .clone()
            .filter(|name| !name.is_empty());
        if image_filename.is_none() {
            if let Some(image_id) = request.input_image_id.as_deref().filter(|id| !id.is_empty()) {
                if let Some((png, source)) = self.resolve_input_source(&job.owner_id, image_id) {
                    tracing::info!(
                        job_id = %job.id,
                        input_image_id = %image_id,
                        source = source,
                        "image input resolved"
                    );
                    let bytes = std::fs::read(&png)
                        .with_context(|| format!("read input image {}", png.display()))?;
                    let requested = format!("{image_id}_{}.png", job.id);
                    run.requested_names.push(requested.clone());
                    if let Some(stored) = self.upload_with_retry(ctx, client, &requested, &bytes) {
                        run.uploaded.push(stored.clone());
                        image_filename = Some(stored);
                    }
                } else if is_plain_png_filename(image_id) {
                    // The id is already an upstream-resident filename.
                    image_filename = Some(image_id.to_owned());
                }
            }
        }

        let Some(filename) = image_filename else {
            tracing::warn!(
                job_id = %job.id,
                workflow_id = %request.workflow_id,
                "image input required but not resolved"
            );
            bail!("Input image is not ready. Select or upload an input image and try again.");
        };
        run.overrides.insert(
            io_cfg.image_node.clone(),
            crate::workflows::node_inputs(&io_cfg.input_field, Value::String(filename)),
        );
        Ok(())
    }

    /// Search the owner's stores for a usable input PNG.
    fn resolve_input_source(&self, owner_id: &str, image_id: &str) -> Option<(PathBuf, &'static str)> {
        if let Some(png) = self.media.locate_png(owner_id, MediaKind::Input, image_id) {
            return Some((png, "inputs"));
        }
        if let Some(meta) = self.media.locate_meta(owner_id, MediaKind::Generated, image_id) {
            let candidate = meta.with_extension("png");
            if candidate.exists() {
                return Some((candidate, "images"));
            }
        }
        self.media
            .locate_png(owner_id, MediaKind::Control, image_id)
            .map(|png| (png, "controls"))
    }

    fn execute(
        &self,
        job: &Job,
        request: &GenerateRequest,
        client: &ComfyClient,
        run: &PlannedRun,
        ctx: &ProcessorContext<'_>,
    ) -> anyhow::Result<Map<String, Value>> {
        let graph_path = self.workflows.graph_path(&request.workflow_id);
        let response = ctx
            .runtime
            .block_on(client.queue_prompt(&graph_path, &run.overrides));
        let Some(prompt_id) = response.get("prompt_id").and_then(Value::as_str) else {
            bail!("Failed to get prompt_id.");
        };

        let images = ctx
            .runtime
            .block_on(client.stream(prompt_id, ctx.progress))?;
        let Some((filename, bytes)) = images.into_iter().next() else {
            bail!("Failed to receive generated images.");
        };

        let provenance = Provenance {
            workflow_id: Some(request.workflow_id.clone()),
            aspect_ratio: Some(request.aspect_ratio.clone()),
            seed: request.seed,
            prompt: Some(request.user_prompt.clone()),
            input_image_id: request.input_image_id.clone(),
        };
        let saved = self
            .media
            .save_artifact(&job.owner_id, &bytes, &provenance, &filename)
            .context("persist generated artifact")?;
        tracing::info!(
            job_id = %job.id,
            owner_id = %job.owner_id,
            artifact_id = %saved.id,
            "artifact persisted"
        );

        let mut result = Map::new();
        result.insert("image_path".into(), Value::String(saved.web_path));
        Ok(result)
    }

    /// Best-effort removal of every upstream input file this job put
    /// there, plus a sweep for files carrying the job id (the server may
    /// rename uploads on collision).
    fn cleanup(&self, job_id: &str, run: &PlannedRun) {
        let Some(input_dir) = &self.comfy_input_dir else {
            return;
        };
        for name in run.uploaded.iter().chain(&run.requested_names) {
            delete_upstream_input(input_dir, name);
        }
        let Ok(entries) = std::fs::read_dir(input_dir) else {
            return;
        };
        let needle = job_id.to_lowercase();
        let mut swept = 0_u32;
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().to_string();
            let lower = name.to_lowercase();
            let is_image = [".png", ".webp", ".jpg", ".jpeg"]
                .iter()
                .any(|ext| lower.ends_with(ext));
            if is_image && lower.contains(&needle) {
                delete_upstream_input(input_dir, &name);
                swept += 1;
            }
        }
        tracing::info!(job_id = %job_id, swept, "upstream input cleanup done");
    }
}

impl Processor for GenerationProcessor {
    fn process(&self, job: &Job, ctx: &ProcessorContext<'_>) -> anyhow::Result<Map<String, Value>> {
        let request: GenerateRequest =
            serde_json::from_value(job.payload.clone()).context("decode generate payload")?;
        tracing::info!(
            job_id = %job.id,
            owner_id = %job.owner_id,
            workflow_id = %request.workflow_id,
            input_image_id = request.input_image_id.as_deref().unwrap_or(""),
            "generation request"
        );
        let Some(cfg) = self.workflows.get(&request.workflow_id) else {
            bail!("Unsupported workflow: {}", request.workflow_id);
        };

        let client = ComfyClient::new(&self.comfy_address, self.timeouts)?;

        // The interrupt doubles as the job's cancel handle; it fires on
        // the runtime so the caller never blocks on upstream I/O.
        let interrupt_client = client.clone();
        let runtime = ctx.runtime.clone();
        (ctx.set_cancel_handle)(Arc::new(move || {
            let client = interrupt_client.clone();
            drop(runtime.spawn(async move { client.interrupt().await }));
            true
        }));

        let mut run = PlannedRun::default();
        let outcome = self
            .plan(job, &request, &cfg, &client, ctx, &mut run)
            .and_then(|()| self.execute(job, &request, &client, &run, ctx));
        // Uploaded inputs are removed on success, failure, and cancel alike.
        self.cleanup(&job.id, &run);
        outcome
    }
}

/// Write the per-slot apply/image node overrides for uploaded controls,
/// clamping requested parameters into the slot's declared ranges.
fn apply_slot_override(
    overrides: &mut Map<String, Value>,
    slot_cfg: &ControlSlot,
    defaults: &ControlDefaults,
    request: Option<&ControlRequest>,
    image_filename: Option<&str>,
) {
    let strength_default = slot_cfg
        .ui
        .strength
        .default
        .unwrap_or(defaults.strength);
    let start_default = slot_cfg
        .ui
        .start_percent
        .default
        .unwrap_or(defaults.start_percent);
    let end_default = slot_cfg.ui.end_percent.default.unwrap_or(defaults.end_percent);

    let mut strength = clamp_into(
        request.and_then(|r| r.strength),
        slot_cfg.ui.strength.min.unwrap_or(0.0),
        slot_cfg.ui.strength.max.unwrap_or(1.5),
        strength_default,
    );
    let mut start = clamp_into(
        request.and_then(|r| r.start_percent),
        slot_cfg.ui.start_percent.min.unwrap_or(0.0),
        slot_cfg.ui.start_percent.max.unwrap_or(1.0),
        start_default,
    );
    let mut end = clamp_into(
        request.and_then(|r| r.end_percent),
        slot_cfg.ui.end_percent.min.unwrap_or(0.0),
        slot_cfg.ui.end_percent.max.unwrap_or(1.0),
        end_default,
    );
    if image_filename.is_none() {
        strength = 0.0;
    }
    if start > end {
        std::mem::swap(&mut start, &mut end);
    }

    overrides.insert(
        slot_cfg.apply_node.clone(),
        json!({ "inputs": {
            "strength": strength,
            "start_percent": start,
            "end_percent": end,
        }}),
    );
    if let Some(filename) = image_filename {
        overrides.insert(
            slot_cfg.image_node.clone(),
            json!({ "inputs": { "image": filename } }),
        );
    }
}

fn clamp_into(requested: Option<f64>, lo: f64, hi: f64, default: f64) -> f64 {
    requested.unwrap_or(default).clamp(lo, hi)
}

fn apply_multi_control_overrides(
    overrides: &mut Map<String, Value>,
    cfg: &WorkflowConfig,
    requested: &[ControlRequest],
    uploads: &[(String, String)],
) {
    let Some(slots) = &cfg.control_slots else { return };
    let defaults = cfg
        .controlnet
        .as_ref()
        .map(|cn| cn.defaults)
        .unwrap_or_default();
    for (slot_name, stored) in uploads {
        let Some(slot_cfg) = slots.get(slot_name) else {
            continue;
        };
        let request = requested
            .iter()
            .find(|c| c.slot.as_deref() == Some(slot_name.as_str()));
        apply_slot_override(overrides, slot_cfg, &defaults, request, Some(stored));
    }
}

/// Write LoRA strength overrides. A single `value` drives both the UNet
/// and CLIP keys; explicit `unet`/`clip` win when present.
fn apply_lora_overrides(
    overrides: &mut Map<String, Value>,
    slots: Option<&std::collections::BTreeMap<String, LoraSlot>>,
    requested: &[LoraRequest],
) {
    let Some(slots) = slots else { return };
    for entry in requested {
        let Some(slot_name) = entry.slot.as_deref() else {
            continue;
        };
        let Some(slot) = slots.get(slot_name) else {
            continue;
        };
        let node_override = overrides
            .entry(slot.node.clone())
            .or_insert_with(|| json!({ "inputs": {} }));
        let Some(inputs) = node_override
            .as_object_mut()
            .and_then(|o| o.entry("inputs").or_insert_with(|| json!({})).as_object_mut())
        else {
            continue;
        };
        if let Some(value) = entry.value {
            inputs.insert(slot.unet_input.clone(), json!(value));
            inputs.insert(slot.clip_input.clone(), json!(value));
        } else {
            if let Some(unet) = entry.unet {
                inputs.insert(slot.unet_input.clone(), json!(unet));
            }
            if let Some(clip) = entry.clip {
                inputs.insert(slot.clip_input.clone(), json!(clip));
            }
        }
        if let Some(name) = entry.name.as_deref().filter(|n| !n.is_empty()) {
            inputs.insert(slot.name_input.clone(), json!(name));
        }
    }
}

/// Clamp and write the background-removal parameters.
fn apply_rmbg_overrides(
    overrides: &mut Map<String, Value>,
    cfg: &WorkflowConfig,
    request: &GenerateRequest,
) {
    let Some(rmbg) = &cfg.rmbg else { return };
    if request.rmbg_mask_blur.is_none() && request.rmbg_mask_offset.is_none() {
        return;
    }
    let mut inputs = Map::new();
    if let Some(blur) = request.rmbg_mask_blur {
        let range = cfg.rmbg_range("mask_blur");
        inputs.insert(
            "mask_blur".into(),
            json!(range.clamp_or(Some(blur as f64), 0.0) as i64),
        );
    }
    if let Some(offset) = request.rmbg_mask_offset {
        let range = cfg.rmbg_range("mask_offset");
        inputs.insert(
            "mask_offset".into(),
            json!(range.clamp_or(Some(offset as f64), 0.0) as i64),
        );
    }
    overrides.insert(rmbg.node.clone(), json!({ "inputs": inputs }));
}

/// Merge the user's prompt into the declared extra text node.
fn apply_additional_prompt(
    overrides: &mut Map<String, Value>,
    cfg: &WorkflowConfig,
    user_prompt: &str,
) {
    let Some(target) = cfg.additional_prompt_target_node() else {
        return;
    };
    let text = if cfg.natural_template_mode() {
        user_prompt.to_owned()
    } else {
        merge_prompt_tokens(user_prompt, &cfg.style_prompt)
    };
    overrides.insert(target.to_owned(), json!({ "inputs": { "text": text } }));
}

/// Whether an id can pass through as an upstream-resident filename.
fn is_plain_png_filename(id: &str) -> bool {
    !id.contains('/') && !id.contains('\\') && id.to_ascii_lowercase().ends_with(".png")
}

/// Remove one upstream input file, retrying briefly: the upstream may
/// hold a transient handle (seen on Windows). Tries both the name as-is
/// and its basename, since responses occasionally carry a path.
fn delete_upstream_input(input_dir: &std::path::Path, name: &str) {
    let mut candidates = vec![input_dir.join(name)];
    let basename = name.replace('\\', "/");
    if let Some(base) = basename.rsplit('/').next() {
        if base != name {
            candidates.push(input_dir.join(base));
        }
    }
    for candidate in candidates {
        let mut ok = false;
        for _ in 0..25 {
            if !candidate.exists() {
                ok = true;
                break;
            }
            match std::fs::remove_file(&candidate) {
                Ok(()) => {
                    ok = true;
                    break;
                }
                Err(_) => std::thread::sleep(Duration::from_millis(200)),
            }
        }
        tracing::debug!(path = %candidate.display(), ok, "upstream input cleanup");
        if ok {
            break;
        }
    }
}
