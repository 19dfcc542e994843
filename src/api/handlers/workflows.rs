//! Workflow listing for the frontend picker.

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::api::protocol::WorkflowInfo;
use crate::api::server::AppState;

/// `GET /api/v1/workflows` — every visible workflow with its UI schema.
pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let mut workflows = Vec::new();
    for (id, cfg) in state.workflows.list() {
        if cfg.hidden {
            continue;
        }
        let graph_path = state.workflows.graph_path(&id);
        let node_count = std::fs::read_to_string(&graph_path)
            .ok()
            .and_then(|text| serde_json::from_str::<serde_json::Map<String, Value>>(&text).ok())
            .map_or(0, |graph| graph.len());
        if node_count == 0 {
            tracing::warn!(workflow_id = %id, path = %graph_path.display(), "workflow graph unreadable");
        }

        workflows.push(WorkflowInfo {
            name: cfg
                .display_name
                .clone()
                .unwrap_or_else(|| id.replace('_', " ")),
            description: cfg
                .description
                .clone()
                .unwrap_or_else(|| "No description.".to_owned()),
            node_count,
            style_prompt: cfg.style_prompt.clone(),
            negative_prompt: cfg.negative_prompt.clone(),
            recommended_prompt: cfg.recommended_prompt.clone(),
            ui: cfg.ui.clone(),
            sizes: serde_json::to_value(&cfg.sizes).unwrap_or(Value::Null),
            image_input: serde_json::to_value(&cfg.image_input).unwrap_or(Value::Null),
            control_slots: serde_json::to_value(&cfg.control_slots).unwrap_or(Value::Null),
            lora_slots: serde_json::to_value(&cfg.loras).unwrap_or(Value::Null),
            lora_hint: cfg.lora_hint.clone().unwrap_or(Value::Null),
            id,
        });
    }
    Json(json!({ "workflows": workflows }))
}
