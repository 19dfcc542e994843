//! Artifact selection over a prompt's history outputs.
//!
//! A history entry lists every image a run produced, including the
//! LoadImage originals of image-to-image workflows. Picking naively by
//! position can return the *input* as the "result", so candidates are
//! scored by the class of the producing node, the folder they landed in,
//! and finally the node id.

use serde_json::{Map, Value};

/// Reference to one image in the upstream's storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Filename under the upstream folder.
    pub filename: String,
    /// Subfolder component for the `/view` endpoint.
    pub subfolder: String,
    /// Folder type: `output`, `temp`, or `input`.
    pub folder_type: String,
}

/// Rank the images of a history entry best-first.
///
/// Scoring, most significant first:
/// 1. class of the producing node (SaveImage > PreviewImage > VAEDecode*
///    > other > LoadImage),
/// 2. folder type (output > temp > input > other),
/// 3. numeric node id, descending (later nodes in typical topologies).
///
/// When any non-input image exists, input-folder images are dropped from
/// the candidate set entirely.
#[must_use]
pub fn select_images(history_entry: &Value) -> Vec<ImageRef> {
    let outputs = history_entry
        .get("outputs")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let graph = prompt_graph(history_entry);

    let mut candidates: Vec<(i64, i64, i64, ImageRef)> = Vec::new();
    for (node_id, node_output) in &outputs {
        let Some(images) = node_output.get("images").and_then(Value::as_array) else {
            continue;
        };
        let class_type = graph
            .get(node_id.as_str())
            .and_then(|n| n.get("class_type"))
            .and_then(Value::as_str);
        let cpri = class_priority(class_type);
        let nid = node_id.parse::<i64>().unwrap_or(-1);
        for image in images {
            let Some(filename) = image.get("filename").and_then(Value::as_str) else {
                continue;
            };
            let folder_type = image
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let tpri = type_priority(&folder_type);
            candidates.push((
                cpri,
                tpri,
                nid,
                ImageRef {
                    filename: filename.to_owned(),
                    subfolder: image
                        .get("subfolder")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned(),
                    folder_type,
                },
            ));
        }
    }

    // Drop input-folder images whenever something better exists.
    let has_non_input = candidates.iter().any(|c| c.1 >= 2);
    if has_non_input {
        candidates.retain(|c| c.1 >= 2);
    }

    candidates.sort_by(|a, b| (b.0, b.1, b.2).cmp(&(a.0, a.1, a.2)));
    candidates.into_iter().map(|c| c.3).collect()
}

/// Extract the node graph from the shape-shifting `prompt` field.
///
/// Seen in the wild: a plain `{node_id: {...}}` map, the same map wrapped
/// under `nodes`, and the queue tuple `[queue_id, prompt_id, {nodes}]`.
fn prompt_graph(history_entry: &Value) -> Map<String, Value> {
    match history_entry.get("prompt") {
        Some(Value::Object(obj)) => {
            if let Some(Value::Object(nodes)) = obj.get("nodes") {
                nodes.clone()
            } else {
                obj.clone()
            }
        }
        Some(Value::Array(parts)) => parts
            .get(2)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
        _ => Map::new(),
    }
}

fn class_priority(class_type: Option<&str>) -> i64 {
    match class_type {
        Some("SaveImage") => 100,
        Some("PreviewImage") => 90,
        Some("VAEDecode" | "VAEDecodeTiled" | "VAEDecodeTAESD") => 80,
        Some("LoadImage") => 0,
        _ => 50,
    }
}

fn type_priority(folder_type: &str) -> i64 {
    match folder_type.to_ascii_lowercase().as_str() {
        "output" => 3,
        "temp" => 2,
        "input" => 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(outputs: Value, prompt: Value) -> Value {
        json!({ "outputs": outputs, "prompt": prompt })
    }

    #[test]
    fn test_img2img_picks_output_over_input() {
        let history = entry(
            json!({
                "10": { "images": [ { "filename": "in.png", "subfolder": "", "type": "input" } ] },
                "20": { "images": [ { "filename": "out.png", "subfolder": "", "type": "output" } ] },
            }),
            json!({
                "10": { "class_type": "LoadImage" },
                "20": { "class_type": "SaveImage" },
            }),
        );
        let refs = select_images(&history);
        assert_eq!(refs.len(), 1, "input image is filtered out");
        assert_eq!(refs[0].filename, "out.png");
    }

    #[test]
    fn test_save_image_outranks_preview() {
        let history = entry(
            json!({
                "5": { "images": [ { "filename": "preview.png", "type": "temp" } ] },
                "6": { "images": [ { "filename": "final.png", "type": "output" } ] },
            }),
            json!({
                "5": { "class_type": "PreviewImage" },
                "6": { "class_type": "SaveImage" },
            }),
        );
        let refs = select_images(&history);
        assert_eq!(refs[0].filename, "final.png");
        assert_eq!(refs[1].filename, "preview.png");
    }

    #[test]
    fn test_node_id_breaks_ties_descending() {
        let history = entry(
            json!({
                "3": { "images": [ { "filename": "early.png", "type": "output" } ] },
                "12": { "images": [ { "filename": "late.png", "type": "output" } ] },
            }),
            json!({
                "3": { "class_type": "SaveImage" },
                "12": { "class_type": "SaveImage" },
            }),
        );
        let refs = select_images(&history);
        assert_eq!(refs[0].filename, "late.png");
    }

    #[test]
    fn test_input_only_history_still_returns_input() {
        let history = entry(
            json!({
                "1": { "images": [ { "filename": "only.png", "type": "input" } ] },
            }),
            json!({ "1": { "class_type": "LoadImage" } }),
        );
        let refs = select_images(&history);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].filename, "only.png");
    }

    #[test]
    fn test_graph_in_queue_tuple_form() {
        let history = json!({
            "outputs": {
                "7": { "images": [ { "filename": "x.png", "type": "output" } ] },
            },
            "prompt": [1, "pid", { "7": { "class_type": "SaveImage" } }],
        });
        let refs = select_images(&history);
        assert_eq!(refs[0].filename, "x.png");
    }

    #[test]
    fn test_missing_graph_uses_folder_priority() {
        let history = json!({
            "outputs": {
                "2": { "images": [ { "filename": "a.png", "type": "input" } ] },
                "4": { "images": [ { "filename": "b.png", "type": "temp" } ] },
            },
        });
        let refs = select_images(&history);
        assert_eq!(refs[0].filename, "b.png");
        assert_eq!(refs.len(), 1, "input dropped when temp exists");
    }

    #[test]
    fn test_empty_history_is_empty() {
        assert!(select_images(&Value::Null).is_empty());
        assert!(select_images(&json!({})).is_empty());
    }
}
