//! Prompt translation endpoint.

use axum::Form;
use axum::Json;
use axum::extract::State;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::protocol::TranslateResponse;
use crate::api::server::AppState;

/// Form body of the translation request.
#[derive(Debug, Deserialize)]
pub struct TranslateForm {
    /// Text to translate.
    #[serde(default)]
    pub text: String,
}

/// `POST /api/v1/translate-prompt` — turn a description into one English
/// image prompt. Provider key/quota problems map to friendly messages.
pub async fn translate_prompt(
    State(state): State<AppState>,
    Form(form): Form<TranslateForm>,
) -> Result<Json<TranslateResponse>, ApiError> {
    let translated_text = state.translator.translate(&form.text).await?;
    Ok(Json(TranslateResponse { translated_text }))
}
