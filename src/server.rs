use std::sync::Arc;

use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, DefaultBodyLimit, Multipart,
        State,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::assembler::AnalysisResponse;
use crate::error::{AppError, Result};
use crate::pipeline::{AnalysisRequest, Analyzer, MAX_IMAGES};
use crate::utils::ImageInput;

pub struct AppState {
    analyzer: Analyzer,
}

pub fn app(analyzer: Analyzer, body_limit_bytes: usize) -> Router {
    let shared_state = Arc::new(AppState { analyzer });

    Router::new()
        .route("/api/analyze", post(analyze_handler))
        .route("/api/analyze/upload", post(upload_handler))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .with_state(shared_state)
        .route("/health", get(health_check))
        .layer(CorsLayer::permissive())
}

/// JSON body of `POST /api/analyze`: either `imageBase64` or up to three
/// `imageDataN` fields.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeBody {
    pub image_base64: Option<String>,
    pub image_data1: Option<String>,
    pub image_data2: Option<String>,
    pub image_data3: Option<String>,
    pub additional_info: Option<String>,
}

impl AnalyzeBody {
    fn into_request(self) -> Result<AnalysisRequest> {
        let encoded: Vec<(&str, String)> = [
            ("imageBase64", self.image_base64),
            ("imageData1", self.image_data1),
            ("imageData2", self.image_data2),
            ("imageData3", self.image_data3),
        ]
        .into_iter()
        .filter_map(|(field, value)| value.filter(|v| !v.trim().is_empty()).map(|v| (field, v)))
        .collect();

        if encoded.is_empty() {
            return Err(AppError::validation(
                "imageBase64 or imageData1..imageData3 is required",
            ));
        }
        if encoded.len() > MAX_IMAGES {
            return Err(AppError::validation(format!(
                "at most {} images are accepted",
                MAX_IMAGES
            )));
        }

        let images = encoded
            .iter()
            .map(|(field, value)| ImageInput::from_base64(field, value))
            .collect::<Result<Vec<_>>>()?;

        Ok(AnalysisRequest {
            images,
            context: self.additional_info,
        })
    }
}

async fn analyze_handler(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<AnalyzeBody>, JsonRejection>,
) -> Result<Json<AnalysisResponse>> {
    let Json(body) = body.map_err(|rejection| AppError::validation(rejection.body_text()))?;
    let request = body.into_request()?;
    tracing::info!(images = request.images.len(), "analyze request");

    let response = state.analyzer.analyze(request).await?;
    Ok(Json(response))
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<AnalysisResponse>> {
    let mut multipart =
        multipart.map_err(|rejection| AppError::validation(rejection.body_text()))?;
    let mut request = AnalysisRequest::default();

    // Process multipart form to find the files
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::validation(err.to_string()))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") => {
                if request.images.len() == MAX_IMAGES {
                    return Err(AppError::validation(format!(
                        "at most {} images are accepted",
                        MAX_IMAGES
                    )));
                }
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::validation(err.to_string()))?;
                request.images.push(ImageInput::from_bytes("file", bytes.to_vec())?);
            }
            Some("additionalInfo") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| AppError::validation(err.to_string()))?;
                request.context = Some(text);
            }
            _ => {}
        }
    }

    if request.images.is_empty() {
        return Err(AppError::validation("No file uploaded"));
    }
    tracing::info!(images = request.images.len(), "upload request");

    let response = state.analyzer.analyze(request).await?;
    Ok(Json(response))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "OK" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_requires_an_image() {
        let err = AnalyzeBody::default().into_request().unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let blank = AnalyzeBody {
            image_base64: Some("   ".into()),
            ..Default::default()
        };
        assert!(blank.into_request().is_err());
    }

    #[test]
    fn test_body_field_names() {
        let body: AnalyzeBody = serde_json::from_value(json!({
            "imageData1": "a",
            "imageData3": "b",
            "additionalInfo": "철쭉"
        }))
        .unwrap();
        assert_eq!(body.image_data1.as_deref(), Some("a"));
        assert_eq!(body.image_data3.as_deref(), Some("b"));
        assert_eq!(body.additional_info.as_deref(), Some("철쭉"));
    }

    #[test]
    fn test_body_rejects_four_images() {
        let body = AnalyzeBody {
            image_base64: Some("a".into()),
            image_data1: Some("b".into()),
            image_data2: Some("c".into()),
            image_data3: Some("d".into()),
            additional_info: None,
        };
        let err = body.into_request().unwrap_err();
        assert_eq!(err.to_string(), "at most 3 images are accepted");
    }
}
