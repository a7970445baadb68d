use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;

use crate::error::{AppError, Result};
use crate::ranker::DetectedLabel;

const COLLABORATOR: &str = "vision";
const ANNOTATE_URL: &str = "https://vision.googleapis.com/v1/images:annotate";

/// Labels and similar-image URLs for one or more images.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub labels: Vec<DetectedLabel>,
    pub similar_images: Vec<DetectedLabel>,
}

impl Detection {
    pub fn merge(mut self, other: Detection) -> Self {
        self.labels.extend(other.labels);
        self.similar_images.extend(other.similar_images);
        self
    }
}

#[async_trait]
pub trait LabelDetector: Send + Sync {
    async fn detect(&self, image: &[u8]) -> Result<Detection>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    web_detection: Option<WebDetection>,
    #[serde(default)]
    error: Option<Status>,
}

#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebDetection {
    #[serde(default)]
    pub web_entities: Vec<WebEntity>,
    #[serde(default)]
    pub best_guess_labels: Vec<BestGuessLabel>,
    #[serde(default)]
    pub visually_similar_images: Vec<WebImage>,
}

#[derive(Debug, Deserialize)]
pub struct WebEntity {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub score: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct BestGuessLabel {
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Deserialize)]
pub struct WebImage {
    #[serde(default)]
    pub url: String,
}

impl From<WebDetection> for Detection {
    fn from(web: WebDetection) -> Self {
        let best_guesses = web
            .best_guess_labels
            .into_iter()
            .filter(|guess| !guess.label.trim().is_empty())
            .map(|guess| DetectedLabel::new(guess.label, 1.0));

        let entities = web.web_entities.into_iter().filter_map(|entity| {
            let text = entity.description?;
            Some(DetectedLabel::new(text, entity.score.unwrap_or(0.0)))
        });

        let similar_images = web
            .visually_similar_images
            .into_iter()
            .filter(|image| !image.url.is_empty())
            .map(|image| {
                let host = Url::parse(&image.url)
                    .ok()
                    .and_then(|url| url.host_str().map(str::to_string));
                let label = DetectedLabel::new(image.url, 0.0);
                match host {
                    Some(host) => label.with_source_domain(host),
                    None => label,
                }
            })
            .collect();

        Detection {
            labels: best_guesses.chain(entities).collect(),
            similar_images,
        }
    }
}

/// Google Cloud Vision `WEB_DETECTION` over the REST API.
pub struct GoogleVisionDetector {
    http: Client,
    api_key: String,
    max_results: u32,
}

impl GoogleVisionDetector {
    pub fn new(http: Client, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            max_results: 20,
        }
    }
}

#[async_trait]
impl LabelDetector for GoogleVisionDetector {
    async fn detect(&self, image: &[u8]) -> Result<Detection> {
        let payload = json!({
            "requests": [{
                "image": { "content": general_purpose::STANDARD.encode(image) },
                "features": [{ "type": "WEB_DETECTION", "maxResults": self.max_results }]
            }]
        });

        let response = self
            .http
            .post(ANNOTATE_URL)
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| AppError::upstream(COLLABORATOR, err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::upstream(
                COLLABORATOR,
                format!("annotate returned {}: {}", status, body),
            ));
        }

        let annotated: AnnotateResponse = response
            .json()
            .await
            .map_err(|err| AppError::upstream(COLLABORATOR, err))?;

        let first = annotated.responses.into_iter().next().unwrap_or_default();
        if let Some(error) = first.error {
            return Err(AppError::upstream(COLLABORATOR, error.message));
        }

        let detection = Detection::from(first.web_detection.unwrap_or_default());
        tracing::debug!(
            labels = detection.labels.len(),
            similar_images = detection.similar_images.len(),
            "web detection finished"
        );
        Ok(detection)
    }
}

/// Returns the same detection for every image.
pub struct StaticDetector {
    detection: Detection,
}

impl StaticDetector {
    pub fn new(detection: Detection) -> Self {
        Self { detection }
    }
}

#[async_trait]
impl LabelDetector for StaticDetector {
    async fn detect(&self, _image: &[u8]) -> Result<Detection> {
        Ok(self.detection.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_web_detection() {
        let web: WebDetection = serde_json::from_value(json!({
            "webEntities": [
                {"entityId": "/m/01", "score": 1.37, "description": "진딧물"},
                {"entityId": "/m/02", "score": 0.4},
                {"entityId": "/m/03", "description": "Aphid"}
            ],
            "bestGuessLabels": [{"label": "aphid on rose", "languageCode": "en"}],
            "visuallySimilarImages": [
                {"url": "https://ncpms.rda.go.kr/a.jpg"},
                {"url": "not a url"}
            ]
        }))
        .unwrap();

        let detection = Detection::from(web);
        let texts: Vec<&str> = detection.labels.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["aphid on rose", "진딧물", "Aphid"]);
        assert_eq!(detection.labels[1].score, 1.0);
        assert_eq!(detection.labels[2].score, 0.0);
        assert_eq!(
            detection.similar_images[0].source_domain.as_deref(),
            Some("ncpms.rda.go.kr")
        );
        assert!(detection.similar_images[1].source_domain.is_none());
    }

    #[test]
    fn test_empty_web_detection() {
        let detection = Detection::from(WebDetection::default());
        assert_eq!(detection, Detection::default());
    }

    #[tokio::test]
    async fn test_static_detector() {
        let detection = Detection {
            labels: vec![DetectedLabel::new("응애", 0.8)],
            similar_images: Vec::new(),
        };
        let detector = StaticDetector::new(detection.clone());
        assert_eq!(detector.detect(b"img").await.unwrap(), detection);
        assert_eq!(
            detection.clone().merge(detection).labels.len(),
            2
        );
    }
}
