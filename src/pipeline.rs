use std::str::FromStr;
use std::sync::Arc;

use futures::future::try_join_all;
use reqwest::Client;

use crate::assembler::{assemble, AnalysisResponse, PredictionShape};
use crate::error::{AppError, Result};
use crate::model::{GeminiModel, GenerativeModel};
use crate::normalizer::{normalize, Shape};
use crate::prompt::{PromptBuilder, PromptSpec, PromptTemplate};
use crate::ranker::{rank, RankOptions};
use crate::storage::{AzureBlobStore, BlobStore};
use crate::utils::{Config, ImageInput};
use crate::vision::{Detection, GoogleVisionDetector, LabelDetector};

pub const MAX_IMAGES: usize = 3;

/// What to do when web detection yields no usable candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyCandidates {
    /// Ask the model anyway; the prompt carries sentinel slots.
    Prompt,
    /// Skip the model and return the upload URL with no predictions.
    Partial,
}

impl FromStr for EmptyCandidates {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prompt" => Ok(EmptyCandidates::Prompt),
            "partial" => Ok(EmptyCandidates::Partial),
            other => Err(format!("unknown empty candidates policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    pub candidates: RankOptions,
    pub references: RankOptions,
    pub shape: PredictionShape,
    pub empty_candidates: EmptyCandidates,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            candidates: RankOptions::new(3),
            references: RankOptions::new(5),
            shape: PredictionShape::List,
            empty_candidates: EmptyCandidates::Prompt,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub images: Vec<ImageInput>,
    pub context: Option<String>,
}

pub struct Analyzer {
    blob_store: Arc<dyn BlobStore>,
    detector: Arc<dyn LabelDetector>,
    model: Arc<dyn GenerativeModel>,
    prompt_builder: PromptBuilder,
    settings: AnalyzerSettings,
}

impl Analyzer {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        detector: Arc<dyn LabelDetector>,
        model: Arc<dyn GenerativeModel>,
        prompt_builder: PromptBuilder,
        settings: AnalyzerSettings,
    ) -> Self {
        Self {
            blob_store,
            detector,
            model,
            prompt_builder,
            settings,
        }
    }

    /// Wires the Azure, Vision and Gemini clients described by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|err| AppError::Config(format!("cannot build HTTP client: {}", err)))?;

        let template = match &config.prompt_template_path {
            Some(path) => PromptTemplate::load(path)?,
            None => PromptTemplate::default(),
        };
        let prompt_builder = PromptBuilder::new(template)
            .with_candidate_slots(config.max_candidates)
            .with_max_context_chars(config.max_context_chars);

        let mut candidates = RankOptions::new(config.max_candidates);
        if let Some(filter) = &config.script_filter {
            candidates = candidates.with_script_filter(filter.clone());
        }
        let mut references = RankOptions::new(config.max_references);
        if let Some(domains) = &config.reference_domains {
            references = references.with_domain_allow_list(domains.clone());
        }

        Ok(Self::new(
            Arc::new(AzureBlobStore::new(http.clone(), &config.azure)),
            Arc::new(GoogleVisionDetector::new(
                http.clone(),
                config.vision_api_key.clone(),
            )),
            Arc::new(GeminiModel::new(http, config.gemini.clone())),
            prompt_builder,
            AnalyzerSettings {
                candidates,
                references,
                shape: config.prediction_shape,
                empty_candidates: config.empty_candidates,
            },
        ))
    }

    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResponse> {
        if request.images.is_empty() {
            return Err(AppError::validation("at least one image is required"));
        }
        if request.images.len() > MAX_IMAGES {
            return Err(AppError::validation(format!(
                "at most {} images are accepted",
                MAX_IMAGES
            )));
        }

        let uploads = try_join_all(
            request
                .images
                .iter()
                .map(|image| self.blob_store.upload(&image.bytes, image.content_type)),
        );
        let detections = try_join_all(
            request
                .images
                .iter()
                .map(|image| self.detector.detect(&image.bytes)),
        );
        let (urls, detections) = futures::try_join!(uploads, detections)?;

        let detection = detections
            .into_iter()
            .fold(Detection::default(), Detection::merge);
        let candidates = rank(&detection.labels, &self.settings.candidates);
        let references = rank(&detection.similar_images, &self.settings.references);
        tracing::info!(
            images = urls.len(),
            candidates = ?candidates.texts(),
            references = references.len(),
            "ranked detection results"
        );

        let image_url = urls.first().cloned().unwrap_or_default();

        if candidates.is_empty() && self.settings.empty_candidates == EmptyCandidates::Partial {
            tracing::info!(%image_url, "no candidates detected, skipping model call");
            return Ok(AnalysisResponse::partial(&image_url, Some(candidates))
                .with_image_urls(urls)
                .with_shape(self.settings.shape));
        }

        let prompt = self.prompt_builder.build(&PromptSpec {
            candidates: candidates.clone(),
            references,
            user_context: request.context,
        });
        tracing::debug!(%prompt, "rendered prompt");

        let raw = self.model.generate(&prompt, &request.images).await?;
        tracing::debug!(%raw, "raw model response");

        let expected = match self.settings.shape {
            PredictionShape::List => Shape::Array,
            PredictionShape::Single => Shape::Object,
        };
        let parsed = normalize(&raw, expected)?;

        Ok(assemble(&image_url, Some(candidates), &parsed)
            .with_image_urls(urls)
            .with_shape(self.settings.shape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::Predictions;
    use crate::model::ScriptedModel;
    use crate::normalizer::ExtractionError;
    use crate::ranker::DetectedLabel;
    use crate::storage::MemoryBlobStore;
    use crate::vision::StaticDetector;
    use regex::Regex;

    fn png() -> ImageInput {
        ImageInput {
            bytes: b"\x89PNG\r\n\x1a\n".to_vec(),
            content_type: "image/png",
        }
    }

    fn detection() -> Detection {
        Detection {
            labels: vec![
                DetectedLabel::new("rose sawfly", 1.0),
                DetectedLabel::new("장미등에잎벌", 0.9),
                DetectedLabel::new("장미등에잎벌", 0.5),
                DetectedLabel::new("진딧물", 0.3),
            ],
            similar_images: vec![DetectedLabel::new("https://ncpms.rda.go.kr/a.jpg", 0.0)],
        }
    }

    fn analyzer(
        detection: Detection,
        settings: AnalyzerSettings,
    ) -> (Analyzer, Arc<MemoryBlobStore>, Arc<ScriptedModel>) {
        let store = Arc::new(MemoryBlobStore::new("memory://blobs"));
        let model = Arc::new(ScriptedModel::default());
        let analyzer = Analyzer::new(
            store.clone(),
            Arc::new(StaticDetector::new(detection)),
            model.clone(),
            PromptBuilder::new(PromptTemplate::default()),
            settings,
        );
        (analyzer, store, model)
    }

    fn korean_first() -> AnalyzerSettings {
        AnalyzerSettings {
            candidates: RankOptions::new(3).with_script_filter(Regex::new(r"\p{Hangul}").unwrap()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_full_pipeline() {
        let (analyzer, store, model) = analyzer(detection(), korean_first());
        model.push_reply(
            "결과입니다:\n[{\"pest\": \"장미등에잎벌\", \"cause\": [\"유충\"], \"remedy\": [\"살충제\"]},]",
        );

        let response = analyzer
            .analyze(AnalysisRequest {
                images: vec![png()],
                context: Some("장미 잎".into()),
            })
            .await
            .unwrap();

        assert_eq!(response.image_url(), "memory://blobs/upload/0.png");
        assert_eq!(
            response.candidates().unwrap().texts(),
            vec!["장미등에잎벌", "진딧물", "rose sawfly"]
        );
        assert_eq!(response.predictions().len(), 1);
        assert_eq!(store.blobs().len(), 1);

        let prompt = &model.prompts()[0];
        assert!(prompt.contains("1. 장미등에잎벌\n2. 진딧물\n3. rose sawfly"));
        assert!(prompt.contains("1. https://ncpms.rda.go.kr/a.jpg"));
        assert!(prompt.contains("장미 잎"));
    }

    #[tokio::test]
    async fn test_multiple_images_merge_detections() {
        let (analyzer, store, model) = analyzer(detection(), korean_first());
        model.push_reply("[]");

        let response = analyzer
            .analyze(AnalysisRequest {
                images: vec![png(), png()],
                context: None,
            })
            .await
            .unwrap();

        assert_eq!(store.blobs().len(), 2);
        assert_eq!(
            response.image_urls().unwrap(),
            &["memory://blobs/upload/0.png".to_string(), "memory://blobs/upload/1.png".to_string()]
        );
        assert_eq!(response.predictions(), &Predictions::Many(Vec::new()));
    }

    #[tokio::test]
    async fn test_extraction_error_propagates() {
        let (analyzer, _, model) = analyzer(detection(), AnalyzerSettings::default());
        model.push_reply("I cannot help with that.");

        let err = analyzer
            .analyze(AnalysisRequest {
                images: vec![png()],
                context: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Extraction(ExtractionError::NoBlock { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_candidates_partial() {
        let settings = AnalyzerSettings {
            empty_candidates: EmptyCandidates::Partial,
            ..Default::default()
        };
        let (analyzer, _, model) = analyzer(Detection::default(), settings);

        let response = analyzer
            .analyze(AnalysisRequest {
                images: vec![png()],
                context: None,
            })
            .await
            .unwrap();
        assert!(response.predictions().is_empty());
        assert!(model.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_single_shape_keeps_empty_reply_empty() {
        let settings = AnalyzerSettings {
            shape: PredictionShape::Single,
            ..Default::default()
        };
        let (analyzer, _, model) = analyzer(detection(), settings);
        model.push_reply("[]");

        let response = analyzer
            .analyze(AnalysisRequest {
                images: vec![png()],
                context: None,
            })
            .await
            .unwrap();
        assert_eq!(response.predictions(), &Predictions::Many(Vec::new()));
    }

    #[tokio::test]
    async fn test_empty_candidates_prompt() {
        let (analyzer, _, model) = analyzer(Detection::default(), AnalyzerSettings::default());
        model.push_reply("{\"pest\": \"모름\"}");

        let response = analyzer
            .analyze(AnalysisRequest {
                images: vec![png()],
                context: None,
            })
            .await
            .unwrap();
        assert!(model.prompts()[0].contains("1. 없음\n2. 없음\n3. 없음"));
        // object reply coerced to the list shape
        assert!(matches!(response.predictions(), Predictions::Many(items) if items.len() == 1));
    }

    #[tokio::test]
    async fn test_image_count_is_validated() {
        let (analyzer, _, _) = analyzer(detection(), AnalyzerSettings::default());
        let none = analyzer.analyze(AnalysisRequest::default()).await;
        assert!(matches!(none, Err(AppError::Validation(_))));

        let four = analyzer
            .analyze(AnalysisRequest {
                images: vec![png(); 4],
                context: None,
            })
            .await;
        assert!(matches!(four, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_empty_candidates_from_str() {
        assert_eq!("Partial".parse::<EmptyCandidates>().unwrap(), EmptyCandidates::Partial);
        assert!("fail".parse::<EmptyCandidates>().is_err());
    }
}
