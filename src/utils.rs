use std::{env, path::PathBuf, str::FromStr};

use base64::{engine::general_purpose, Engine as _};
use image::ImageFormat;
use regex::Regex;
use serde::Serialize;

use crate::assembler::PredictionShape;
use crate::error::{AppError, Result};
use crate::pipeline::EmptyCandidates;

// Prefer Korean names from web detection.
const DEFAULT_SCRIPT_FILTER: &str = r"\p{Hangul}";

/// A decoded upload with its sniffed content type.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInput {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

impl ImageInput {
    /// Accepts bare base64 or a `data:image/...;base64,` URL.
    pub fn from_base64(field: &str, encoded: &str) -> Result<Self> {
        let payload = match encoded.trim().split_once(";base64,") {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => encoded.trim(),
        };
        let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();

        let bytes = general_purpose::STANDARD
            .decode(&cleaned)
            .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(&cleaned))
            .map_err(|_| AppError::validation(format!("{} is not valid base64", field)))?;

        Self::from_bytes(field, bytes)
    }

    pub fn from_bytes(field: &str, bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(AppError::validation(format!("{} is empty", field)));
        }

        let format = image::guess_format(&bytes)
            .map_err(|_| AppError::validation(format!("{} is not a recognizable image", field)))?;
        let content_type = match format {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::WebP => "image/webp",
            ImageFormat::Bmp => "image/bmp",
            ImageFormat::Tiff => "image/tiff",
            other => {
                return Err(AppError::validation(format!(
                    "{} has unsupported image format {:?}",
                    field, other
                )))
            }
        };

        Ok(Self {
            bytes,
            content_type,
        })
    }
}

pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/tiff" => "tiff",
        _ => "jpg",
    }
}

#[derive(Debug, Clone)]
pub struct AzureConfig {
    pub account_url: String,
    pub container: String,
    pub sas_token: Option<String>,
}

const DEFAULT_SAFETY_SETTINGS: &str = "HARM_CATEGORY_HARASSMENT=BLOCK_ONLY_HIGH,\
HARM_CATEGORY_HATE_SPEECH=BLOCK_ONLY_HIGH,\
HARM_CATEGORY_SEXUALLY_EXPLICIT=BLOCK_LOW_AND_ABOVE,\
HARM_CATEGORY_DANGEROUS_CONTENT=BLOCK_ONLY_HIGH";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

impl SafetySetting {
    /// Parses `CATEGORY=THRESHOLD` pairs separated by commas; `off` yields none.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        if list.trim().eq_ignore_ascii_case("off") {
            return Ok(Vec::new());
        }

        list.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((category, threshold))
                    if !category.trim().is_empty() && !threshold.trim().is_empty() =>
                {
                    Ok(SafetySetting {
                        category: category.trim().to_ascii_uppercase(),
                        threshold: threshold.trim().to_ascii_uppercase(),
                    })
                }
                _ => Err(AppError::Config(format!(
                    "GEMINI_SAFETY_SETTINGS entry {:?} is not CATEGORY=THRESHOLD",
                    pair
                ))),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub top_p: f32,
    pub safety_settings: Vec<SafetySetting>,
    pub google_search: bool,
    pub system_instruction: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub body_limit_bytes: usize,
    pub max_candidates: usize,
    pub max_references: usize,
    pub script_filter: Option<Regex>,
    pub reference_domains: Option<Vec<String>>,
    pub prompt_template_path: Option<PathBuf>,
    pub max_context_chars: usize,
    pub prediction_shape: PredictionShape,
    pub empty_candidates: EmptyCandidates,
    pub azure: AzureConfig,
    pub vision_api_key: String,
    pub gemini: GeminiConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let required = |name: &str| {
            var(name).ok_or_else(|| AppError::Config(format!("{} must be set", name)))
        };

        let body_limit_mb: usize = parse_var(&var, "BODY_LIMIT_MB", 5)?;

        let script_filter = match var("CANDIDATE_SCRIPT_FILTER").as_deref().map(str::trim) {
            Some("off") => None,
            Some(pattern) => Some(Regex::new(pattern).map_err(|err| {
                AppError::Config(format!("CANDIDATE_SCRIPT_FILTER is not a valid regex: {}", err))
            })?),
            None => Some(Regex::new(DEFAULT_SCRIPT_FILTER).map_err(|err| {
                AppError::Config(err.to_string())
            })?),
        };

        let reference_domains = var("REFERENCE_DOMAINS").map(|list| {
            list.split(',')
                .map(|domain| domain.trim().to_string())
                .filter(|domain| !domain.is_empty())
                .collect::<Vec<_>>()
        });

        let prediction_shape = match var("PREDICTION_SHAPE") {
            Some(value) => value.parse().map_err(AppError::Config)?,
            None => PredictionShape::List,
        };
        let empty_candidates = match var("EMPTY_CANDIDATES") {
            Some(value) => value.parse().map_err(AppError::Config)?,
            None => EmptyCandidates::Prompt,
        };

        let google_api_key = required("GOOGLE_API_KEY")?;

        Ok(Config {
            port: parse_var(&var, "PORT", 5020)?,
            body_limit_bytes: body_limit_mb * 1024 * 1024,
            max_candidates: parse_var(&var, "MAX_CANDIDATES", 3)?,
            max_references: parse_var(&var, "MAX_REFERENCES", 5)?,
            script_filter,
            reference_domains,
            prompt_template_path: var("PROMPT_TEMPLATE_PATH").map(PathBuf::from),
            max_context_chars: parse_var(&var, "MAX_CONTEXT_CHARS", 500)?,
            prediction_shape,
            empty_candidates,
            azure: AzureConfig {
                account_url: required("AZURE_STORAGE_ACCOUNT_URL")?,
                container: required("AZURE_STORAGE_CONTAINER")?,
                sas_token: var("AZURE_STORAGE_SAS"),
            },
            vision_api_key: var("VISION_API_KEY").unwrap_or_else(|| google_api_key.clone()),
            gemini: GeminiConfig {
                api_key: google_api_key,
                model: var("GEMINI_MODEL").unwrap_or_else(|| "gemini-2.0-flash-001".into()),
                max_output_tokens: parse_var(&var, "GEMINI_MAX_OUTPUT_TOKENS", 1024)?,
                top_p: parse_var(&var, "GEMINI_TOP_P", 0.5)?,
                safety_settings: SafetySetting::parse_list(
                    var("GEMINI_SAFETY_SETTINGS")
                        .as_deref()
                        .unwrap_or(DEFAULT_SAFETY_SETTINGS),
                )?,
                google_search: parse_var(&var, "GEMINI_GOOGLE_SEARCH", true)?,
                system_instruction: var("GEMINI_SYSTEM_INSTRUCTION"),
            },
        })
    }
}

fn parse_var<T, F>(var: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{} has an invalid value: {}", name, raw))),
        None => Ok(default),
    }
}
