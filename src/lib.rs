//! Pest and disease diagnosis service.
//!
//! An uploaded image is stored, run through web detection, and the ranked
//! labels are folded into a prompt for a generative model whose free-text
//! reply is normalized into a fixed JSON schema.

pub mod assembler;
pub mod error;
pub mod model;
pub mod normalizer;
pub mod pipeline;
pub mod prompt;
pub mod ranker;
pub mod server;
pub mod storage;
pub mod utils;
pub mod vision;

pub use assembler::{assemble, AnalysisResponse, DiagnosisResult, Field, PredictionShape, Predictions};
pub use error::AppError;
pub use normalizer::{normalize, ExtractionError, Shape};
pub use pipeline::{AnalysisRequest, Analyzer, AnalyzerSettings, EmptyCandidates};
pub use prompt::{PromptBuilder, PromptSpec, PromptTemplate};
pub use ranker::{rank, CandidateList, DetectedLabel, RankOptions};
