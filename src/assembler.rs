use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ranker::CandidateList;

/// `cause` / `remedy` payload: one sentence or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Field {
    Text(String),
    List(Vec<String>),
}

impl Default for Field {
    fn default() -> Self {
        Field::Text(String::new())
    }
}

impl Field {
    fn is_list(&self) -> bool {
        matches!(self, Field::List(_))
    }

    fn into_list(self) -> Field {
        match self {
            Field::Text(text) if text.is_empty() => Field::List(Vec::new()),
            Field::Text(text) => Field::List(vec![text]),
            list => list,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisResult {
    pub pest: String,
    pub cause: Field,
    pub remedy: Field,
}

impl DiagnosisResult {
    /// Missing keys become empty values; `cause` and `remedy` always end up
    /// with the same arity.
    pub fn from_object(object: &Map<String, Value>) -> Self {
        let cause = field_of(object.get("cause"));
        let remedy = field_of(object.get("remedy"));

        let (cause, remedy) = if cause.is_list() || remedy.is_list() {
            (cause.into_list(), remedy.into_list())
        } else {
            (cause, remedy)
        };

        Self {
            pest: text_of(object.get("pest")),
            cause,
            remedy,
        }
    }
}

fn text_of(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.trim().to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| text_of(Some(item)))
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        Some(other) => other.to_string(),
    }
}

// Absent values stay scalar here; arity is settled by the caller.
fn field_of(value: Option<&Value>) -> Field {
    match value {
        Some(Value::Array(items)) => Field::List(
            items
                .iter()
                .map(|item| text_of(Some(item)))
                .filter(|text| !text.is_empty())
                .collect(),
        ),
        other => Field::Text(text_of(other)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionShape {
    List,
    Single,
}

impl FromStr for PredictionShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "list" | "array" => Ok(PredictionShape::List),
            "single" | "object" => Ok(PredictionShape::Single),
            other => Err(format!("unknown prediction shape: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Predictions {
    Single(DiagnosisResult),
    Many(Vec<DiagnosisResult>),
}

impl Predictions {
    pub fn from_value(parsed: &Value) -> Self {
        match parsed {
            Value::Object(object) => Predictions::Single(DiagnosisResult::from_object(object)),
            Value::Array(items) => Predictions::Many(
                items
                    .iter()
                    .filter_map(Value::as_object)
                    .map(DiagnosisResult::from_object)
                    .collect(),
            ),
            _ => Predictions::Many(Vec::new()),
        }
    }

    /// Pins the wire shape a deployment's frontend expects. An empty list
    /// stays an empty list rather than becoming a blank diagnosis.
    pub fn into_shape(self, shape: PredictionShape) -> Self {
        match (self, shape) {
            (Predictions::Single(result), PredictionShape::List) => Predictions::Many(vec![result]),
            (Predictions::Many(results), PredictionShape::Single) => {
                match results.into_iter().next() {
                    Some(first) => Predictions::Single(first),
                    None => Predictions::Many(Vec::new()),
                }
            }
            (predictions, _) => predictions,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Predictions::Single(_) => 1,
            Predictions::Many(results) => results.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResponse {
    image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_urls: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidates: Option<CandidateList>,
    predictions: Predictions,
}

impl AnalysisResponse {
    /// Response for a request that stopped before the model call.
    pub fn partial(upload_url: &str, candidates: Option<CandidateList>) -> Self {
        Self {
            image_url: upload_url.to_string(),
            image_urls: None,
            candidates,
            predictions: Predictions::Many(Vec::new()),
        }
    }

    pub fn with_image_urls(mut self, urls: Vec<String>) -> Self {
        if urls.len() > 1 {
            self.image_urls = Some(urls);
        }
        self
    }

    pub fn with_shape(mut self, shape: PredictionShape) -> Self {
        self.predictions = self.predictions.into_shape(shape);
        self
    }

    pub fn image_url(&self) -> &str {
        &self.image_url
    }

    pub fn image_urls(&self) -> Option<&[String]> {
        self.image_urls.as_deref()
    }

    pub fn candidates(&self) -> Option<&CandidateList> {
        self.candidates.as_ref()
    }

    pub fn predictions(&self) -> &Predictions {
        &self.predictions
    }
}

pub fn assemble(
    upload_url: &str,
    candidates: Option<CandidateList>,
    parsed: &Value,
) -> AnalysisResponse {
    AnalysisResponse {
        image_url: upload_url.to_string(),
        image_urls: None,
        candidates,
        predictions: Predictions::from_value(parsed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_shape_is_kept() {
        let response = assemble(
            "https://x/img.jpg",
            Some(CandidateList::from_texts(["a", "b"])),
            &json!({"pest": "p", "cause": "c", "remedy": "r"}),
        );
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "imageUrl": "https://x/img.jpg",
                "candidates": ["a", "b"],
                "predictions": {"pest": "p", "cause": "c", "remedy": "r"}
            })
        );
    }

    #[test]
    fn test_array_maps_one_to_one() {
        let parsed = json!([
            {"pest": "선녀벌레", "cause": ["고온", "다습"], "remedy": ["방제"]},
            {"pest": "떡병", "cause": ["습기"], "remedy": ["제거", "살균제"]},
            "stray text",
        ]);
        let response = assemble("u", None, &parsed);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["predictions"].as_array().unwrap().len(), 2);
        assert_eq!(value["predictions"][1]["remedy"], json!(["제거", "살균제"]));
        assert!(value.get("candidates").is_none());
    }

    #[test]
    fn test_missing_keys_become_empty() {
        let response = assemble("u", None, &json!({"pest": "응애"}));
        assert_eq!(
            serde_json::to_value(response.predictions()).unwrap(),
            json!({"pest": "응애", "cause": "", "remedy": ""})
        );

        let response = assemble("u", None, &json!([{"cause": ["a"]}]));
        assert_eq!(
            serde_json::to_value(response.predictions()).unwrap(),
            json!([{"pest": "", "cause": ["a"], "remedy": []}])
        );
    }

    #[test]
    fn test_arity_is_repaired() {
        let result = DiagnosisResult::from_object(
            json!({"pest": "a", "cause": "one cause", "remedy": ["x", "y"]})
                .as_object()
                .unwrap(),
        );
        assert_eq!(result.cause, Field::List(vec!["one cause".to_string()]));
        assert_eq!(result.remedy, Field::List(vec!["x".to_string(), "y".to_string()]));
    }

    #[test]
    fn test_non_string_values_are_stringified() {
        let result = DiagnosisResult::from_object(
            json!({"pest": 42, "cause": [1, null, "b"], "remedy": true})
                .as_object()
                .unwrap(),
        );
        assert_eq!(result.pest, "42");
        assert_eq!(result.cause, Field::List(vec!["1".to_string(), "b".to_string()]));
        assert_eq!(result.remedy, Field::List(vec!["true".to_string()]));
    }

    #[test]
    fn test_into_shape() {
        let single = Predictions::from_value(&json!({"pest": "a"}));
        let list = single.clone().into_shape(PredictionShape::List);
        assert_eq!(list.len(), 1);
        assert!(matches!(list, Predictions::Many(_)));

        assert_eq!(single.clone().into_shape(PredictionShape::Single), single);

        let first = Predictions::from_value(&json!([{"pest": "a"}, {"pest": "b"}]))
            .into_shape(PredictionShape::Single);
        assert!(matches!(first, Predictions::Single(ref result) if result.pest == "a"));
    }

    #[test]
    fn test_empty_list_is_not_a_blank_single() {
        let empty = Predictions::Many(Vec::new()).into_shape(PredictionShape::Single);
        assert_eq!(empty, Predictions::Many(Vec::new()));

        let response = AnalysisResponse::partial("u", None).with_shape(PredictionShape::Single);
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"imageUrl": "u", "predictions": []})
        );
    }

    #[test]
    fn test_partial_and_image_urls() {
        let response = AnalysisResponse::partial("u1", Some(CandidateList::default()))
            .with_image_urls(vec!["u1".into(), "u2".into()]);
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"imageUrl": "u1", "imageUrls": ["u1", "u2"], "candidates": [], "predictions": []})
        );
        assert!(response.predictions().is_empty());
    }

    #[test]
    fn test_prediction_shape_from_str() {
        assert_eq!("LIST".parse::<PredictionShape>().unwrap(), PredictionShape::List);
        assert_eq!("single".parse::<PredictionShape>().unwrap(), PredictionShape::Single);
        assert!("both".parse::<PredictionShape>().is_err());
    }
}
