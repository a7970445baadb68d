use std::cmp::Ordering;
use std::collections::HashMap;

use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A label proposed by the vision collaborator, before ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedLabel {
    #[serde(default)]
    pub text: String,
    #[serde(default, deserialize_with = "lenient_score")]
    pub score: f32,
    #[serde(
        default,
        rename = "sourceDomain",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_domain: Option<String>,
}

impl DetectedLabel {
    pub fn new(text: impl Into<String>, score: f32) -> Self {
        Self {
            text: text.into(),
            score: clamp_score(score),
            source_domain: None,
        }
    }

    pub fn with_source_domain(mut self, domain: impl Into<String>) -> Self {
        self.source_domain = Some(domain.into());
        self
    }
}

fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

fn lenient_score<'de, D>(deserializer: D) -> Result<f32, D::Error>
where
    D: Deserializer<'de>,
{
    let score = Option::<f32>::deserialize(deserializer)?;
    Ok(clamp_score(score.unwrap_or(0.0)))
}

/// Ranked, deduplicated candidates. Serializes as a plain array of texts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateList(Vec<DetectedLabel>);

impl CandidateList {
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = CandidateList::default();
        for text in texts {
            let text = text.into();
            if !list.contains(&text) {
                list.0.push(DetectedLabel::new(text, 0.0));
            }
        }
        list
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DetectedLabel> {
        self.0.iter()
    }

    pub fn contains(&self, text: &str) -> bool {
        self.0.iter().any(|label| label.text == text)
    }

    pub fn texts(&self) -> Vec<&str> {
        self.0.iter().map(|label| label.text.as_str()).collect()
    }
}

impl Serialize for CandidateList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(|label| label.text.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct RankOptions {
    pub max_results: usize,
    pub script_filter: Option<Regex>,
    pub domain_allow_list: Option<Vec<String>>,
}

impl RankOptions {
    pub fn new(max_results: usize) -> Self {
        Self {
            max_results,
            script_filter: None,
            domain_allow_list: None,
        }
    }

    pub fn with_script_filter(mut self, filter: Regex) -> Self {
        self.script_filter = Some(filter);
        self
    }

    pub fn with_domain_allow_list(mut self, domains: Vec<String>) -> Self {
        self.domain_allow_list = Some(domains);
        self
    }
}

/// Deduplicates and orders raw labels by frequency, then summed score, then
/// first appearance. Entries passing the filters come first; the remaining
/// slots are backfilled from the unfiltered ranking.
pub fn rank(raw: &[DetectedLabel], opts: &RankOptions) -> CandidateList {
    if opts.max_results == 0 {
        return CandidateList::default();
    }

    let pool: Vec<&DetectedLabel> = raw
        .iter()
        .filter(|label| !label.text.trim().is_empty())
        .collect();
    if pool.is_empty() {
        return CandidateList::default();
    }

    let mut filtered = pool.clone();
    if let Some(filter) = &opts.script_filter {
        filtered = prefer(filtered, |label| filter.is_match(&label.text));
    }
    if let Some(domains) = &opts.domain_allow_list {
        filtered = prefer(filtered, |label| matches_domain(label, domains));
    }

    let mut ranked = aggregate(&filtered);
    ranked.truncate(opts.max_results);

    if ranked.len() < opts.max_results {
        for label in aggregate(&pool) {
            if ranked.len() >= opts.max_results {
                break;
            }
            if !ranked.iter().any(|kept| kept.text == label.text) {
                ranked.push(label);
            }
        }
    }

    CandidateList(ranked)
}

// Falls back to the whole pool when nothing matches.
fn prefer<'a, F>(pool: Vec<&'a DetectedLabel>, keep: F) -> Vec<&'a DetectedLabel>
where
    F: Fn(&DetectedLabel) -> bool,
{
    let (matching, rest): (Vec<_>, Vec<_>) = pool.into_iter().partition(|label| keep(*label));
    if matching.is_empty() {
        rest
    } else {
        matching
    }
}

struct Tally {
    first_index: usize,
    count: usize,
    score: f32,
    source_domain: Option<String>,
}

fn aggregate<'a>(labels: &[&'a DetectedLabel]) -> Vec<DetectedLabel> {
    let mut tallies: HashMap<&'a str, Tally> = HashMap::new();
    for (index, &label) in labels.iter().enumerate() {
        let tally = tallies.entry(label.text.as_str()).or_insert_with(|| Tally {
            first_index: index,
            count: 0,
            score: 0.0,
            source_domain: label.source_domain.clone(),
        });
        tally.count += 1;
        tally.score += label.score;
    }

    let mut ranked: Vec<(&str, Tally)> = tallies.into_iter().collect();
    ranked.sort_by(|(_, a), (_, b)| {
        b.count
            .cmp(&a.count)
            .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
            .then_with(|| a.first_index.cmp(&b.first_index))
    });

    ranked
        .into_iter()
        .map(|(text, tally)| DetectedLabel {
            text: text.to_string(),
            score: clamp_score(tally.score),
            source_domain: tally.source_domain,
        })
        .collect()
}

fn host_of(label: &DetectedLabel) -> Option<String> {
    let parse_host = |value: &str| {
        Url::parse(value)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
    };

    match &label.source_domain {
        Some(domain) => parse_host(domain).or_else(|| {
            let domain = domain.trim().to_ascii_lowercase();
            (!domain.is_empty()).then_some(domain)
        }),
        None => parse_host(&label.text),
    }
}

fn matches_domain(label: &DetectedLabel, allow_list: &[String]) -> bool {
    let Some(host) = host_of(label) else {
        return false;
    };

    // suffix or substring match on the host
    allow_list
        .iter()
        .map(|domain| domain.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|domain| !domain.is_empty())
        .any(|domain| host.contains(&domain))
}
