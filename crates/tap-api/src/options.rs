//! Traffic filtering options delivered by the control plane

use regex::Regex;
use serde::{Deserialize, Deserializer};

/// Per-exchange filtering applied before emission.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrafficFilteringOptions {
    /// Matches in plain-text bodies are replaced with the redaction marker
    #[serde(deserialize_with = "deserialize_regexes")]
    pub plain_text_masking_regexes:       Vec<Regex>,
    /// Exchanges whose request User-Agent contains one of these are dropped
    pub health_checks_user_agent_headers: Vec<String>,
    pub disable_redaction:                bool,
}

impl TrafficFilteringOptions {
    /// Parse the JSON document; an empty string yields the defaults.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
    }

    /// Case-insensitive substring match against the health-check list.
    pub fn is_health_check(&self, user_agent: &str) -> bool {
        let ua = user_agent.to_ascii_lowercase();
        self.health_checks_user_agent_headers
            .iter()
            .any(|h| !h.is_empty() && ua.contains(&h.to_ascii_lowercase()))
    }
}

/// Regexes arrive either as bare strings or as `{"regex": "..."}` objects.
fn deserialize_regexes<'de, D>(deserializer: D) -> Result<Vec<Regex>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Plain(String),
        Wrapped { regex: String },
    }

    let raw: Option<Vec<Raw>> = Option::deserialize(deserializer)?;
    raw.unwrap_or_default()
        .into_iter()
        .map(|r| {
            let pattern = match r {
                Raw::Plain(p) | Raw::Wrapped { regex: p } => p,
            };
            Regex::new(&pattern).map_err(serde::de::Error::custom)
        })
        .collect()
}
