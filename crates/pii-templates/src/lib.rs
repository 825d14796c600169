//! Static detection-template configuration (§3 `DetectionTemplates`, §6
//! "Template file"), loaded once at startup from a YAML file.

use serde::{Deserialize, Serialize};

use pii_core::error::{PiiError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct InfoType {
    pub name: String,
}

/// A custom info-type definition. Only `name` is interpreted by this
/// workspace (for dedup and for matching against a context's
/// `expected_pii_type`); everything else in the definition is carried
/// through opaquely to the detection engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomInfoType {
    pub name: String,
    #[serde(flatten)]
    pub definition: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HotwordRule {
    pub hotword_regex: String,
    pub proximity_window_before: u32,
    pub proximity_window_after: u32,
    pub likelihood: String,
}

impl HotwordRule {
    /// A symmetric-window catch-all rule boosting likelihood to
    /// `VERY_LIKELY` (§4.2 step 2).
    pub fn catch_all_boost(likelihood: &str, proximity_window: u32) -> Self {
        Self {
            hotword_regex: ".*".to_string(),
            proximity_window_before: proximity_window,
            proximity_window_after: proximity_window,
            likelihood: likelihood.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSet {
    pub info_types: Vec<InfoType>,
    #[serde(default)]
    pub hotword_rules: Vec<HotwordRule>,
}

impl RuleSet {
    pub fn references(&self, info_type: &str) -> bool {
        self.info_types.iter().any(|t| t.name == info_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InspectConfig {
    #[serde(default)]
    pub info_types: Vec<InfoType>,
    #[serde(default)]
    pub custom_info_types: Vec<CustomInfoType>,
    #[serde(default)]
    pub min_likelihood: Option<String>,
    #[serde(default)]
    pub rule_set: Vec<RuleSet>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DlpTemplateNames {
    pub inspect_template_name: Option<String>,
    pub deidentify_template_name: Option<String>,
}

impl DlpTemplateNames {
    /// Substitute the literal `${PROJECT_ID}` token in both template names
    /// (§6, R2). Grounded on `update_dlp_templates.py`'s
    /// `.replace("${PROJECT_ID}", project_id)`.
    pub fn substitute_project_id(&mut self, project_id: &str) {
        if let Some(name) = self.inspect_template_name.as_mut() {
            *name = name.replace("${PROJECT_ID}", project_id);
        }
        if let Some(name) = self.deidentify_template_name.as_mut() {
            *name = name.replace("${PROJECT_ID}", project_id);
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawDetectionTemplates {
    dlp_location: String,
    dlp_templates: DlpTemplateNames,
    inspect_config: InspectConfig,
    #[serde(default)]
    deidentify_config: serde_json::Value,
    #[serde(default)]
    context_keywords: serde_yaml::Mapping,
}

/// Static configuration record (§3, §6). `context_keywords` is an
/// *ordered* mapping from PII-type tag to trigger substrings — iteration
/// order determines which tag wins on an ambiguous transcript (§4.2,
/// I3) — so it is kept as a `Vec` rather than a sorted map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionTemplates {
    pub dlp_location: String,
    pub dlp_templates: DlpTemplateNames,
    pub inspect_config: InspectConfig,
    pub deidentify_config: serde_json::Value,
    pub context_keywords: Vec<(String, Vec<String>)>,
}

impl DetectionTemplates {
    /// Load from a YAML file and substitute `${PROJECT_ID}` into the
    /// template names.
    pub fn load_from_file(path: &str, project_id: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::load_from_str(&raw, project_id)
    }

    pub fn load_from_str(raw: &str, project_id: &str) -> Result<Self> {
        let raw: RawDetectionTemplates = serde_yaml::from_str(raw)
            .map_err(|e| PiiError::Config(format!("invalid detection template file: {e}")))?;

        let mut dlp_templates = raw.dlp_templates;
        dlp_templates.substitute_project_id(project_id);

        let mut context_keywords = Vec::with_capacity(raw.context_keywords.len());
        for (key, value) in raw.context_keywords {
            let key = key
                .as_str()
                .ok_or_else(|| PiiError::Config("context_keywords key must be a string".into()))?
                .to_string();
            let keywords: Vec<String> = serde_yaml::from_value(value).map_err(|e| {
                PiiError::Config(format!("context_keywords['{key}'] must be a string list: {e}"))
            })?;
            context_keywords.push((key, keywords));
        }

        Ok(Self {
            dlp_location: raw.dlp_location,
            dlp_templates,
            inspect_config: raw.inspect_config,
            deidentify_config: raw.deidentify_config,
            context_keywords,
        })
    }

    /// First-match-wins scan of `context_keywords` against a lower-cased
    /// transcript (§4.2 `/handle-agent-utterance`, I3). ASCII lowercasing
    /// only — preserved verbatim from the source, no Unicode normalization
    /// (§9 "deliberately-left-ambiguous").
    pub fn match_expected_pii_type(&self, transcript: &str) -> Option<&str> {
        let lowered = transcript.to_lowercase();
        for (pii_type, keywords) in &self.context_keywords {
            for keyword in keywords {
                if lowered.contains(&keyword.to_lowercase()) {
                    return Some(pii_type.as_str());
                }
            }
        }
        None
    }

    pub fn custom_info_type(&self, name: &str) -> Option<&CustomInfoType> {
        self.inspect_config
            .custom_info_types
            .iter()
            .find(|c| c.name == name)
    }
}
