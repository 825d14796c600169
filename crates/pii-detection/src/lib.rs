//! Detection-request assembly and the `DetectionEngine` client contract
//! (§1 "assumed: an RPC that accepts a text item plus inspection/redaction
//! configuration and returns a redacted item"; §4.2).
//!
//! Grounded on `main_service/main.py`'s `call_dlp_for_redaction` (inline
//! inspect-config assembly, template selection) — this crate owns only the
//! pure request-building logic; `pii-redactor` owns the endpoint handlers
//! and the template-not-found retry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use pii_core::types::RedactionContext;
use pii_templates::{DetectionTemplates, HotwordRule, InfoType, RuleSet};

/// A fully-assembled request to the detection engine, mirroring §4.2 step 2.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionRequest {
    pub parent: String,
    pub item: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inspect_template_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inspect_config: Option<pii_templates::InspectConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deidentify_template_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deidentify_config: Option<serde_json::Value>,
}

impl DetectionRequest {
    /// Force a fully-inline request, dropping both template names — used
    /// for the single not-found-retry attempt (§4.2 step 3).
    pub fn into_fully_inline(mut self, templates: &DetectionTemplates) -> Self {
        if self.inspect_config.is_none() {
            self.inspect_config = Some(templates.inspect_config.clone());
        }
        if self.deidentify_config.is_none() {
            self.deidentify_config = Some(templates.deidentify_config.clone());
        }
        self.inspect_template_name = None;
        self.deidentify_template_name = None;
        self
    }
}

/// Boost level applied to a context-matched built-in info type (§4.2 step 2).
const CONTEXT_BOOST_LIKELIHOOD: &str = "VERY_LIKELY";
/// Symmetric hotword proximity window, in characters (§4.2 step 2).
const CONTEXT_HOTWORD_PROXIMITY: u32 = 100;

/// Assemble the detection request for one customer-turn transcript,
/// returning the request plus whether dynamic context was applied (for the
/// response's `context_used` field, §4.2 step 4).
pub fn build_detection_request(
    parent: &str,
    transcript: &str,
    context: Option<&RedactionContext>,
    templates: &DetectionTemplates,
    allow_inline_configs: bool,
) -> (DetectionRequest, bool) {
    let mut inline_inspect = templates.inspect_config.clone();
    let mut dynamic_context_applied = false;

    if allow_inline_configs {
        if let Some(ctx) = context {
            let pii_type = ctx.expected_pii_type.as_str();
            if templates.custom_info_type(pii_type).is_some() {
                let custom = templates.custom_info_type(pii_type).unwrap().clone();
                if !inline_inspect
                    .custom_info_types
                    .iter()
                    .any(|c| c.name == custom.name)
                {
                    inline_inspect.custom_info_types.push(custom);
                }
                dynamic_context_applied = true;
            } else {
                if !inline_inspect.info_types.iter().any(|t| t.name == pii_type) {
                    inline_inspect.info_types.push(InfoType {
                        name: pii_type.to_string(),
                    });
                }

                let boost_rule = HotwordRule::catch_all_boost(
                    CONTEXT_BOOST_LIKELIHOOD,
                    CONTEXT_HOTWORD_PROXIMITY,
                );

                match inline_inspect
                    .rule_set
                    .iter_mut()
                    .find(|rs| rs.references(pii_type))
                {
                    Some(existing) => existing.hotword_rules = vec![boost_rule],
                    None => inline_inspect.rule_set.push(RuleSet {
                        info_types: vec![InfoType {
                            name: pii_type.to_string(),
                        }],
                        hotword_rules: vec![boost_rule],
                    }),
                }

                dynamic_context_applied = true;
            }
        }
    }

    let use_inline_inspect =
        dynamic_context_applied || templates.dlp_templates.inspect_template_name.is_none();

    let (inspect_template_name, inspect_config) = if use_inline_inspect {
        (None, Some(inline_inspect))
    } else {
        (templates.dlp_templates.inspect_template_name.clone(), None)
    };

    let (deidentify_template_name, deidentify_config) =
        match &templates.dlp_templates.deidentify_template_name {
            Some(name) => (Some(name.clone()), None),
            None => (None, Some(templates.deidentify_config.clone())),
        };

    let request = DetectionRequest {
        parent: parent.to_string(),
        item: transcript.to_string(),
        inspect_template_name,
        inspect_config,
        deidentify_template_name,
        deidentify_config,
    };

    (request, dynamic_context_applied)
}

/// Error classes the detection engine RPC can return (§7, §4.2 step 3).
#[derive(Debug, thiserror::Error)]
pub enum DetectionEngineError {
    #[error("template not found")]
    TemplateNotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("method not implemented")]
    NotImplemented,
    #[error("transient error: {0}")]
    Transient(String),
    #[error("detection engine error: {0}")]
    Other(String),
}

impl DetectionEngineError {
    /// Prefix used for the `[…_ERROR]` fallback value (§4.2 step 3, §7.4).
    pub fn error_tag(&self) -> &'static str {
        match self {
            DetectionEngineError::TemplateNotFound => "DLP_TEMPLATE_NOT_FOUND_ERROR",
            DetectionEngineError::PermissionDenied => "DLP_PERMISSION_DENIED_ERROR",
            DetectionEngineError::NotImplemented => "DLP_NOT_IMPLEMENTED_ERROR",
            DetectionEngineError::Transient(_) => "DLP_TRANSIENT_ERROR",
            DetectionEngineError::Other(_) => "DLP_PROCESSING_ERROR",
        }
    }
}

#[async_trait]
pub trait DetectionEngine: Send + Sync {
    async fn redact(&self, request: &DetectionRequest) -> Result<String, DetectionEngineError>;
}

/// HTTP-backed RPC client — the detection engine is an external
/// collaborator (§1); this just carries the request/response shape over
/// `reqwest`.
pub struct HttpDetectionEngine {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDetectionEngine {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DetectionResponse {
    redacted_item: String,
}

#[async_trait]
impl DetectionEngine for HttpDetectionEngine {
    async fn redact(&self, request: &DetectionRequest) -> Result<String, DetectionEngineError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| DetectionEngineError::Transient(e.to_string()))?;

        match response.status().as_u16() {
            200..=299 => {
                let parsed: DetectionResponse = response
                    .json()
                    .await
                    .map_err(|e| DetectionEngineError::Other(e.to_string()))?;
                Ok(parsed.redacted_item)
            }
            404 => Err(DetectionEngineError::TemplateNotFound),
            403 => Err(DetectionEngineError::PermissionDenied),
            501 => Err(DetectionEngineError::NotImplemented),
            502 | 503 | 504 => {
                Err(DetectionEngineError::Transient(format!("status {}", response.status())))
            }
            other => Err(DetectionEngineError::Other(format!("status {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_templates(with_server_templates: bool) -> DetectionTemplates {
        let yaml = if with_server_templates {
            r#"
dlp_location: global
dlp_templates:
  inspect_template_name: "projects/${PROJECT_ID}/locations/global/inspectTemplates/identify"
  deidentify_template_name: "projects/${PROJECT_ID}/locations/global/deidentifyTemplates/deidentify"
inspect_config:
  info_types:
    - name: EMAIL_ADDRESS
  min_likelihood: POSSIBLE
deidentify_config:
  replace_with_info_type_config: {}
context_keywords:
  PHONE_NUMBER: ["phone number"]
  US_SOCIAL_SECURITY_NUMBER: ["ssn"]
"#
        } else {
            r#"
dlp_location: global
dlp_templates:
  inspect_template_name: null
  deidentify_template_name: null
inspect_config:
  info_types:
    - name: EMAIL_ADDRESS
  min_likelihood: POSSIBLE
deidentify_config:
  replace_with_info_type_config: {}
context_keywords:
  PHONE_NUMBER: ["phone number"]
  US_SOCIAL_SECURITY_NUMBER: ["ssn"]
"#
        };
        DetectionTemplates::load_from_str(yaml, "my-project").unwrap()
    }

    #[test]
    fn no_context_uses_server_template_when_configured() {
        let templates = sample_templates(true);
        let (request, dynamic) =
            build_detection_request("projects/p/locations/us-central1", "hello", None, &templates, true);
        assert!(!dynamic);
        assert!(request.inspect_config.is_none());
        assert_eq!(
            request.inspect_template_name.as_deref(),
            Some("projects/my-project/locations/global/inspectTemplates/identify")
        );
    }

    #[test]
    fn no_context_uses_inline_config_when_no_template_configured() {
        let templates = sample_templates(false);
        let (request, dynamic) =
            build_detection_request("projects/p/locations/us-central1", "hello", None, &templates, true);
        assert!(!dynamic);
        assert!(request.inspect_config.is_some());
        assert!(request.inspect_template_name.is_none());
    }

    #[test]
    fn built_in_context_type_adds_info_type_and_hotword_rule() {
        let templates = sample_templates(true);
        let ctx = RedactionContext::new("PHONE_NUMBER", 100.0);
        let (request, dynamic) = build_detection_request(
            "projects/p/locations/us-central1",
            "it's 415-555-0142",
            Some(&ctx),
            &templates,
            true,
        );
        assert!(dynamic);
        let inspect = request.inspect_config.expect("inline config expected");
        assert!(inspect.info_types.iter().any(|t| t.name == "PHONE_NUMBER"));
        let rule_set = inspect
            .rule_set
            .iter()
            .find(|rs| rs.references("PHONE_NUMBER"))
            .expect("rule set for PHONE_NUMBER");
        assert_eq!(rule_set.hotword_rules[0].likelihood, "VERY_LIKELY");
        assert_eq!(rule_set.hotword_rules[0].proximity_window_before, 100);
    }

    #[test]
    fn dynamic_context_forces_inline_even_with_server_template() {
        let templates = sample_templates(true);
        let ctx = RedactionContext::new("US_SOCIAL_SECURITY_NUMBER", 100.0);
        let (request, dynamic) = build_detection_request(
            "projects/p/locations/us-central1",
            "my ssn is 123",
            Some(&ctx),
            &templates,
            true,
        );
        assert!(dynamic);
        assert!(request.inspect_config.is_some());
        assert!(request.inspect_template_name.is_none());
    }

    #[test]
    fn disallowing_inline_configs_pins_dynamic_context_applied_false() {
        let templates = sample_templates(true);
        let ctx = RedactionContext::new("PHONE_NUMBER", 100.0);
        let (request, dynamic) = build_detection_request(
            "projects/p/locations/us-central1",
            "it's 415-555-0142",
            Some(&ctx),
            &templates,
            false,
        );
        assert!(!dynamic);
        assert!(request.inspect_config.is_none());
    }

    #[test]
    fn error_tag_matches_original_dlp_processing_error_prefix() {
        let err = DetectionEngineError::Other("boom".to_string());
        assert_eq!(err.error_tag(), "DLP_PROCESSING_ERROR");
    }
}
