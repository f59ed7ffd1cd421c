// src/services/classifier.rs
//! Client for the external phishing classifier (`POST /domain_status`).
//!
//! The classifier decides; this module only calls it and turns its JSON into
//! a [`ClassifierReport`]. Anything that does not parse into a usable verdict
//! is a protocol error, never a guess.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::ClassifierConfig;
use crate::domain::VerdictStatus;
use crate::error::{EngineError, EngineResult};

pub trait Classifier: Send + Sync {
    fn classify(&self, url: &str) -> EngineResult<ClassifierReport>;

    /// Where the classifier lives, for error messages.
    fn endpoint(&self) -> &str {
        "classifier"
    }
}

/// One entry of the ranked explanation shown on the verification surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rationale {
    Signal {
        feature: String,
        value: String,
        impact: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        weight: Option<f64>,
    },
    Note {
        text: String,
    },
}

impl Rationale {
    pub fn signal(feature: &str, value: &str, impact: &str) -> Self {
        Rationale::Signal {
            feature: feature.to_string(),
            value: value.to_string(),
            impact: impact.to_string(),
            weight: None,
        }
    }

    pub fn note(text: impl Into<String>) -> Self {
        Rationale::Note { text: text.into() }
    }

    /// Risk factor vs. safety factor, as the classifier phrases its impact.
    pub fn increases_risk(&self) -> bool {
        match self {
            Rationale::Signal { impact, .. } => impact.contains("increases"),
            Rationale::Note { .. } => false,
        }
    }

    fn weight(&self) -> Option<f64> {
        match self {
            Rationale::Signal { weight, .. } => *weight,
            Rationale::Note { .. } => None,
        }
    }
}

/// Interpreted classifier answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifierReport {
    pub status: VerdictStatus,
    pub prediction: String,
    /// Percentage in `0..=100`; absent when the classifier skipped the model.
    pub confidence: Option<f64>,
    pub rationale: Vec<Rationale>,
    /// The classifier's own reputation lookup flagged the URL.
    pub reputation_flagged: bool,
}

// ---------- wire format ----------

#[derive(Debug, Serialize)]
struct DomainStatusRequest<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct DomainStatusResponse {
    pub model_status: Option<i64>,
    #[serde(default)]
    pub model_prediction: Option<String>,
    #[serde(default)]
    pub model_confidence: Option<f64>,
    #[serde(default)]
    pub model_reasoning: Option<Vec<WireReason>>,
    #[serde(default)]
    pub google_flagged: bool,
    /// An object with `matches`, or `false`/`null` when the lookup did not run.
    #[serde(default)]
    pub google_safe_browsing: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum WireReason {
    Signal {
        feature: String,
        #[serde(default)]
        value: Value,
        #[serde(default)]
        impact: String,
        #[serde(default)]
        shap_value: Option<f64>,
    },
    Note(String),
}

impl DomainStatusResponse {
    pub fn interpret(self, endpoint: &str) -> EngineResult<ClassifierReport> {
        let protocol = |message: String| EngineError::Protocol {
            endpoint: endpoint.to_string(),
            message,
        };

        let code = self
            .model_status
            .ok_or_else(|| protocol("missing model_status".into()))?;
        let status = VerdictStatus::from_wire(code)
            .ok_or_else(|| protocol(format!("model_status must be 0 or 1, got {code}")))?;

        if let Some(c) = self.model_confidence {
            if !c.is_finite() || !(0.0..=100.0).contains(&c) {
                return Err(protocol(format!("model_confidence out of range: {c}")));
            }
        }

        let mut rationale: Vec<Rationale> = self
            .model_reasoning
            .unwrap_or_default()
            .into_iter()
            .map(|r| match r {
                WireReason::Signal {
                    feature,
                    value,
                    impact,
                    shap_value,
                } => Rationale::Signal {
                    feature,
                    value: display_value(&value),
                    impact,
                    weight: shap_value,
                },
                WireReason::Note(text) => Rationale::note(text),
            })
            .collect();
        rank(&mut rationale);

        let safe_browsing_matches = self
            .google_safe_browsing
            .as_ref()
            .and_then(|v| v.get("matches"))
            .and_then(Value::as_array)
            .is_some_and(|m| !m.is_empty());

        let prediction = self.model_prediction.unwrap_or_else(|| match status {
            VerdictStatus::Blocked => "PHISHING".to_string(),
            VerdictStatus::Allowed => "LEGITIMATE".to_string(),
        });

        Ok(ClassifierReport {
            status,
            prediction,
            confidence: self.model_confidence,
            rationale,
            reputation_flagged: self.google_flagged || safe_browsing_matches,
        })
    }
}

/// Strongest contributors first when every signal carries a weight;
/// otherwise keep the classifier's order.
fn rank(rationale: &mut [Rationale]) {
    if rationale.is_empty() || !rationale.iter().all(|r| r.weight().is_some()) {
        return;
    }
    rationale.sort_by(|a, b| {
        let wa = a.weight().unwrap_or(0.0).abs();
        let wb = b.weight().unwrap_or(0.0).abs();
        wb.partial_cmp(&wa).unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn display_value(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

// ---------- HTTP client ----------

/// Blocking HTTP classifier. The timeout covers connect + response body.
pub struct HttpClassifier {
    endpoint: String,
    timeout_secs: u64,
    http: reqwest::blocking::Client,
}

impl HttpClassifier {
    pub fn new(cfg: &ClassifierConfig) -> EngineResult<Self> {
        let endpoint = format!("{}/domain_status", cfg.endpoint.trim_end_matches('/'));
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| EngineError::Config(format!("classifier http client: {e}")))?;
        Ok(Self {
            endpoint,
            timeout_secs: cfg.timeout_secs,
            http,
        })
    }
}

impl Classifier for HttpClassifier {
    fn classify(&self, url: &str) -> EngineResult<ClassifierReport> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&DomainStatusRequest { url })
            .send()
            .map_err(|e| EngineError::from_http(&self.endpoint, self.timeout_secs, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::Network {
                endpoint: self.endpoint.clone(),
                message: format!("server returned {status}"),
            });
        }

        let body: DomainStatusResponse = resp
            .json()
            .map_err(|e| EngineError::from_http(&self.endpoint, self.timeout_secs, e))?;
        body.interpret(&self.endpoint)
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> EngineResult<ClassifierReport> {
        serde_json::from_value::<DomainStatusResponse>(v)
            .unwrap()
            .interpret("test")
    }

    #[test]
    fn phishing_response_keeps_reasoning() {
        let report = parse(json!({
            "model_status": 0,
            "model_prediction": "PHISHING",
            "model_confidence": 87.3,
            "model_reasoning": [
                {"feature": "domain_age_days", "value": "3", "impact": "increases risk"}
            ]
        }))
        .unwrap();
        assert_eq!(report.status, VerdictStatus::Blocked);
        assert_eq!(report.confidence, Some(87.3));
        assert_eq!(
            report.rationale,
            vec![Rationale::signal("domain_age_days", "3", "increases risk")]
        );
        assert!(report.rationale[0].increases_risk());
        assert!(!report.reputation_flagged);
    }

    #[test]
    fn weighted_signals_are_ranked_by_magnitude() {
        let report = parse(json!({
            "model_status": 0,
            "model_confidence": 70.0,
            "model_reasoning": [
                {"feature": "Qty Dot Url", "value": 2.0, "impact": "decreases phishing risk", "shap_value": -0.1},
                {"feature": "Length Url", "value": 87.0, "impact": "increases phishing risk", "shap_value": 1.4},
                {"feature": "Qty Hyphen Domain", "value": 3.5, "impact": "increases phishing risk", "shap_value": 0.6}
            ]
        }))
        .unwrap();
        let features: Vec<_> = report
            .rationale
            .iter()
            .map(|r| match r {
                Rationale::Signal { feature, value, .. } => (feature.as_str(), value.as_str()),
                Rationale::Note { .. } => unreachable!(),
            })
            .collect();
        assert_eq!(
            features,
            vec![("Length Url", "87"), ("Qty Hyphen Domain", "3.5"), ("Qty Dot Url", "2")]
        );
        assert_eq!(report.prediction, "PHISHING");
    }

    #[test]
    fn trusted_bypass_shape_is_accepted() {
        let report = parse(json!({
            "model_status": 1,
            "model_prediction": "TRUSTED DOMAIN",
            "model_confidence": null,
            "model_reasoning": ["Trusted domain and not flagged by Google Safe Browsing."],
            "google_flagged": false,
            "google_safe_browsing": false
        }))
        .unwrap();
        assert_eq!(report.status, VerdictStatus::Allowed);
        assert_eq!(report.confidence, None);
        assert!(matches!(report.rationale[0], Rationale::Note { .. }));
    }

    #[test]
    fn safe_browsing_matches_flag_the_report() {
        let report = parse(json!({
            "model_status": 1,
            "model_confidence": 99.0,
            "google_flagged": false,
            "google_safe_browsing": {"matches": [{"threatType": "SOCIAL_ENGINEERING"}]}
        }))
        .unwrap();
        assert!(report.reputation_flagged);
    }

    #[test]
    fn malformed_responses_are_protocol_errors() {
        for body in [
            json!({"model_prediction": "PHISHING"}),
            json!({"model_status": 3}),
            json!({"model_status": 1, "model_confidence": 140.0}),
        ] {
            let err = parse(body).unwrap_err();
            assert!(matches!(err, EngineError::Protocol { .. }), "{err}");
        }
    }
}
