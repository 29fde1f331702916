use serde::{Deserialize, Serialize};

/// A customer or contact as it appeared in a finished session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMention {
    pub mention_id: String,
    /// "customer" or "contact"; only customer mentions participate in merges.
    pub entity_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub customer_name: String,
}

/// An existing entity the mention may resolve to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateEntity {
    pub entity_id: String,
    pub entity_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub customer_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_phone: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizationRequest {
    pub dialog_context: String,
    pub mentions_entity: Vec<EntityMention>,
    pub candidate_entities: Vec<CandidateEntity>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationEvidence {
    #[serde(default)]
    pub name_match: f64,
    #[serde(default)]
    pub context: f64,
    #[serde(default)]
    pub attributes: f64,
    #[serde(default)]
    pub history: f64,
}

/// Confidence bands derived from the raw score; only `High` merges are
/// applied without confirmation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizationLevel {
    High,
    Medium,
    Low,
    None,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizationResult {
    pub mention_id: String,
    pub entity_id: Option<String>,
    #[serde(default)]
    pub normalization_score: f64,
    #[serde(default = "NormalizationResult::default_level")]
    pub normalization_level: NormalizationLevel,
    #[serde(default)]
    pub evidence: NormalizationEvidence,
    #[serde(default)]
    pub needs_confirmation: bool,
}

impl NormalizationResult {
    fn default_level() -> NormalizationLevel {
        NormalizationLevel::None
    }

    /// Applies the score thresholds: >=80 high (no confirmation), >=60
    /// medium, >=40 low (both confirm), below none.
    pub fn grade(&mut self) {
        let (level, confirm) = match self.normalization_score {
            s if s >= 80.0 => (NormalizationLevel::High, false),
            s if s >= 60.0 => (NormalizationLevel::Medium, true),
            s if s >= 40.0 => (NormalizationLevel::Low, true),
            _ => (NormalizationLevel::None, false),
        };
        self.normalization_level = level;
        self.needs_confirmation = confirm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with_score(score: f64) -> NormalizationResult {
        let mut result: NormalizationResult = serde_json::from_str(
            r#"{"mention_id": "customer_x", "entity_id": "y", "normalization_score": 0}"#,
        )
        .expect("decode");
        result.normalization_score = score;
        result
    }

    #[test]
    fn grading_matches_thresholds() {
        let cases = [
            (95.0, NormalizationLevel::High, false),
            (80.0, NormalizationLevel::High, false),
            (79.9, NormalizationLevel::Medium, true),
            (60.0, NormalizationLevel::Medium, true),
            (40.0, NormalizationLevel::Low, true),
            (39.9, NormalizationLevel::None, false),
        ];
        for (score, level, confirm) in cases {
            let mut result = result_with_score(score);
            result.grade();
            assert_eq!(result.normalization_level, level, "score {score}");
            assert_eq!(result.needs_confirmation, confirm, "score {score}");
        }
    }
}
