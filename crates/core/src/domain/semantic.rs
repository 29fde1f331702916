use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::states::SemanticRelevance;

/// One customer mentioned in an utterance together with the field values the
/// model extracted for it. An empty `customer_name` means "whoever is in
/// focus".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerRef {
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub field_updates: BTreeMap<String, Value>,
}

/// Output contract of the semantic-analysis operation. The LLM proposes;
/// the rule engine decides what actually lands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SemanticAnalysisResult {
    pub semantic_relevance: SemanticRelevance,
    #[serde(default)]
    pub customer_refs: Vec<CustomerRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_result_with_missing_refs() {
        let parsed: SemanticAnalysisResult =
            serde_json::from_str(r#"{"semantic_relevance":"NONE"}"#).expect("decode");
        assert_eq!(parsed.semantic_relevance, SemanticRelevance::None);
        assert!(parsed.customer_refs.is_empty());
    }

    #[test]
    fn decodes_multi_customer_refs() {
        let parsed: SemanticAnalysisResult = serde_json::from_str(
            r#"{
                "semantic_relevance": "STRONG",
                "customer_refs": [
                    {"customer_name": "阿里", "field_updates": {"follow_goal": "完成续约"}},
                    {"customer_name": "腾讯", "field_updates": {"follow_goal": "让客户立项"}}
                ]
            }"#,
        )
        .expect("decode");
        assert_eq!(parsed.customer_refs.len(), 2);
        assert_eq!(parsed.customer_refs[0].customer_name, "阿里");
        assert_eq!(
            parsed.customer_refs[1].field_updates.get("follow_goal"),
            Some(&Value::String("让客户立项".into()))
        );
    }
}
