//! Post-session entity normalization: dedupe the customers (and their
//! contacts) a finished session touched against everything already known,
//! and derive a merge map from the high-confidence matches.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use salesnote_ai::{LlmClient, LlmError};
use salesnote_core::domain::normalize::{
    CandidateEntity, EntityMention, NormalizationLevel, NormalizationRequest,
    NormalizationResult,
};
use salesnote_db::{Store, StoreError};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Runs the normalization pass for a session and returns
/// `source customer id -> target customer id` for confident merges.
pub async fn normalize_entities<S: Store + ?Sized>(
    store: &mut S,
    llm: &dyn LlmClient,
    session_id: Uuid,
) -> Result<BTreeMap<Uuid, Uuid>, NormalizeError> {
    let mentions = extract_mentions(store, session_id).await?;
    if mentions.is_empty() {
        info!(%session_id, "no entity mentions in session");
        return Ok(BTreeMap::new());
    }

    let candidates = candidate_entities(store).await?;
    let dialog_context = build_dialog_context(store, session_id).await?;

    let request = NormalizationRequest {
        dialog_context,
        mentions_entity: mentions.clone(),
        candidate_entities: candidates,
    };
    let results = llm.entity_normalization(&request).await?;

    Ok(merge_map_from_results(&results, &mentions))
}

/// Every customer the session focused, plus their contact persons.
async fn extract_mentions<S: Store + ?Sized>(
    store: &mut S,
    session_id: Uuid,
) -> Result<Vec<EntityMention>, StoreError> {
    let dialogs = store.dialogs_by_session(session_id).await?;
    let customer_ids: BTreeSet<Uuid> =
        dialogs.iter().filter_map(|dialog| dialog.focus_customer_id).collect();

    let mut mentions = Vec::new();
    for customer_id in customer_ids {
        let Some(customer) = store.get_customer(customer_id).await? else {
            continue;
        };
        mentions.push(EntityMention {
            mention_id: format!("customer_{customer_id}"),
            entity_type: "customer".to_string(),
            name: customer.name.clone(),
            customer_name: String::new(),
        });
        if let Some(contact) = customer.contact_person.filter(|name| !name.is_empty()) {
            mentions.push(EntityMention {
                mention_id: format!("contact_{customer_id}"),
                entity_type: "contact".to_string(),
                name: contact,
                customer_name: customer.name,
            });
        }
    }
    Ok(mentions)
}

/// All known customers and contacts are candidates.
async fn candidate_entities<S: Store + ?Sized>(
    store: &mut S,
) -> Result<Vec<CandidateEntity>, StoreError> {
    let customers = store.all_customers().await?;
    let mut candidates = Vec::with_capacity(customers.len());
    for customer in customers {
        candidates.push(CandidateEntity {
            entity_id: customer.id.to_string(),
            entity_type: "customer".to_string(),
            name: customer.name.clone(),
            customer_name: String::new(),
            contact_role: None,
            contact_phone: None,
        });
        if let Some(contact) = customer.contact_person.filter(|name| !name.is_empty()) {
            candidates.push(CandidateEntity {
                entity_id: format!("contact_{}", customer.id),
                entity_type: "contact".to_string(),
                name: contact,
                customer_name: customer.name,
                contact_role: customer.contact_role,
                contact_phone: customer.contact_phone,
            });
        }
    }
    Ok(candidates)
}

async fn build_dialog_context<S: Store + ?Sized>(
    store: &mut S,
    session_id: Uuid,
) -> Result<String, StoreError> {
    let dialogs = store.dialogs_by_session(session_id).await?;
    Ok(format!("Session ID: {session_id}, Total turns: {}", dialogs.len()))
}

/// Picks the best-scoring result per customer mention and keeps `high`
/// confidence matches whose target differs from the source. Contact
/// mentions do not participate in merges.
pub fn merge_map_from_results(
    results: &[NormalizationResult],
    mentions: &[EntityMention],
) -> BTreeMap<Uuid, Uuid> {
    let mut merge_map = BTreeMap::new();

    for mention in mentions {
        if mention.entity_type != "customer" {
            continue;
        }
        let best = results
            .iter()
            .filter(|result| result.mention_id == mention.mention_id)
            .max_by(|a, b| {
                a.normalization_score
                    .partial_cmp(&b.normalization_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        let Some(best) = best else { continue };
        if best.normalization_level != NormalizationLevel::High {
            continue;
        }
        let Some(entity_id) = best.entity_id.as_deref() else { continue };

        let Some(source) = mention
            .mention_id
            .strip_prefix("customer_")
            .and_then(|raw| Uuid::parse_str(raw).ok())
        else {
            continue;
        };
        let Ok(target) = Uuid::parse_str(entity_id) else {
            error!(entity_id, "normalization target is not a customer id");
            continue;
        };
        if source != target {
            info!(%source, %target, score = best.normalization_score, "customer merge identified");
            merge_map.insert(source, target);
        }
    }
    merge_map
}

#[cfg(test)]
mod tests {
    use salesnote_core::domain::normalize::NormalizationEvidence;

    use super::*;

    fn mention(customer_id: Uuid) -> EntityMention {
        EntityMention {
            mention_id: format!("customer_{customer_id}"),
            entity_type: "customer".to_string(),
            name: "阿里".to_string(),
            customer_name: String::new(),
        }
    }

    fn result(mention_id: &str, entity_id: Option<Uuid>, score: f64) -> NormalizationResult {
        let mut result = NormalizationResult {
            mention_id: mention_id.to_string(),
            entity_id: entity_id.map(|id| id.to_string()),
            normalization_score: score,
            normalization_level: NormalizationLevel::None,
            evidence: NormalizationEvidence::default(),
            needs_confirmation: false,
        };
        result.grade();
        result
    }

    #[test]
    fn only_high_confidence_merges_survive() {
        let source = Uuid::new_v4();
        let target = Uuid::new_v4();
        let mentions = vec![mention(source)];

        let high = vec![result(&format!("customer_{source}"), Some(target), 92.0)];
        assert_eq!(merge_map_from_results(&high, &mentions).get(&source), Some(&target));

        let medium = vec![result(&format!("customer_{source}"), Some(target), 65.0)];
        assert!(merge_map_from_results(&medium, &mentions).is_empty());
    }

    #[test]
    fn self_merge_is_dropped() {
        let source = Uuid::new_v4();
        let mentions = vec![mention(source)];
        let results = vec![result(&format!("customer_{source}"), Some(source), 95.0)];
        assert!(merge_map_from_results(&results, &mentions).is_empty());
    }

    #[test]
    fn best_of_multiple_results_wins() {
        let source = Uuid::new_v4();
        let weak_target = Uuid::new_v4();
        let strong_target = Uuid::new_v4();
        let mentions = vec![mention(source)];
        let results = vec![
            result(&format!("customer_{source}"), Some(weak_target), 84.0),
            result(&format!("customer_{source}"), Some(strong_target), 91.0),
        ];
        assert_eq!(
            merge_map_from_results(&results, &mentions).get(&source),
            Some(&strong_target)
        );
    }

    #[test]
    fn contact_mentions_never_merge() {
        let source = Uuid::new_v4();
        let target = Uuid::new_v4();
        let mentions = vec![EntityMention {
            mention_id: format!("contact_{source}"),
            entity_type: "contact".to_string(),
            name: "张总".to_string(),
            customer_name: "阿里".to_string(),
        }];
        let results = vec![result(&format!("contact_{source}"), Some(target), 95.0)];
        assert!(merge_map_from_results(&results, &mentions).is_empty());
    }
}
