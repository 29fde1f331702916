//! The rule engine: pure functions that derive per-customer state, session
//! stage and focus selection from collected data. No I/O, no locking; the
//! LLM proposes, these functions decide.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::domain::{Customer, FollowRecord};
use crate::states::{CustomerState, SemanticRelevance, SessionStage};

/// Returns the first unsatisfied field in the canonical ordering.
///
/// A missing customer means the name is still unknown; a missing record
/// means nothing has been collected for an existing customer yet.
pub fn determine_state(
    customer: Option<&Customer>,
    record: Option<&FollowRecord>,
) -> CustomerState {
    if customer.is_none() {
        return CustomerState::CustomerName;
    }
    let Some(record) = record else {
        return CustomerState::FollowContent;
    };

    if is_blank(&record.follow_content) {
        CustomerState::FollowContent
    } else if is_blank(&record.follow_goal) {
        CustomerState::FollowGoal
    } else if is_blank(&record.follow_result) {
        CustomerState::FollowResult
    } else if is_blank(&record.next_plan) {
        CustomerState::NextPlan
    } else if is_blank(&record.follow_method) {
        CustomerState::FollowMethod
    } else {
        CustomerState::Complete
    }
}

fn is_blank(field: &Option<String>) -> bool {
    field.as_deref().map_or(true, str::is_empty)
}

/// Derives the session stage from the states of every tracked customer.
///
/// An empty map means all customers were already persisted or dismissed, so
/// the bot asks whether there is anyone else.
pub fn determine_stage(customer_states: &BTreeMap<Uuid, CustomerState>) -> SessionStage {
    tracing::debug!(?customer_states, "determining session stage");
    if customer_states.is_empty() {
        return SessionStage::AskingOtherCustomers;
    }
    if customer_states.values().any(|state| *state != CustomerState::Complete) {
        return SessionStage::Collecting;
    }
    SessionStage::Confirming
}

/// Picks the customer the conversation should focus on this turn.
///
/// Ties among customers in the same state break on customer-id lexicographic
/// order, which `BTreeMap` iteration provides.
pub fn select_focus_customer(
    current_focus: Option<Uuid>,
    mentioned: Option<Uuid>,
    customer_states: &BTreeMap<Uuid, CustomerState>,
    stage: SessionStage,
) -> Option<Uuid> {
    // While confirming, only an explicit mention moves the focus.
    if stage == SessionStage::Confirming {
        return mentioned.or(current_focus);
    }

    if stage == SessionStage::AskingOtherCustomers {
        if mentioned.is_some() {
            return mentioned;
        }
        return current_focus;
    }

    if mentioned.is_some() {
        return mentioned;
    }

    if let Some(focus) = current_focus {
        if customer_states.get(&focus).is_some_and(|state| *state != CustomerState::Complete) {
            return Some(focus);
        }
    }

    for target in CustomerState::ORDER {
        for (customer_id, state) in customer_states {
            if *state == target {
                return Some(*customer_id);
            }
        }
    }

    None
}

/// Risk content is opportunistic: it may only land while the conversation is
/// strongly follow-up related and the customer sits in FOLLOW_RESULT or
/// NEXT_PLAN.
pub fn can_write_risk(relevance: SemanticRelevance, state: CustomerState) -> bool {
    relevance == SemanticRelevance::Strong
        && matches!(state, CustomerState::FollowResult | CustomerState::NextPlan)
}

/// Maps a field modified during CONFIRMING to the state that owns it.
///
/// The returned clear-set is empty: a correction rewrites only the named
/// field, downstream fields keep their values.
pub fn field_modification_target(field: &str) -> Option<(CustomerState, Vec<&'static str>)> {
    let state = match field {
        "customer_name" => CustomerState::CustomerName,
        "follow_content" => CustomerState::FollowContent,
        "follow_goal" => CustomerState::FollowGoal,
        "follow_result" => CustomerState::FollowResult,
        "next_plan" => CustomerState::NextPlan,
        "follow_method" => CustomerState::FollowMethod,
        _ => return None,
    };
    Some((state, Vec::new()))
}
