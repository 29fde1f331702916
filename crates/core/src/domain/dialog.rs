use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::states::{CustomerState, SemanticRelevance, SessionStage};

/// Append-only per-turn snapshot row. `runtime_snapshot` alone is enough to
/// resume the session at the next turn; `turn_content` preserves the raw
/// exchange for LLM context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dialog {
    pub id: Uuid,
    pub session_id: Uuid,
    pub state: CustomerState,
    pub stage: SessionStage,
    pub turn_index: i32,
    pub focus_customer_id: Option<Uuid>,
    pub is_first_focus: bool,
    pub semantic_relevance: Option<SemanticRelevance>,
    /// Nested `customer_id -> field -> value` JSON. Older rows may carry the
    /// flat `field -> value` form; see `snapshot::PendingUpdates`.
    pub pending_updates: Value,
    pub runtime_snapshot: Value,
    /// "User: ...\nAssistant: ..." for this turn, when either side spoke.
    pub turn_content: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Dialog {
    /// Formats the per-turn transcript fragment stored in `turn_content`.
    pub fn render_turn_content(user_text: &str, assistant_text: &str) -> Option<String> {
        if user_text.is_empty() && assistant_text.is_empty() {
            return None;
        }
        Some(format!("User: {user_text}\nAssistant: {assistant_text}"))
    }
}
