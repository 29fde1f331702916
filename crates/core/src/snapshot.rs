use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::Dialog;
use crate::errors::SnapshotError;
use crate::states::{CustomerState, SemanticRelevance, SessionStage};

/// Per-customer field scratch space: `customer_id -> field -> value`.
///
/// Two encodings exist in stored snapshots. The current one nests by
/// customer id; a historical one was a flat `field -> value` map belonging
/// to the snapshot's focus customer. Decoding accepts both and re-keys the
/// flat form; new writes always produce the nested form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingUpdates {
    inner: BTreeMap<String, BTreeMap<String, String>>,
}

impl PendingUpdates {
    pub fn new() -> PendingUpdates {
        PendingUpdates::default()
    }

    /// Decodes from raw snapshot JSON. `focus` keys the legacy flat form;
    /// a flat map without a focus customer decodes to empty.
    pub fn decode(raw: &Value, focus: Option<Uuid>) -> PendingUpdates {
        let Value::Object(map) = raw else {
            return PendingUpdates::new();
        };
        if map.is_empty() {
            return PendingUpdates::new();
        }

        if map.values().all(Value::is_object) {
            let mut inner = BTreeMap::new();
            for (customer_key, fields) in map {
                let Value::Object(fields) = fields else { continue };
                let data = stringify_fields(fields);
                if !data.is_empty() {
                    inner.insert(customer_key.clone(), data);
                }
            }
            return PendingUpdates { inner };
        }

        let Some(focus) = focus else {
            return PendingUpdates::new();
        };
        let data = stringify_flat(map);
        let mut inner = BTreeMap::new();
        if !data.is_empty() {
            inner.insert(focus.to_string(), data);
        }
        PendingUpdates { inner }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn contains(&self, customer_id: Uuid) -> bool {
        self.inner.contains_key(&customer_id.to_string())
    }

    /// Customer ids with pending data, lexicographic by id string. Keys that
    /// do not parse as UUIDs are skipped.
    pub fn customer_ids(&self) -> Vec<Uuid> {
        self.inner.keys().filter_map(|key| Uuid::parse_str(key).ok()).collect()
    }

    pub fn fields_for(&self, customer_id: Uuid) -> Option<&BTreeMap<String, String>> {
        self.inner.get(&customer_id.to_string())
    }

    pub fn get(&self, customer_id: Uuid, field: &str) -> Option<&str> {
        self.fields_for(customer_id).and_then(|data| data.get(field)).map(String::as_str)
    }

    pub fn set(&mut self, customer_id: Uuid, field: &str, value: impl Into<String>) {
        self.inner
            .entry(customer_id.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
    }

    pub fn clear_field(&mut self, customer_id: Uuid, field: &str) {
        if let Some(data) = self.inner.get_mut(&customer_id.to_string()) {
            data.remove(field);
        }
    }

    pub fn remove_customer(&mut self, customer_id: Uuid) {
        self.inner.remove(&customer_id.to_string());
    }

    /// Flattened `(customer_id, field, value)` view, used by tests and
    /// recap building.
    pub fn triples(&self) -> Vec<(String, String, String)> {
        self.inner
            .iter()
            .flat_map(|(customer, fields)| {
                fields.iter().map(move |(field, value)| {
                    (customer.clone(), field.clone(), value.clone())
                })
            })
            .collect()
    }
}

fn stringify_fields(fields: &serde_json::Map<String, Value>) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    for (field, value) in fields {
        if let Some(text) = value_to_string(value) {
            data.insert(field.clone(), text);
        }
    }
    data
}

fn stringify_flat(map: &serde_json::Map<String, Value>) -> BTreeMap<String, String> {
    stringify_fields(map)
}

/// Renders a JSON value the way extracted values are stored: strings as-is,
/// scalars via their JSON form, nulls dropped.
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// The persisted portion of the runtime context. Together with the dialog's
/// `turn_index` this fully determines what can happen on the next turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    pub session_id: Uuid,
    pub focus_customer_id: Option<Uuid>,
    pub state: CustomerState,
    pub stage: SessionStage,
    #[serde(default)]
    pub pending_updates: Value,
    #[serde(default)]
    pub pending_reconfirm: bool,
}

/// In-memory state of one turn, rebuilt from the previous dialog row.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeContext {
    pub session_id: Uuid,
    pub turn_index: i32,
    pub state: CustomerState,
    pub stage: SessionStage,
    pub focus_customer_id: Option<Uuid>,
    pub mentioned_customer_id: Option<Uuid>,
    pub semantic_relevance: SemanticRelevance,
    pub pending_updates: PendingUpdates,
    pub is_first_focus: bool,
    pub pending_reconfirm: bool,
}

impl RuntimeContext {
    /// Zero context for a session with no dialogs yet.
    pub fn initial(session_id: Uuid) -> RuntimeContext {
        RuntimeContext {
            session_id,
            turn_index: 0,
            state: CustomerState::CustomerName,
            stage: SessionStage::Collecting,
            focus_customer_id: None,
            mentioned_customer_id: None,
            semantic_relevance: SemanticRelevance::None,
            pending_updates: PendingUpdates::new(),
            is_first_focus: false,
            pending_reconfirm: false,
        }
    }

    /// Restores the runtime from the latest dialog's snapshot.
    pub fn from_dialog(dialog: &Dialog) -> Result<RuntimeContext, SnapshotError> {
        let snapshot: RuntimeSnapshot = serde_json::from_value(dialog.runtime_snapshot.clone())
            .map_err(|source| SnapshotError::Decode { dialog_id: dialog.id, source })?;
        let pending_updates =
            PendingUpdates::decode(&snapshot.pending_updates, snapshot.focus_customer_id);
        Ok(RuntimeContext {
            session_id: dialog.session_id,
            turn_index: dialog.turn_index,
            state: snapshot.state,
            stage: snapshot.stage,
            focus_customer_id: snapshot.focus_customer_id,
            mentioned_customer_id: None,
            semantic_relevance: SemanticRelevance::None,
            pending_updates,
            is_first_focus: false,
            pending_reconfirm: snapshot.pending_reconfirm,
        })
    }

    pub fn to_snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            session_id: self.session_id,
            focus_customer_id: self.focus_customer_id,
            state: self.state,
            stage: self.stage,
            pending_updates: self.pending_updates.to_value(),
            pending_reconfirm: self.pending_reconfirm,
        }
    }

    pub fn snapshot_value(&self) -> Value {
        serde_json::to_value(self.to_snapshot())
            .unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_nested_form() {
        let customer = Uuid::new_v4();
        let raw = json!({ customer.to_string(): { "follow_goal": "续约", "attempts": 3 } });
        let pending = PendingUpdates::decode(&raw, None);
        assert_eq!(pending.get(customer, "follow_goal"), Some("续约"));
        assert_eq!(pending.get(customer, "attempts"), Some("3"));
    }

    #[test]
    fn rekeys_legacy_flat_form_under_focus() {
        let focus = Uuid::new_v4();
        let raw = json!({ "follow_content": "聊了方案", "next_plan": "周三报价" });
        let pending = PendingUpdates::decode(&raw, Some(focus));
        assert_eq!(pending.get(focus, "follow_content"), Some("聊了方案"));
        assert_eq!(pending.get(focus, "next_plan"), Some("周三报价"));
        assert_eq!(pending.customer_ids(), vec![focus]);
    }

    #[test]
    fn flat_form_without_focus_decodes_empty() {
        let raw = json!({ "follow_content": "聊了方案" });
        assert!(PendingUpdates::decode(&raw, None).is_empty());
    }

    #[test]
    fn null_and_empty_values_are_dropped() {
        let focus = Uuid::new_v4();
        let raw = json!({ focus.to_string(): { "follow_goal": null } });
        assert!(PendingUpdates::decode(&raw, None).is_empty());
        assert!(PendingUpdates::decode(&json!(null), Some(focus)).is_empty());
        assert!(PendingUpdates::decode(&json!({}), Some(focus)).is_empty());
    }

    #[test]
    fn legacy_rekey_round_trips_to_same_triples() {
        let focus = Uuid::new_v4();
        let raw = json!({ "follow_goal": "完成续约", "follow_method": "电话" });
        let rekeyed = PendingUpdates::decode(&raw, Some(focus));

        let encoded = rekeyed.to_value();
        let reparsed = PendingUpdates::decode(&encoded, None);
        assert_eq!(reparsed.triples(), rekeyed.triples());
        assert_eq!(
            reparsed.triples(),
            vec![
                (focus.to_string(), "follow_goal".into(), "完成续约".into()),
                (focus.to_string(), "follow_method".into(), "电话".into()),
            ]
        );
    }

    #[test]
    fn runtime_snapshot_serde_is_identity() {
        let customer = Uuid::new_v4();
        let mut pending = PendingUpdates::new();
        pending.set(customer, "follow_content", "续约项目");

        let snapshot = RuntimeSnapshot {
            session_id: Uuid::new_v4(),
            focus_customer_id: Some(customer),
            state: CustomerState::FollowGoal,
            stage: SessionStage::Collecting,
            pending_updates: pending.to_value(),
            pending_reconfirm: true,
        };
        let value = serde_json::to_value(&snapshot).expect("encode");
        let decoded: RuntimeSnapshot = serde_json::from_value(value).expect("decode");
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn runtime_context_survives_dialog_round_trip() {
        let session_id = Uuid::new_v4();
        let customer = Uuid::new_v4();
        let mut context = RuntimeContext::initial(session_id);
        context.turn_index = 4;
        context.state = CustomerState::NextPlan;
        context.stage = SessionStage::Collecting;
        context.focus_customer_id = Some(customer);
        context.pending_updates.set(customer, "follow_result", "基本同意");

        let dialog = Dialog {
            id: Uuid::new_v4(),
            session_id,
            state: context.state,
            stage: context.stage,
            turn_index: context.turn_index,
            focus_customer_id: context.focus_customer_id,
            is_first_focus: false,
            semantic_relevance: None,
            pending_updates: context.pending_updates.to_value(),
            runtime_snapshot: context.snapshot_value(),
            turn_content: None,
            created_at: Utc::now(),
        };

        let restored = RuntimeContext::from_dialog(&dialog).expect("restore");
        assert_eq!(restored.state, context.state);
        assert_eq!(restored.stage, context.stage);
        assert_eq!(restored.focus_customer_id, context.focus_customer_id);
        assert_eq!(restored.pending_updates, context.pending_updates);
        assert_eq!(restored.turn_index, 4);
    }
}
