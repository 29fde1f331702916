//! End-to-end turn pipeline scenarios over the in-memory store and a
//! scripted LLM. The script answers the classification and extraction calls
//! the way a diligent reader of each utterance would.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use salesnote_ai::{DialogueInput, LlmClient, LlmError, SemanticInput};
use salesnote_core::config::Messages;
use salesnote_core::domain::normalize::{NormalizationRequest, NormalizationResult};
use salesnote_core::domain::{CustomerRef, SemanticAnalysisResult};
use salesnote_core::snapshot::RuntimeSnapshot;
use salesnote_core::states::{CustomerState, SemanticRelevance, SessionStage};
use salesnote_db::{MemoryStore, Store};
use salesnote_orchestrator::worker::finalize_session;
use salesnote_orchestrator::{OutputTask, TurnOrchestrator, TurnOutcome};

#[derive(Clone, Default)]
struct TurnScript {
    follow_related: bool,
    confirmation: bool,
    no_more: bool,
    semantic: Option<SemanticAnalysisResult>,
}

#[derive(Default)]
struct ScriptedLlm {
    turns: HashMap<String, TurnScript>,
    normalization: Vec<NormalizationResult>,
}

impl ScriptedLlm {
    fn script(&self, utterance: &str) -> TurnScript {
        self.turns.get(utterance).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn is_customer_follow_related(&self, utterance: &str) -> Result<bool, LlmError> {
        Ok(self.script(utterance).follow_related)
    }

    async fn is_user_confirmation(&self, utterance: &str) -> Result<bool, LlmError> {
        Ok(self.script(utterance).confirmation)
    }

    async fn is_user_no_more_customers(&self, utterance: &str) -> Result<bool, LlmError> {
        Ok(self.script(utterance).no_more)
    }

    async fn semantic_analysis(
        &self,
        input: SemanticInput<'_>,
    ) -> Result<SemanticAnalysisResult, LlmError> {
        Ok(self.script(input.utterance).semantic.unwrap_or(SemanticAnalysisResult {
            semantic_relevance: SemanticRelevance::None,
            customer_refs: Vec::new(),
        }))
    }

    async fn generate_dialogue(&self, input: DialogueInput<'_>) -> Result<String, LlmError> {
        Ok(format!("reply-{}", input.stage.as_str()))
    }

    async fn summarize_customer_info(&self, _record_json: &str) -> Result<String, LlmError> {
        Ok("摘要".to_string())
    }

    async fn entity_normalization(
        &self,
        _request: &NormalizationRequest,
    ) -> Result<Vec<NormalizationResult>, LlmError> {
        Ok(self.normalization.clone())
    }
}

fn strong(refs: Vec<CustomerRef>) -> SemanticAnalysisResult {
    SemanticAnalysisResult {
        semantic_relevance: SemanticRelevance::Strong,
        customer_refs: refs,
    }
}

fn cref(name: &str, fields: &[(&str, &str)]) -> CustomerRef {
    CustomerRef {
        customer_name: name.to_string(),
        field_updates: fields
            .iter()
            .map(|(field, value)| (field.to_string(), Value::String(value.to_string())))
            .collect::<BTreeMap<String, Value>>(),
    }
}

fn extraction(utterance: &str, refs: Vec<CustomerRef>) -> (String, TurnScript) {
    (
        utterance.to_string(),
        TurnScript { follow_related: true, semantic: Some(strong(refs)), ..Default::default() },
    )
}

fn confirmation(utterance: &str) -> (String, TurnScript) {
    (utterance.to_string(), TurnScript { confirmation: true, ..Default::default() })
}

fn no_more(utterance: &str) -> (String, TurnScript) {
    (utterance.to_string(), TurnScript { no_more: true, ..Default::default() })
}

fn orchestrator(llm: ScriptedLlm) -> TurnOrchestrator {
    TurnOrchestrator::new(Arc::new(llm), Messages::default())
}

async fn turn(
    orchestrator: &TurnOrchestrator,
    store: &mut MemoryStore,
    text: &str,
) -> TurnOutcome {
    orchestrator.process_turn(store, "u1", text).await.expect("turn should succeed")
}

fn latest_snapshot(store: &MemoryStore, session_id: Uuid) -> RuntimeSnapshot {
    let dialog = store
        .dialogs
        .iter()
        .filter(|dialog| dialog.session_id == session_id)
        .max_by_key(|dialog| dialog.turn_index)
        .expect("dialog exists");
    serde_json::from_value(dialog.runtime_snapshot.clone()).expect("snapshot decodes")
}

/// Scenario 1: happy path with a single customer, confirm, close, finalize.
#[tokio::test]
async fn single_customer_happy_path() {
    let mut llm = ScriptedLlm::default();
    llm.turns.extend([
        extraction(
            "今天下午电话跟进了阿里巴巴的续约项目",
            vec![cref(
                "阿里巴巴",
                &[
                    ("customer_name", "阿里巴巴"),
                    ("follow_content", "续约项目"),
                    ("follow_method", "电话"),
                    ("follow_time", "今天下午"),
                ],
            )],
        ),
        extraction(
            "目标是完成年度续约，对方基本同意",
            vec![cref("", &[("follow_goal", "完成年度续约"), ("follow_result", "基本同意")])],
        ),
        extraction("下一步周三发正式报价", vec![cref("", &[("next_plan", "周三发正式报价")])]),
        confirmation("确认"),
        no_more("没有其他客户了"),
    ]);
    let llm_handle = ScriptedLlm { turns: llm.turns.clone(), normalization: Vec::new() };
    let orchestrator = orchestrator(llm);
    let mut store = MemoryStore::new();

    let first = turn(&orchestrator, &mut store, "今天下午电话跟进了阿里巴巴的续约项目").await;
    let session_id = first.session_id;
    let customer =
        store.get_customer_by_name("阿里巴巴").await.unwrap().expect("customer created");

    let dialog = store.dialogs.last().unwrap();
    assert_eq!(dialog.turn_index, 1);
    assert!(dialog.is_first_focus);
    assert_eq!(dialog.focus_customer_id, Some(customer.id));
    assert_eq!(dialog.state, CustomerState::FollowGoal);
    assert_eq!(dialog.stage, SessionStage::Collecting);

    turn(&orchestrator, &mut store, "目标是完成年度续约，对方基本同意").await;
    assert_eq!(store.dialogs.last().unwrap().state, CustomerState::NextPlan);

    turn(&orchestrator, &mut store, "下一步周三发正式报价").await;
    let dialog = store.dialogs.last().unwrap();
    assert_eq!(dialog.state, CustomerState::Complete);
    assert_eq!(dialog.stage, SessionStage::Confirming);

    let first_focus_at = store.dialogs[0].created_at;
    let confirmed = turn(&orchestrator, &mut store, "确认").await;
    assert_eq!(confirmed.reply, Messages::default().asking_other_customers);
    assert_eq!(store.records.len(), 1);
    let record = &store.records[0];
    assert_eq!(record.customer_name, "阿里巴巴");
    assert_eq!(record.follow_content.as_deref(), Some("续约项目"));
    assert_eq!(record.follow_method.as_deref(), Some("电话"));
    assert_eq!(record.follow_goal.as_deref(), Some("完成年度续约"));
    assert_eq!(record.follow_result.as_deref(), Some("基本同意"));
    assert_eq!(record.next_plan.as_deref(), Some("周三发正式报价"));
    assert_eq!(record.user_id, "u1");
    // "今天下午" does not parse, so the first-focus time wins.
    assert_eq!(record.follow_time, first_focus_at);

    let closing = turn(&orchestrator, &mut store, "没有其他客户了").await;
    assert_eq!(closing.reply, Messages::default().outputting_confirm);
    let task = closing.output_task.expect("output task queued");
    assert_eq!(task.session_id, session_id);
    let session = store.sessions.iter().find(|session| session.id == session_id).unwrap();
    assert_eq!(session.stage, SessionStage::Outputting);

    finalize_session(&mut store, &llm_handle, &task).await.expect("finalize");
    assert_eq!(store.records.len(), 1, "confirmed customer is emitted exactly once");
    assert!(store.dialogs.is_empty(), "dialog state deleted");
    assert!(store.sessions.is_empty(), "session deleted");
}

/// Scenario 2: two interleaved customers; goals land on the right one.
#[tokio::test]
async fn interleaved_customers_attribute_fields_correctly() {
    let mut llm = ScriptedLlm::default();
    llm.turns.extend([
        extraction(
            "见了腾讯，聊新产品方案",
            vec![cref("腾讯", &[("customer_name", "腾讯"), ("follow_content", "新产品方案")])],
        ),
        extraction(
            "阿里那边也推进了续约",
            vec![cref("阿里", &[("customer_name", "阿里"), ("follow_content", "续约")])],
        ),
        extraction(
            "阿里的目标是完成续约，腾讯的目标是让客户立项",
            vec![
                cref("阿里", &[("follow_goal", "完成续约")]),
                cref("腾讯", &[("follow_goal", "让客户立项")]),
            ],
        ),
        extraction(
            "腾讯那边结果是同意立项，下一步发方案，这次是线下聊的",
            vec![cref(
                "腾讯",
                &[
                    ("follow_result", "同意立项"),
                    ("next_plan", "发方案"),
                    ("follow_method", "线下"),
                ],
            )],
        ),
        extraction(
            "阿里结果基本同意，下一步周三报价，电话聊的",
            vec![cref(
                "阿里",
                &[
                    ("follow_result", "基本同意"),
                    ("next_plan", "周三报价"),
                    ("follow_method", "电话"),
                ],
            )],
        ),
        confirmation("确认"),
        confirmation("对，确认"),
        no_more("没有其他了"),
    ]);
    let orchestrator = orchestrator(llm);
    let mut store = MemoryStore::new();

    turn(&orchestrator, &mut store, "见了腾讯，聊新产品方案").await;
    let tencent = store.get_customer_by_name("腾讯").await.unwrap().unwrap();
    assert_eq!(store.dialogs.last().unwrap().focus_customer_id, Some(tencent.id));

    turn(&orchestrator, &mut store, "阿里那边也推进了续约").await;
    let ali = store.get_customer_by_name("阿里").await.unwrap().unwrap();
    assert_eq!(
        store.dialogs.last().unwrap().focus_customer_id,
        Some(ali.id),
        "focus follows the newly mentioned customer"
    );

    let outcome = turn(&orchestrator, &mut store, "阿里的目标是完成续约，腾讯的目标是让客户立项")
        .await;
    let snapshot = latest_snapshot(&store, outcome.session_id);
    let pending = salesnote_core::snapshot::PendingUpdates::decode(
        &snapshot.pending_updates,
        snapshot.focus_customer_id,
    );
    assert_eq!(pending.len(), 2, "pending carries both customer keys");
    assert_eq!(pending.get(ali.id, "follow_goal"), Some("完成续约"));
    assert_eq!(pending.get(tencent.id, "follow_goal"), Some("让客户立项"));

    turn(&orchestrator, &mut store, "腾讯那边结果是同意立项，下一步发方案，这次是线下聊的")
        .await;
    turn(&orchestrator, &mut store, "阿里结果基本同意，下一步周三报价，电话聊的").await;
    assert_eq!(store.dialogs.last().unwrap().stage, SessionStage::Confirming);

    turn(&orchestrator, &mut store, "确认").await;
    assert_eq!(store.records.len(), 1);
    assert_eq!(store.dialogs.last().unwrap().stage, SessionStage::Confirming);

    turn(&orchestrator, &mut store, "对，确认").await;
    assert_eq!(store.records.len(), 2);
    assert_eq!(store.dialogs.last().unwrap().stage, SessionStage::AskingOtherCustomers);

    let by_name: HashMap<&str, &str> = store
        .records
        .iter()
        .map(|record| {
            (record.customer_name.as_str(), record.follow_goal.as_deref().unwrap_or(""))
        })
        .collect();
    assert_eq!(by_name["阿里"], "完成续约");
    assert_eq!(by_name["腾讯"], "让客户立项");
}

/// Scenario 3: a correction while confirming re-enters CONFIRMING, not
/// ASKING_OTHER_CUSTOMERS, and only rewrites the named field.
#[tokio::test]
async fn correction_during_confirming_triggers_reconfirm() {
    let mut llm = ScriptedLlm::default();
    llm.turns.extend([
        extraction(
            "电话跟进了阿里巴巴，聊续约，目标续约，结果同意，下一步报价",
            vec![cref(
                "阿里巴巴",
                &[
                    ("customer_name", "阿里巴巴"),
                    ("follow_content", "续约"),
                    ("follow_goal", "续约"),
                    ("follow_result", "同意"),
                    ("next_plan", "报价"),
                    ("follow_method", "电话"),
                ],
            )],
        ),
        extraction("跟进方式改成线下", vec![cref("", &[("follow_method", "线下")])]),
        confirmation("确认"),
    ]);
    let orchestrator = orchestrator(llm);
    let mut store = MemoryStore::new();

    let outcome =
        turn(&orchestrator, &mut store, "电话跟进了阿里巴巴，聊续约，目标续约，结果同意，下一步报价")
            .await;
    assert_eq!(store.dialogs.last().unwrap().stage, SessionStage::Confirming);
    let customer = store.get_customer_by_name("阿里巴巴").await.unwrap().unwrap();

    turn(&orchestrator, &mut store, "跟进方式改成线下").await;
    let snapshot = latest_snapshot(&store, outcome.session_id);
    assert!(snapshot.pending_reconfirm, "inline correction flags re-confirmation");
    assert_eq!(snapshot.stage, SessionStage::Confirming, "re-enters CONFIRMING, not ASKING");
    let pending = salesnote_core::snapshot::PendingUpdates::decode(
        &snapshot.pending_updates,
        snapshot.focus_customer_id,
    );
    assert_eq!(pending.get(customer.id, "follow_method"), Some("线下"));
    assert_eq!(pending.get(customer.id, "follow_result"), Some("同意"), "no cascading clear");

    turn(&orchestrator, &mut store, "确认").await;
    assert_eq!(store.records.len(), 1);
    assert_eq!(store.records[0].follow_method.as_deref(), Some("线下"));
}

/// Scenario 4: unrelated chatter changes nothing.
#[tokio::test]
async fn unrelated_chatter_leaves_state_untouched() {
    let mut llm = ScriptedLlm::default();
    llm.turns.extend([
        extraction(
            "见了腾讯，聊新产品方案",
            vec![cref("腾讯", &[("customer_name", "腾讯"), ("follow_content", "新产品方案")])],
        ),
        // "今天天气不错" is not scripted: follow-related resolves to false.
    ]);
    let orchestrator = orchestrator(llm);
    let mut store = MemoryStore::new();

    let first = turn(&orchestrator, &mut store, "见了腾讯，聊新产品方案").await;
    let before = latest_snapshot(&store, first.session_id);

    let chatter = turn(&orchestrator, &mut store, "今天天气不错").await;
    assert_eq!(chatter.reply, "reply-COLLECTING", "conversation continues");

    let after = latest_snapshot(&store, first.session_id);
    assert_eq!(after.state, before.state);
    assert_eq!(after.stage, before.stage);
    assert_eq!(after.focus_customer_id, before.focus_customer_id);
    assert_eq!(after.pending_updates, before.pending_updates);
    assert_eq!(store.dialogs.len(), 2, "the turn itself is still recorded");
}

/// Scenario 5: follow-up content after OUTPUTTING starts a fresh session.
#[tokio::test]
async fn post_outputting_message_starts_new_session() {
    let mut llm = ScriptedLlm::default();
    llm.turns.extend([
        extraction(
            "电话跟进了阿里巴巴，聊续约，目标续约，结果同意，下一步报价",
            vec![cref(
                "阿里巴巴",
                &[
                    ("customer_name", "阿里巴巴"),
                    ("follow_content", "续约"),
                    ("follow_goal", "续约"),
                    ("follow_result", "同意"),
                    ("next_plan", "报价"),
                    ("follow_method", "电话"),
                ],
            )],
        ),
        confirmation("确认"),
        no_more("没有其他客户了"),
        extraction("还有个客户华为", vec![cref("华为", &[("customer_name", "华为")])]),
    ]);
    let orchestrator = orchestrator(llm);
    let mut store = MemoryStore::new();

    turn(&orchestrator, &mut store, "电话跟进了阿里巴巴，聊续约，目标续约，结果同意，下一步报价")
        .await;
    turn(&orchestrator, &mut store, "确认").await;
    let closed = turn(&orchestrator, &mut store, "没有其他客户了").await;
    let old_session = closed.session_id;
    assert!(closed.output_task.is_some());

    // Unrelated chatter first: the session is already closed.
    let shrug = turn(&orchestrator, &mut store, "好的辛苦了").await;
    assert_eq!(shrug.session_id, old_session);
    assert_eq!(shrug.reply, Messages::default().outputting_ended);

    let fresh = turn(&orchestrator, &mut store, "还有个客户华为").await;
    assert_ne!(fresh.session_id, old_session, "a fresh session was created");
    assert!(fresh.output_task.is_none());

    let old = store.sessions.iter().find(|session| session.id == old_session).unwrap();
    assert_eq!(old.stage, SessionStage::Exit);
    assert!(old.ended_at.is_some());

    let huawei = store.get_customer_by_name("华为").await.unwrap().expect("华为 created");
    let new_dialog = store
        .dialogs
        .iter()
        .find(|dialog| dialog.session_id == fresh.session_id)
        .expect("dialog in new session");
    assert_eq!(new_dialog.turn_index, 1);
    assert_eq!(new_dialog.focus_customer_id, Some(huawei.id));
}

/// A session stranded in OUTPUTTING with pending data (crash before any
/// confirmation) still emits its records at close, including legacy
/// flat-format snapshots.
#[tokio::test]
async fn finalize_emits_from_legacy_flat_snapshot() {
    use chrono::Utc;
    use salesnote_core::domain::{Customer, Dialog, Session};
    use serde_json::json;

    let mut store = MemoryStore::new();
    let customer = Customer::new("阿里巴巴");
    store.create_customer(&customer).await.unwrap();
    let mut session = Session::start("u1");
    session.stage = SessionStage::Outputting;
    store.create_session(&session).await.unwrap();

    let focus_at = Utc::now();
    let snapshot = json!({
        "session_id": session.id,
        "focus_customer_id": customer.id,
        "state": "COMPLETE",
        "stage": "OUTPUTTING",
        // Legacy flat form: field -> value, keyed by the focus customer.
        "pending_updates": { "follow_content": "续约项目", "follow_method": "电话" },
        "pending_reconfirm": false,
    });
    store
        .create_dialog(&Dialog {
            id: Uuid::new_v4(),
            session_id: session.id,
            state: CustomerState::Complete,
            stage: SessionStage::Outputting,
            turn_index: 1,
            focus_customer_id: Some(customer.id),
            is_first_focus: true,
            semantic_relevance: None,
            pending_updates: json!({}),
            runtime_snapshot: snapshot,
            turn_content: None,
            created_at: focus_at,
        })
        .await
        .unwrap();

    let llm = ScriptedLlm::default();
    let task = OutputTask::new(session.id, "u1".to_string());
    finalize_session(&mut store, &llm, &task).await.expect("finalize");

    assert_eq!(store.records.len(), 1);
    let record = &store.records[0];
    assert_eq!(record.customer_id, customer.id);
    assert_eq!(record.follow_content.as_deref(), Some("续约项目"));
    assert_eq!(record.follow_method.as_deref(), Some("电话"));
    assert_eq!(record.follow_time, focus_at);
    assert!(store.sessions.is_empty());
    assert!(store.dialogs.is_empty());
}

/// High-confidence normalization merges re-point records and backfill
/// contact columns; customer rows stay.
#[tokio::test]
async fn finalize_applies_high_confidence_merges() {
    use chrono::Utc;
    use salesnote_core::domain::normalize::NormalizationEvidence;
    use salesnote_core::domain::{Customer, Dialog, FollowRecord, Session};
    use serde_json::json;

    let mut store = MemoryStore::new();
    let mut source = Customer::new("阿里");
    source.contact_person = Some("张总".to_string());
    let target = Customer::new("阿里巴巴");
    store.create_customer(&source).await.unwrap();
    store.create_customer(&target).await.unwrap();

    let mut session = Session::start("u1");
    session.stage = SessionStage::Outputting;
    store.create_session(&session).await.unwrap();
    store
        .create_dialog(&Dialog {
            id: Uuid::new_v4(),
            session_id: session.id,
            state: CustomerState::Complete,
            stage: SessionStage::Outputting,
            turn_index: 1,
            focus_customer_id: Some(source.id),
            is_first_focus: true,
            semantic_relevance: None,
            pending_updates: json!({}),
            runtime_snapshot: json!({
                "session_id": session.id,
                "focus_customer_id": source.id,
                "state": "COMPLETE",
                "stage": "OUTPUTTING",
                "pending_updates": {},
            }),
            turn_content: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let mut record = FollowRecord::skeleton(&source);
    record.id = Uuid::new_v4();
    record.user_id = "u1".to_string();
    store.create_follow_record(&record).await.unwrap();

    let mut merge = NormalizationResult {
        mention_id: format!("customer_{}", source.id),
        entity_id: Some(target.id.to_string()),
        normalization_score: 93.0,
        normalization_level: salesnote_core::domain::normalize::NormalizationLevel::None,
        evidence: NormalizationEvidence::default(),
        needs_confirmation: false,
    };
    merge.grade();
    let llm = ScriptedLlm { turns: HashMap::new(), normalization: vec![merge] };

    let task = OutputTask::new(session.id, "u1".to_string());
    finalize_session(&mut store, &llm, &task).await.expect("finalize");

    let merged = store.get_follow_record(record.id).await.unwrap().unwrap();
    assert_eq!(merged.customer_id, target.id);
    assert_eq!(merged.customer_name, "阿里巴巴");

    let target_row = store.get_customer(target.id).await.unwrap().unwrap();
    assert_eq!(target_row.contact_person.as_deref(), Some("张总"), "contact backfilled");
    assert!(
        store.get_customer(source.id).await.unwrap().is_some(),
        "source customer row is retained"
    );
}
