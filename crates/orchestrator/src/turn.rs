use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use salesnote_ai::{DialogueInput, LlmClient, SemanticInput};
use salesnote_core::config::Messages;
use salesnote_core::domain::{Customer, CustomerRef, Dialog, Session};
use salesnote_core::engine;
use salesnote_core::errors::SnapshotError;
use salesnote_core::snapshot::{value_to_string, RuntimeContext};
use salesnote_core::states::{CustomerState, SemanticRelevance, SessionStage};
use salesnote_db::{Store, StoreError};

use crate::records::{build_record_from_pending, resolve_follow_time};
use crate::worker::OutputTask;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Llm(#[from] salesnote_ai::LlmError),
    #[error("turn invariant violated: {0}")]
    Invariant(String),
}

/// Result of one processed turn. When the turn landed the session in
/// OUTPUTTING, `output_task` carries the finalization task; the caller
/// enqueues it after the transaction commits so the worker never observes an
/// uncommitted snapshot.
#[derive(Debug)]
pub struct TurnOutcome {
    pub session_id: Uuid,
    pub reply: String,
    pub output_task: Option<OutputTask>,
}

/// The per-turn pipeline. Every step runs against the caller-provided
/// `Store`, so the whole turn shares one transaction and rolls back as a
/// unit on error; the turn index is only consumed by committed turns.
pub struct TurnOrchestrator {
    llm: Arc<dyn LlmClient>,
    messages: Messages,
}

impl TurnOrchestrator {
    pub fn new(llm: Arc<dyn LlmClient>, messages: Messages) -> TurnOrchestrator {
        TurnOrchestrator { llm, messages }
    }

    pub async fn process_turn<S: Store>(
        &self,
        store: &mut S,
        user_id: &str,
        user_text: &str,
    ) -> Result<TurnOutcome, TurnError> {
        // 1. Load or create the active session.
        let mut session = match store.get_active_session(user_id).await? {
            Some(session) => session,
            None => {
                let session = Session::start(user_id);
                store.create_session(&session).await?;
                session
            }
        };

        // 2. Finalization already queued: either the user moved on, or they
        // are starting a fresh recording.
        if session.stage == SessionStage::Outputting {
            let related = match self.llm.is_customer_follow_related(user_text).await {
                Ok(related) => related,
                Err(llm_error) => {
                    error!(%llm_error, "follow-related check failed in OUTPUTTING");
                    false
                }
            };
            if !related {
                let reply = if self.messages.outputting_ended.is_empty() {
                    "对话已结束，如果有新的客户跟进情况要整理，再找我~".to_string()
                } else {
                    self.messages.outputting_ended.clone()
                };
                return Ok(TurnOutcome { session_id: session.id, reply, output_task: None });
            }
            store
                .update_session_stage(session.id, SessionStage::Exit, Some(Utc::now()))
                .await?;
            let fresh = Session::start(user_id);
            store.create_session(&fresh).await?;
            info!(old_session = %session.id, new_session = %fresh.id,
                "started new session after OUTPUTTING");
            session = fresh;
        }

        // 3. Restore the runtime from the latest snapshot.
        let mut runtime = match store.latest_dialog(session.id).await? {
            Some(dialog) => RuntimeContext::from_dialog(&dialog)?,
            None => RuntimeContext::initial(session.id),
        };

        // 4. This turn's index.
        runtime.turn_index += 1;

        // 5. Pending data without a focus cannot stand; recover from the
        // dialog table before anything else looks at the focus.
        ensure_focus_when_pending(store, &mut runtime).await?;

        // 6. CONFIRMING: an affirmative answer persists the focus customer.
        if runtime.stage == SessionStage::Confirming {
            let confirmed = match self.llm.is_user_confirmation(user_text).await {
                Ok(confirmed) => confirmed,
                Err(llm_error) => {
                    error!(%llm_error, "confirmation check failed");
                    false
                }
            };
            if confirmed {
                self.save_confirmed_customer(store, &mut runtime, user_id).await?;
                info!(session_id = %session.id, "customer confirmed and persisted");
                return self.finish_turn(store, &session, runtime, user_text).await;
            }
        }

        // 7. ASKING_OTHER_CUSTOMERS: "no more" moves to OUTPUTTING.
        if runtime.stage == SessionStage::AskingOtherCustomers {
            let no_more = match self.llm.is_user_no_more_customers(user_text).await {
                Ok(no_more) => no_more,
                Err(llm_error) => {
                    error!(%llm_error, "no-more-customers check failed");
                    false
                }
            };
            if no_more {
                runtime.stage = SessionStage::Outputting;
                info!(session_id = %session.id, "no more customers, transitioning to OUTPUTTING");
                return self.finish_turn(store, &session, runtime, user_text).await;
            }
        }

        // 8. Semantic gate: extraction only runs in collection-like stages
        // and only for follow-up-related utterances.
        let semantic_result = if runtime.stage.is_collection_like()
            && self.is_follow_related(user_text).await
        {
            let focus_name = self.focus_customer_name(store, &runtime).await?;
            let history =
                store.conversation_history(session.id, runtime.turn_index).await?;
            let expected_field = runtime.state.expected_field().unwrap_or_default();
            match self
                .llm
                .semantic_analysis(SemanticInput {
                    utterance: user_text,
                    stage: runtime.stage,
                    focus_customer: &focus_name,
                    expected_field,
                    conversation_history: &history,
                })
                .await
            {
                Ok(result) => Some(result),
                Err(llm_error) => {
                    // Extraction failure leaves the turn without updates.
                    error!(%llm_error, "semantic analysis failed");
                    None
                }
            }
        } else {
            None
        };

        // 9. Apply whatever the model proposed, within the engine's gates.
        if let Some(result) = semantic_result {
            self.apply_semantic_result(store, &mut runtime, result).await?;
        }

        // 10. Recompute state, focus and stage.
        self.recalculate(store, &mut runtime).await?;

        self.finish_turn(store, &session, runtime, user_text).await
    }

    /// Steps 10b-12: OUTPUTTING bookkeeping, reply generation, snapshot.
    async fn finish_turn<S: Store>(
        &self,
        store: &mut S,
        session: &Session,
        runtime: RuntimeContext,
        user_text: &str,
    ) -> Result<TurnOutcome, TurnError> {
        let mut output_task = None;
        if runtime.stage == SessionStage::Outputting {
            store.update_session_stage(session.id, SessionStage::Outputting, None).await?;
            output_task = Some(OutputTask::new(session.id, session.user_id.clone()));
        }

        let reply = match self.generate_reply(store, &runtime, user_text).await {
            Ok(reply) => reply,
            Err(turn_error) => {
                error!(%turn_error, "reply generation failed");
                self.messages.process_error.clone()
            }
        };

        self.persist_snapshot(store, &runtime, user_text, &reply).await?;

        Ok(TurnOutcome { session_id: session.id, reply, output_task })
    }

    async fn is_follow_related(&self, user_text: &str) -> bool {
        match self.llm.is_customer_follow_related(user_text).await {
            Ok(related) => related,
            Err(llm_error) => {
                error!(%llm_error, "follow-related check failed");
                false
            }
        }
    }

    async fn focus_customer_name<S: Store>(
        &self,
        store: &mut S,
        runtime: &RuntimeContext,
    ) -> Result<String, TurnError> {
        let Some(focus) = runtime.focus_customer_id else {
            return Ok(String::new());
        };
        Ok(store.get_customer(focus).await?.map(|customer| customer.name).unwrap_or_default())
    }

    /// Step 9: routes each extracted customer reference.
    async fn apply_semantic_result<S: Store>(
        &self,
        store: &mut S,
        runtime: &mut RuntimeContext,
        result: salesnote_core::domain::SemanticAnalysisResult,
    ) -> Result<(), TurnError> {
        runtime.semantic_relevance = result.semantic_relevance;
        if result.semantic_relevance != SemanticRelevance::Strong
            || result.customer_refs.is_empty()
        {
            return Ok(());
        }

        let focus_name = self.focus_customer_name(store, runtime).await?;

        for item in result.customer_refs {
            // Inline corrections during CONFIRMING stay on the focus
            // customer; no new customers, no focus change.
            if runtime.stage == SessionStage::Confirming {
                if runtime.focus_customer_id.is_some() && !item.field_updates.is_empty() {
                    if let Err(turn_error) =
                        self.process_field_updates(store, runtime, &item).await
                    {
                        error!(%turn_error, "confirming correction failed");
                    }
                }
                continue;
            }

            // No customer named: updates belong to the focus.
            if item.customer_name.is_empty() {
                if runtime.focus_customer_id.is_some() && !item.field_updates.is_empty() {
                    if let Err(turn_error) =
                        self.process_field_updates(store, runtime, &item).await
                    {
                        error!(%turn_error, "field updates for focus failed");
                    }
                }
                continue;
            }

            if item.customer_name == focus_name {
                if let Err(turn_error) = self.process_field_updates(store, runtime, &item).await
                {
                    error!(%turn_error, customer = %item.customer_name, "field updates failed");
                }
                continue;
            }

            // A different customer: resolve or create, and move the focus.
            let customer_id = match self.find_or_create_customer(store, &item.customer_name).await
            {
                Ok(customer_id) => customer_id,
                Err(turn_error) => {
                    error!(%turn_error, customer = %item.customer_name,
                        "find-or-create customer failed");
                    continue;
                }
            };
            runtime.mentioned_customer_id = Some(customer_id);
            runtime.focus_customer_id = Some(customer_id);
            if let Err(turn_error) = self.process_field_updates(store, runtime, &item).await {
                error!(%turn_error, customer = %item.customer_name, "field updates failed");
            }
        }
        Ok(())
    }

    async fn process_field_updates<S: Store>(
        &self,
        store: &mut S,
        runtime: &mut RuntimeContext,
        item: &CustomerRef,
    ) -> Result<(), TurnError> {
        let Some(focus) = runtime.focus_customer_id else {
            return Ok(());
        };

        if runtime.stage == SessionStage::Confirming {
            self.handle_confirming_modifications(runtime, focus, &item.field_updates);
            return Ok(());
        }

        // The field the current state is waiting on, using this turn's value
        // when extracted and the already-pending one otherwise.
        if let Some(current_field) = runtime.state.expected_field() {
            let fresh = item.field_updates.get(current_field).and_then(value_to_string);
            let existing = runtime.pending_updates.get(focus, current_field).map(str::to_string);
            if let Some(value) = fresh.or(existing) {
                write_field(runtime, focus, current_field, &value);
            }
        }

        // Everything else is stashed for its own state to pick up.
        let current_field = runtime.state.expected_field().unwrap_or_default();
        for (field, value) in &item.field_updates {
            if field == current_field || is_special_field(field) {
                continue;
            }
            if let Some(value) = value_to_string(value) {
                write_field(runtime, focus, field, &value);
            }
        }

        self.handle_special_fields(store, runtime, focus, &item.field_updates).await?;
        Ok(())
    }

    /// Out-of-band fields: risk (gated) and the contact triple (written to
    /// the customer row).
    async fn handle_special_fields<S: Store>(
        &self,
        store: &mut S,
        runtime: &mut RuntimeContext,
        focus: Uuid,
        field_updates: &BTreeMap<String, Value>,
    ) -> Result<(), TurnError> {
        if let Some(risk) = risk_value(field_updates) {
            if engine::can_write_risk(runtime.semantic_relevance, runtime.state) {
                runtime.pending_updates.set(focus, "risk_content", risk);
            } else {
                debug!("risk update rejected by gate");
            }
        }

        let name = field_updates.get("contact_person").and_then(value_to_string);
        let role = field_updates.get("contact_role").and_then(value_to_string);
        let phone = field_updates.get("contact_phone").and_then(value_to_string);
        if name.is_some() || role.is_some() || phone.is_some() {
            if let Err(store_error) = write_contact(store, focus, name, role, phone).await {
                error!(%store_error, "contact write failed");
            }
        }
        Ok(())
    }

    /// CONFIRMING corrections: rewrite only the named field in pending data,
    /// rewind the state to the field's owner and flag re-confirmation.
    fn handle_confirming_modifications(
        &self,
        runtime: &mut RuntimeContext,
        focus: Uuid,
        field_updates: &BTreeMap<String, Value>,
    ) {
        for (field, value) in field_updates {
            let Some(value) = value_to_string(value) else { continue };

            // follow_time and risk corrections do not rewind the state.
            if field == "follow_time" {
                runtime.pending_updates.set(focus, "follow_time", value);
                continue;
            }
            if field == "risk" || field == "risk_content" {
                runtime.pending_updates.set(focus, "risk_content", value);
                continue;
            }
            if is_special_field(field) {
                continue;
            }

            let Some((new_state, fields_to_clear)) = engine::field_modification_target(field)
            else {
                continue;
            };
            for cleared in fields_to_clear {
                runtime.pending_updates.clear_field(focus, cleared);
            }
            runtime.pending_updates.set(focus, field, value);
            runtime.state = new_state;
            runtime.pending_reconfirm = true;
            info!(field, new_state = new_state.as_str(), "field modified during CONFIRMING");
            return;
        }
    }

    /// Emit-on-confirm: persist a record for the focus customer from pending
    /// data and reset collection for whoever is next.
    async fn save_confirmed_customer<S: Store>(
        &self,
        store: &mut S,
        runtime: &mut RuntimeContext,
        user_id: &str,
    ) -> Result<(), TurnError> {
        let focus = runtime
            .focus_customer_id
            .ok_or_else(|| TurnError::Invariant("no focus customer to save".to_string()))?;
        let data = runtime
            .pending_updates
            .fields_for(focus)
            .filter(|data| !data.is_empty())
            .cloned()
            .ok_or_else(|| {
                TurnError::Invariant(format!("no pending data for customer {focus}"))
            })?;
        let customer = store
            .get_customer(focus)
            .await?
            .ok_or_else(|| TurnError::Invariant(format!("customer {focus} not found")))?;

        let mut record = build_record_from_pending(&customer, Some(&data));
        record.follow_time =
            resolve_follow_time(store, runtime.session_id, focus, Some(&data)).await?;
        record.user_id = user_id.to_string();
        record.id = Uuid::new_v4();
        store.create_follow_record(&record).await?;

        runtime.pending_updates.remove_customer(focus);
        runtime.focus_customer_id = None;
        // Cleared so the persisted customer no longer counts toward states.
        runtime.mentioned_customer_id = None;
        runtime.state = CustomerState::CustomerName;

        self.recalculate(store, runtime).await?;
        info!(customer_id = %focus, customer_name = %customer.name, "confirmed customer saved");
        Ok(())
    }

    /// Step 10: derive customer states, re-select focus and stage.
    async fn recalculate<S: Store>(
        &self,
        store: &mut S,
        runtime: &mut RuntimeContext,
    ) -> Result<(), TurnError> {
        let customer_states = self.collect_customer_states(store, runtime).await?;
        let previous_focus = runtime.focus_customer_id;

        runtime.focus_customer_id = engine::select_focus_customer(
            runtime.focus_customer_id,
            runtime.mentioned_customer_id,
            &customer_states,
            runtime.stage,
        );

        // Invariant: pending data implies a focus. The selector can come up
        // empty (all complete, nothing mentioned); fall back to the earliest
        // state in canonical order, then to the dialog table.
        if runtime.focus_customer_id.is_none() && !runtime.pending_updates.is_empty() {
            'search: for target in
                CustomerState::ORDER.iter().copied().chain([CustomerState::Complete])
            {
                for (customer_id, state) in &customer_states {
                    if *state == target {
                        runtime.focus_customer_id = Some(*customer_id);
                        break 'search;
                    }
                }
            }
            if runtime.focus_customer_id.is_none() {
                ensure_focus_when_pending(store, runtime).await?;
            }
        }

        if let Some(focus) = runtime.focus_customer_id {
            if previous_focus != Some(focus) {
                runtime.is_first_focus = self.is_first_focus(store, runtime, focus).await?;
            }
            // Refresh the focus customer's state from the data that counts
            // for the current stage.
            let customer = store.get_customer(focus).await?;
            let record = if runtime.stage.is_collection_like() {
                customer.as_ref().map(|customer| {
                    build_record_from_pending(customer, runtime.pending_updates.fields_for(focus))
                })
            } else {
                store.latest_follow_record(focus).await?
            };
            runtime.state = engine::determine_state(customer.as_ref(), record.as_ref());
        }

        let new_stage = engine::determine_stage(&customer_states);
        // After an inline correction, a fully complete set re-enters
        // CONFIRMING instead of asking for more customers. Only while
        // customers remain: confirming the last one goes straight to asking.
        if new_stage == SessionStage::AskingOtherCustomers
            && runtime.pending_reconfirm
            && !customer_states.is_empty()
        {
            runtime.stage = SessionStage::Confirming;
            runtime.pending_reconfirm = false;
            info!("returning to CONFIRMING after modification completion");
        } else {
            runtime.stage = new_stage;
            if new_stage == SessionStage::AskingOtherCustomers {
                runtime.pending_reconfirm = false;
            }
        }
        Ok(())
    }

    /// States for every customer in pending data plus the current focus and
    /// mention. Collection-like stages read pending data; otherwise the
    /// persisted records decide.
    async fn collect_customer_states<S: Store>(
        &self,
        store: &mut S,
        runtime: &RuntimeContext,
    ) -> Result<BTreeMap<Uuid, CustomerState>, TurnError> {
        let mut customer_ids: Vec<Uuid> = runtime.pending_updates.customer_ids();
        for extra in [runtime.focus_customer_id, runtime.mentioned_customer_id]
            .into_iter()
            .flatten()
        {
            if !customer_ids.contains(&extra) {
                customer_ids.push(extra);
            }
        }

        let mut customer_states = BTreeMap::new();
        for customer_id in customer_ids {
            let Some(customer) = store.get_customer(customer_id).await? else {
                warn!(%customer_id, "customer in pending data no longer exists");
                continue;
            };
            let record = if runtime.stage.is_collection_like() {
                Some(build_record_from_pending(
                    &customer,
                    runtime.pending_updates.fields_for(customer_id),
                ))
            } else {
                store.latest_follow_record(customer_id).await?
            };
            let state = engine::determine_state(Some(&customer), record.as_ref());
            debug!(customer_name = %customer.name, state = state.as_str(), "customer state");
            customer_states.insert(customer_id, state);
        }
        Ok(customer_states)
    }

    async fn is_first_focus<S: Store>(
        &self,
        store: &mut S,
        runtime: &RuntimeContext,
        customer_id: Uuid,
    ) -> Result<bool, TurnError> {
        let dialogs = store.dialogs_by_session(runtime.session_id).await?;
        Ok(!dialogs.iter().any(|dialog| dialog.focus_customer_id == Some(customer_id)))
    }

    async fn find_or_create_customer<S: Store>(
        &self,
        store: &mut S,
        name: &str,
    ) -> Result<Uuid, TurnError> {
        if let Some(customer) = store.get_customer_by_name(name).await? {
            return Ok(customer.id);
        }
        let customer = Customer::new(name);
        store.create_customer(&customer).await?;
        Ok(customer.id)
    }

    /// Step 11. OUTPUTTING and ASKING get fixed wording; CONFIRMING restates
    /// the recap; COLLECTING summarizes and continues the conversation.
    async fn generate_reply<S: Store>(
        &self,
        store: &mut S,
        runtime: &RuntimeContext,
        user_text: &str,
    ) -> Result<String, TurnError> {
        if runtime.stage == SessionStage::Outputting {
            return Ok(self.messages.outputting_confirm.clone());
        }
        if runtime.stage == SessionStage::AskingOtherCustomers {
            return Ok(self.messages.asking_other_customers.clone());
        }

        let focus_name = self.focus_customer_name(store, runtime).await?;
        let history =
            store.conversation_history(runtime.session_id, runtime.turn_index).await?;

        let mut history_context = String::new();
        let mut summary = String::new();

        if runtime.stage == SessionStage::Confirming {
            if let Some(focus) = runtime.focus_customer_id {
                if let Some(recap) = self.build_confirmation_display(store, runtime, focus).await?
                {
                    history_context = recap;
                }
            }
        } else if let Some(focus) = runtime.focus_customer_id {
            if let Some(payload) = self.build_summary_payload(store, runtime, focus).await? {
                summary = match self.llm.summarize_customer_info(&payload).await {
                    Ok(summary) => summary,
                    Err(llm_error) => {
                        error!(%llm_error, "summary generation failed");
                        String::new()
                    }
                };
            }
        }

        let reply = self
            .llm
            .generate_dialogue(DialogueInput {
                stage: runtime.stage,
                focus_customer: &focus_name,
                expected_info: runtime.state.expected_info(),
                utterance: user_text,
                history_context: &history_context,
                summary: &summary,
                conversation_history: &history,
            })
            .await?;
        Ok(reply)
    }

    /// The full recap JSON the confirmation dialogue restates: identity,
    /// contact columns, resolved follow time and every populated field.
    async fn build_confirmation_display<S: Store>(
        &self,
        store: &mut S,
        runtime: &RuntimeContext,
        focus: Uuid,
    ) -> Result<Option<String>, TurnError> {
        let Some(data) = runtime.pending_updates.fields_for(focus).cloned() else {
            return Ok(None);
        };
        if data.is_empty() {
            return Ok(None);
        }
        let Some(customer) = store.get_customer(focus).await? else {
            return Ok(None);
        };

        let mut display = serde_json::Map::new();
        display.insert("customer_name".to_string(), Value::String(customer.name.clone()));
        for (key, value) in [
            ("contact_person", &customer.contact_person),
            ("contact_phone", &customer.contact_phone),
            ("contact_role", &customer.contact_role),
        ] {
            if let Some(value) = value.as_ref().filter(|value| !value.is_empty()) {
                display.insert(key.to_string(), Value::String(value.clone()));
            }
        }

        match data.get("follow_time").filter(|value| !value.is_empty()) {
            Some(stated) => {
                display.insert("follow_time".to_string(), Value::String(stated.clone()));
            }
            None => {
                let fallback =
                    crate::records::first_focus_time(store, runtime.session_id, focus).await?;
                display.insert(
                    "follow_time".to_string(),
                    Value::String(fallback.format("%Y-%m-%d").to_string()),
                );
            }
        }

        for field in
            ["follow_method", "follow_content", "follow_goal", "follow_result", "next_plan",
             "risk_content"]
        {
            if let Some(value) = data.get(field).filter(|value| !value.is_empty()) {
                display.insert(field.to_string(), Value::String(value.clone()));
            }
        }

        Ok(Some(Value::Object(display).to_string()))
    }

    /// The collected facts handed to the summary operation while collecting.
    async fn build_summary_payload<S: Store>(
        &self,
        store: &mut S,
        runtime: &RuntimeContext,
        focus: Uuid,
    ) -> Result<Option<String>, TurnError> {
        let Some(customer) = store.get_customer(focus).await? else {
            return Ok(None);
        };
        let data = runtime.pending_updates.fields_for(focus);
        if data.map_or(true, |data| data.is_empty()) {
            return Ok(None);
        }
        let record = build_record_from_pending(&customer, data);

        let mut payload = serde_json::Map::new();
        payload.insert("customer_name".to_string(), Value::String(customer.name));
        for (key, value) in [
            ("follow_method", &record.follow_method),
            ("follow_content", &record.follow_content),
            ("follow_goal", &record.follow_goal),
            ("follow_result", &record.follow_result),
            ("next_plan", &record.next_plan),
            ("risk_content", &record.risk_content),
        ] {
            if let Some(value) = value {
                payload.insert(key.to_string(), Value::String(value.clone()));
            }
        }
        Ok(Some(Value::Object(payload).to_string()))
    }

    /// Step 12: append this turn's dialog row.
    async fn persist_snapshot<S: Store>(
        &self,
        store: &mut S,
        runtime: &RuntimeContext,
        user_text: &str,
        reply: &str,
    ) -> Result<(), TurnError> {
        let dialog = Dialog {
            id: Uuid::new_v4(),
            session_id: runtime.session_id,
            state: runtime.state,
            stage: runtime.stage,
            turn_index: runtime.turn_index,
            focus_customer_id: runtime.focus_customer_id,
            is_first_focus: runtime.is_first_focus,
            semantic_relevance: Some(runtime.semantic_relevance),
            pending_updates: runtime.pending_updates.to_value(),
            runtime_snapshot: runtime.snapshot_value(),
            turn_content: Dialog::render_turn_content(user_text, reply),
            created_at: Utc::now(),
        };
        store.create_dialog(&dialog).await?;
        Ok(())
    }
}

/// Invariant recovery: non-empty pending data with no focus adopts the most
/// recent focus recorded in the dialog table, provided it still has pending
/// data.
async fn ensure_focus_when_pending<S: Store>(
    store: &mut S,
    runtime: &mut RuntimeContext,
) -> Result<(), TurnError> {
    if runtime.focus_customer_id.is_some() || runtime.pending_updates.is_empty() {
        return Ok(());
    }
    if !runtime.stage.is_collection_like() {
        return Ok(());
    }
    if let Some(latest) = store.latest_focus_customer(runtime.session_id).await? {
        if runtime.pending_updates.contains(latest) {
            runtime.focus_customer_id = Some(latest);
            info!(customer_id = %latest, stage = runtime.stage.as_str(),
                "recovered focus from dialogs");
        }
    }
    Ok(())
}

fn is_special_field(field: &str) -> bool {
    matches!(field, "risk" | "risk_content" | "contact_person" | "contact_role" | "contact_phone")
}

fn risk_value(field_updates: &BTreeMap<String, Value>) -> Option<String> {
    field_updates
        .get("risk")
        .or_else(|| field_updates.get("risk_content"))
        .and_then(value_to_string)
}

/// Writes one collected field into pending data. Customer identity is
/// already established, so `customer_name` is a no-op; unknown fields are
/// dropped with a warning.
fn write_field(runtime: &mut RuntimeContext, customer_id: Uuid, field: &str, value: &str) {
    match field {
        "customer_name" => {}
        "follow_time" => {
            // The user's own words ("今天下午") are kept verbatim; parsing
            // happens at emit time.
            runtime.pending_updates.set(customer_id, "follow_time", value);
        }
        "follow_method" | "follow_content" | "follow_goal" | "follow_result" | "next_plan" => {
            runtime.pending_updates.set(customer_id, field, value);
        }
        "risk" => {
            runtime.pending_updates.set(customer_id, "risk_content", value);
        }
        other => {
            warn!(field = other, "unknown field name in updates");
        }
    }
}

async fn write_contact<S: Store>(
    store: &mut S,
    customer_id: Uuid,
    name: Option<String>,
    role: Option<String>,
    phone: Option<String>,
) -> Result<(), StoreError> {
    let Some(mut customer) = store.get_customer(customer_id).await? else {
        return Ok(());
    };
    if let Some(name) = name {
        customer.contact_person = Some(name);
    }
    if let Some(role) = role {
        customer.contact_role = Some(role);
    }
    if let Some(phone) = phone {
        customer.contact_phone = Some(phone);
    }
    store.update_customer(&customer).await
}
