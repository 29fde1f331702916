use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use salesnote_core::domain::{Customer, Dialog, FollowRecord, Session, User};
use salesnote_core::states::SessionStage;

use crate::store::{Store, StoreError};

/// HashMap-backed store with the same observable semantics as the SQL
/// implementation. Backs orchestrator and worker tests; not used in
/// production wiring.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub users: HashMap<String, User>,
    pub customers: Vec<Customer>,
    pub sessions: Vec<Session>,
    pub dialogs: Vec<Dialog>,
    pub records: Vec<FollowRecord>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get_user(&mut self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(user_id).cloned())
    }

    async fn create_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn update_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn touch_user_start_lark(&mut self, user_id: &str) -> Result<(), StoreError> {
        if let Some(user) = self.users.get_mut(user_id) {
            user.start_lark = Some(Utc::now());
        }
        Ok(())
    }

    async fn get_customer(&mut self, customer_id: Uuid) -> Result<Option<Customer>, StoreError> {
        Ok(self.customers.iter().find(|customer| customer.id == customer_id).cloned())
    }

    async fn get_customer_by_name(
        &mut self,
        name: &str,
    ) -> Result<Option<Customer>, StoreError> {
        Ok(self.customers.iter().find(|customer| customer.name == name).cloned())
    }

    async fn all_customers(&mut self) -> Result<Vec<Customer>, StoreError> {
        Ok(self.customers.clone())
    }

    async fn create_customer(&mut self, customer: &Customer) -> Result<(), StoreError> {
        self.customers.push(customer.clone());
        Ok(())
    }

    async fn update_customer(&mut self, customer: &Customer) -> Result<(), StoreError> {
        if let Some(slot) = self.customers.iter_mut().find(|slot| slot.id == customer.id) {
            *slot = customer.clone();
        }
        Ok(())
    }

    async fn get_active_session(
        &mut self,
        user_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        Ok(self
            .sessions
            .iter()
            .filter(|session| {
                session.user_id == user_id
                    && session.stage != SessionStage::Exit
                    && session.ended_at.is_none()
            })
            .max_by_key(|session| session.created_at)
            .cloned())
    }

    async fn create_session(&mut self, session: &Session) -> Result<(), StoreError> {
        self.sessions.push(session.clone());
        Ok(())
    }

    async fn update_session_stage(
        &mut self,
        session_id: Uuid,
        stage: SessionStage,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        if let Some(session) = self.sessions.iter_mut().find(|session| session.id == session_id)
        {
            session.stage = stage;
            session.ended_at = ended_at;
        }
        Ok(())
    }

    async fn delete_session(&mut self, session_id: Uuid) -> Result<(), StoreError> {
        self.sessions.retain(|session| session.id != session_id);
        Ok(())
    }

    async fn latest_dialog(&mut self, session_id: Uuid) -> Result<Option<Dialog>, StoreError> {
        Ok(self
            .dialogs
            .iter()
            .filter(|dialog| dialog.session_id == session_id)
            .max_by_key(|dialog| dialog.turn_index)
            .cloned())
    }

    async fn dialogs_by_session(&mut self, session_id: Uuid) -> Result<Vec<Dialog>, StoreError> {
        let mut dialogs: Vec<Dialog> = self
            .dialogs
            .iter()
            .filter(|dialog| dialog.session_id == session_id)
            .cloned()
            .collect();
        dialogs.sort_by_key(|dialog| dialog.turn_index);
        Ok(dialogs)
    }

    async fn latest_focus_customer(
        &mut self,
        session_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .dialogs
            .iter()
            .filter(|dialog| {
                dialog.session_id == session_id && dialog.focus_customer_id.is_some()
            })
            .max_by_key(|dialog| dialog.turn_index)
            .and_then(|dialog| dialog.focus_customer_id))
    }

    async fn create_dialog(&mut self, dialog: &Dialog) -> Result<(), StoreError> {
        let duplicate = self.dialogs.iter().any(|existing| {
            existing.session_id == dialog.session_id && existing.turn_index == dialog.turn_index
        });
        if duplicate {
            return Err(StoreError::Decode(format!(
                "duplicate turn_index {} for session {}",
                dialog.turn_index, dialog.session_id
            )));
        }
        self.dialogs.push(dialog.clone());
        Ok(())
    }

    async fn delete_dialogs_by_session(&mut self, session_id: Uuid) -> Result<(), StoreError> {
        self.dialogs.retain(|dialog| dialog.session_id != session_id);
        Ok(())
    }

    async fn create_follow_record(&mut self, record: &FollowRecord) -> Result<(), StoreError> {
        self.records.push(record.clone());
        Ok(())
    }

    async fn update_follow_record(&mut self, record: &FollowRecord) -> Result<(), StoreError> {
        if let Some(slot) = self.records.iter_mut().find(|slot| slot.id == record.id) {
            *slot = record.clone();
        }
        Ok(())
    }

    async fn latest_follow_record(
        &mut self,
        customer_id: Uuid,
    ) -> Result<Option<FollowRecord>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|record| record.customer_id == customer_id)
            .max_by_key(|record| record.follow_time)
            .cloned())
    }

    async fn follow_records_by_customer(
        &mut self,
        customer_id: Uuid,
    ) -> Result<Vec<FollowRecord>, StoreError> {
        let mut records: Vec<FollowRecord> = self
            .records
            .iter()
            .filter(|record| record.customer_id == customer_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.follow_time.cmp(&a.follow_time));
        Ok(records)
    }

    async fn follow_records_by_user(
        &mut self,
        user_id: &str,
    ) -> Result<Vec<FollowRecord>, StoreError> {
        let mut records: Vec<FollowRecord> = self
            .records
            .iter()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.follow_time.cmp(&a.follow_time));
        Ok(records)
    }

    async fn get_follow_record(
        &mut self,
        id: Uuid,
    ) -> Result<Option<FollowRecord>, StoreError> {
        Ok(self.records.iter().find(|record| record.id == id).cloned())
    }

    async fn delete_follow_record(
        &mut self,
        id: Uuid,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        let before = self.records.len();
        self.records.retain(|record| !(record.id == id && record.user_id == user_id));
        Ok(self.records.len() != before)
    }
}
