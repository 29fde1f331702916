use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use salesnote_core::domain::{Customer, Dialog, FollowRecord, Session, User};
use salesnote_core::states::SessionStage;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Persistence facade for the turn pipeline, output worker and page API.
///
/// The SQL implementation is scoped to a single connection, so a caller that
/// opens a transaction sees every method run inside it; the in-memory
/// implementation backs tests.
#[async_trait]
pub trait Store: Send {
    // users
    async fn get_user(&mut self, user_id: &str) -> Result<Option<User>, StoreError>;
    async fn create_user(&mut self, user: &User) -> Result<(), StoreError>;
    async fn update_user(&mut self, user: &User) -> Result<(), StoreError>;
    async fn touch_user_start_lark(&mut self, user_id: &str) -> Result<(), StoreError>;

    // customers
    async fn get_customer(&mut self, customer_id: Uuid) -> Result<Option<Customer>, StoreError>;
    async fn get_customer_by_name(&mut self, name: &str)
        -> Result<Option<Customer>, StoreError>;
    async fn all_customers(&mut self) -> Result<Vec<Customer>, StoreError>;
    async fn create_customer(&mut self, customer: &Customer) -> Result<(), StoreError>;
    async fn update_customer(&mut self, customer: &Customer) -> Result<(), StoreError>;

    // sessions
    async fn get_active_session(&mut self, user_id: &str)
        -> Result<Option<Session>, StoreError>;
    async fn create_session(&mut self, session: &Session) -> Result<(), StoreError>;
    async fn update_session_stage(
        &mut self,
        session_id: Uuid,
        stage: SessionStage,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
    async fn delete_session(&mut self, session_id: Uuid) -> Result<(), StoreError>;

    // dialogs
    async fn latest_dialog(&mut self, session_id: Uuid) -> Result<Option<Dialog>, StoreError>;
    async fn dialogs_by_session(&mut self, session_id: Uuid) -> Result<Vec<Dialog>, StoreError>;
    async fn latest_focus_customer(&mut self, session_id: Uuid)
        -> Result<Option<Uuid>, StoreError>;
    async fn create_dialog(&mut self, dialog: &Dialog) -> Result<(), StoreError>;
    async fn delete_dialogs_by_session(&mut self, session_id: Uuid) -> Result<(), StoreError>;

    /// Raw transcript of the session before `before_turn_index`, one
    /// "User/Assistant" block per turn.
    async fn conversation_history(
        &mut self,
        session_id: Uuid,
        before_turn_index: i32,
    ) -> Result<String, StoreError> {
        let dialogs = self.dialogs_by_session(session_id).await?;
        let parts: Vec<&str> = dialogs
            .iter()
            .take_while(|dialog| dialog.turn_index < before_turn_index)
            .filter_map(|dialog| dialog.turn_content.as_deref())
            .filter(|content| !content.is_empty())
            .collect();
        Ok(parts.join("\n"))
    }

    // follow records
    async fn create_follow_record(&mut self, record: &FollowRecord) -> Result<(), StoreError>;
    async fn update_follow_record(&mut self, record: &FollowRecord) -> Result<(), StoreError>;
    async fn latest_follow_record(
        &mut self,
        customer_id: Uuid,
    ) -> Result<Option<FollowRecord>, StoreError>;
    async fn follow_records_by_customer(
        &mut self,
        customer_id: Uuid,
    ) -> Result<Vec<FollowRecord>, StoreError>;
    async fn follow_records_by_user(
        &mut self,
        user_id: &str,
    ) -> Result<Vec<FollowRecord>, StoreError>;
    async fn get_follow_record(&mut self, id: Uuid)
        -> Result<Option<FollowRecord>, StoreError>;
    async fn delete_follow_record(&mut self, id: Uuid, user_id: &str)
        -> Result<bool, StoreError>;
}
