use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use salesnote_core::domain::user::UserStatus;
use salesnote_core::domain::{Customer, Dialog, FollowRecord, Session, User};
use salesnote_core::states::{CustomerState, SemanticRelevance, SessionStage};

use crate::store::{Store, StoreError};

/// Postgres-backed store scoped to one connection. Hand it a transaction's
/// connection and every statement of a turn commits or rolls back together.
pub struct SqlStore<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> SqlStore<'c> {
    pub fn new(conn: &'c mut PgConnection) -> SqlStore<'c> {
        SqlStore { conn }
    }
}

#[async_trait::async_trait]
impl Store for SqlStore<'_> {
    async fn get_user(&mut self, user_id: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, phone, orgname, status, avatar_url, start_lark
             FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        row.map(user_from_row).transpose()
    }

    async fn create_user(&mut self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users (id, name, phone, orgname, status, avatar_url, start_lark)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&user.id)
        .bind(&user.name)
        .bind(user.phone.as_deref())
        .bind(&user.orgname)
        .bind(user.status.as_i16())
        .bind(user.avatar_url.as_deref())
        .bind(user.start_lark)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn update_user(&mut self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE users SET name = $2, phone = $3, orgname = $4, status = $5,
             avatar_url = $6, updated_at = now() WHERE id = $1",
        )
        .bind(&user.id)
        .bind(&user.name)
        .bind(user.phone.as_deref())
        .bind(&user.orgname)
        .bind(user.status.as_i16())
        .bind(user.avatar_url.as_deref())
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn touch_user_start_lark(&mut self, user_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET start_lark = now(), updated_at = now() WHERE id = $1")
            .bind(user_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    async fn get_customer(&mut self, customer_id: Uuid) -> Result<Option<Customer>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, contact_person, contact_phone, contact_role
             FROM customers WHERE id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        row.map(customer_from_row).transpose()
    }

    async fn get_customer_by_name(
        &mut self,
        name: &str,
    ) -> Result<Option<Customer>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, contact_person, contact_phone, contact_role
             FROM customers WHERE name = $1 LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&mut *self.conn)
        .await?;
        row.map(customer_from_row).transpose()
    }

    async fn all_customers(&mut self) -> Result<Vec<Customer>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, contact_person, contact_phone, contact_role
             FROM customers ORDER BY created_at DESC",
        )
        .fetch_all(&mut *self.conn)
        .await?;
        rows.into_iter().map(customer_from_row).collect()
    }

    async fn create_customer(&mut self, customer: &Customer) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO customers (id, name, contact_person, contact_phone, contact_role)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(customer.id)
        .bind(&customer.name)
        .bind(customer.contact_person.as_deref())
        .bind(customer.contact_phone.as_deref())
        .bind(customer.contact_role.as_deref())
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn update_customer(&mut self, customer: &Customer) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE customers SET name = $2, contact_person = $3, contact_phone = $4,
             contact_role = $5, updated_at = now() WHERE id = $1",
        )
        .bind(customer.id)
        .bind(&customer.name)
        .bind(customer.contact_person.as_deref())
        .bind(customer.contact_phone.as_deref())
        .bind(customer.contact_role.as_deref())
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn get_active_session(
        &mut self,
        user_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, status, ended_at, created_at FROM sessions
             WHERE user_id = $1 AND status != $2 AND ended_at IS NULL
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(SessionStage::Exit.as_str())
        .fetch_optional(&mut *self.conn)
        .await?;
        row.map(session_from_row).transpose()
    }

    async fn create_session(&mut self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, status, ended_at, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(session.id)
        .bind(&session.user_id)
        .bind(session.stage.as_str())
        .bind(session.ended_at)
        .bind(session.created_at)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn update_session_stage(
        &mut self,
        session_id: Uuid,
        stage: SessionStage,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sessions SET status = $2, ended_at = $3, updated_at = now() WHERE id = $1",
        )
        .bind(session_id)
        .bind(stage.as_str())
        .bind(ended_at)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn delete_session(&mut self, session_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(session_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    async fn latest_dialog(&mut self, session_id: Uuid) -> Result<Option<Dialog>, StoreError> {
        let row = sqlx::query(
            "SELECT id, session_id, state, status, turn_index, focus_customer_id,
                    is_first_focus, semantic_relevance, pending_updates, runtime_snapshot,
                    turn_content, created_at
             FROM dialogs WHERE session_id = $1 ORDER BY turn_index DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        row.map(dialog_from_row).transpose()
    }

    async fn dialogs_by_session(&mut self, session_id: Uuid) -> Result<Vec<Dialog>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, session_id, state, status, turn_index, focus_customer_id,
                    is_first_focus, semantic_relevance, pending_updates, runtime_snapshot,
                    turn_content, created_at
             FROM dialogs WHERE session_id = $1 ORDER BY turn_index ASC",
        )
        .bind(session_id)
        .fetch_all(&mut *self.conn)
        .await?;
        rows.into_iter().map(dialog_from_row).collect()
    }

    async fn latest_focus_customer(
        &mut self,
        session_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(
            "SELECT focus_customer_id FROM dialogs
             WHERE session_id = $1 AND focus_customer_id IS NOT NULL
             ORDER BY turn_index DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(row.map(|row| row.try_get("focus_customer_id")).transpose()?)
    }

    async fn create_dialog(&mut self, dialog: &Dialog) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO dialogs (id, session_id, state, status, turn_index,
                focus_customer_id, is_first_focus, semantic_relevance, pending_updates,
                runtime_snapshot, turn_content, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(dialog.id)
        .bind(dialog.session_id)
        .bind(dialog.state.as_str())
        .bind(dialog.stage.as_str())
        .bind(dialog.turn_index)
        .bind(dialog.focus_customer_id)
        .bind(dialog.is_first_focus)
        .bind(dialog.semantic_relevance.map(SemanticRelevance::as_str))
        .bind(&dialog.pending_updates)
        .bind(&dialog.runtime_snapshot)
        .bind(dialog.turn_content.as_deref())
        .bind(dialog.created_at)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn delete_dialogs_by_session(&mut self, session_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM dialogs WHERE session_id = $1")
            .bind(session_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    async fn create_follow_record(&mut self, record: &FollowRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO follow_records (id, user_id, customer_id, customer_name,
                contact_person, contact_phone, contact_role, follow_time, follow_method,
                follow_content, follow_goal, follow_result, risk_content, next_plan)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(record.id)
        .bind(&record.user_id)
        .bind(record.customer_id)
        .bind(&record.customer_name)
        .bind(record.contact_person.as_deref())
        .bind(record.contact_phone.as_deref())
        .bind(record.contact_role.as_deref())
        .bind(record.follow_time)
        .bind(record.follow_method.as_deref())
        .bind(record.follow_content.as_deref())
        .bind(record.follow_goal.as_deref())
        .bind(record.follow_result.as_deref())
        .bind(record.risk_content.as_deref())
        .bind(record.next_plan.as_deref())
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn update_follow_record(&mut self, record: &FollowRecord) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE follow_records SET customer_id = $2, customer_name = $3,
                contact_person = $4, contact_phone = $5, contact_role = $6,
                follow_time = $7, follow_method = $8, follow_content = $9,
                follow_goal = $10, follow_result = $11, risk_content = $12,
                next_plan = $13, updated_at = now()
             WHERE id = $1",
        )
        .bind(record.id)
        .bind(record.customer_id)
        .bind(&record.customer_name)
        .bind(record.contact_person.as_deref())
        .bind(record.contact_phone.as_deref())
        .bind(record.contact_role.as_deref())
        .bind(record.follow_time)
        .bind(record.follow_method.as_deref())
        .bind(record.follow_content.as_deref())
        .bind(record.follow_goal.as_deref())
        .bind(record.follow_result.as_deref())
        .bind(record.risk_content.as_deref())
        .bind(record.next_plan.as_deref())
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn latest_follow_record(
        &mut self,
        customer_id: Uuid,
    ) -> Result<Option<FollowRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, customer_id, customer_name, contact_person, contact_phone,
                    contact_role, follow_time, follow_method, follow_content, follow_goal,
                    follow_result, risk_content, next_plan, created_at
             FROM follow_records WHERE customer_id = $1
             ORDER BY follow_time DESC LIMIT 1",
        )
        .bind(customer_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        row.map(record_from_row).transpose()
    }

    async fn follow_records_by_customer(
        &mut self,
        customer_id: Uuid,
    ) -> Result<Vec<FollowRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, customer_id, customer_name, contact_person, contact_phone,
                    contact_role, follow_time, follow_method, follow_content, follow_goal,
                    follow_result, risk_content, next_plan, created_at
             FROM follow_records WHERE customer_id = $1 ORDER BY follow_time DESC",
        )
        .bind(customer_id)
        .fetch_all(&mut *self.conn)
        .await?;
        rows.into_iter().map(record_from_row).collect()
    }

    async fn follow_records_by_user(
        &mut self,
        user_id: &str,
    ) -> Result<Vec<FollowRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, customer_id, customer_name, contact_person, contact_phone,
                    contact_role, follow_time, follow_method, follow_content, follow_goal,
                    follow_result, risk_content, next_plan, created_at
             FROM follow_records WHERE user_id = $1 ORDER BY follow_time DESC",
        )
        .bind(user_id)
        .fetch_all(&mut *self.conn)
        .await?;
        rows.into_iter().map(record_from_row).collect()
    }

    async fn get_follow_record(
        &mut self,
        id: Uuid,
    ) -> Result<Option<FollowRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, customer_id, customer_name, contact_person, contact_phone,
                    contact_role, follow_time, follow_method, follow_content, follow_goal,
                    follow_result, risk_content, next_plan, created_at
             FROM follow_records WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;
        row.map(record_from_row).transpose()
    }

    async fn delete_follow_record(
        &mut self,
        id: Uuid,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM follow_records WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn user_from_row(row: PgRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        phone: row.try_get("phone")?,
        orgname: row.try_get("orgname")?,
        status: UserStatus::from_i16(row.try_get("status")?),
        avatar_url: row.try_get("avatar_url")?,
        start_lark: row.try_get("start_lark")?,
    })
}

fn customer_from_row(row: PgRow) -> Result<Customer, StoreError> {
    Ok(Customer {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        contact_person: row.try_get("contact_person")?,
        contact_phone: row.try_get("contact_phone")?,
        contact_role: row.try_get("contact_role")?,
    })
}

fn session_from_row(row: PgRow) -> Result<Session, StoreError> {
    let stage: String = row.try_get("status")?;
    Ok(Session {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        stage: SessionStage::parse(&stage)
            .ok_or_else(|| StoreError::Decode(format!("unknown session status `{stage}`")))?,
        ended_at: row.try_get("ended_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn dialog_from_row(row: PgRow) -> Result<Dialog, StoreError> {
    let state: String = row.try_get("state")?;
    let stage: String = row.try_get("status")?;
    let relevance: Option<String> = row.try_get("semantic_relevance")?;
    let semantic_relevance = match relevance.as_deref() {
        Some("STRONG") => Some(SemanticRelevance::Strong),
        Some(_) => Some(SemanticRelevance::None),
        None => None,
    };
    Ok(Dialog {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        state: CustomerState::parse(&state)
            .ok_or_else(|| StoreError::Decode(format!("unknown dialog state `{state}`")))?,
        stage: SessionStage::parse(&stage)
            .ok_or_else(|| StoreError::Decode(format!("unknown dialog status `{stage}`")))?,
        turn_index: row.try_get("turn_index")?,
        focus_customer_id: row.try_get("focus_customer_id")?,
        is_first_focus: row.try_get("is_first_focus")?,
        semantic_relevance,
        pending_updates: row.try_get::<Value, _>("pending_updates")?,
        runtime_snapshot: row.try_get::<Value, _>("runtime_snapshot")?,
        turn_content: row.try_get("turn_content")?,
        created_at: row.try_get("created_at")?,
    })
}

fn record_from_row(row: PgRow) -> Result<FollowRecord, StoreError> {
    Ok(FollowRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        customer_id: row.try_get("customer_id")?,
        customer_name: row.try_get("customer_name")?,
        contact_person: row.try_get("contact_person")?,
        contact_phone: row.try_get("contact_phone")?,
        contact_role: row.try_get("contact_role")?,
        follow_time: row.try_get("follow_time")?,
        follow_method: row.try_get("follow_method")?,
        follow_content: row.try_get("follow_content")?,
        follow_goal: row.try_get("follow_goal")?,
        follow_result: row.try_get("follow_result")?,
        risk_content: row.try_get("risk_content")?,
        next_plan: row.try_get("next_plan")?,
        created_at: row.try_get("created_at")?,
    })
}
