//! Glue between the chat gateway and the turn pipeline: per-user
//! serialization, user upkeep, the turn transaction, post-commit task
//! submission and outbound replies.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use salesnote_core::config::Messages;
use salesnote_core::domain::{User, UserProfile};
use salesnote_db::{DbPool, SqlStore, Store};
use salesnote_gateway::{HandlerError, InboundMessage, MessageHandler, OutboundSender};
use salesnote_orchestrator::{OutputQueue, SubmitError, TurnOrchestrator, UserSerializer};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory lookup failed: {0}")]
    Lookup(String),
    #[error("directory is not configured")]
    Unconfigured,
}

/// The chat platform's employee directory; consulted to refresh profile
/// attributes when a user enters the chat.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn fetch_profile(&self, user_id: &str) -> Result<UserProfile, DirectoryError>;
}

/// Directory stub for deployments without directory access; users keep
/// their placeholder profile.
pub struct NoopDirectory;

#[async_trait]
impl UserDirectory for NoopDirectory {
    async fn fetch_profile(&self, _user_id: &str) -> Result<UserProfile, DirectoryError> {
        Err(DirectoryError::Unconfigured)
    }
}

pub struct ChatService {
    pool: DbPool,
    orchestrator: Arc<TurnOrchestrator>,
    serializer: UserSerializer,
    queue: OutputQueue,
    outbound: Arc<dyn OutboundSender>,
    directory: Arc<dyn UserDirectory>,
    messages: Messages,
}

impl ChatService {
    pub fn new(
        pool: DbPool,
        orchestrator: Arc<TurnOrchestrator>,
        queue: OutputQueue,
        outbound: Arc<dyn OutboundSender>,
        directory: Arc<dyn UserDirectory>,
        messages: Messages,
    ) -> ChatService {
        ChatService {
            pool,
            orchestrator,
            serializer: UserSerializer::new(),
            queue,
            outbound,
            directory,
            messages,
        }
    }

    /// Runs one turn inside its own transaction and enqueues any output task
    /// only after the commit, so the worker never reads an uncommitted
    /// snapshot.
    async fn run_turn(&self, user_id: &str, text: &str) -> anyhow::Result<String> {
        let mut tx = self.pool.begin().await?;
        let outcome = {
            let mut store = SqlStore::new(&mut *tx);
            self.orchestrator.process_turn(&mut store, user_id, text).await?
        };
        tx.commit().await?;

        if let Some(task) = outcome.output_task {
            match self.queue.try_submit(task) {
                Ok(()) => {
                    info!(session_id = %outcome.session_id, "output task submitted");
                }
                Err(submit_error @ SubmitError::QueueFull) => {
                    // The session stays in OUTPUTTING; resubmission is an
                    // operational concern.
                    error!(%submit_error, session_id = %outcome.session_id,
                        "output task dropped");
                }
                Err(submit_error) => {
                    error!(%submit_error, session_id = %outcome.session_id,
                        "output task dropped");
                }
            }
        }
        Ok(outcome.reply)
    }

    /// Creates the user row on first contact; refreshes profile attributes
    /// from the directory when asked and when they changed.
    async fn ensure_user_exists(
        &self,
        user_id: &str,
        refresh_profile: bool,
    ) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        let mut store = SqlStore::new(&mut conn);

        let existing = store.get_user(user_id).await?;
        if !refresh_profile {
            if existing.is_none() {
                store.create_user(&User::placeholder(user_id)).await?;
            }
            return Ok(());
        }

        let profile = match self.directory.fetch_profile(user_id).await {
            Ok(profile) => profile,
            Err(DirectoryError::Unconfigured) => {
                if existing.is_none() {
                    store.create_user(&User::placeholder(user_id)).await?;
                }
                return Ok(());
            }
            Err(directory_error) => {
                warn!(%directory_error, user_id, "profile refresh failed");
                if existing.is_none() {
                    store.create_user(&User::placeholder(user_id)).await?;
                }
                return Ok(());
            }
        };

        match existing {
            Some(mut user) => {
                let changed = user.status != profile.status
                    || user.orgname != profile.orgname
                    || user.phone != profile.mobile;
                if changed {
                    user.status = profile.status;
                    user.orgname = profile.orgname;
                    user.phone = profile.mobile;
                    store.update_user(&user).await?;
                }
            }
            None => {
                let user = User {
                    id: user_id.to_string(),
                    name: profile.name,
                    phone: profile.mobile,
                    orgname: profile.orgname,
                    status: profile.status,
                    avatar_url: profile.avatar_url,
                    start_lark: None,
                };
                store.create_user(&user).await?;
                info!(user_id, "created new user");
            }
        }
        Ok(())
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<(), HandlerError> {
        self.outbound.send_message(chat_id, text).await
    }
}

#[async_trait]
impl MessageHandler for ChatService {
    async fn handle_message(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        info!(user_id = %message.user_id, chat_id = %message.chat_id, "processing message");

        let lock = self.serializer.lock_for(&message.user_id);
        let _guard = lock.lock().await;

        if let Err(user_error) = self.ensure_user_exists(&message.user_id, false).await {
            error!(%user_error, user_id = %message.user_id, "ensure user failed");
            return self.send(&message.chat_id, &self.messages.system_error).await;
        }

        let reply = match self.run_turn(&message.user_id, &message.text).await {
            Ok(reply) => reply,
            Err(turn_error) => {
                error!(%turn_error, user_id = %message.user_id, "turn processing failed");
                self.messages.process_error.clone()
            }
        };

        self.send(&message.chat_id, &reply).await
    }

    async fn handle_user_entered(
        &self,
        user_id: &str,
        chat_id: &str,
    ) -> Result<(), HandlerError> {
        if let Err(user_error) = self.ensure_user_exists(user_id, true).await {
            error!(%user_error, user_id, "ensure user failed");
            return self.send(chat_id, &self.messages.system_error).await;
        }

        let greeting = match self.pick_greeting(user_id).await {
            Ok(greeting) => greeting,
            Err(greeting_error) => {
                error!(%greeting_error, user_id, "greeting lookup failed");
                self.messages.welcome_back.clone()
            }
        };
        self.send(chat_id, &greeting).await
    }
}

impl ChatService {
    async fn pick_greeting(&self, user_id: &str) -> anyhow::Result<String> {
        let mut conn = self.pool.acquire().await?;
        let mut store = SqlStore::new(&mut conn);

        let user = store.get_user(user_id).await?;
        if is_first_time_today(user.as_ref()) {
            store.touch_user_start_lark(user_id).await?;
            return Ok(self.messages.new_user.clone());
        }

        let greeting = if store.get_active_session(user_id).await?.is_some() {
            self.messages.continue_session.clone()
        } else {
            self.messages.new_dialog.clone()
        };
        Ok(greeting)
    }
}

/// First visit of the calendar day (UTC), including brand-new users.
fn is_first_time_today(user: Option<&User>) -> bool {
    let Some(user) = user else {
        return false;
    };
    match user.start_lark {
        None => true,
        Some(start_lark) => start_lark.date_naive() < Utc::now().date_naive(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn first_time_today_rules() {
        assert!(!is_first_time_today(None));

        let mut user = User::placeholder("u1");
        assert!(is_first_time_today(Some(&user)), "never greeted before");

        user.start_lark = Some(Utc::now());
        assert!(!is_first_time_today(Some(&user)), "already greeted today");

        user.start_lark = Some(Utc::now() - Duration::days(2));
        assert!(is_first_time_today(Some(&user)), "greeted days ago");
    }
}
