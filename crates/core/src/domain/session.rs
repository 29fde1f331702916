use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::states::SessionStage;

/// One recording conversation. At most one non-EXIT session exists per user;
/// the output worker deletes the row once finalization lands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub stage: SessionStage,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn start(user_id: &str) -> Session {
        Session {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            stage: SessionStage::Collecting,
            ended_at: None,
            created_at: Utc::now(),
        }
    }
}
