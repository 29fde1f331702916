use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A customer being followed up. Looked up by exact name and created lazily
/// on first mention; contact attributes live here rather than on the follow
/// record so a contact mentioned at any point is not re-extracted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub name: String,
    pub contact_person: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_role: Option<String>,
}

impl Customer {
    pub fn new(name: impl Into<String>) -> Customer {
        Customer {
            id: Uuid::new_v4(),
            name: name.into(),
            contact_person: None,
            contact_phone: None,
            contact_role: None,
        }
    }
}
