use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Customer;

/// The durable artifact of a recording session. Emitted once per
/// (session, customer) by confirmation or by the output worker; conversation
/// logic never mutates it afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FollowRecord {
    pub id: Uuid,
    pub user_id: String,
    pub customer_id: Uuid,
    pub customer_name: String,
    pub contact_person: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_role: Option<String>,
    pub follow_time: DateTime<Utc>,
    pub follow_method: Option<String>,
    pub follow_content: Option<String>,
    pub follow_goal: Option<String>,
    pub follow_result: Option<String>,
    pub risk_content: Option<String>,
    pub next_plan: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FollowRecord {
    /// Skeleton record for a customer: identity and contact columns mirrored
    /// from the customer row, collection fields empty. `follow_time` is a
    /// placeholder until the first-focus time is known.
    pub fn skeleton(customer: &Customer) -> FollowRecord {
        FollowRecord {
            id: Uuid::nil(),
            user_id: String::new(),
            customer_id: customer.id,
            customer_name: customer.name.clone(),
            contact_person: customer.contact_person.clone(),
            contact_phone: customer.contact_phone.clone(),
            contact_role: customer.contact_role.clone(),
            follow_time: Utc::now(),
            follow_method: None,
            follow_content: None,
            follow_goal: None,
            follow_result: None,
            risk_content: None,
            next_plan: None,
            created_at: Utc::now(),
        }
    }

    fn field_mut(&mut self, field: &str) -> Option<&mut Option<String>> {
        match field {
            "follow_method" => Some(&mut self.follow_method),
            "follow_content" => Some(&mut self.follow_content),
            "follow_goal" => Some(&mut self.follow_goal),
            "follow_result" => Some(&mut self.follow_result),
            "risk_content" => Some(&mut self.risk_content),
            "next_plan" => Some(&mut self.next_plan),
            _ => None,
        }
    }

    /// Applies one collected field value by name. Unknown fields and
    /// `follow_time` (parsed separately) are ignored.
    pub fn apply_field(&mut self, field: &str, value: &str) {
        if let Some(slot) = self.field_mut(field) {
            *slot = Some(value.to_string());
        }
    }
}
