//! Shared helpers for turning per-customer pending data into follow records.
//! Used by the confirmation path and the output worker so both emit the same
//! shape.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use uuid::Uuid;

use salesnote_core::domain::{Customer, FollowRecord};
use salesnote_db::{Store, StoreError};

/// Fields a state transition gates on; everything else in pending data is
/// carried opportunistically.
const RECORD_FIELDS: [&str; 6] = [
    "follow_method",
    "follow_content",
    "follow_goal",
    "follow_result",
    "next_plan",
    "risk_content",
];

/// Builds a record from collected data. Contact columns mirror the customer
/// row; `follow_time` is parsed from a user-stated value when one parses,
/// and otherwise left for `resolve_follow_time`.
pub fn build_record_from_pending(
    customer: &Customer,
    data: Option<&BTreeMap<String, String>>,
) -> FollowRecord {
    let mut record = FollowRecord::skeleton(customer);
    let Some(data) = data else {
        return record;
    };
    for field in RECORD_FIELDS {
        if let Some(value) = data.get(field) {
            record.apply_field(field, value);
        }
    }
    if let Some(raw) = data.get("follow_time") {
        if let Some(parsed) = parse_follow_time(raw) {
            record.follow_time = parsed;
        }
    }
    record
}

/// Accepts `YYYY-MM-DD` (midnight UTC) or RFC3339.
pub fn parse_follow_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date.and_time(NaiveTime::MIN);
        return Some(midnight.and_utc());
    }
    DateTime::parse_from_rfc3339(raw).ok().map(|time| time.with_timezone(&Utc))
}

/// The timestamp of the turn where the customer first became focus, or `now`
/// when the session never recorded one.
pub async fn first_focus_time<S: Store + ?Sized>(
    store: &mut S,
    session_id: Uuid,
    customer_id: Uuid,
) -> Result<DateTime<Utc>, StoreError> {
    let dialogs = store.dialogs_by_session(session_id).await?;
    let found = dialogs
        .iter()
        .find(|dialog| dialog.focus_customer_id == Some(customer_id) && dialog.is_first_focus)
        .map(|dialog| dialog.created_at);
    Ok(found.unwrap_or_else(Utc::now))
}

/// Resolves the record's `follow_time`: user-stated value when it parses,
/// then the first-focus time, then now.
pub async fn resolve_follow_time<S: Store + ?Sized>(
    store: &mut S,
    session_id: Uuid,
    customer_id: Uuid,
    data: Option<&BTreeMap<String, String>>,
) -> Result<DateTime<Utc>, StoreError> {
    if let Some(raw) = data.and_then(|data| data.get("follow_time")) {
        if let Some(parsed) = parse_follow_time(raw) {
            return Ok(parsed);
        }
    }
    first_focus_time(store, session_id, customer_id).await
}
