//! Page API: follow-record CRUD scoped to the authenticated user. Every
//! response uses the `{ success, data, message }` envelope the page frontend
//! expects.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use salesnote_core::config::ServerConfig;
use salesnote_core::domain::{Customer, FollowRecord, User};
use salesnote_db::{DbPool, SqlStore, Store};

use crate::auth;

#[derive(Clone)]
pub struct ApiState {
    pub db_pool: DbPool,
    pub server: ServerConfig,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiResponse {
    fn ok(data: Value) -> Json<ApiResponse> {
        Json(ApiResponse { success: true, data: Some(data), message: None })
    }

    fn err(message: &str) -> Json<ApiResponse> {
        Json(ApiResponse { success: false, data: None, message: Some(message.to_string()) })
    }
}

pub fn router(state: ApiState) -> Router {
    let prefix = state.server.api_prefix();
    Router::new()
        .route(&format!("{prefix}/records"), get(list_records).post(create_record))
        .route(
            &format!("{prefix}/records/{{id}}"),
            axum::routing::put(update_record).delete(delete_record),
        )
        .with_state(state)
}

/// Resolves the authenticated union identifier: a valid bearer token first,
/// then the `x-user-id` header when the fallback is enabled. `demo_user` is
/// never accepted.
pub fn authenticated_user(headers: &HeaderMap, server: &ServerConfig) -> Option<String> {
    let secret = server.jwt_secret.expose_secret();

    if !secret.is_empty() {
        if let Some(token) = bearer_token(headers) {
            if let Ok(uid) = auth::validate(secret, token) {
                if !is_invalid_user(&uid) {
                    return Some(uid);
                }
            }
        }
        if server.allow_header_fallback {
            if let Some(uid) = header_user(headers) {
                return Some(uid);
            }
        }
        return None;
    }

    // No JWT secret configured: header identity only.
    header_user(headers)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

fn header_user(headers: &HeaderMap) -> Option<String> {
    let uid = headers.get("x-user-id").and_then(|value| value.to_str().ok())?;
    if uid.is_empty() || is_invalid_user(uid) {
        return None;
    }
    Some(uid.to_string())
}

fn is_invalid_user(uid: &str) -> bool {
    uid == "demo_user"
}

#[derive(Debug, Deserialize)]
struct CreateRecordRequest {
    #[serde(default)]
    customer_id: String,
    customer_name: String,
    #[serde(default)]
    follow_content: String,
    #[serde(default)]
    follow_time: String,
    #[serde(default)]
    follow_method: String,
    #[serde(default)]
    contact_person: String,
    contact_role: Option<String>,
    #[serde(default)]
    follow_goal: String,
    #[serde(default)]
    follow_result: String,
    risk_content: Option<String>,
    #[serde(default)]
    next_plan: String,
}

#[derive(Debug, Deserialize)]
struct UpdateRecordRequest {
    #[serde(default)]
    follow_method: String,
    #[serde(default)]
    contact_person: String,
    contact_role: Option<String>,
    #[serde(default)]
    follow_goal: String,
    #[serde(default)]
    follow_result: String,
    risk_content: Option<String>,
    #[serde(default)]
    next_plan: String,
}

async fn list_records(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(user_id) = authenticated_user(&headers, &state.server) else {
        return (StatusCode::UNAUTHORIZED, ApiResponse::err("未登录或登录已过期"));
    };

    let result = async {
        let mut conn = state.db_pool.acquire().await?;
        let mut store = SqlStore::new(&mut conn);
        ensure_user(&mut store, &user_id).await?;
        let records = store.follow_records_by_user(&user_id).await?;
        Ok::<_, anyhow::Error>(records)
    }
    .await;

    match result {
        Ok(records) => {
            let data: Vec<Value> = records.iter().map(record_to_page).collect();
            (StatusCode::OK, ApiResponse::ok(Value::Array(data)))
        }
        Err(api_error) => {
            error!(%api_error, "list follow records failed");
            (StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::err("查询记录失败"))
        }
    }
}

async fn create_record(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<CreateRecordRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(user_id) = authenticated_user(&headers, &state.server) else {
        return (StatusCode::UNAUTHORIZED, ApiResponse::err("未登录或登录已过期"));
    };

    let follow_time = DateTime::parse_from_rfc3339(&request.follow_time)
        .map(|time| time.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    let result = async {
        let mut conn = state.db_pool.acquire().await?;
        let mut store = SqlStore::new(&mut conn);
        ensure_user(&mut store, &user_id).await?;

        // Reuse an existing customer when a valid id was sent; otherwise a
        // new customer is created from the name.
        let customer = match Uuid::parse_str(&request.customer_id) {
            Ok(id) => store.get_customer(id).await?,
            Err(_) => None,
        };
        let customer = match customer {
            Some(customer) => customer,
            None => {
                let customer = Customer::new(request.customer_name.clone());
                store.create_customer(&customer).await?;
                customer
            }
        };

        let follow_method = if request.follow_method.is_empty() {
            "线上".to_string()
        } else {
            request.follow_method.clone()
        };
        let record = FollowRecord {
            id: Uuid::new_v4(),
            user_id: user_id.clone(),
            customer_id: customer.id,
            customer_name: request.customer_name.clone(),
            contact_person: Some(request.contact_person.clone()),
            contact_phone: None,
            contact_role: request.contact_role.clone(),
            follow_time,
            follow_method: Some(follow_method),
            follow_content: Some(request.follow_content.clone()),
            follow_goal: Some(request.follow_goal.clone()),
            follow_result: Some(request.follow_result.clone()),
            risk_content: request.risk_content.clone(),
            next_plan: Some(request.next_plan.clone()),
            created_at: Utc::now(),
        };
        store.create_follow_record(&record).await?;
        Ok::<_, anyhow::Error>(record)
    }
    .await;

    match result {
        Ok(record) => (StatusCode::OK, ApiResponse::ok(record_to_page(&record))),
        Err(api_error) => {
            error!(%api_error, "create follow record failed");
            (StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::err("创建记录失败"))
        }
    }
}

async fn update_record(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<UpdateRecordRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(user_id) = authenticated_user(&headers, &state.server) else {
        return (StatusCode::UNAUTHORIZED, ApiResponse::err("未登录或登录已过期"));
    };

    let result = async {
        let mut conn = state.db_pool.acquire().await?;
        let mut store = SqlStore::new(&mut conn);
        let Some(mut record) = store.get_follow_record(id).await? else {
            return Ok::<_, anyhow::Error>(WriteOutcome::NotFound);
        };
        if record.user_id != user_id {
            return Ok(WriteOutcome::Forbidden);
        }

        record.follow_method = Some(request.follow_method.clone());
        record.contact_person = Some(request.contact_person.clone());
        record.contact_role = request.contact_role.clone();
        record.follow_goal = Some(request.follow_goal.clone());
        record.follow_result = Some(request.follow_result.clone());
        record.risk_content = request.risk_content.clone();
        record.next_plan = Some(request.next_plan.clone());
        store.update_follow_record(&record).await?;
        Ok(WriteOutcome::Done(Some(record)))
    }
    .await;

    match result {
        Ok(WriteOutcome::NotFound) => (StatusCode::NOT_FOUND, ApiResponse::err("记录不存在")),
        Ok(WriteOutcome::Forbidden) => {
            (StatusCode::FORBIDDEN, ApiResponse::err("无权限操作此记录"))
        }
        Ok(WriteOutcome::Done(Some(record))) => {
            (StatusCode::OK, ApiResponse::ok(record_to_page(&record)))
        }
        Ok(WriteOutcome::Done(None)) => (StatusCode::NOT_FOUND, ApiResponse::err("记录不存在")),
        Err(api_error) => {
            error!(%api_error, %id, "update follow record failed");
            (StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::err("更新记录失败"))
        }
    }
}

enum WriteOutcome {
    NotFound,
    Forbidden,
    Done(Option<FollowRecord>),
}

async fn delete_record(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(user_id) = authenticated_user(&headers, &state.server) else {
        return (StatusCode::UNAUTHORIZED, ApiResponse::err("未登录或登录已过期"));
    };

    let result = async {
        let mut conn = state.db_pool.acquire().await?;
        let mut store = SqlStore::new(&mut conn);
        if let Some(record) = store.get_follow_record(id).await? {
            if record.user_id != user_id {
                return Ok::<_, anyhow::Error>(WriteOutcome::Forbidden);
            }
        }
        let deleted = store.delete_follow_record(id, &user_id).await?;
        if deleted {
            Ok(WriteOutcome::Done(None))
        } else {
            Ok(WriteOutcome::NotFound)
        }
    }
    .await;

    match result {
        Ok(WriteOutcome::Done(_)) => (
            StatusCode::OK,
            Json(ApiResponse {
                success: true,
                data: None,
                message: Some("删除成功".to_string()),
            }),
        ),
        Ok(WriteOutcome::Forbidden) => {
            (StatusCode::FORBIDDEN, ApiResponse::err("无权限操作此记录"))
        }
        Ok(WriteOutcome::NotFound) => (StatusCode::NOT_FOUND, ApiResponse::err("记录不存在")),
        Err(api_error) => {
            error!(%api_error, %id, "delete follow record failed");
            (StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::err("删除记录失败"))
        }
    }
}

/// Creates a placeholder user row on first page access.
async fn ensure_user<S: Store>(store: &mut S, user_id: &str) -> Result<(), anyhow::Error> {
    if store.get_user(user_id).await?.is_none() {
        store.create_user(&User::placeholder(user_id)).await?;
    }
    Ok(())
}

/// Maps a record into the snake_case shape the page expects, with empty
/// strings where the frontend wants non-null values.
fn record_to_page(record: &FollowRecord) -> Value {
    json!({
        "id": record.id.to_string(),
        "customer_id": record.customer_id.to_string(),
        "customer_name": record.customer_name,
        "follow_time": record.follow_time.to_rfc3339(),
        "created_at": record.created_at.to_rfc3339(),
        "follow_content": record.follow_content.clone().unwrap_or_default(),
        "follow_method": record.follow_method.clone().unwrap_or_else(|| "线上".to_string()),
        "contact_person": record.contact_person.clone().unwrap_or_default(),
        "contact_role": record.contact_role,
        "follow_goal": record.follow_goal.clone().unwrap_or_default(),
        "follow_result": record.follow_result.clone().unwrap_or_default(),
        "risk_content": record.risk_content,
        "next_plan": record.next_plan.clone().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use secrecy::SecretString;

    use super::*;

    fn server_config(secret: &str, fallback: bool) -> ServerConfig {
        let mut config = salesnote_core::config::AppConfig::default().server;
        config.jwt_secret = SecretString::from(secret.to_string());
        config.allow_header_fallback = fallback;
        config
    }

    fn headers_with(pairs: &[(&str, String)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    const SECRET: &str = "a-test-secret-at-least-16-bytes";

    #[test]
    fn valid_bearer_token_authenticates() {
        let config = server_config(SECRET, false);
        let token = auth::issue(SECRET, "ou_1").unwrap();
        let headers = headers_with(&[("authorization", format!("Bearer {token}"))]);
        assert_eq!(authenticated_user(&headers, &config).as_deref(), Some("ou_1"));
    }

    #[test]
    fn header_fallback_requires_opt_in() {
        let strict = server_config(SECRET, false);
        let lenient = server_config(SECRET, true);
        let headers = headers_with(&[("x-user-id", "ou_2".to_string())]);

        assert_eq!(authenticated_user(&headers, &strict), None);
        assert_eq!(authenticated_user(&headers, &lenient).as_deref(), Some("ou_2"));
    }

    #[test]
    fn demo_user_is_always_rejected() {
        let config = server_config(SECRET, true);
        let headers = headers_with(&[("x-user-id", "demo_user".to_string())]);
        assert_eq!(authenticated_user(&headers, &config), None);
    }

    #[test]
    fn no_secret_falls_back_to_header_identity() {
        let config = server_config("", false);
        let headers = headers_with(&[("x-user-id", "ou_3".to_string())]);
        assert_eq!(authenticated_user(&headers, &config).as_deref(), Some("ou_3"));
        assert_eq!(authenticated_user(&HeaderMap::new(), &config), None);
    }
}
