//! OAuth code exchange for the page: code -> platform token -> user profile
//! -> user upsert -> signed session JWT. Only the exchange interface lives
//! here; platform protocol details stay behind the configured base URL.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use salesnote_core::domain::user::UserStatus;
use salesnote_core::domain::User;
use salesnote_db::{SqlStore, Store};

use crate::auth;
use crate::records_api::{ApiResponse, ApiState};

#[derive(Clone)]
pub struct OauthState {
    pub api: ApiState,
    pub http: reqwest::Client,
    pub base_url: String,
    pub app_id: String,
    pub app_secret: secrecy::SecretString,
}

pub fn router(state: OauthState) -> Router {
    let prefix = state.api.server.api_prefix();
    Router::new().route(&format!("{prefix}/feishu/auth"), post(exchange)).with_state(state)
}

#[derive(Debug, Deserialize)]
struct ExchangeRequest {
    code: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfoEnvelope {
    data: UserInfo,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    union_id: String,
    #[serde(default)]
    name: String,
    avatar_url: Option<String>,
}

async fn exchange(
    State(state): State<OauthState>,
    Json(request): Json<ExchangeRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let profile = match fetch_profile(&state, &request.code).await {
        Ok(profile) => profile,
        Err(oauth_error) => {
            error!(%oauth_error, "oauth exchange failed");
            return (
                StatusCode::UNAUTHORIZED,
                Json(ApiResponse {
                    success: false,
                    data: None,
                    message: Some("授权失败，请重新登录".to_string()),
                }),
            );
        }
    };

    let upsert = async {
        let mut conn = state.api.db_pool.acquire().await?;
        let mut store = SqlStore::new(&mut conn);
        match store.get_user(&profile.union_id).await? {
            Some(mut user) => {
                user.name = profile.name.clone();
                user.avatar_url = profile.avatar_url.clone();
                store.update_user(&user).await?;
            }
            None => {
                let user = User {
                    id: profile.union_id.clone(),
                    name: profile.name.clone(),
                    phone: None,
                    orgname: String::new(),
                    status: UserStatus::Active,
                    avatar_url: profile.avatar_url.clone(),
                    start_lark: None,
                };
                store.create_user(&user).await?;
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    if let Err(api_error) = upsert {
        error!(%api_error, "user upsert after oauth failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse {
                success: false,
                data: None,
                message: Some("获取用户信息失败".to_string()),
            }),
        );
    }

    let secret = state.api.server.jwt_secret.expose_secret();
    let token = match auth::issue(secret, &profile.union_id) {
        Ok(token) => token,
        Err(auth_error) => {
            error!(%auth_error, "token issue failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse {
                    success: false,
                    data: None,
                    message: Some("登录态签发失败".to_string()),
                }),
            );
        }
    };

    (
        StatusCode::OK,
        Json(ApiResponse {
            success: true,
            data: Some(json!({
                "token": token,
                "user": {
                    "id": profile.union_id,
                    "name": profile.name,
                    "avatar_url": profile.avatar_url,
                },
            })),
            message: None,
        }),
    )
}

async fn fetch_profile(state: &OauthState, code: &str) -> Result<UserInfo, anyhow::Error> {
    let base = state.base_url.trim_end_matches('/');

    let token: TokenResponse = state
        .http
        .post(format!("{base}/open-apis/authen/v2/oauth/token"))
        .json(&json!({
            "grant_type": "authorization_code",
            "code": code,
            "client_id": state.app_id,
            "client_secret": state.app_secret.expose_secret(),
        }))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let envelope: UserInfoEnvelope = state
        .http
        .get(format!("{base}/open-apis/authen/v1/user_info"))
        .bearer_auth(&token.access_token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    Ok(envelope.data)
}
