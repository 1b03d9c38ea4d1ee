use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use tracing::instrument;

use crate::auth::extractors::{cookie_value, AuthUser, ACCESS_COOKIE, REFRESH_COOKIE};
use crate::error::ApiError;
use crate::state::AppState;
use crate::uploads::stage_upload;
use crate::users::dto::{AuthResponse, LoginRequest, PublicUser, RefreshRequest, TokenPair};
use crate::users::service::{self, LoginInput, RegisterInput};

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/users/register", post(register))
        .route("/users/login", post(login))
        .route("/users/refresh-token", post(refresh))
        .route("/users/logout", post(logout))
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024)) // 10MB, covers both image fields
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/users/me", get(me))
}

fn session_cookie(name: &str, value: &str) -> String {
    format!("{name}={value}; Path=/; HttpOnly; Secure; SameSite=Strict")
}

fn expired_cookie(name: &str) -> String {
    format!("{name}=; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age=0")
}

/// Both tokens also travel as http-only cookies for browser clients.
fn session_headers(tokens: &TokenPair) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.append(
        SET_COOKIE,
        session_cookie(ACCESS_COOKIE, &tokens.access_token)
            .parse()
            .unwrap(),
    );
    headers.append(
        SET_COOKIE,
        session_cookie(REFRESH_COOKIE, &tokens.refresh_token)
            .parse()
            .unwrap(),
    );
    headers
}

fn cleared_session_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.append(SET_COOKIE, expired_cookie(ACCESS_COOKIE).parse().unwrap());
    headers.append(SET_COOKIE, expired_cookie(REFRESH_COOKIE).parse().unwrap());
    headers
}

fn unreadable_field(e: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::Validation(format!("unreadable multipart field: {e}"))
}

#[instrument(skip(state, multipart))]
pub async fn register(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<PublicUser>), ApiError> {
    let mut input = RegisterInput::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("malformed multipart body: {e}")))?
    {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        match name.as_str() {
            "full_name" => input.full_name = field.text().await.map_err(unreadable_field)?,
            "email" => input.email = field.text().await.map_err(unreadable_field)?,
            "username" => input.username = field.text().await.map_err(unreadable_field)?,
            "password" => input.password = field.text().await.map_err(unreadable_field)?,
            "avatar" | "cover_image" => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_owned();
                let data = field.bytes().await.map_err(unreadable_field)?;
                if data.is_empty() {
                    continue;
                }
                let staged =
                    stage_upload(&state.config.upload_dir, &name, &content_type, data).await?;
                if name == "avatar" {
                    input.avatar = Some(staged);
                } else {
                    input.cover_image = Some(staged);
                }
            }
            _ => {}
        }
    }

    let user = service::register_user(&state, input).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<(HeaderMap, Json<AuthResponse>), ApiError> {
    let (user, tokens) = service::login_user(
        &state,
        LoginInput {
            username: payload.username,
            email: payload.email,
            password: payload.password,
        },
    )
    .await?;

    let headers = session_headers(&tokens);
    Ok((
        headers,
        Json(AuthResponse {
            user,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
        }),
    ))
}

#[instrument(skip(state, headers, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Option<Json<RefreshRequest>>,
) -> Result<(HeaderMap, Json<TokenPair>), ApiError> {
    let presented = cookie_value(&headers, REFRESH_COOKIE)
        .or_else(|| payload.and_then(|Json(p)| p.refresh_token))
        .ok_or_else(|| ApiError::Auth("refresh token is required".into()))?;

    let tokens = service::rotate_session(&state, &presented).await?;
    Ok((session_headers(&tokens), Json(tokens)))
}

#[instrument(skip(state))]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<(HeaderMap, Json<PublicUser>), ApiError> {
    let user = service::logout_user(&state, user_id).await?;
    Ok((cleared_session_headers(), Json(user)))
}

#[instrument(skip(state))]
pub async fn me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<PublicUser>, ApiError> {
    let user = service::current_user(&state, user_id).await?;
    Ok(Json(user))
}
