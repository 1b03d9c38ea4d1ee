use axum::extract::FromRef;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::claims::TokenKind;
use crate::auth::jwt::JwtKeys;
use crate::auth::password::{hash_password, verify_password};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::uploads::{upload_staged, StagedFile};
use crate::users::dto::{PublicUser, TokenPair};
use crate::users::store::{NewUser, User, UserStore};

/// Shared by "no such account" and "wrong password" so responses do not
/// reveal which identifiers exist.
pub const INVALID_CREDENTIALS: &str = "invalid credentials";
pub const STALE_REFRESH_TOKEN: &str = "refresh token is expired, used, or tampered";

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

#[derive(Default)]
pub struct RegisterInput {
    pub full_name: String,
    pub email: String,
    pub username: String,
    pub password: String,
    pub avatar: Option<StagedFile>,
    pub cover_image: Option<StagedFile>,
}

pub struct LoginInput {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: String,
}

/// Create an account. Staged files are released on every exit path; the
/// user record is only created once the avatar has a durable URL.
pub async fn register_user(st: &AppState, input: RegisterInput) -> ApiResult<PublicUser> {
    let full_name = input.full_name.trim().to_string();
    let email = input.email.trim().to_lowercase();
    let username = input.username.trim().to_lowercase();
    let password = input.password;

    for (field, value) in [
        ("full_name", full_name.as_str()),
        ("email", email.as_str()),
        ("username", username.as_str()),
        ("password", password.trim()),
    ] {
        if value.is_empty() {
            warn!(%field, "registration rejected, blank field");
            return Err(ApiError::Validation(format!("{field} is required")));
        }
    }

    if !is_valid_email(&email) {
        warn!(%email, "registration rejected, invalid email");
        return Err(ApiError::Validation("invalid email".into()));
    }

    if st
        .users
        .find_by_username_or_email(Some(username.as_str()), Some(email.as_str()))
        .await?
        .is_some()
    {
        warn!(%username, %email, "registration rejected, user exists");
        return Err(ApiError::Conflict(
            "user with email or username already exists".into(),
        ));
    }

    // Must hold before anything is pushed to object storage.
    let avatar = input
        .avatar
        .ok_or_else(|| ApiError::Validation("avatar file is required".into()))?;

    let avatar_asset = upload_staged(st.storage.as_ref(), "avatars", avatar)
        .await
        .ok_or_else(|| ApiError::Upload("avatar upload failed".into()))?;
    debug!(key = %avatar_asset.key, "avatar stored");

    let cover_image_url = match input.cover_image {
        Some(staged) => upload_staged(st.storage.as_ref(), "covers", staged)
            .await
            .map(|asset| asset.url)
            .unwrap_or_default(),
        None => String::new(),
    };

    let password_hash = hash_password(&password)?;
    let created = st
        .users
        .create(NewUser {
            username,
            email,
            full_name,
            password_hash,
            avatar_url: avatar_asset.url,
            cover_image_url,
        })
        .await?;

    let user = st
        .users
        .find_by_id(created.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("user {} missing right after create", created.id))?;

    info!(user_id = %user.id, username = %user.username, "user registered");
    Ok(user.into())
}

pub async fn login_user(st: &AppState, input: LoginInput) -> ApiResult<(PublicUser, TokenPair)> {
    let username = normalize_identifier(input.username);
    let email = normalize_identifier(input.email);
    if username.is_none() && email.is_none() {
        return Err(ApiError::Validation("username or email is required".into()));
    }

    let user = st
        .users
        .find_by_username_or_email(username.as_deref(), email.as_deref())
        .await?
        .ok_or_else(|| {
            warn!("login rejected, unknown account");
            ApiError::Auth(INVALID_CREDENTIALS.into())
        })?;

    if !verify_password(&input.password, &user.password_hash)? {
        warn!(user_id = %user.id, "login rejected, wrong password");
        return Err(ApiError::Auth(INVALID_CREDENTIALS.into()));
    }

    let (user, tokens) = issue_session(st, user.id).await?;
    info!(user_id = %user.id, username = %user.username, "user logged in");
    Ok((user.into(), tokens))
}

/// Exchange a valid refresh token for a fresh pair. The compare-and-swap
/// in the store makes each stored value rotatable exactly once; a replayed
/// or raced token gets the stale-token error.
pub async fn rotate_session(st: &AppState, presented: &str) -> ApiResult<TokenPair> {
    let keys = JwtKeys::from_ref(st);
    let claims = keys
        .verify(presented, TokenKind::Refresh)
        .map_err(|e| ApiError::Auth(format!("invalid refresh token: {e}")))?;

    let user = st
        .users
        .find_by_id(claims.sub)
        .await?
        .ok_or_else(|| ApiError::Auth("invalid refresh token".into()))?;

    if user.refresh_token.as_deref() != Some(presented) {
        warn!(user_id = %user.id, "refresh token replayed or superseded");
        return Err(ApiError::Auth(STALE_REFRESH_TOKEN.into()));
    }

    let access_token = keys.sign_access(user.id)?;
    let refresh_token = keys.sign_refresh(user.id)?;
    if st
        .users
        .rotate_refresh_token(user.id, presented, &refresh_token)
        .await?
        .is_none()
    {
        warn!(user_id = %user.id, "rotation lost to a concurrent refresh");
        return Err(ApiError::Auth(STALE_REFRESH_TOKEN.into()));
    }

    info!(user_id = %user.id, "session rotated");
    Ok(TokenPair {
        access_token,
        refresh_token,
    })
}

/// End the active session: the stored refresh token is unset, so any copy
/// of it fails the equality check from now on.
pub async fn logout_user(st: &AppState, user_id: Uuid) -> ApiResult<PublicUser> {
    let user = st
        .users
        .clear_refresh_token(user_id)
        .await?
        .ok_or_else(|| ApiError::Auth("user not found".into()))?;
    info!(user_id = %user.id, "user logged out");
    Ok(user.into())
}

pub async fn current_user(st: &AppState, user_id: Uuid) -> ApiResult<PublicUser> {
    let user = st
        .users
        .find_by_id(user_id)
        .await?
        .ok_or_else(|| ApiError::Auth("user not found".into()))?;
    Ok(user.into())
}

/// Sign a fresh pair and persist the refresh token as the user's sole
/// active session. Tokens are only handed out once the store write landed.
async fn issue_session(st: &AppState, user_id: Uuid) -> ApiResult<(User, TokenPair)> {
    let keys = JwtKeys::from_ref(st);
    let access_token = keys.sign_access(user_id)?;
    let refresh_token = keys.sign_refresh(user_id)?;
    let user = st
        .users
        .set_refresh_token(user_id, &refresh_token)
        .await?
        .ok_or_else(|| anyhow::anyhow!("user {user_id} vanished while issuing tokens"))?;
    Ok((
        user,
        TokenPair {
            access_token,
            refresh_token,
        },
    ))
}

fn normalize_identifier(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}
