use std::sync::Arc;

use axum::http::HeaderMap;
use axum::{Extension, Json};
use chrono::{Duration, Utc};
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use rand::{thread_rng, Rng};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::err::Error;
use crate::models::{session_key, user_key, Account, AccountView, Role, Session};
use crate::store::KvStore;
use crate::{breaks, proceeds, AppState, Message, Payload};

pub const SESSION_TTL_DAYS: i64 = 2;

/// Header carrying the opaque session token on authenticated calls.
pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

pub fn session_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
}

pub fn hash_password(password: &str) -> Result<String, Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Pbkdf2.hash_password(password.as_bytes(), &salt)?.to_string())
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(hash) => Pbkdf2.verify_password(password.as_bytes(), &hash).is_ok(),
        Err(_) => false,
    }
}

/// 256 bits of thread-local randomness, digested and hex-encoded. The
/// token carries no account data and cannot be derived by a caller.
pub fn mint_token() -> String {
    let token_bytes: [u8; 32] = thread_rng().gen();
    let mut hasher: Sha256 = Digest::new();
    hasher.update(token_bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Deserialize)]
pub struct Signup {
    pub email: String,
    pub password: String,
    pub mobile: String,
    pub name: String,
    pub role: Role,
    pub usn: Option<String>,
}

/// Creates an account. Email uniqueness is enforced with a put-if-absent
/// insert, so two racing signups cannot both win. OTP verification of the
/// mobile number is the client flow's responsibility and is not re-checked
/// here.
pub async fn create_account(
    store: &dyn KvStore,
    email_domain: &str,
    signup: Signup,
) -> Result<(), Error> {
    if signup.email.is_empty()
        || signup.password.is_empty()
        || signup.mobile.is_empty()
        || signup.name.is_empty()
    {
        return Err(Error::validation("All fields are required"));
    }
    if !signup.email.ends_with(email_domain) {
        return Err(Error::validation(format!(
            "Only {} emails are allowed",
            email_domain
        )));
    }

    let usn = match signup.role {
        Role::Student => signup.usn.filter(|usn| !usn.is_empty()),
        Role::Admin => None,
    };
    let account = Account {
        email: signup.email,
        password_hash: hash_password(&signup.password)?,
        mobile: signup.mobile,
        name: signup.name,
        role: signup.role,
        usn,
        created_at: Utc::now(),
    };

    let created = store
        .put_if_absent(&user_key(&account.email), serde_json::to_string(&account)?)
        .await?;
    if !created {
        return Err(Error::conflict("User already exists"));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct Login {
    pub email: String,
    pub password: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedIn {
    pub token: String,
    pub user: AccountView,
}

/// Authenticates credentials and mints a session. Unknown email, wrong
/// password, and role mismatch all fail with the same error so callers
/// cannot probe which accounts exist.
pub async fn open_session(store: &dyn KvStore, login: Login) -> Result<LoggedIn, Error> {
    let invalid = || Error::invalid_credentials("Invalid credentials");

    let account = match store.get(&user_key(&login.email)).await? {
        Some(raw) => serde_json::from_str::<Account>(&raw)?,
        None => return Err(invalid()),
    };
    if account.role != login.role {
        return Err(invalid());
    }
    if !verify_password(&login.password, &account.password_hash) {
        return Err(invalid());
    }

    let token = mint_token();
    let now = Utc::now();
    let session = Session {
        email: account.email.clone(),
        role: account.role,
        created_at: now,
        expires_at: now + Duration::days(SESSION_TTL_DAYS),
    };
    store
        .set(&session_key(&token), serde_json::to_string(&session)?)
        .await?;

    Ok(LoggedIn {
        token,
        user: account.view(),
    })
}

/// Resolves token -> session -> account. Expired sessions are deleted on
/// discovery, so a later lookup with the same token stays Unauthenticated.
pub async fn authenticate(
    store: &dyn KvStore,
    token: Option<&str>,
) -> Result<(Session, Account), Error> {
    let token = match token {
        Some(token) if !token.is_empty() => token,
        _ => return Err(Error::unauthenticated("No token provided")),
    };

    let key = session_key(token);
    let session = match store.get(&key).await? {
        Some(raw) => serde_json::from_str::<Session>(&raw)?,
        None => return Err(Error::unauthenticated("Invalid session")),
    };
    if Utc::now() > session.expires_at {
        store.delete(&key).await?;
        return Err(Error::unauthenticated("Session expired"));
    }

    let account = match store.get(&user_key(&session.email)).await? {
        Some(raw) => serde_json::from_str::<Account>(&raw)?,
        None => return Err(Error::unauthenticated("User not found")),
    };

    Ok((session, account))
}

pub fn require_admin(session: &Session) -> Result<(), Error> {
    if session.role == Role::Admin {
        Ok(())
    } else {
        Err(Error::forbidden("Admin role required"))
    }
}

/// Deletes the session if present; logging out twice is not an error.
pub async fn close_session(store: &dyn KvStore, token: Option<&str>) -> Result<(), Error> {
    if let Some(token) = token {
        if !token.is_empty() {
            store.delete(&session_key(token)).await?;
        }
    }
    Ok(())
}

pub async fn signup(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<Signup>,
) -> Payload<Message> {
    if body.password.is_empty() {
        return breaks(Error::validation("All fields are required"));
    }
    create_account(state.store.as_ref(), &state.email_domain, body).await?;
    proceeds(Message {
        message: "User created successfully",
    })
}

pub async fn login(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<Login>,
) -> Payload<LoggedIn> {
    let logged_in = open_session(state.store.as_ref(), body).await?;
    proceeds(logged_in)
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub user: AccountView,
}

pub async fn verify_session(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Payload<SessionInfo> {
    let (_, account) = authenticate(state.store.as_ref(), session_token(&headers)).await?;
    proceeds(SessionInfo {
        user: account.view(),
    })
}

pub async fn logout(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Payload<Message> {
    close_session(state.store.as_ref(), session_token(&headers)).await?;
    proceeds(Message {
        message: "Logged out successfully",
    })
}
