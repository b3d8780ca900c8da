pub mod auth;
pub mod err;
pub mod models;
pub mod otp;
pub mod requests;
pub mod storage;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::handler::Handler;
use axum::{routing::get, routing::post, Extension, Router};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;

use crate::err::{Error, Fine, Maybe, Nothing};
use crate::otp::{SmsGateway, TwilioSms};
use crate::storage::{MemoryObjectStore, ObjectStore, SupabaseStorage};
use crate::store::{KvStore, MemoryStore, PgStore};

pub type Payload<T> = axum::response::Result<Maybe<T>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V>
where
    V: Serialize,
{
    Ok(Fine(value))
}

pub fn breaks<V>(err: Error) -> Payload<V>
where
    V: Serialize,
{
    Ok(Nothing(err))
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub message: &'static str,
}

pub struct AppState {
    pub store: Arc<dyn KvStore>,
    pub sms: Option<Arc<dyn SmsGateway>>,
    pub objects: Arc<dyn ObjectStore>,
    pub email_domain: String,
}

struct TwilioConfig {
    account_sid: String,
    auth_token: String,
    from_number: String,
}

struct StorageConfig {
    base_url: String,
    service_key: String,
    bucket: String,
}

struct Config {
    addr: SocketAddr,
    database_url: Option<String>,
    email_domain: String,
    twilio: Option<TwilioConfig>,
    storage: Option<StorageConfig>,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

impl Config {
    fn from_env() -> anyhow::Result<Config> {
        let port: u16 = match env_opt("PORT") {
            Some(raw) => raw.parse()?,
            None => 3000,
        };
        let twilio = match (
            env_opt("TWILIO_ACCOUNT_SID"),
            env_opt("TWILIO_AUTH_TOKEN"),
            env_opt("TWILIO_PHONE_NUMBER"),
        ) {
            (Some(account_sid), Some(auth_token), Some(from_number)) => Some(TwilioConfig {
                account_sid,
                auth_token,
                from_number,
            }),
            _ => None,
        };
        let storage = match (env_opt("SUPABASE_URL"), env_opt("SUPABASE_SERVICE_ROLE_KEY")) {
            (Some(base_url), Some(service_key)) => Some(StorageConfig {
                base_url,
                service_key,
                bucket: env_opt("STORAGE_BUCKET").unwrap_or_else(|| "certificates".to_string()),
            }),
            _ => None,
        };
        Ok(Config {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            database_url: env_opt("DATABASE_URL"),
            email_domain: env_opt("EMAIL_DOMAIN").unwrap_or_else(|| "@gat.ac.in".to_string()),
            twilio,
            storage,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::from_env()?;

    let store: Arc<dyn KvStore> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(8).connect(url).await?;
            let store = PgStore::new(pool);
            store.migrate().await?;
            Arc::new(store)
        }
        None => {
            log::warn!("DATABASE_URL not set; records are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let sms: Option<Arc<dyn SmsGateway>> = match config.twilio {
        Some(twilio) => Some(Arc::new(TwilioSms::new(
            twilio.account_sid,
            twilio.auth_token,
            twilio.from_number,
        )?)),
        None => {
            log::warn!("Twilio not configured; OTP codes will be returned to the caller");
            None
        }
    };

    let objects: Arc<dyn ObjectStore> = match config.storage {
        Some(storage) => Arc::new(SupabaseStorage::new(
            storage.base_url,
            storage.service_key,
            storage.bucket,
        )?),
        None => {
            log::warn!("object storage not configured; artifacts are kept in memory");
            Arc::new(MemoryObjectStore::new())
        }
    };

    let state = Arc::new(AppState {
        store,
        sms,
        objects,
        email_domain: config.email_domain,
    });

    let app = Router::new()
        .route("/send-otp", post(otp::send_otp))
        .route("/verify-otp", post(otp::verify_otp))
        .route("/signup", post(auth::signup))
        .route("/login", post(auth::login))
        .route("/verify-session", post(auth::verify_session))
        .route("/request-certificate", post(requests::request_certificate))
        .route("/my-requests", get(requests::my_requests))
        .route("/all-requests", get(requests::all_requests))
        .route("/approve-request", post(requests::approve_request))
        .route("/reject-request", post(requests::reject_request))
        .route("/logout", post(auth::logout))
        .fallback(err::handler404.into_service())
        .layer(Extension(state));

    log::info!(
        "Starting certificate portal HTTP server on http://{}",
        config.addr
    );
    axum::Server::bind(&config.addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
