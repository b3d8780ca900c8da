use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use axum::{Extension, Json};
use chrono::{Duration, Utc};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::err::Error;
use crate::models::{otp_key, OtpRecord};
use crate::store::KvStore;
use crate::{breaks, proceeds, AppState, Message, Payload};

pub const OTP_TTL_MINUTES: i64 = 10;

const SMS_TIMEOUT: StdDuration = StdDuration::from_secs(10);

/// Outbound SMS delivery port.
#[async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<(), Error>;
}

/// Twilio Messages API client.
pub struct TwilioSms {
    http: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl TwilioSms {
    pub fn new(account_sid: String, auth_token: String, from_number: String) -> Result<Self, Error> {
        let http = reqwest::Client::builder().timeout(SMS_TIMEOUT).build()?;
        Ok(Self {
            http,
            account_sid,
            auth_token,
            from_number,
        })
    }
}

#[async_trait]
impl SmsGateway for TwilioSms {
    async fn send(&self, to: &str, body: &str) -> Result<(), Error> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.account_sid
        );
        let form = [("To", to), ("From", self.from_number.as_str()), ("Body", body)];

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            log::error!("Twilio error ({}): {}", status, detail);
            return Err(Error::upstream(
                "SmsGateway",
                format!("Twilio returned {}", status),
            ));
        }
        Ok(())
    }
}

pub fn generate_code() -> String {
    thread_rng().gen_range(100_000..1_000_000u32).to_string()
}

/// Issues a code for `mobile`, overwriting any live one, and hands it to
/// the SMS gateway. Without a configured gateway the code is returned to
/// the caller instead of being delivered; that development fallback is
/// intentional and kicks in exactly when Twilio credentials are absent.
pub async fn send_code(
    store: &dyn KvStore,
    sms: Option<&dyn SmsGateway>,
    mobile: &str,
) -> Result<Option<String>, Error> {
    if mobile.is_empty() {
        return Err(Error::validation("Mobile number is required"));
    }

    let code = generate_code();
    let record = OtpRecord {
        mobile: mobile.to_string(),
        code: code.clone(),
        expires_at: Utc::now() + Duration::minutes(OTP_TTL_MINUTES),
    };
    store
        .set(&otp_key(mobile), serde_json::to_string(&record)?)
        .await?;

    match sms {
        Some(gateway) => {
            let body = format!(
                "Your certificate portal OTP is: {}. Valid for {} minutes.",
                code, OTP_TTL_MINUTES
            );
            gateway.send(mobile, &body).await?;
            Ok(None)
        }
        None => {
            log::warn!(
                "SMS gateway not configured; exposing code for {} in the response",
                mobile
            );
            Ok(Some(code))
        }
    }
}

#[derive(Debug)]
pub enum VerifyError {
    /// No live code for this mobile (never sent, already used, or purged).
    NotFound,
    /// Code existed but its expiry instant passed; the record was deleted.
    Expired,
    /// Wrong code; the stored record is left intact.
    Mismatch,
    Store(Error),
}

impl From<Error> for VerifyError {
    fn from(err: Error) -> Self {
        VerifyError::Store(err)
    }
}

impl From<VerifyError> for Error {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::NotFound => Error::not_found("OTP not found or already used"),
            VerifyError::Expired => Error::validation("OTP expired"),
            VerifyError::Mismatch => Error::validation("Invalid OTP"),
            VerifyError::Store(err) => err,
        }
    }
}

/// Single-use verification: an exact match consumes the code.
pub async fn verify_code(
    store: &dyn KvStore,
    mobile: &str,
    code: &str,
) -> Result<(), VerifyError> {
    let key = otp_key(mobile);
    let record = match store.get(&key).await? {
        Some(raw) => serde_json::from_str::<OtpRecord>(&raw).map_err(Error::from)?,
        None => return Err(VerifyError::NotFound),
    };

    if Utc::now() > record.expires_at {
        store.delete(&key).await?;
        return Err(VerifyError::Expired);
    }
    if record.code != code {
        return Err(VerifyError::Mismatch);
    }

    store.delete(&key).await?;
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendOtp {
    pub mobile: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpSent {
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dev_code: Option<String>,
}

pub async fn send_otp(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<SendOtp>,
) -> Payload<OtpSent> {
    let dev_code = send_code(state.store.as_ref(), state.sms.as_deref(), &body.mobile).await?;
    proceeds(OtpSent {
        message: "OTP sent successfully",
        dev_code,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyOtp {
    pub mobile: String,
    pub code: String,
}

pub async fn verify_otp(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<VerifyOtp>,
) -> Payload<Message> {
    if body.mobile.is_empty() || body.code.is_empty() {
        return breaks(Error::validation("Mobile and OTP are required"));
    }
    verify_code(state.store.as_ref(), &body.mobile, &body.code)
        .await
        .map_err(Error::from)?;
    proceeds(Message {
        message: "OTP verified successfully",
    })
}
