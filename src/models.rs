use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Admin,
}

/// Stored account record. The password hash never leaves the store;
/// responses carry an [`AccountView`] instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub email: String,
    pub password_hash: String,
    pub mobile: String,
    pub name: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usn: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub email: String,
    pub mobile: String,
    pub name: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usn: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn view(&self) -> AccountView {
        AccountView {
            email: self.email.clone(),
            mobile: self.mobile.clone(),
            name: self.name.clone(),
            role: self.role,
            usn: self.usn.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpRecord {
    pub mobile: String,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub email: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequest {
    pub id: String,
    pub student_email: String,
    pub certificate_type: String,
    pub purpose: String,
    pub additional_info: String,
    #[serde(flatten)]
    pub state: RequestState,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request lifecycle. Terminal states carry their resolution data so an
/// approved request without an artifact reference is unrepresentable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RequestState {
    Pending,
    #[serde(rename_all = "camelCase")]
    Approved {
        certificate_url: String,
        approved_by: String,
        approved_at: DateTime<Utc>,
        remarks: String,
    },
    #[serde(rename_all = "camelCase")]
    Rejected {
        rejected_by: String,
        rejected_at: DateTime<Utc>,
        rejection_reason: String,
    },
}

impl RequestState {
    pub fn is_pending(&self) -> bool {
        matches!(self, RequestState::Pending)
    }
}

// Key/value namespaces, one per record shape.

pub fn user_key(email: &str) -> String {
    format!("user:{}", email)
}

pub fn otp_key(mobile: &str) -> String {
    format!("otp:{}", mobile)
}

pub fn session_key(token: &str) -> String {
    format!("session:{}", token)
}

pub fn request_key(id: &str) -> String {
    format!("request:{}", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_state_serializes_with_status_tag() {
        let request = CertificateRequest {
            id: "REQ17000000000000001".to_string(),
            student_email: "alice@gat.ac.in".to_string(),
            certificate_type: "bonafide".to_string(),
            purpose: "bank loan".to_string(),
            additional_info: String::new(),
            state: RequestState::Pending,
            requested_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["status"], "pending");
        assert_eq!(value["certificateType"], "bonafide");

        let back: CertificateRequest = serde_json::from_value(value).unwrap();
        assert!(back.state.is_pending());
    }

    #[test]
    fn approved_state_round_trips_resolution_fields() {
        let state = RequestState::Approved {
            certificate_url: "https://storage.example/signed".to_string(),
            approved_by: "admin@gat.ac.in".to_string(),
            approved_at: Utc::now(),
            remarks: "Verified".to_string(),
        };

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["status"], "approved");
        assert_eq!(value["approvedBy"], "admin@gat.ac.in");

        let back: RequestState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn account_view_strips_password_hash() {
        let account = Account {
            email: "alice@gat.ac.in".to_string(),
            password_hash: "$pbkdf2-sha256$...".to_string(),
            mobile: "+911234567890".to_string(),
            name: "Alice".to_string(),
            role: Role::Student,
            usn: Some("1GA21CS001".to_string()),
            created_at: Utc::now(),
        };

        let value = serde_json::to_value(account.view()).unwrap();
        assert!(value.get("passwordHash").is_none());
        assert_eq!(value["usn"], "1GA21CS001");
    }
}
