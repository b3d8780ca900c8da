use std::sync::Arc;

use axum::extract::Multipart;
use axum::http::HeaderMap;
use axum::{Extension, Json};
use chrono::Utc;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{authenticate, require_admin, session_token};
use crate::err::Error;
use crate::models::{request_key, user_key, Account, CertificateRequest, RequestState, Session};
use crate::storage::ObjectStore;
use crate::store::KvStore;
use crate::{proceeds, AppState, Message, Payload};

/// Signed retrieval URLs stay valid for a year.
pub const SIGNED_URL_TTL_SECS: u64 = 31_536_000;

const PDF_CONTENT_TYPE: &str = "application/pdf";
const ID_ALLOC_ATTEMPTS: usize = 5;

fn new_request_id() -> String {
    format!(
        "REQ{}{:04}",
        Utc::now().timestamp_millis(),
        thread_rng().gen_range(0..10_000u32)
    )
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub certificate_type: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub additional_info: String,
}

/// Persists a new pending request. The timestamp-derived id carries a
/// random suffix and is claimed with put-if-absent, so two creations in
/// the same millisecond cannot collide.
pub async fn create_request(
    store: &dyn KvStore,
    session: &Session,
    create: CreateRequest,
) -> Result<String, Error> {
    if create.certificate_type.trim().is_empty() {
        return Err(Error::validation("Certificate type is required"));
    }

    let now = Utc::now();
    for _ in 0..ID_ALLOC_ATTEMPTS {
        let id = new_request_id();
        let request = CertificateRequest {
            id: id.clone(),
            student_email: session.email.clone(),
            certificate_type: create.certificate_type.clone(),
            purpose: create.purpose.clone(),
            additional_info: create.additional_info.clone(),
            state: RequestState::Pending,
            requested_at: now,
            updated_at: now,
        };
        let claimed = store
            .put_if_absent(&request_key(&id), serde_json::to_string(&request)?)
            .await?;
        if claimed {
            return Ok(id);
        }
    }
    Err(Error::Internal {
        kind: "RequestId",
        message: "Could not allocate a unique request id".to_string(),
    })
}

async fn scan_requests(store: &dyn KvStore) -> Result<Vec<CertificateRequest>, Error> {
    let mut requests = Vec::new();
    for raw in store.get_by_prefix("request:").await? {
        requests.push(serde_json::from_str::<CertificateRequest>(&raw)?);
    }
    Ok(requests)
}

/// All requests owned by the session's account, newest first.
pub async fn list_mine(
    store: &dyn KvStore,
    session: &Session,
) -> Result<Vec<CertificateRequest>, Error> {
    let mut requests: Vec<CertificateRequest> = scan_requests(store)
        .await?
        .into_iter()
        .filter(|request| request.student_email == session.email)
        .collect();
    requests.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
    Ok(requests)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminRequestView {
    #[serde(flatten)]
    pub request: CertificateRequest,
    pub student_name: String,
    #[serde(rename = "studentUSN")]
    pub student_usn: String,
    pub student_mobile: String,
}

/// Every request across all students, enriched with the owning account's
/// name, USN, and mobile. Admin only.
pub async fn list_all(
    store: &dyn KvStore,
    session: &Session,
) -> Result<Vec<AdminRequestView>, Error> {
    require_admin(session)?;

    let mut views = Vec::new();
    for request in scan_requests(store).await? {
        let account = match store.get(&user_key(&request.student_email)).await? {
            Some(raw) => Some(serde_json::from_str::<Account>(&raw)?),
            None => None,
        };
        let (student_name, student_usn, student_mobile) = match account {
            Some(account) => (
                account.name,
                account.usn.unwrap_or_else(|| "N/A".to_string()),
                account.mobile,
            ),
            None => (
                "Unknown".to_string(),
                "N/A".to_string(),
                "N/A".to_string(),
            ),
        };
        views.push(AdminRequestView {
            request,
            student_name,
            student_usn,
            student_mobile,
        });
    }
    views.sort_by(|a, b| b.request.requested_at.cmp(&a.request.requested_at));
    Ok(views)
}

async fn load_pending(
    store: &dyn KvStore,
    request_id: &str,
) -> Result<(String, CertificateRequest), Error> {
    let raw = match store.get(&request_key(request_id)).await? {
        Some(raw) => raw,
        None => return Err(Error::not_found("Request not found")),
    };
    let request = serde_json::from_str::<CertificateRequest>(&raw)?;
    if !request.state.is_pending() {
        return Err(Error::invalid_state("Request has already been resolved"));
    }
    Ok((raw, request))
}

/// Approves a pending request. The artifact is uploaded first and its
/// reference is persisted inside the same compare-and-swap that flips the
/// status, so a crash or a lost race never yields "approved with no
/// artifact". When the swap is not taken, the upload is rolled back.
pub async fn approve(
    store: &dyn KvStore,
    objects: &dyn ObjectStore,
    session: &Session,
    request_id: &str,
    certificate: Vec<u8>,
    remarks: String,
) -> Result<(), Error> {
    require_admin(session)?;
    if request_id.is_empty() || certificate.is_empty() {
        return Err(Error::validation(
            "Request ID and certificate file are required",
        ));
    }

    let (raw, request) = load_pending(store, request_id).await?;

    let object_name = format!("{}_{}.pdf", request_id, Uuid::new_v4().simple());
    objects
        .put(&object_name, certificate, PDF_CONTENT_TYPE)
        .await?;

    let certificate_url = match objects.signed_url(&object_name, SIGNED_URL_TTL_SECS).await {
        Ok(url) => url,
        Err(err) => {
            rollback_upload(objects, &object_name).await;
            return Err(err);
        }
    };

    let now = Utc::now();
    let mut updated = request;
    updated.state = RequestState::Approved {
        certificate_url,
        approved_by: session.email.clone(),
        approved_at: now,
        remarks,
    };
    updated.updated_at = now;

    let swapped = match store
        .compare_and_swap(
            &request_key(request_id),
            &raw,
            serde_json::to_string(&updated)?,
        )
        .await
    {
        Ok(swapped) => swapped,
        Err(err) => {
            rollback_upload(objects, &object_name).await;
            return Err(err);
        }
    };
    if !swapped {
        rollback_upload(objects, &object_name).await;
        return Err(Error::invalid_state("Request has already been resolved"));
    }
    Ok(())
}

async fn rollback_upload(objects: &dyn ObjectStore, object_name: &str) {
    if let Err(err) = objects.delete(object_name).await {
        log::warn!("could not roll back artifact {}: {}", object_name, err);
    }
}

/// Rejects a pending request with a mandatory reason.
pub async fn reject(
    store: &dyn KvStore,
    session: &Session,
    request_id: &str,
    reason: &str,
) -> Result<(), Error> {
    require_admin(session)?;
    if request_id.is_empty() {
        return Err(Error::validation("Request ID is required"));
    }
    if reason.trim().is_empty() {
        return Err(Error::validation("Rejection reason is required"));
    }

    let (raw, request) = load_pending(store, request_id).await?;

    let now = Utc::now();
    let mut updated = request;
    updated.state = RequestState::Rejected {
        rejected_by: session.email.clone(),
        rejected_at: now,
        rejection_reason: reason.to_string(),
    };
    updated.updated_at = now;

    let swapped = store
        .compare_and_swap(
            &request_key(request_id),
            &raw,
            serde_json::to_string(&updated)?,
        )
        .await?;
    if !swapped {
        return Err(Error::invalid_state("Request has already been resolved"));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCreated {
    pub request_id: String,
    pub message: &'static str,
}

pub async fn request_certificate(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateRequest>,
) -> Payload<RequestCreated> {
    let (session, _) = authenticate(state.store.as_ref(), session_token(&headers)).await?;
    let request_id = create_request(state.store.as_ref(), &session, body).await?;
    proceeds(RequestCreated {
        request_id,
        message: "Certificate request submitted successfully",
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestList {
    pub requests: Vec<CertificateRequest>,
}

pub async fn my_requests(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Payload<RequestList> {
    let (session, _) = authenticate(state.store.as_ref(), session_token(&headers)).await?;
    let requests = list_mine(state.store.as_ref(), &session).await?;
    proceeds(RequestList { requests })
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminRequestList {
    pub requests: Vec<AdminRequestView>,
}

pub async fn all_requests(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Payload<AdminRequestList> {
    let (session, _) = authenticate(state.store.as_ref(), session_token(&headers)).await?;
    let requests = list_all(state.store.as_ref(), &session).await?;
    proceeds(AdminRequestList { requests })
}

pub async fn approve_request(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Payload<Message> {
    let (session, _) = authenticate(state.store.as_ref(), session_token(&headers)).await?;

    let mut request_id: Option<String> = None;
    let mut certificate: Option<Vec<u8>> = None;
    let mut remarks = String::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| Error::validation(format!("Malformed multipart body: {}", err)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("requestId") => {
                request_id = Some(field.text().await.map_err(|err| {
                    Error::validation(format!("Malformed requestId field: {}", err))
                })?);
            }
            Some("certificate") => {
                let bytes = field.bytes().await.map_err(|err| {
                    Error::validation(format!("Malformed certificate field: {}", err))
                })?;
                certificate = Some(bytes.to_vec());
            }
            Some("remarks") => {
                remarks = field.text().await.map_err(|err| {
                    Error::validation(format!("Malformed remarks field: {}", err))
                })?;
            }
            _ => {}
        }
    }

    let request_id =
        request_id.ok_or_else(|| Error::validation("Request ID and certificate file are required"))?;
    let certificate = certificate
        .ok_or_else(|| Error::validation("Request ID and certificate file are required"))?;

    approve(
        state.store.as_ref(),
        state.objects.as_ref(),
        &session,
        &request_id,
        certificate,
        remarks,
    )
    .await?;
    proceeds(Message {
        message: "Certificate approved and uploaded successfully",
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectRequest {
    pub request_id: String,
    pub reason: String,
}

pub async fn reject_request(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RejectRequest>,
) -> Payload<Message> {
    let (session, _) = authenticate(state.store.as_ref(), session_token(&headers)).await?;
    reject(
        state.store.as_ref(),
        &session,
        &body.request_id,
        &body.reason,
    )
    .await?;
    proceeds(Message {
        message: "Request rejected successfully",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{create_account, open_session, Login, Signup};
    use crate::models::Role;
    use crate::otp::{send_code, verify_code};
    use crate::storage::MemoryObjectStore;
    use crate::store::MemoryStore;
    use chrono::Duration;

    const DOMAIN: &str = "@gat.ac.in";

    async fn signup_and_login(
        store: &MemoryStore,
        email: &str,
        role: Role,
        usn: Option<&str>,
    ) -> Session {
        create_account(
            store,
            DOMAIN,
            Signup {
                email: email.to_string(),
                password: "pw123".to_string(),
                mobile: "+911234567890".to_string(),
                name: email.split('@').next().unwrap_or("user").to_string(),
                role,
                usn: usn.map(str::to_string),
            },
        )
        .await
        .unwrap();

        let logged_in = open_session(
            store,
            Login {
                email: email.to_string(),
                password: "pw123".to_string(),
                role,
            },
        )
        .await
        .unwrap();

        let (session, _) = authenticate(store, Some(&logged_in.token)).await.unwrap();
        session
    }

    fn bonafide() -> CreateRequest {
        CreateRequest {
            certificate_type: "bonafide".to_string(),
            purpose: "bank loan".to_string(),
            additional_info: String::new(),
        }
    }

    #[tokio::test]
    async fn create_requires_certificate_type() {
        let store = MemoryStore::new();
        let session = signup_and_login(&store, "alice@gat.ac.in", Role::Student, None).await;

        let result = create_request(
            &store,
            &session,
            CreateRequest {
                certificate_type: "  ".to_string(),
                purpose: String::new(),
                additional_info: String::new(),
            },
        )
        .await;
        assert!(matches!(result, Err(Error::Validation { .. })));
    }

    #[tokio::test]
    async fn list_mine_is_scoped_and_newest_first() {
        let store = MemoryStore::new();
        let alice = signup_and_login(&store, "alice@gat.ac.in", Role::Student, None).await;
        let bob = signup_and_login(&store, "bob@gat.ac.in", Role::Student, None).await;

        let first = create_request(&store, &alice, bonafide()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = create_request(&store, &alice, bonafide()).await.unwrap();
        create_request(&store, &bob, bonafide()).await.unwrap();

        let mine = list_mine(&store, &alice).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].id, second);
        assert_eq!(mine[1].id, first);
        assert!(mine.iter().all(|r| r.student_email == "alice@gat.ac.in"));
        assert!(mine.iter().all(|r| r.state.is_pending()));
    }

    #[tokio::test]
    async fn list_all_requires_admin_and_joins_student_details() {
        let store = MemoryStore::new();
        let alice =
            signup_and_login(&store, "alice@gat.ac.in", Role::Student, Some("1GA21CS001")).await;
        let admin = signup_and_login(&store, "dean@gat.ac.in", Role::Admin, None).await;

        create_request(&store, &alice, bonafide()).await.unwrap();

        let forbidden = list_all(&store, &alice).await;
        assert!(matches!(forbidden, Err(Error::Forbidden { .. })));

        let all = list_all(&store, &admin).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].student_name, "alice");
        assert_eq!(all[0].student_usn, "1GA21CS001");
        assert_eq!(all[0].student_mobile, "+911234567890");
    }

    #[tokio::test]
    async fn approve_requires_admin() {
        let store = MemoryStore::new();
        let objects = MemoryObjectStore::new();
        let alice = signup_and_login(&store, "alice@gat.ac.in", Role::Student, None).await;
        let id = create_request(&store, &alice, bonafide()).await.unwrap();

        let result = approve(&store, &objects, &alice, &id, b"%PDF-1.4".to_vec(), String::new())
            .await;
        assert!(matches!(result, Err(Error::Forbidden { .. })));
    }

    #[tokio::test]
    async fn approve_unknown_request_is_not_found() {
        let store = MemoryStore::new();
        let objects = MemoryObjectStore::new();
        let admin = signup_and_login(&store, "dean@gat.ac.in", Role::Admin, None).await;

        let result = approve(
            &store,
            &objects,
            &admin,
            "REQ0000000000000000",
            b"%PDF-1.4".to_vec(),
            String::new(),
        )
        .await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert_eq!(objects.count().await, 0);
    }

    #[tokio::test]
    async fn approve_stores_artifact_and_resolution() {
        let store = MemoryStore::new();
        let objects = MemoryObjectStore::new();
        let alice = signup_and_login(&store, "alice@gat.ac.in", Role::Student, None).await;
        let admin = signup_and_login(&store, "dean@gat.ac.in", Role::Admin, None).await;
        let id = create_request(&store, &alice, bonafide()).await.unwrap();

        approve(
            &store,
            &objects,
            &admin,
            &id,
            b"%PDF-1.4".to_vec(),
            "Verified".to_string(),
        )
        .await
        .unwrap();

        let mine = list_mine(&store, &alice).await.unwrap();
        match &mine[0].state {
            RequestState::Approved {
                certificate_url,
                approved_by,
                remarks,
                ..
            } => {
                assert!(certificate_url.starts_with("memory://"));
                assert_eq!(approved_by, "dean@gat.ac.in");
                assert_eq!(remarks, "Verified");
            }
            other => panic!("expected approved, got {:?}", other),
        }
        assert_eq!(objects.count().await, 1);
    }

    #[tokio::test]
    async fn re_approval_is_invalid_state_and_keeps_the_artifact() {
        let store = MemoryStore::new();
        let objects = MemoryObjectStore::new();
        let alice = signup_and_login(&store, "alice@gat.ac.in", Role::Student, None).await;
        let admin = signup_and_login(&store, "dean@gat.ac.in", Role::Admin, None).await;
        let id = create_request(&store, &alice, bonafide()).await.unwrap();

        approve(&store, &objects, &admin, &id, b"one".to_vec(), String::new())
            .await
            .unwrap();
        let first_url = match &list_mine(&store, &alice).await.unwrap()[0].state {
            RequestState::Approved { certificate_url, .. } => certificate_url.clone(),
            other => panic!("expected approved, got {:?}", other),
        };

        let again = approve(&store, &objects, &admin, &id, b"two".to_vec(), String::new()).await;
        assert!(matches!(again, Err(Error::InvalidState { .. })));

        // the original artifact reference is untouched
        match &list_mine(&store, &alice).await.unwrap()[0].state {
            RequestState::Approved { certificate_url, .. } => {
                assert_eq!(certificate_url, &first_url)
            }
            other => panic!("expected approved, got {:?}", other),
        }
        assert_eq!(objects.count().await, 1);
    }

    #[tokio::test]
    async fn reject_requires_a_reason() {
        let store = MemoryStore::new();
        let alice = signup_and_login(&store, "alice@gat.ac.in", Role::Student, None).await;
        let admin = signup_and_login(&store, "dean@gat.ac.in", Role::Admin, None).await;
        let id = create_request(&store, &alice, bonafide()).await.unwrap();

        let result = reject(&store, &admin, &id, "   ").await;
        assert!(matches!(result, Err(Error::Validation { .. })));

        // still pending
        assert!(list_mine(&store, &alice).await.unwrap()[0].state.is_pending());
    }

    #[tokio::test]
    async fn concurrent_approve_and_reject_have_one_winner() {
        let store = MemoryStore::new();
        let objects = MemoryObjectStore::new();
        let alice = signup_and_login(&store, "alice@gat.ac.in", Role::Student, None).await;
        let admin = signup_and_login(&store, "dean@gat.ac.in", Role::Admin, None).await;
        let id = create_request(&store, &alice, bonafide()).await.unwrap();

        let (approved, rejected) = tokio::join!(
            approve(
                &store,
                &objects,
                &admin,
                &id,
                b"%PDF-1.4".to_vec(),
                String::new()
            ),
            reject(&store, &admin, &id, "Incomplete purpose"),
        );

        assert!(
            approved.is_ok() ^ rejected.is_ok(),
            "exactly one transition must win: approve={:?} reject={:?}",
            approved,
            rejected
        );
        let loser = if approved.is_ok() { &rejected } else { &approved };
        assert!(matches!(loser, Err(Error::InvalidState { .. })));

        let state = &list_mine(&store, &alice).await.unwrap()[0].state;
        assert!(!state.is_pending());
        match state {
            RequestState::Approved { .. } => {
                assert!(approved.is_ok());
                assert_eq!(objects.count().await, 1);
            }
            RequestState::Rejected { .. } => {
                assert!(rejected.is_ok());
                // the losing upload was rolled back
                assert_eq!(objects.count().await, 0);
            }
            RequestState::Pending => unreachable!(),
        }
    }

    #[tokio::test]
    async fn student_flow_from_otp_to_approved_artifact() {
        let store = MemoryStore::new();
        let objects = MemoryObjectStore::new();

        // mobile verification
        let code = send_code(&store, None, "+911234567890")
            .await
            .unwrap()
            .unwrap();
        verify_code(&store, "+911234567890", &code).await.unwrap();

        let alice =
            signup_and_login(&store, "alice@gat.ac.in", Role::Student, Some("1GA21CS001")).await;
        let id = create_request(&store, &alice, bonafide()).await.unwrap();

        let mine = list_mine(&store, &alice).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].certificate_type, "bonafide");
        assert_eq!(mine[0].purpose, "bank loan");
        assert!(mine[0].state.is_pending());

        let admin = signup_and_login(&store, "dean@gat.ac.in", Role::Admin, None).await;
        let all = list_all(&store, &admin).await.unwrap();
        assert_eq!(all[0].student_name, "alice");
        assert_eq!(all[0].student_usn, "1GA21CS001");

        approve(
            &store,
            &objects,
            &admin,
            &id,
            b"%PDF-1.4".to_vec(),
            "Verified".to_string(),
        )
        .await
        .unwrap();

        match &list_mine(&store, &alice).await.unwrap()[0].state {
            RequestState::Approved {
                certificate_url,
                remarks,
                ..
            } => {
                assert!(!certificate_url.is_empty());
                assert_eq!(remarks, "Verified");
            }
            other => panic!("expected approved, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejection_preserves_the_reason_and_blocks_approval() {
        let store = MemoryStore::new();
        let objects = MemoryObjectStore::new();
        let alice = signup_and_login(&store, "alice@gat.ac.in", Role::Student, None).await;
        let admin = signup_and_login(&store, "dean@gat.ac.in", Role::Admin, None).await;
        let id = create_request(&store, &alice, bonafide()).await.unwrap();

        reject(&store, &admin, &id, "Incomplete purpose")
            .await
            .unwrap();

        match &list_mine(&store, &alice).await.unwrap()[0].state {
            RequestState::Rejected {
                rejected_by,
                rejection_reason,
                ..
            } => {
                assert_eq!(rejected_by, "dean@gat.ac.in");
                assert_eq!(rejection_reason, "Incomplete purpose");
            }
            other => panic!("expected rejected, got {:?}", other),
        }

        let late = approve(
            &store,
            &objects,
            &admin,
            &id,
            b"%PDF-1.4".to_vec(),
            String::new(),
        )
        .await;
        assert!(matches!(late, Err(Error::InvalidState { .. })));
        assert_eq!(objects.count().await, 0);
    }

    #[tokio::test]
    async fn updated_at_moves_on_transition() {
        let store = MemoryStore::new();
        let alice = signup_and_login(&store, "alice@gat.ac.in", Role::Student, None).await;
        let admin = signup_and_login(&store, "dean@gat.ac.in", Role::Admin, None).await;
        let id = create_request(&store, &alice, bonafide()).await.unwrap();

        let before = list_mine(&store, &alice).await.unwrap()[0].clone();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        reject(&store, &admin, &id, "late").await.unwrap();

        let after = list_mine(&store, &alice).await.unwrap()[0].clone();
        assert!(after.updated_at > before.updated_at);
        assert_eq!(after.requested_at, before.requested_at);
        assert!(after.updated_at - before.requested_at < Duration::seconds(5));
    }
}
