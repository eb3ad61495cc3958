use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::{Value, json};

use journalflow_api::app::{AppServices, build_app_with};
use journalflow_auth::{JwtClaims, PrincipalId, Role};
use journalflow_infra::external::{MockApprovalEngine, MockErpGateway};
use journalflow_infra::{InMemoryJournalRepository, JournalWorkflow, WorkflowSettings};

const JWT_SECRET: &str = "test-secret";
const WEBHOOK_SECRET: &str = "hook-secret";

struct TestServer {
    base_url: String,
    erp: Arc<MockErpGateway>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let erp = Arc::new(MockErpGateway::default());
        let workflow = JournalWorkflow::new(
            Arc::new(InMemoryJournalRepository::new()),
            Arc::new(MockApprovalEngine::default()),
            erp.clone(),
            WorkflowSettings::default(),
        );
        let services = AppServices::new(workflow, Some(WEBHOOK_SECRET.to_string()));

        // Same router as prod, bound to an ephemeral port.
        let app = build_app_with(JWT_SECRET.to_string(), services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            erp,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(name: &str, roles: Vec<Role>) -> String {
    let now = Utc::now();
    let claims = JwtClaims {
        sub: PrincipalId::new(),
        name: Some(name.to_string()),
        roles,
        issued_at: now,
        expires_at: now + ChronoDuration::minutes(10),
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("failed to encode jwt")
}

fn accountant() -> String {
    mint_jwt("alice", vec![Role::ACCOUNTANT])
}

fn approver() -> String {
    mint_jwt("bob", vec![Role::APPROVER])
}

fn entry_body(debit: f64, credit: f64) -> Value {
    json!({
        "companyCode": "1000",
        "postingDate": "2026-09-30",
        "documentDate": "2026-09-30",
        "headerText": "Month-end accrual",
        "currency": "EUR",
        "items": [
            {"glAccount": "400000", "amount": debit, "dcIndicator": "D", "costCenter": "CC100"},
            {"glAccount": "113100", "amount": credit, "dcIndicator": "C"}
        ]
    })
}

async fn create_entry(client: &reqwest::Client, srv: &TestServer, debit: f64, credit: f64) -> String {
    let res = client
        .post(srv.url("/journal-entries"))
        .bearer_auth(accountant())
        .json(&entry_body(debit, credit))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: Value = res.json().await.unwrap();
    assert_eq!(created["status"], "Draft");
    created["id"].as_str().unwrap().to_string()
}

async fn post_json(client: &reqwest::Client, url: String, token: &str, body: Value) -> (StatusCode, Value) {
    let res = client.post(url).bearer_auth(token).json(&body).send().await.unwrap();
    let status = res.status();
    let body = res.json().await.unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn auth_required_for_protected_endpoints() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.get(srv.url("/whoami")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .get(srv.url("/journal-entries"))
        .bearer_auth("not-a-jwt")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn principal_is_derived_from_token() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(srv.url("/whoami"))
        .bearer_auth(approver())
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["actor"], "bob");
    assert!(body["roles"].as_array().unwrap().iter().any(|r| r == "approver"));
}

#[tokio::test]
async fn balanced_entry_is_submitted_approved_and_posted_once() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = create_entry(&client, &srv, 100.0, 100.0).await;

    let (status, body) = post_json(&client, srv.url(&format!("/journal-entries/{id}/submit")), &accountant(), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "Pending"}));

    let (status, body) = post_json(
        &client,
        srv.url(&format!("/journal-entries/{id}/approve")),
        &approver(),
        json!({"comment": "looks right"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "Approved"}));

    let (status, body) = post_json(&client, srv.url(&format!("/journal-entries/{id}/post-to-erp")), &approver(), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let number = body["value"].as_str().unwrap().to_string();
    assert_eq!(number.len(), 10);
    assert!(number.starts_with('5'));

    let (status, body) = post_json(&client, srv.url(&format!("/journal-entries/{id}/post-to-erp")), &approver(), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");
    assert_eq!(body["message"], format!("Entry already posted. Document Number: {number}"));
    assert_eq!(srv.erp.calls(), 1);

    let res = client
        .get(srv.url(&format!("/journal-entries/{id}/logs")))
        .bearer_auth(accountant())
        .send()
        .await
        .unwrap();
    let logs: Value = res.json().await.unwrap();
    let items = logs["items"].as_array().unwrap();
    let actions: Vec<&str> = items.iter().map(|l| l["action"].as_str().unwrap()).collect();
    assert_eq!(actions, vec!["Submit", "Approve", "Post"]);
    assert_eq!(items[0]["actor"], "alice");
    assert_eq!(items[1]["actor"], "bob");
    assert_eq!(items[1]["comment"], "looks right");
}

#[tokio::test]
async fn unbalanced_submit_returns_validation_error() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = create_entry(&client, &srv, 150.0, 100.0).await;

    let (status, body) = post_json(&client, srv.url(&format!("/journal-entries/{id}/submit")), &accountant(), json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    assert_eq!(body["message"], "Cannot submit unbalanced entry. Debit: 150, Credit: 100");

    let res = client
        .get(srv.url(&format!("/journal-entries/{id}")))
        .bearer_auth(accountant())
        .send()
        .await
        .unwrap();
    let entry: Value = res.json().await.unwrap();
    assert_eq!(entry["status"], "Draft");
    assert_eq!(entry["totalAmount"], 150.0);
}

#[tokio::test]
async fn roles_limit_workflow_actions() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = create_entry(&client, &srv, 10.0, 10.0).await;
    post_json(&client, srv.url(&format!("/journal-entries/{id}/submit")), &accountant(), json!({})).await;

    let (status, body) = post_json(&client, srv.url(&format!("/journal-entries/{id}/approve")), &accountant(), json!({})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    let viewer = mint_jwt("eve", vec![Role::new("viewer")]);
    let res = client
        .get(srv.url("/journal-entries"))
        .bearer_auth(viewer)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn webhook_approval_posts_and_ignores_redelivery() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = create_entry(&client, &srv, 250.0, 250.0).await;

    let (status, body) = post_json(
        &client,
        srv.url(&format!("/journal-entries/{id}/send-to-external-approval")),
        &accountant(),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Pending");
    let instance_id = body["instanceId"].as_str().unwrap().to_string();
    assert_eq!(instance_id, "mock-1");

    let callback = json!({"instanceId": instance_id, "decision": "Approved"});

    let res = client
        .post(srv.url("/webhooks/approval-engine/approval"))
        .json(&callback)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(srv.url("/webhooks/approval-engine/approval"))
        .header("X-Webhook-Secret", WEBHOOK_SECRET)
        .json(&callback)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["outcome"], "applied");
    assert_eq!(body["status"], "Approved");
    assert_eq!(body["posting"], "posted");
    let number = body["accountingDocumentNumber"].as_str().unwrap().to_string();

    let res = client
        .post(srv.url("/webhooks/approval-engine/approval"))
        .header("X-Webhook-Secret", WEBHOOK_SECRET)
        .json(&callback)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["outcome"], "duplicate");
    assert_eq!(srv.erp.calls(), 1);

    let res = client
        .get(srv.url(&format!("/journal-entries/{id}")))
        .bearer_auth(approver())
        .send()
        .await
        .unwrap();
    let entry: Value = res.json().await.unwrap();
    assert_eq!(entry["status"], "Approved");
    assert_eq!(entry["accountingDocumentNumber"], number);

    let res = client
        .get(srv.url(&format!("/process-instances/{instance_id}")))
        .bearer_auth(approver())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let view: Value = res.json().await.unwrap();
    assert_eq!(view["instance"]["status"], "Completed");
    assert_eq!(view["instance"]["result"], "Approved");
}

#[tokio::test]
async fn webhook_for_unknown_instance_is_not_found() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/webhooks/approval-engine/error"))
        .header("X-Webhook-Secret", WEBHOOK_SECRET)
        .json(&json!({"instanceId": "wf-unknown", "errorMessage": "boom"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_bodies_get_json_validation_errors() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/webhooks/approval-engine/approval"))
        .header("X-Webhook-Secret", WEBHOOK_SECRET)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
    assert!(body["message"].as_str().unwrap().starts_with("invalid request body"));

    let res = client
        .post(srv.url("/webhooks/approval-engine/complete"))
        .header("X-Webhook-Secret", WEBHOOK_SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let (status, body) = post_json(
        &client,
        srv.url("/journal-entries"),
        &accountant(),
        json!({"companyCode": "1000"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn cancelled_instance_allows_resend() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = create_entry(&client, &srv, 5.0, 5.0).await;
    let send_url = srv.url(&format!("/journal-entries/{id}/send-to-external-approval"));

    let (_, body) = post_json(&client, send_url.clone(), &accountant(), json!({})).await;
    let instance_id = body["instanceId"].as_str().unwrap().to_string();

    let (status, _) = post_json(&client, send_url.clone(), &accountant(), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let res = client
        .delete(srv.url(&format!("/process-instances/{instance_id}")))
        .bearer_auth(approver())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let cancelled: Value = res.json().await.unwrap();
    assert_eq!(cancelled["status"], "Error");
    assert_eq!(cancelled["errorMessage"], "Cancelled");

    let (status, body) = post_json(&client, send_url, &accountant(), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instanceId"], "mock-2");
}

#[tokio::test]
async fn drafts_listing_stats_and_bad_ids() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let a = create_entry(&client, &srv, 1.0, 1.0).await;
    let b = create_entry(&client, &srv, 2.0, 2.0).await;
    post_json(&client, srv.url(&format!("/journal-entries/{a}/submit")), &accountant(), json!({})).await;

    let res = client
        .get(srv.url("/journal-entries?status=Pending"))
        .bearer_auth(accountant())
        .send()
        .await
        .unwrap();
    let list: Value = res.json().await.unwrap();
    let items = list["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], a);

    let res = client
        .get(srv.url("/journal-entries?status=Posted"))
        .bearer_auth(accountant())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(srv.url("/journal-entries/stats"))
        .bearer_auth(accountant())
        .send()
        .await
        .unwrap();
    let stats: Value = res.json().await.unwrap();
    assert_eq!(stats, json!({"total": 2, "draft": 1, "pending": 1, "approved": 0, "rejected": 0}));

    let res = client
        .get(srv.url(&format!("/journal-entries/{b}/payload")))
        .bearer_auth(accountant())
        .send()
        .await
        .unwrap();
    let payload: Value = res.json().await.unwrap();
    assert_eq!(payload["DocumentType"], "SA");
    assert_eq!(payload["to_JournalEntryItem"][1]["DebitCreditCode"], "H");

    let res = client
        .put(srv.url(&format!("/journal-entries/{a}")))
        .bearer_auth(accountant())
        .json(&entry_body(3.0, 3.0))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .delete(srv.url(&format!("/journal-entries/{b}")))
        .bearer_auth(accountant())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = client
        .get(srv.url(&format!("/journal-entries/{b}")))
        .bearer_auth(accountant())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(srv.url("/journal-entries/not-a-uuid"))
        .bearer_auth(accountant())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}
