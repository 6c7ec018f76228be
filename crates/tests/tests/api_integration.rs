use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use teleassist_api::{build_app, ApiConfig, MessengerConfig};
use teleassist_core::{unknown_reply, Language};
use tower::ServiceExt;

const API_KEY: &str = "dev-teleassist-key";

async fn app() -> Router {
    build_app(ApiConfig::default())
        .await
        .expect("app should build")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-api-key", API_KEY)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let response = app()
        .await
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let parsed = json_body(response).await;
    assert_eq!(parsed["store"], "memory");
    assert_eq!(parsed["capabilities"]["messenger_outbound"], false);
}

#[tokio::test]
async fn chat_requires_api_key() {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "text": "quel est mon solde" }).to_string()))
        .unwrap();

    let response = app().await.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn chat_from_allowed_origin_needs_no_key() {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat")
        .header("content-type", "application/json")
        .header("origin", "http://localhost:5500")
        .body(Body::from(json!({ "text": "bonjour", "language": "fr" }).to_string()))
        .unwrap();

    let response = app().await.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn chat_answers_balance_question_in_french() {
    let response = app()
        .await
        .oneshot(post_json(
            "/v1/chat",
            json!({ "text": "quel est mon solde", "language": "fr" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let parsed = json_body(response).await;
    assert_eq!(parsed["intent"]["intent"], "balance_inquiry");
    assert_eq!(parsed["intent"]["category"], "balance");
    let confidence = parsed["intent"]["confidence"].as_f64().unwrap();
    assert!((confidence - 5.0 / 18.0).abs() < 1e-9);
    assert!(parsed["bot_message"]["text"]
        .as_str()
        .unwrap()
        .starts_with("Vous pouvez consulter votre solde"));
}

#[tokio::test]
async fn chat_falls_back_to_unknown_reply() {
    let response = app()
        .await
        .oneshot(post_json("/v1/chat", json!({ "text": "hi", "language": "ar" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let parsed = json_body(response).await;
    assert_eq!(parsed["intent"]["intent"], "unknown");
    assert_eq!(parsed["intent"]["confidence"], 0.0);
    assert_eq!(parsed["bot_message"]["text"], unknown_reply(Language::Ar));
}

#[tokio::test]
async fn chat_rejects_blank_text_and_unknown_language() {
    let app = app().await;

    let response = app
        .clone()
        .oneshot(post_json("/v1/chat", json!({ "text": "   " })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(post_json("/v1/chat", json!({ "text": "solde", "language": "en" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn conversation_transcript_and_close() {
    let app = app().await;

    let first = json_body(
        app.clone()
            .oneshot(post_json("/v1/chat", json!({ "text": "bonjour" })))
            .await
            .unwrap(),
    )
    .await;
    let conversation_id = first["conversation_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/chat",
            json!({ "conversation_id": conversation_id, "text": "je veux recharger" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let transcript = json_body(
        app.clone()
            .oneshot(get(&format!("/v1/conversations/{conversation_id}")))
            .await
            .unwrap(),
    )
    .await;
    let messages = transcript["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2]["sender"], "user");
    assert_eq!(messages[3]["intent"], "recharge");

    let listed = json_body(app.clone().oneshot(get("/v1/conversations")).await.unwrap()).await;
    assert_eq!(listed["conversations"].as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/v1/conversations/{conversation_id}/close"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/chat",
            json!({ "conversation_id": conversation_id, "text": "solde" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .oneshot(get("/v1/conversations/does-not-exist"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn create_conversation_defaults_to_french() {
    let response = app()
        .await
        .oneshot(post_json("/v1/conversations", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let parsed = json_body(response).await;
    assert_eq!(parsed["language"], "fr");
    assert_eq!(parsed["status"], "open");
    assert_eq!(parsed["channel"], "web");
}

#[tokio::test]
async fn catalog_admin_round_trip() {
    let app = app().await;

    let entry = json!({
        "intent": "roaming",
        "keywords": ["roaming", "التجوال"],
        "category": "plans",
        "responses": {
            "ar": "فعّل خدمة التجوال من التطبيق قبل السفر.",
            "fr": "Activez le roaming depuis l'application avant votre voyage."
        }
    });
    let response = app
        .clone()
        .oneshot(post_json("/v1/catalog", entry))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let preview = json_body(
        app.clone()
            .oneshot(post_json("/v1/classify", json!({ "text": "roaming" })))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(preview["intent"]["intent"], "roaming");
    assert_eq!(preview["intent"]["confidence"], 1.0);

    let response = app
        .clone()
        .oneshot(post_json("/v1/catalog/roaming/active", json!({ "active": false })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let preview = json_body(
        app.clone()
            .oneshot(post_json("/v1/classify", json!({ "text": "roaming", "language": "fr" })))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(preview["intent"]["intent"], "unknown");
    assert_eq!(preview["reply"], unknown_reply(Language::Fr));

    let catalog = json_body(app.clone().oneshot(get("/v1/catalog")).await.unwrap()).await;
    let entries = catalog["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 6);
    assert_eq!(entries[5]["intent"], "roaming");
    assert_eq!(entries[5]["active"], false);

    let response = app
        .oneshot(post_json("/v1/catalog/nope/active", json!({ "active": true })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn catalog_rejects_entry_missing_a_language() {
    let entry = json!({
        "intent": "roaming",
        "keywords": ["roaming"],
        "category": "plans",
        "responses": { "fr": "Roaming" }
    });

    let response = app()
        .await
        .oneshot(post_json("/v1/catalog", entry))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let parsed = json_body(response).await;
    assert_eq!(parsed["error"], "invalid_catalog");
}

#[tokio::test]
async fn messenger_verification_echoes_challenge() {
    let app = app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/webhook/messenger?hub.mode=subscribe&hub.verify_token=dev-verify-token&hub.challenge=CHALLENGE_ACCEPTED")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"CHALLENGE_ACCEPTED");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/webhook/messenger?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

fn messenger_event(sender: &str, text: &str) -> String {
    messenger_event_with_mid(sender, "mid-1", text)
}

fn messenger_event_with_mid(sender: &str, mid: &str, text: &str) -> String {
    json!({
        "object": "page",
        "entry": [{
            "id": "page-1",
            "time": 1700000000,
            "messaging": [{
                "sender": { "id": sender },
                "recipient": { "id": "page-1" },
                "timestamp": 1700000000,
                "message": { "mid": mid, "text": text }
            }]
        }]
    })
    .to_string()
}

#[tokio::test]
async fn messenger_message_opens_conversation_with_detected_language() {
    let app = app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/messenger")
                .header("content-type", "application/json")
                .body(Body::from(messenger_event("psid-99", "شحال باقي في الرصيد")))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let listed = json_body(app.clone().oneshot(get("/v1/conversations")).await.unwrap()).await;
    let conversations = listed["conversations"].as_array().unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0]["channel"], "messenger");
    assert_eq!(conversations[0]["external_user_id"], "psid-99");
    assert_eq!(conversations[0]["language"], "ar");

    let id = conversations[0]["conversation_id"].as_str().unwrap();
    let transcript = json_body(
        app.oneshot(get(&format!("/v1/conversations/{id}")))
            .await
            .unwrap(),
    )
    .await;
    let messages = transcript["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["intent"], "balance_inquiry");
}

fn messenger_post(body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhook/messenger")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

async fn only_conversation_messages(app: &Router) -> Vec<Value> {
    let listed = json_body(app.clone().oneshot(get("/v1/conversations")).await.unwrap()).await;
    let conversations = listed["conversations"].as_array().unwrap();
    assert_eq!(conversations.len(), 1);

    let id = conversations[0]["conversation_id"].as_str().unwrap();
    let transcript = json_body(
        app.clone()
            .oneshot(get(&format!("/v1/conversations/{id}")))
            .await
            .unwrap(),
    )
    .await;
    transcript["messages"].as_array().unwrap().clone()
}

#[tokio::test]
async fn messenger_scores_untrimmed_text_like_web_chat() {
    let app = app().await;

    let response = app
        .clone()
        .oneshot(messenger_post(messenger_event("psid-5", "  solde  ")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let messages = only_conversation_messages(&app).await;
    assert_eq!(messages[0]["text"], "  solde  ");
    let messenger_confidence = messages[0]["confidence"].as_f64().unwrap();
    assert!((messenger_confidence - 5.0 / 9.0).abs() < 1e-9);

    let web = json_body(
        app.oneshot(post_json("/v1/chat", json!({ "text": "  solde  " })))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(web["intent"]["confidence"].as_f64().unwrap(), messenger_confidence);
}

#[tokio::test]
async fn messenger_redelivery_is_stored_once() {
    let app = app().await;
    let body = messenger_event_with_mid("psid-8", "mid-42", "je veux recharger");

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(messenger_post(body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let messages = only_conversation_messages(&app).await;
    let user_messages = messages
        .iter()
        .filter(|message| message["sender"] == "user")
        .count();
    assert_eq!(user_messages, 1);
    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn classify_preview_treats_blank_text_as_unknown() {
    let response = app()
        .await
        .oneshot(post_json("/v1/classify", json!({ "text": "   " })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let parsed = json_body(response).await;
    assert_eq!(parsed["intent"]["intent"], "unknown");
    assert_eq!(parsed["intent"]["confidence"], 0.0);
    assert_eq!(parsed["reply"], unknown_reply(Language::Fr));
}

#[tokio::test]
async fn messenger_rejects_bad_payloads() {
    let app = app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/messenger")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/messenger")
                .body(Body::from(json!({ "object": "instagram", "entry": [] }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn messenger_signature_is_enforced_when_secret_configured() {
    let config = ApiConfig {
        messenger: MessengerConfig {
            app_secret: Some("shh".to_string()),
            ..MessengerConfig::default()
        },
        ..ApiConfig::default()
    };
    let app = build_app(config).await.expect("app should build");
    let body = messenger_event("psid-1", "bonjour");

    let mut mac = Hmac::<Sha256>::new_from_slice(b"shh").unwrap();
    mac.update(body.as_bytes());
    let signature = mac
        .finalize()
        .into_bytes()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/messenger")
                .header("x-hub-signature-256", format!("sha256={signature}"))
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/messenger")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rate_limit_applies_per_client() {
    let config = ApiConfig {
        rate_limit_max: 2,
        ..ApiConfig::default()
    };
    let app = build_app(config).await.expect("app should build");

    for _ in 0..2 {
        let response = app.clone().oneshot(get("/v1/catalog")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.clone().oneshot(get("/v1/catalog")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
