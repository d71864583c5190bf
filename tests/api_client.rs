//! Tests for the vendor API client against a stand-in server.

use emailit_relay::parser::normalize;
use emailit_relay::{
    ApiClient, Database, HostInfo, MailRequest, NormalizedEmail, SendError, SettingsPatch,
    SettingsStore,
};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::{Arc, Mutex};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings(api_key: &str, from_email: &str) -> Arc<SettingsStore> {
    let db = Database::open_in_memory().unwrap();
    let store = SettingsStore::load(
        db,
        HostInfo {
            admin_email: "admin@site.test".into(),
            site_name: "Site".into(),
            site_url: "https://site.test".into(),
        },
    )
    .unwrap();
    store
        .update(SettingsPatch {
            api_key: Some(api_key.into()),
            from_email: Some(from_email.into()),
            from_name: Some("Site Mailer".into()),
            ..SettingsPatch::default()
        })
        .unwrap();
    Arc::new(store)
}

fn client(vendor: &MockServer, settings: Arc<SettingsStore>) -> ApiClient {
    ApiClient::with_endpoint(settings, format!("{}/v1/emails", vendor.uri())).unwrap()
}

fn email(request: &MailRequest, settings: &SettingsStore) -> NormalizedEmail {
    normalize(request, &settings.current(), settings.host())
}

#[tokio::test]
async fn test_posts_json_with_bearer_auth() {
    let vendor = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/emails"))
        .and(header("authorization", "Bearer secret"))
        .and(header("accept", "application/json"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "em_1" })))
        .expect(1)
        .mount(&vendor)
        .await;

    let settings = settings("secret", "noreply@site.test");
    let api = client(&vendor, Arc::clone(&settings));
    let request = MailRequest::new("a@x.com", "Hello", "Plain body").with_headers("X-Ref: 7");

    let response = api.send(&email(&request, &settings)).await.unwrap();
    assert_eq!(response.code, 200);
    assert_eq!(response.body, Some(json!({ "id": "em_1" })));
    assert_eq!(api.last_error(), "");
    assert_eq!(api.last_response(), Some(response));

    let payload: Value = vendor.received_requests().await.unwrap()[0].body_json().unwrap();
    assert_eq!(
        payload,
        json!({
            "from": "Site Mailer <noreply@site.test>",
            "to": "a@x.com",
            "subject": "Hello",
            "reply_to": "noreply@site.test",
            "text": "Plain body",
            "headers": { "X-Ref": "7" },
        })
    );
}

#[tokio::test]
async fn test_missing_content_makes_no_request() {
    let vendor = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&vendor)
        .await;

    let settings = settings("secret", "noreply@site.test");
    let api = client(&vendor, Arc::clone(&settings));
    let request = MailRequest::new("a@x.com", "Hello", "");

    let err = api.send(&email(&request, &settings)).await.unwrap_err();
    assert_eq!(err, SendError::MissingContent);
    assert_eq!(err.code(), "missing_content");
    assert!(err.is_validation());
    assert_eq!(api.last_error(), err.to_string());
}

#[tokio::test]
async fn test_missing_api_key_makes_no_request() {
    let vendor = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&vendor)
        .await;

    let settings = settings("", "noreply@site.test");
    let api = client(&vendor, Arc::clone(&settings));
    let request = MailRequest::new("a@x.com", "Hello", "Body");

    assert_eq!(
        api.send(&email(&request, &settings)).await,
        Err(SendError::ApiKeyMissing)
    );
}

#[tokio::test]
async fn test_generic_message_for_non_json_errors() {
    let vendor = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .expect(1)
        .mount(&vendor)
        .await;

    let settings = settings("secret", "noreply@site.test");
    let api = client(&vendor, Arc::clone(&settings));
    let request = MailRequest::new("a@x.com", "Hello", "Body");

    let err = api.send(&email(&request, &settings)).await.unwrap_err();
    assert_eq!(
        err,
        SendError::Api {
            status: 503,
            message: "API error (status 503)".into(),
        }
    );
    let last = api.last_response().unwrap();
    assert_eq!(last.code, 503);
    assert_eq!(last.body, None);
    assert_eq!(last.raw, "upstream unavailable");
}

#[tokio::test]
async fn test_transport_errors_keep_native_message() {
    let settings = settings("secret", "noreply@site.test");
    let api = ApiClient::with_endpoint(Arc::clone(&settings), "http://127.0.0.1:1/v1/emails").unwrap();
    let request = MailRequest::new("a@x.com", "Hello", "Body");

    let err = api.send(&email(&request, &settings)).await.unwrap_err();
    let SendError::Transport(message) = &err else {
        panic!("expected a transport error, got {err:?}");
    };
    assert!(!message.is_empty());
    assert_eq!(err.code(), "transport_error");
    assert_eq!(api.last_response(), None);
    assert_eq!(&api.last_error(), message);
}

#[tokio::test]
async fn test_file_attachments_are_base64_encoded() {
    let vendor = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "em_2" })))
        .expect(1)
        .mount(&vendor)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("invoice.pdf");
    std::fs::File::create(&file_path)
        .unwrap()
        .write_all(b"%PDF-1.4")
        .unwrap();

    let settings = settings("secret", "noreply@site.test");
    let api = client(&vendor, Arc::clone(&settings));
    let request = MailRequest::new("a@x.com", "Invoice", "Attached")
        .with_attachment(file_path)
        .with_attachment(dir.path().join("missing.txt"));

    api.send(&email(&request, &settings)).await.unwrap();

    let payload: Value = vendor.received_requests().await.unwrap()[0].body_json().unwrap();
    assert_eq!(
        payload["attachments"],
        json!([{
            "filename": "invoice.pdf",
            "content": "JVBERi0xLjQ=",
            "content_type": "application/pdf",
        }])
    );
}

#[tokio::test]
async fn test_payload_hooks_run_in_order() {
    let vendor = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&vendor)
        .await;

    let settings = settings("secret", "noreply@site.test");
    let api = client(&vendor, Arc::clone(&settings));
    api.add_payload_hook(|payload, _| {
        payload["tags"] = json!(["first"]);
    });
    api.add_payload_hook(|payload, email| {
        if let Some(tags) = payload["tags"].as_array_mut() {
            tags.push(json!(email.subject.clone()));
        }
    });

    let request = MailRequest::new("a@x.com", "second", "Body");
    let response = api.send(&email(&request, &settings)).await.unwrap();
    assert_eq!(response.body, None);

    let payload: Value = vendor.received_requests().await.unwrap()[0].body_json().unwrap();
    assert_eq!(payload["tags"], json!(["first", "second"]));
}

#[tokio::test]
async fn test_connection_requires_sender() {
    let vendor = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&vendor)
        .await;

    let api = client(&vendor, settings("secret", ""));
    let err = api.test_connection("ops@x.com").await.unwrap_err();
    assert_eq!(err, SendError::SenderNotConfigured);
    assert_eq!(err.code(), "missing_from");
}

#[tokio::test]
async fn test_connection_sends_diagnostic_email() {
    let vendor = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "em_t" })))
        .expect(1)
        .mount(&vendor)
        .await;

    let api = client(&vendor, settings("secret", "noreply@site.test"));
    api.test_connection("ops@x.com").await.unwrap();

    let payload: Value = vendor.received_requests().await.unwrap()[0].body_json().unwrap();
    assert_eq!(payload["subject"], "[Test] EmailIT Relay - Site");
    assert_eq!(payload["from"], "Site Mailer <noreply@site.test>");
    assert!(payload["html"].as_str().unwrap().contains("<strong>Site</strong>"));
    assert!(payload["text"].as_str().unwrap().contains("Site"));
    assert!(payload.get("reply_to").is_none());
}

#[tokio::test]
async fn test_sent_observers_see_final_payload_and_response() {
    let vendor = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "em_3" })))
        .expect(1)
        .mount(&vendor)
        .await;

    let settings = settings("secret", "noreply@site.test");
    let api = client(&vendor, Arc::clone(&settings));
    let seen = Arc::new(Mutex::new(Vec::new()));

    api.add_payload_hook(|payload, _| {
        payload["tags"] = json!(["welcome"]);
    });
    let first = Arc::clone(&seen);
    api.on_sent(move |payload, response| {
        first.lock().unwrap().push(format!("first {} {}", payload["tags"][0], response.code));
    });
    let second = Arc::clone(&seen);
    api.on_sent(move |payload, _| {
        second.lock().unwrap().push(format!("second {}", payload["to"]));
    });
    api.on_failed(|_, _, error| panic!("unexpected failure: {error}"));

    let request = MailRequest::new("a@x.com", "Hello", "Body");
    api.send(&email(&request, &settings)).await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            "first \"welcome\" 200".to_string(),
            "second \"a@x.com\"".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_failed_observers_see_vendor_answer() {
    let vendor = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({ "message": "Domain not verified" })))
        .expect(1)
        .mount(&vendor)
        .await;

    let settings = settings("secret", "noreply@site.test");
    let api = client(&vendor, Arc::clone(&settings));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let failures = Arc::clone(&seen);
    api.on_failed(move |payload, response, error| {
        failures.lock().unwrap().push((
            payload["subject"].clone(),
            response.map(|r| r.code),
            error.to_string(),
        ));
    });
    api.on_sent(|_, _| panic!("rejected email reported as sent"));

    let request = MailRequest::new("a@x.com", "Hello", "Body");
    api.send(&email(&request, &settings)).await.unwrap_err();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![(json!("Hello"), Some(422), "Domain not verified".to_string())]
    );
}

#[tokio::test]
async fn test_failed_observers_on_transport_error_and_not_on_validation() {
    let settings = settings("secret", "noreply@site.test");
    let api = ApiClient::with_endpoint(Arc::clone(&settings), "http://127.0.0.1:1/v1/emails").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let failures = Arc::clone(&seen);
    api.on_failed(move |_, response, error| {
        failures.lock().unwrap().push((response.is_some(), error.code()));
    });

    let invalid = MailRequest::new("a@x.com", "Hello", "");
    api.send(&email(&invalid, &settings)).await.unwrap_err();
    assert!(seen.lock().unwrap().is_empty());

    let request = MailRequest::new("a@x.com", "Hello", "Body");
    api.send(&email(&request, &settings)).await.unwrap_err();
    assert_eq!(*seen.lock().unwrap(), vec![(false, "transport_error")]);
}
