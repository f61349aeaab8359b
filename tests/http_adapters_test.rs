use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use reqwest::Url;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use esi_sync::config::PostTypes;
use esi_sync::content::{ContentStore, RecordPayload, WordPressClient};
use esi_sync::error::{Domain, SyncError};
use esi_sync::esi::{Endpoint, EsiClient, RateBudget, UpstreamApi};
use esi_sync::model::EntityType;
use esi_sync::resilience::{BreakerSettings, CircuitBreaker, Guard, RetryPolicy, RetryRuntime};
use esi_sync::test_support::{MutableClock, NoJitter, RecordingSleeper};

fn esi_client(server: &MockServer, max_pages: u32) -> (EsiClient, Arc<RecordingSleeper>) {
    let clock = Arc::new(MutableClock::new(
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap(),
    ));
    let sleeper = Arc::new(RecordingSleeper::with_clock(clock.clone()));
    let budget = Arc::new(RateBudget::new(20, clock, sleeper.clone()));
    let base = Url::parse(&format!("{}/latest/", server.uri())).unwrap();
    (EsiClient::with_base_url(base, max_pages, budget).unwrap(), sleeper)
}

#[tokio::test]
async fn follows_every_page() {
    let server = MockServer::start().await;
    for page in 1..=3 {
        Mock::given(method("GET"))
            .and(path("/latest/characters/1/blueprints/"))
            .and(query_param("page", page.to_string()))
            .and(header("authorization", "Bearer tok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-pages", "3")
                    .set_body_json(json!([{"item_id": page}, {"item_id": page * 10}])),
            )
            .expect(1)
            .mount(&server)
            .await;
    }
    let (client, _) = esi_client(&server, 10);

    let records = client
        .fetch(&Endpoint::blueprints(1), Some("tok"))
        .await
        .unwrap();
    let ids: Vec<i64> = records
        .iter()
        .map(|r| r["item_id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 10, 2, 20, 3, 30]);
}

#[tokio::test]
async fn page_count_above_cap_is_refused() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/latest/contracts/public/10000002/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-pages", "500")
                .set_body_json(json!([])),
        )
        .expect(1)
        .mount(&server)
        .await;
    let (client, _) = esi_client(&server, 50);

    let err = client
        .fetch(&Endpoint::public_contracts(10000002), None)
        .await
        .unwrap_err();
    assert_eq!(err, SyncError::PaginationLimitExceeded { pages: 500, cap: 50 });
}

#[tokio::test]
async fn hard_limit_holds_requests_until_reset() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/latest/universe/systems/30000142/"))
        .respond_with(
            ResponseTemplate::new(429).insert_header("x-esi-error-limit-reset", "30"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/latest/universe/systems/30000142/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-esi-error-limit-remain", "100")
                .insert_header("x-esi-error-limit-reset", "60")
                .set_body_json(json!({"system_id": 30000142, "constellation_id": 20000020})),
        )
        .mount(&server)
        .await;
    let (client, sleeper) = esi_client(&server, 10);

    let err = client
        .fetch(&Endpoint::system(30000142), None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SyncError::RateLimited {
            retry_after: Duration::from_secs(30)
        }
    );
    assert!(sleeper.recorded().is_empty());

    let records = client.fetch(&Endpoint::system(30000142), None).await.unwrap();
    assert_eq!(records[0]["constellation_id"], json!(20000020));
    assert_eq!(client.budget().remaining(), Some(100));
    // The retry waited out the full reset window before touching the network.
    assert_eq!(sleeper.recorded(), vec![Duration::from_secs(30)]);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn unauthorized_is_auth_expired() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/latest/characters/1/planets/"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token is expired"))
        .mount(&server)
        .await;
    let (client, _) = esi_client(&server, 10);

    let err = client
        .fetch(&Endpoint::planets(1), Some("old"))
        .await
        .unwrap_err();
    assert_eq!(err, SyncError::AuthExpired);
}

fn post_types() -> PostTypes {
    PostTypes {
        character: "eve_character".into(),
        corporation: "eve_corporation".into(),
        blueprint: "eve_blueprint".into(),
        planet: "eve_planet".into(),
        contract: "eve_contract".into(),
    }
}

fn store_client(server: &MockServer) -> WordPressClient {
    let base = Url::parse(&format!("{}/wp-json/wp/v2/", server.uri())).unwrap();
    WordPressClient::with_base_url(base, "wp-token".into(), "_eve_external_id".into(), post_types())
        .unwrap()
}

#[tokio::test]
async fn create_tags_external_id_and_returns_store_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/wp-json/wp/v2/eve_blueprint"))
        .and(header("authorization", "Bearer wp-token"))
        .and(body_partial_json(json!({
            "title": "Blueprint 691 (original)",
            "status": "publish",
            "meta": {"_eve_external_id": 77, "runs": -1}
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 4312})))
        .expect(1)
        .mount(&server)
        .await;

    let payload = RecordPayload::titled("Blueprint 691 (original)")
        .with("runs", -1)
        .with("location_flag", serde_json::Value::Null);
    let id = store_client(&server)
        .create_record(EntityType::Blueprint, 77, &payload)
        .await
        .unwrap();
    assert_eq!(id, "4312");
}

#[tokio::test]
async fn update_omits_blank_fields() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/wp-json/wp/v2/eve_character/15"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 15})))
        .expect(1)
        .mount(&server)
        .await;

    let payload = RecordPayload::titled("Ana Ng")
        .with("security_status", 2.0)
        .with("description", serde_json::Value::Null)
        .with("title", "");
    store_client(&server)
        .update_record(EntityType::Character, "15", &payload)
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    let meta = body["meta"].as_object().unwrap();
    assert_eq!(meta.get("security_status"), Some(&json!(2.0)));
    assert!(!meta.contains_key("description"));
    assert!(!meta.contains_key("title"));
    assert!(body.get("status").is_none());
}

#[tokio::test]
async fn lookup_filters_by_external_id_meta() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wp-json/wp/v2/eve_contract"))
        .and(query_param("meta_key", "_eve_external_id"))
        .and(query_param("meta_value", "500"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 91}])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/wp-json/wp/v2/eve_contract"))
        .and(query_param("meta_value", "501"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    let client = store_client(&server);

    assert_eq!(
        client
            .find_by_external_id(EntityType::Contract, 500)
            .await
            .unwrap()
            .as_deref(),
        Some("91")
    );
    assert_eq!(
        client
            .find_by_external_id(EntityType::Contract, 501)
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn store_rejection_is_a_record_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/wp-json/wp/v2/eve_planet"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid meta"))
        .mount(&server)
        .await;

    let err = store_client(&server)
        .create_record(EntityType::Planet, 1, &RecordPayload::titled("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    assert!(!err.is_source_fatal());
}

fn guarded_store_client(server: &MockServer) -> (WordPressClient, Arc<RecordingSleeper>) {
    let clock = Arc::new(MutableClock::new(
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap(),
    ));
    let sleeper = Arc::new(RecordingSleeper::with_clock(clock.clone()));
    let breaker = Arc::new(CircuitBreaker::new(
        Domain::ContentStore,
        BreakerSettings {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        },
        clock,
    ));
    let runtime = RetryRuntime {
        sleeper: sleeper.clone(),
        jitter: Arc::new(NoJitter),
    };
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
    };
    let client = store_client(server).with_guard(Guard::new(breaker, policy, runtime));
    (client, sleeper)
}

#[tokio::test]
async fn failed_create_is_not_resent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/wp-json/wp/v2/eve_blueprint"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream timed out"))
        .expect(1)
        .mount(&server)
        .await;
    let (client, sleeper) = guarded_store_client(&server);

    let err = client
        .create_record(EntityType::Blueprint, 77, &RecordPayload::titled("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ContentStore(_)), "{err:?}");
    assert!(sleeper.recorded().is_empty());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_update_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/wp-json/wp/v2/eve_blueprint/15"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/wp-json/wp/v2/eve_blueprint/15"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 15})))
        .mount(&server)
        .await;
    let (client, sleeper) = guarded_store_client(&server);

    client
        .update_record(EntityType::Blueprint, "15", &RecordPayload::titled("x"))
        .await
        .unwrap();
    assert_eq!(sleeper.recorded().len(), 1);
}

#[tokio::test]
async fn ping_rejects_bad_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wp-json/wp/v2/users/me"))
        .and(header("authorization", "Bearer wp-token"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"code": "rest_not_logged_in"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let err = store_client(&server).ping().await.unwrap_err();
    assert!(matches!(err, SyncError::ContentStoreAuth(_)), "{err:?}");
    assert!(err.is_source_fatal());
}
