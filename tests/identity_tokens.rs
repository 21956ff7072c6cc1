use std::sync::Arc;

use httpmock::{Method::GET, MockServer};

use llm_relay::utils::test_support::should_skip_httpmock;
use llm_relay::{
    Clock, IdentityConfig, IdentityError, IdentityTokenCache, ManagedIdentityIssuer, TokenIssuer,
    TokenRequest,
};

const NOW: u64 = 1_700_000_000;

struct FixedClock;

impl Clock for FixedClock {
    fn now_epoch_seconds(&self) -> u64 {
        NOW
    }
}

fn token_request(server: &MockServer, client_id: Option<&str>) -> TokenRequest {
    TokenRequest {
        endpoint: server.url("/msi/token"),
        resource: "https://cognitiveservices.azure.com".to_string(),
        client_id: client_id.map(str::to_string),
    }
}

#[tokio::test]
async fn managed_identity_issuer_sends_metadata_request() -> Result<(), IdentityError> {
    if should_skip_httpmock() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/msi/token")
                .query_param("resource", "https://cognitiveservices.azure.com")
                .query_param("api-version", "2019-08-01")
                .query_param("client_id", "client-a")
                .header("Metadata", "true")
                .header("X-IDENTITY-HEADER", "shared-secret");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"token-abc","expires_on":"1700003600","token_type":"Bearer"}"#);
        })
        .await;

    let issuer = ManagedIdentityIssuer::new(reqwest::Client::new())
        .with_secret("shared-secret")
        .with_clock(Arc::new(FixedClock));
    let token = issuer.fetch(&token_request(&server, Some("client-a"))).await?;
    mock.assert_calls(1);

    assert_eq!(token.access_token, "token-abc");
    assert_eq!(token.expires_at, NOW + 3600);
    Ok(())
}

#[tokio::test]
async fn managed_identity_issuer_accepts_relative_expiry() -> Result<(), IdentityError> {
    if should_skip_httpmock() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/msi/token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"token-rel","expires_in":1800}"#);
        })
        .await;

    let issuer = ManagedIdentityIssuer::new(reqwest::Client::new()).with_clock(Arc::new(FixedClock));
    let token = issuer.fetch(&token_request(&server, None)).await?;
    assert_eq!(token.expires_at, NOW + 1800);
    Ok(())
}

#[tokio::test]
async fn managed_identity_issuer_reports_error_status() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/msi/token");
            then.status(403).body("identity not assigned");
        })
        .await;

    let issuer = ManagedIdentityIssuer::new(reqwest::Client::new());
    let err = issuer
        .fetch(&token_request(&server, None))
        .await
        .expect_err("403 should fail");
    match err {
        IdentityError::Status { status, body } => {
            assert_eq!(status, 403);
            assert_eq!(body, "identity not assigned");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn cache_from_config_fetches_once_per_token() -> Result<(), IdentityError> {
    if should_skip_httpmock() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/msi/token")
                .query_param("api-version", "2018-02-01")
                .header("Metadata", "true");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"token-cached","expires_in":"3600"}"#);
        })
        .await;

    let config = IdentityConfig {
        endpoint: Some(server.url("/msi/token")),
        api_version: "2018-02-01".to_string(),
        ..IdentityConfig::default()
    };
    let cache = IdentityTokenCache::from_config(&config, reqwest::Client::new());

    assert_eq!(cache.default_token().await?, "token-cached");
    assert_eq!(cache.default_token().await?, "token-cached");
    mock.assert_calls(1);
    Ok(())
}

#[tokio::test]
async fn cache_does_not_keep_failed_fetches() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/msi/token");
            then.status(500).body("unavailable");
        })
        .await;

    let config = IdentityConfig {
        endpoint: Some(server.url("/msi/token")),
        ..IdentityConfig::default()
    };
    let cache = IdentityTokenCache::from_config(&config, reqwest::Client::new());

    assert!(cache.default_token().await.is_err());
    assert!(cache.default_token().await.is_err());
    mock.assert_calls(2);
}

#[tokio::test]
async fn managed_identity_issuer_times_out_slow_metadata_service() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/msi/token");
            then.status(200)
                .delay(std::time::Duration::from_secs(3))
                .header("content-type", "application/json")
                .body(r#"{"access_token":"late","expires_in":3600}"#);
        })
        .await;

    let issuer = ManagedIdentityIssuer::new(reqwest::Client::new())
        .with_timeout(std::time::Duration::from_millis(100));
    let err = issuer
        .fetch(&token_request(&server, None))
        .await
        .expect_err("slow issuer should time out");
    assert!(matches!(err, IdentityError::Timeout(_)), "{err:?}");
}
