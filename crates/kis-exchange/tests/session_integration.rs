//! 세션 수명 주기 통합 테스트 (mockito 토큰 서버).

use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use kis_exchange::{
    ApiRequest, AuthSource, CachedToken, Clock, Credentials, ExchangeError, KisConfig,
    KisEnvironment, ManualClock, RequestDispatcher, RetryPolicy, SessionManager, SessionState,
    TokenStore,
};
use mockito::{Matcher, Server, ServerGuard};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TOKEN_PATH: &str = "/oauth2/tokenP";

/// 레이트 리밋 재시도 간격. 세 번째 대기가 끼어들면 구분될 만큼 길게 잡습니다.
const RETRY_WAIT: Duration = Duration::from_millis(250);

fn start_time() -> chrono::DateTime<Utc> {
    // 2024-01-02 09:00 KST
    Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
}

fn config(server: &ServerGuard, dir: &Path, max_attempts: u32) -> KisConfig {
    let creds = Credentials::new(KisEnvironment::Real, "app-key", "app-secret", "50000000-01")
        .with_base_url(server.url());
    KisConfig::new(creds)
        .with_token_dir(dir)
        .with_auth_retry(RetryPolicy {
            max_attempts,
            wait: Duration::from_millis(10),
        })
}

fn rate_limit_config(server: &ServerGuard, dir: &Path) -> KisConfig {
    config(server, dir, 3).with_auth_retry(RetryPolicy {
        max_attempts: 3,
        wait: RETRY_WAIT,
    })
}

/// 최대 3회 시도에서 대기는 정확히 두 번.
fn assert_two_waits(elapsed: Duration) {
    assert!(elapsed >= RETRY_WAIT * 2, "waited too little: {:?}", elapsed);
    assert!(elapsed < RETRY_WAIT * 3, "waited too long: {:?}", elapsed);
}

fn token_body(token: &str) -> String {
    json!({
        "access_token": token,
        "token_type": "Bearer",
        "expires_in": 86400,
        "access_token_token_expired": "2024-01-10 09:00:00",
    })
    .to_string()
}

fn rate_limited_body() -> String {
    json!({
        "error_code": "EGW00133",
        "error_description": "접근토큰 발급 잠시 후 다시 시도하세요(1분당 1회)",
    })
    .to_string()
}

#[tokio::test]
async fn test_cache_hit_makes_no_token_request() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let token_mock = server
        .mock("POST", TOKEN_PATH)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("fresh"))
        .expect(0)
        .create_async()
        .await;

    let today = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
    let cached = CachedToken::from_kis("cached-token", "2024-01-03 08:00:00").unwrap();
    TokenStore::new(dir.path()).save(today, &cached).await.unwrap();

    let clock = Arc::new(ManualClock::new(start_time()));
    let session = SessionManager::with_clock(config(&server, dir.path(), 5), clock).unwrap();

    assert_eq!(session.authenticate(false).await.unwrap(), AuthSource::Cache);
    assert_eq!(session.state().await, SessionState::Authenticated);
    assert_eq!(session.last_authenticated_at().await, Some(start_time()));

    let env = session.environment().await.unwrap();
    assert_eq!(env.authorization(), "Bearer cached-token");

    token_mock.assert_async().await;
}

#[tokio::test]
async fn test_forced_auth_requests_exactly_once_and_persists() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let token_mock = server
        .mock("POST", TOKEN_PATH)
        .match_header("content-type", "application/json")
        .match_body(Matcher::PartialJson(json!({
            "grant_type": "client_credentials",
            "appkey": "app-key",
            "appsecret": "app-secret",
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("fresh"))
        .expect(1)
        .create_async()
        .await;

    let today = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
    let store = TokenStore::new(dir.path());
    let cached = CachedToken::from_kis("cached-token", "2024-01-03 08:00:00").unwrap();
    store.save(today, &cached).await.unwrap();

    let clock = Arc::new(ManualClock::new(start_time()));
    let session = SessionManager::with_clock(config(&server, dir.path(), 5), clock).unwrap();

    assert_eq!(
        session.authenticate(true).await.unwrap(),
        AuthSource::Network { attempts: 1 }
    );
    assert_eq!(
        session.environment().await.unwrap().authorization(),
        "Bearer fresh"
    );

    let reloaded = store.load(today, start_time()).await.unwrap();
    assert_eq!(reloaded.access_token, "fresh");

    token_mock.assert_async().await;
}

#[tokio::test]
async fn test_concurrent_callers_share_one_token_request() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let token_mock = server
        .mock("POST", TOKEN_PATH)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("shared"))
        .expect(1)
        .create_async()
        .await;

    let clock = Arc::new(ManualClock::new(start_time()));
    let session =
        Arc::new(SessionManager::with_clock(config(&server, dir.path(), 5), clock).unwrap());

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let session = Arc::clone(&session);
        tasks.push(tokio::spawn(async move { session.environment().await }));
    }
    for task in tasks {
        let env = task.await.unwrap().unwrap();
        assert_eq!(env.authorization(), "Bearer shared");
    }

    token_mock.assert_async().await;
}

#[tokio::test]
async fn test_stale_session_reauthenticates_on_dispatch() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let token_mock = server
        .mock("POST", TOKEN_PATH)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("tok"))
        .expect(2)
        .create_async()
        .await;
    let price_mock = server
        .mock("GET", Matcher::Regex("^/uapi/domestic-stock/v1/quotations/inquire-price".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"rt_cd":"0","msg_cd":"MCA00000","msg1":"정상처리 되었습니다.","output":{}}"#)
        .expect(2)
        .create_async()
        .await;

    let clock = Arc::new(ManualClock::new(start_time()));
    let session = Arc::new(
        SessionManager::with_clock(config(&server, dir.path(), 5), clock.clone()).unwrap(),
    );
    let dispatcher = RequestDispatcher::new(Arc::clone(&session));
    let request = || ApiRequest::get("/uapi/domestic-stock/v1/quotations/inquire-price", "FHKST01010100");

    session.authenticate(true).await.unwrap();

    // 23시간 경과: 재인증 없음
    clock.advance(ChronoDuration::hours(23));
    assert!(dispatcher.call(request()).await.unwrap().ok());

    // 25시간 경과 (캐시 파일이 있어도 강제 재발급)
    clock.advance(ChronoDuration::hours(2));
    let cached = CachedToken::from_kis("cached", "2024-01-10 09:00:00").unwrap();
    TokenStore::new(dir.path())
        .save(clock.today_kst(), &cached)
        .await
        .unwrap();
    assert!(dispatcher.call(request()).await.unwrap().ok());
    assert_eq!(session.last_authenticated_at().await, Some(clock.now()));

    token_mock.assert_async().await;
    price_mock.assert_async().await;
}

#[tokio::test]
async fn test_rate_limit_retried_then_succeeds() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let limited = server
        .mock("POST", TOKEN_PATH)
        .with_status(403)
        .with_header("content-type", "application/json")
        .with_body(rate_limited_body())
        .expect(2)
        .create_async()
        .await;
    let granted = server
        .mock("POST", TOKEN_PATH)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("after-retry"))
        .expect(1)
        .create_async()
        .await;

    let clock = Arc::new(ManualClock::new(start_time()));
    let session = SessionManager::with_clock(rate_limit_config(&server, dir.path()), clock).unwrap();

    let started = Instant::now();
    assert_eq!(
        session.authenticate(false).await.unwrap(),
        AuthSource::Network { attempts: 3 }
    );
    assert_two_waits(started.elapsed());
    assert_eq!(session.state().await, SessionState::Authenticated);

    limited.assert_async().await;
    granted.assert_async().await;
}

#[tokio::test]
async fn test_rate_limit_exhausted_is_auth_failure() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let limited = server
        .mock("POST", TOKEN_PATH)
        .with_status(403)
        .with_header("content-type", "application/json")
        .with_body(rate_limited_body())
        .expect(3)
        .create_async()
        .await;

    let clock = Arc::new(ManualClock::new(start_time()));
    let session = SessionManager::with_clock(rate_limit_config(&server, dir.path()), clock).unwrap();

    let started = Instant::now();
    let result = session.authenticate(false).await;
    assert_two_waits(started.elapsed());
    match result {
        Err(ExchangeError::AuthFailure { status, message }) => {
            assert_eq!(status, 403);
            assert!(message.contains("EGW00133"));
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(session.state().await, SessionState::Failed);

    // 실패 상태에서는 추가 발급 요청 없이 실패
    assert!(session.environment().await.unwrap_err().is_auth_error());

    limited.assert_async().await;
}

#[tokio::test]
async fn test_other_rejection_fails_without_retry() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let rejected = server
        .mock("POST", TOKEN_PATH)
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error_code":"EGW00103","error_description":"유효하지 않은 AppKey입니다."}"#)
        .expect(1)
        .create_async()
        .await;

    let clock = Arc::new(ManualClock::new(start_time()));
    let session = SessionManager::with_clock(config(&server, dir.path(), 5), clock).unwrap();

    let err = session.authenticate(false).await.unwrap_err();
    assert!(matches!(err, ExchangeError::AuthFailure { status: 401, .. }));

    rejected.assert_async().await;
}

#[tokio::test]
async fn test_unusable_token_marks_session_failed() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let token_mock = server
        .mock("POST", TOKEN_PATH)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("bad\ntoken"))
        .expect(1)
        .create_async()
        .await;

    let clock = Arc::new(ManualClock::new(start_time()));
    let session = SessionManager::with_clock(config(&server, dir.path(), 3), clock).unwrap();

    let err = session.authenticate(false).await.unwrap_err();
    assert!(matches!(err, ExchangeError::InvalidHeader(_)));
    assert_eq!(session.state().await, SessionState::Failed);
    assert!(session.environment().await.unwrap_err().is_auth_error());

    // 헤더로 쓸 수 없는 토큰은 캐시에 남기지 않음
    let today = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
    assert!(TokenStore::new(dir.path())
        .load(today, start_time())
        .await
        .is_none());

    token_mock.assert_async().await;
}
