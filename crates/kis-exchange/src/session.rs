//! KIS 세션 (접근 토큰) 수명 주기 관리.
//!
//! 처리 기능:
//! - 접근 토큰 발급 (POST /oauth2/tokenP)
//! - 날짜별 파일 캐시 재사용 ([`TokenStore`])
//! - 발급 제한 응답 (403 + `EGW00133`) 시 고정 간격 재시도
//! - 마지막 인증 후 24시간이 지나면 강제 재인증
//!
//! 상태 전이:
//!
//! ```text
//! Unauthenticated → Authenticating → Authenticated → (stale) → Authenticating
//!                          └──────────→ Failed
//! ```
//!
//! 모든 인증 과정은 하나의 비동기 뮤텍스 안에서 실행되므로 동시에 여러
//! 호출자가 요청해도 토큰 발급 요청은 한 번만 나갑니다. 디스패처는
//! 불변 스냅샷([`SessionEnvironment`])만 받아 사용합니다.

use crate::clock::{Clock, SystemClock};
use crate::config::{Credentials, KisConfig};
use crate::response::ApiResponse;
use crate::token_store::{CachedToken, TokenStore};
use crate::ExchangeError;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// 강제 재인증 주기 (시간).
pub const REAUTH_INTERVAL_HOURS: i64 = 24;

/// 토큰 발급 제한 에러 코드 (1분당 1회 초과).
pub const RATE_LIMIT_ERROR_CODE: &str = "EGW00133";

/// 연결 수립 타임아웃 (초).
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// 세션 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 아직 인증하지 않음
    Unauthenticated,
    /// 토큰 발급 중
    Authenticating,
    /// 유효한 토큰 보유
    Authenticated,
    /// 인증 실패 (명시적 재인증 전까지 사용 불가)
    Failed,
}

/// 인증 결과의 토큰 출처.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSource {
    /// 파일 캐시에서 재사용 (네트워크 호출 없음)
    Cache,
    /// 토큰 발급 API 호출 (`attempts`는 재시도 포함 총 시도 횟수)
    Network { attempts: u32 },
}

/// KIS 토큰 응답.
#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    access_token_token_expired: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    86_400
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    grant_type: &'a str,
    appkey: &'a str,
    appsecret: &'a str,
}

/// 인증된 세션의 불변 스냅샷.
///
/// 토큰이 바뀔 때마다 새로 만들어지며 호출마다 `Arc`로 전달됩니다.
#[derive(Debug)]
pub struct SessionEnvironment {
    credentials: Arc<Credentials>,
    authorization: String,
    expires_at: DateTime<Utc>,
    headers: HeaderMap,
}

impl SessionEnvironment {
    /// `authorization` 헤더 값 ("Bearer ...").
    pub fn authorization(&self) -> &str {
        &self.authorization
    }

    /// 토큰 만료 시각.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// 인증 정보.
    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    /// 모의투자 여부.
    pub fn is_paper(&self) -> bool {
        self.credentials.is_paper()
    }

    /// REST 기본 URL.
    pub fn base_url(&self) -> &str {
        &self.credentials.base_url
    }

    /// 계좌번호 (CANO).
    pub fn account_no(&self) -> &str {
        self.credentials.cano()
    }

    /// 계좌상품코드.
    pub fn product_code(&self) -> &str {
        self.credentials.acnt_prdt_cd()
    }

    /// 인증 필드가 채워진 기본 헤더 묶음.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

struct SessionInner {
    state: SessionState,
    env: Option<Arc<SessionEnvironment>>,
    last_auth: Option<DateTime<Utc>>,
    last_failure: Option<(u16, String)>,
}

/// KIS 세션 관리자.
pub struct SessionManager {
    config: KisConfig,
    client: Client,
    store: TokenStore,
    clock: Arc<dyn Clock>,
    base_headers: HeaderMap,
    inner: Mutex<SessionInner>,
}

impl SessionManager {
    /// 시스템 시계를 사용하는 세션 관리자 생성.
    pub fn new(config: KisConfig) -> Result<Self, ExchangeError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// 주어진 시계를 사용하는 세션 관리자 생성.
    ///
    /// # Errors
    /// HTTP 클라이언트 생성에 실패하거나 User-Agent가 헤더에 쓸 수 없는
    /// 값이면 에러를 반환합니다.
    pub fn with_clock(config: KisConfig, clock: Arc<dyn Clock>) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExchangeError::NetworkError(format!("HTTP client 생성 실패: {}", e)))?;

        let base_headers = base_headers(&config.user_agent)?;
        let store = TokenStore::new(config.token_dir.clone());

        Ok(Self {
            config,
            client,
            store,
            clock,
            base_headers,
            inner: Mutex::new(SessionInner {
                state: SessionState::Unauthenticated,
                env: None,
                last_auth: None,
                last_failure: None,
            }),
        })
    }

    /// 설정 반환.
    pub fn config(&self) -> &KisConfig {
        &self.config
    }

    /// 인증 정보 반환.
    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.config.credentials
    }

    /// 공유 HTTP 클라이언트.
    pub fn http_client(&self) -> &Client {
        &self.client
    }

    /// 세션 시계.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// 현재 상태.
    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// 마지막 인증 시각.
    pub async fn last_authenticated_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().await.last_auth
    }

    /// 인증 수행.
    ///
    /// `force`가 아니면 먼저 오늘 날짜의 토큰 파일을 확인하고, 만료되지 않은
    /// 토큰이 있으면 네트워크 호출 없이 재사용합니다.
    pub async fn authenticate(&self, force: bool) -> Result<AuthSource, ExchangeError> {
        let mut inner = self.inner.lock().await;
        self.authenticate_locked(&mut inner, force).await
    }

    /// 디스패치에 사용할 세션 스냅샷 반환.
    ///
    /// 마지막 인증 후 24시간이 지났으면 강제 재인증하고, 토큰이 만료되었으면
    /// 캐시 확인 후 재발급합니다. 인증 전이면 암묵적으로 인증합니다.
    pub async fn environment(&self) -> Result<Arc<SessionEnvironment>, ExchangeError> {
        let mut inner = self.inner.lock().await;
        let now = self.clock.now();
        let state = inner.state;

        match state {
            SessionState::Failed => {
                let (status, message) = inner
                    .last_failure
                    .clone()
                    .unwrap_or((0, "session failed".to_string()));
                return Err(ExchangeError::AuthFailure { status, message });
            }
            SessionState::Unauthenticated | SessionState::Authenticating => {
                self.authenticate_locked(&mut inner, false).await?;
            }
            SessionState::Authenticated => {
                let stale = inner
                    .last_auth
                    .map(|at| now - at > Duration::hours(REAUTH_INTERVAL_HOURS))
                    .unwrap_or(true);
                let expired = inner
                    .env
                    .as_ref()
                    .map(|env| env.expires_at <= now)
                    .unwrap_or(true);

                if stale {
                    info!(
                        "Last KIS authentication older than {}h, re-authenticating",
                        REAUTH_INTERVAL_HOURS
                    );
                    self.authenticate_locked(&mut inner, true).await?;
                } else if expired {
                    warn!("KIS token expired, refreshing");
                    self.authenticate_locked(&mut inner, false).await?;
                }
            }
        }

        inner
            .env
            .clone()
            .ok_or_else(|| ExchangeError::AuthFailure {
                status: 0,
                message: "no session environment".to_string(),
            })
    }

    async fn authenticate_locked(
        &self,
        inner: &mut SessionInner,
        force: bool,
    ) -> Result<AuthSource, ExchangeError> {
        let now = self.clock.now();
        let today = self.clock.today_kst();

        if !force {
            if let Some(token) = self.store.load(today, now).await {
                let env = match self.build_environment(&token) {
                    Ok(env) => env,
                    Err(e) => return Err(Self::fail(inner, e)),
                };
                Self::commit(inner, env, now);
                info!(expires_at = %token.expires_at, "Reusing cached KIS token");
                return Ok(AuthSource::Cache);
            }
        }

        inner.state = SessionState::Authenticating;

        let issued = self
            .issue_token()
            .await
            .and_then(|(token, attempts)| Ok((self.build_environment(&token)?, token, attempts)));

        match issued {
            Ok((env, token, attempts)) => {
                if let Err(e) = self.store.save(today, &token).await {
                    warn!(error = %e, "Failed to persist KIS token, continuing with in-memory token");
                }
                Self::commit(inner, env, now);
                info!(
                    expires_at = %token.expires_at,
                    attempts,
                    mode = self.config.credentials.environment.display_name(),
                    "KIS access token obtained"
                );
                Ok(AuthSource::Network { attempts })
            }
            Err(e) => Err(Self::fail(inner, e)),
        }
    }

    fn commit(inner: &mut SessionInner, env: SessionEnvironment, now: DateTime<Utc>) {
        inner.env = Some(Arc::new(env));
        inner.state = SessionState::Authenticated;
        inner.last_auth = Some(now);
        inner.last_failure = None;
    }

    /// 인증 실패 기록 후 `Failed` 상태로 전환.
    fn fail(inner: &mut SessionInner, e: ExchangeError) -> ExchangeError {
        inner.state = SessionState::Failed;
        inner.env = None;
        inner.last_failure = Some(match &e {
            ExchangeError::AuthFailure { status, message } => (*status, message.clone()),
            other => (0, other.to_string()),
        });
        e
    }

    fn build_environment(&self, token: &CachedToken) -> Result<SessionEnvironment, ExchangeError> {
        let credentials = Arc::clone(&self.config.credentials);
        let authorization = token.bearer();

        let mut headers = self.base_headers.clone();
        headers.insert(
            HeaderName::from_static("authorization"),
            header_value("authorization", &authorization, true)?,
        );
        headers.insert(
            HeaderName::from_static("appkey"),
            header_value("appkey", &credentials.app_key, false)?,
        );
        headers.insert(
            HeaderName::from_static("appsecret"),
            header_value("appsecret", credentials.app_secret(), true)?,
        );

        Ok(SessionEnvironment {
            credentials,
            authorization,
            expires_at: token.expires_at,
            headers,
        })
    }

    /// 토큰 발급 API 호출 (403/EGW00133 재시도 포함).
    async fn issue_token(&self) -> Result<(CachedToken, u32), ExchangeError> {
        let credentials = &self.config.credentials;
        let url = format!("{}/oauth2/tokenP", credentials.base_url);
        let request = TokenRequest {
            grant_type: "client_credentials",
            appkey: &credentials.app_key,
            appsecret: credentials.app_secret(),
        };

        let policy = self.config.auth_retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(attempt, max_attempts, "Requesting KIS access token");

            let response = self
                .client
                .post(&url)
                .headers(self.base_headers.clone())
                .json(&request)
                .send()
                .await?;
            let resp = ApiResponse::from_reqwest(response).await?;

            if resp.status() == 200 {
                let token: TokenResponse = resp.parse()?;
                let cached = match CachedToken::from_kis(
                    token.access_token.clone(),
                    &token.access_token_token_expired,
                ) {
                    Ok(cached) => cached,
                    Err(_) => CachedToken::new(
                        token.access_token,
                        self.clock.now() + Duration::seconds(token.expires_in),
                    ),
                };
                return Ok((cached, attempt));
            }

            let error_code = resp.field_str("error_code").unwrap_or("");
            if resp.status() == 403 && error_code == RATE_LIMIT_ERROR_CODE && attempt < max_attempts {
                warn!(
                    attempt,
                    max_attempts,
                    wait_secs = policy.wait.as_secs_f64(),
                    "KIS token request rate limited (403/{}), retrying",
                    RATE_LIMIT_ERROR_CODE
                );
                tokio::time::sleep(policy.wait).await;
                continue;
            }

            let message = match resp.field_str("error_description") {
                Some(description) => format!("{} ({})", description, error_code),
                None => resp.raw_body().to_string(),
            };
            error!(status = resp.status(), attempt, "KIS token request failed: {}", message);
            return Err(ExchangeError::AuthFailure {
                status: resp.status(),
                message,
            });
        }
    }
}

/// 모든 KIS 요청에 공통으로 붙는 기본 헤더.
pub(crate) fn base_headers(user_agent: &str) -> Result<HeaderMap, ExchangeError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("text/plain"));
    headers.insert(HeaderName::from_static("charset"), HeaderValue::from_static("UTF-8"));
    headers.insert(USER_AGENT, header_value("user-agent", user_agent, false)?);
    Ok(headers)
}

/// 동적 값을 헤더 값으로 변환.
pub(crate) fn header_value(
    name: &str,
    value: &str,
    sensitive: bool,
) -> Result<HeaderValue, ExchangeError> {
    let mut value =
        HeaderValue::from_str(value).map_err(|_| ExchangeError::InvalidHeader(name.to_string()))?;
    value.set_sensitive(sensitive);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::KisEnvironment;
    use chrono::TimeZone;

    fn manager(env: KisEnvironment) -> SessionManager {
        let creds = Credentials::new(env, "app-key", "app-secret", "12345678");
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
        SessionManager::with_clock(KisConfig::new(creds), Arc::new(clock)).unwrap()
    }

    #[test]
    fn test_base_headers() {
        let headers = base_headers("kis-client/1.0").unwrap();
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers["accept"], "text/plain");
        assert_eq!(headers["charset"], "UTF-8");
        assert_eq!(headers["user-agent"], "kis-client/1.0");
        assert!(base_headers("bad\nagent").is_err());
    }

    #[tokio::test]
    async fn test_environment_snapshot_headers() {
        let session = manager(KisEnvironment::Paper);
        let token = CachedToken::new("tok", Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap());
        let env = session.build_environment(&token).unwrap();

        assert_eq!(env.authorization(), "Bearer tok");
        assert!(env.is_paper());
        assert_eq!(env.headers()["authorization"], "Bearer tok");
        assert_eq!(env.headers()["appkey"], "app-key");
        assert_eq!(env.headers()["appsecret"], "app-secret");
        assert!(env.headers()["appsecret"].is_sensitive());
        assert_eq!(session.state().await, SessionState::Unauthenticated);
    }
}
