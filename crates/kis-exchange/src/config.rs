//! 한국투자증권 (KIS) API 설정.
//!
//! 모든 설정은 환경 변수에서 읽습니다. 실전/모의 모드에 따라
//! 서로 다른 앱키, 앱시크릿, 기본 URL, 계좌번호 묶음을 사용합니다.
//!
//! # 환경 변수
//! - `KIS_MODE`: `real` | `paper` (`vps`) (기본값: real)
//! - 실전: `APP_KEY_REAL`, `APP_SECRET_REAL`, `KIS_API_REAL`, `KIS_ACCT_REAL`
//! - 모의: `APP_KEY_PAPER`, `APP_SECRET_PAPER`, `KIS_API_VPS`, `KIS_ACCT_PAPER`
//! - 공통: `KIS_PROD_CODE`, `KIS_TOKEN_DIR`, `KIS_AUTH_RETRY_MAX`,
//!   `KIS_AUTH_RETRY_WAIT`, `MY_AGENT`, `KIS_HTTP_TIMEOUT_SECS`, `KIS_WS_URL`,
//!   `KIS_WS_RECONNECT_MAX`, `KIS_TRADING_WINDOWS`

use crate::market_hours::TradingWindow;
use crate::stream::ReconnectPolicy;
use crate::ExchangeError;
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// 토큰 캐시 기본 디렉터리.
const DEFAULT_TOKEN_DIR: &str = "/tmp/kis";

/// 기본 User-Agent.
const DEFAULT_USER_AGENT: &str = "kis-client/1.0";

/// KIS API 환경 유형.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KisEnvironment {
    /// 실전투자
    Real,
    /// 모의투자
    Paper,
}

impl KisEnvironment {
    /// `KIS_MODE` 값 파싱.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "real" | "prod" => Some(KisEnvironment::Real),
            "paper" | "vps" | "mock" => Some(KisEnvironment::Paper),
            _ => None,
        }
    }

    /// 이 환경의 REST API 기본 URL 반환.
    pub fn rest_base_url(&self) -> &'static str {
        match self {
            KisEnvironment::Real => "https://openapi.koreainvestment.com:9443",
            KisEnvironment::Paper => "https://openapivts.koreainvestment.com:29443",
        }
    }

    /// 이 환경의 WebSocket URL 반환.
    pub fn websocket_url(&self) -> &'static str {
        match self {
            KisEnvironment::Real => "ws://ops.koreainvestment.com:21000",
            KisEnvironment::Paper => "ws://ops.koreainvestment.com:31000",
        }
    }

    /// 표시용 이름. 환경 변수 접미사(`APP_KEY_REAL` 등)로도 쓰입니다.
    pub fn display_name(&self) -> &'static str {
        match self {
            KisEnvironment::Real => "REAL",
            KisEnvironment::Paper => "PAPER",
        }
    }
}

/// 한 거래 모드에 대한 인증 정보.
///
/// 프로세스 수명 동안 변경되지 않으며 `Arc`로 공유합니다.
#[derive(Debug)]
pub struct Credentials {
    /// 실전/모의 구분
    pub environment: KisEnvironment,
    /// 앱키
    pub app_key: String,
    /// 앱시크릿
    app_secret: SecretString,
    /// REST API 기본 URL
    pub base_url: String,
    /// 계좌번호 (CANO, 8자리)
    pub account_no: String,
    /// 계좌상품코드 - 주식의 경우 일반적으로 "01"
    pub product_code: String,
}

impl Credentials {
    /// 새 인증 정보 생성.
    pub fn new(
        environment: KisEnvironment,
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        account_no: impl Into<String>,
    ) -> Self {
        Self {
            environment,
            app_key: app_key.into(),
            app_secret: SecretString::new(app_secret.into().into_boxed_str()),
            base_url: environment.rest_base_url().to_string(),
            account_no: account_no.into(),
            product_code: "01".to_string(),
        }
    }

    /// REST 기본 URL 변경 (테스트 서버, 프록시 등).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// 계좌상품코드 설정.
    pub fn with_product_code(mut self, code: impl Into<String>) -> Self {
        self.product_code = code.into();
        self
    }

    /// 앱시크릿 원문 (헤더/본문 작성 시에만 사용).
    pub fn app_secret(&self) -> &str {
        self.app_secret.expose_secret()
    }

    /// 모의투자 여부.
    pub fn is_paper(&self) -> bool {
        self.environment == KisEnvironment::Paper
    }

    /// 계좌번호 앞 8자리 반환 (CANO).
    pub fn cano(&self) -> &str {
        let plain = self.account_no.split('-').next().unwrap_or(&self.account_no);
        if plain.len() > 8 {
            &plain[..8]
        } else {
            plain
        }
    }

    /// 계좌상품코드 반환 (ACNT_PRDT_CD).
    pub fn acnt_prdt_cd(&self) -> &str {
        &self.product_code
    }
}

/// 토큰 발급 재시도 정책 (고정 간격).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 최대 시도 횟수 (첫 시도 포함)
    pub max_attempts: u32,
    /// 시도 간 대기 시간
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            wait: Duration::from_secs(60),
        }
    }
}

/// KIS 연동 전체 설정.
#[derive(Debug, Clone)]
pub struct KisConfig {
    /// 현재 모드의 인증 정보
    pub credentials: Arc<Credentials>,
    /// 토큰 캐시 디렉터리
    pub token_dir: PathBuf,
    /// 토큰 발급 재시도 정책
    pub auth_retry: RetryPolicy,
    /// User-Agent 헤더 값
    pub user_agent: String,
    /// HTTP 요청 타임아웃
    pub timeout: Duration,
    /// 실시간 시세 WebSocket URL
    pub websocket_url: String,
    /// WebSocket 재연결 정책
    pub reconnect: ReconnectPolicy,
    /// 주문 가능 시간대
    pub trading_windows: Vec<TradingWindow>,
}

impl KisConfig {
    /// 기본값으로 설정 생성.
    pub fn new(credentials: Credentials) -> Self {
        let websocket_url = credentials.environment.websocket_url().to_string();
        Self {
            credentials: Arc::new(credentials),
            token_dir: PathBuf::from(DEFAULT_TOKEN_DIR),
            auth_retry: RetryPolicy::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(10),
            websocket_url,
            reconnect: ReconnectPolicy::default(),
            trading_windows: TradingWindow::default_krx(),
        }
    }

    /// 토큰 캐시 디렉터리 설정.
    pub fn with_token_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.token_dir = dir.into();
        self
    }

    /// 토큰 발급 재시도 정책 설정.
    pub fn with_auth_retry(mut self, policy: RetryPolicy) -> Self {
        self.auth_retry = policy;
        self
    }

    /// WebSocket URL 설정.
    pub fn with_websocket_url(mut self, url: impl Into<String>) -> Self {
        self.websocket_url = url.into();
        self
    }

    /// 프로세스 환경 변수에서 설정 로드.
    pub fn from_env() -> Result<Self, ExchangeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 임의의 키-값 조회 함수로 설정 로드.
    ///
    /// 필수 값이 없으면 `ExchangeError::Config`를 반환합니다.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ExchangeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str| {
            get(key).ok_or_else(|| {
                ExchangeError::Config(format!("환경변수 {} 가 설정되지 않았습니다", key))
            })
        };

        let mode = get("KIS_MODE").unwrap_or_else(|| "real".to_string());
        let environment = KisEnvironment::parse(&mode)
            .ok_or_else(|| ExchangeError::Config(format!("알 수 없는 KIS_MODE: {}", mode)))?;
        let suffix = environment.display_name();

        let app_key = require(&format!("APP_KEY_{}", suffix))?;
        let app_secret = require(&format!("APP_SECRET_{}", suffix))?;
        let account_no = require(&format!("KIS_ACCT_{}", suffix))?;
        let base_url_key = match environment {
            KisEnvironment::Real => "KIS_API_REAL",
            KisEnvironment::Paper => "KIS_API_VPS",
        };
        let base_url =
            get(base_url_key).unwrap_or_else(|| environment.rest_base_url().to_string());
        let product_code = get("KIS_PROD_CODE").unwrap_or_else(|| "01".to_string());

        let credentials = Credentials::new(environment, app_key, app_secret, account_no)
            .with_base_url(base_url)
            .with_product_code(product_code);

        let mut config = Self::new(credentials);

        if let Some(dir) = get("KIS_TOKEN_DIR") {
            config.token_dir = PathBuf::from(dir);
        }
        config.auth_retry = RetryPolicy {
            max_attempts: parse_or(&get, "KIS_AUTH_RETRY_MAX", 5)?,
            wait: Duration::from_secs(parse_or(&get, "KIS_AUTH_RETRY_WAIT", 60)?),
        };
        if let Some(agent) = get("MY_AGENT") {
            config.user_agent = agent;
        }
        config.timeout = Duration::from_secs(parse_or(&get, "KIS_HTTP_TIMEOUT_SECS", 10)?);
        if let Some(url) = get("KIS_WS_URL") {
            config.websocket_url = url;
        }
        config.reconnect.max_attempts = parse_or(&get, "KIS_WS_RECONNECT_MAX", 0)?;
        if let Some(windows) = get("KIS_TRADING_WINDOWS") {
            config.trading_windows = TradingWindow::parse_list(&windows)?;
        }

        Ok(config)
    }
}

/// 값이 있으면 파싱하고 없으면 기본값 사용. 파싱 실패는 설정 에러.
fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ExchangeError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ExchangeError::Config(format!("{} 값이 올바르지 않습니다: {}", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_real_mode_is_default() {
        let config = KisConfig::from_lookup(lookup(&[
            ("APP_KEY_REAL", "real_key"),
            ("APP_SECRET_REAL", "real_secret"),
            ("KIS_ACCT_REAL", "12345678"),
            ("APP_KEY_PAPER", "paper_key"),
        ]))
        .unwrap();

        let creds = &config.credentials;
        assert_eq!(creds.environment, KisEnvironment::Real);
        assert_eq!(creds.app_key, "real_key");
        assert_eq!(creds.app_secret(), "real_secret");
        assert_eq!(creds.base_url, "https://openapi.koreainvestment.com:9443");
        assert_eq!(creds.product_code, "01");
        assert!(!creds.is_paper());
        assert_eq!(config.auth_retry, RetryPolicy::default());
        assert_eq!(config.token_dir, PathBuf::from("/tmp/kis"));
    }

    #[test]
    fn test_paper_mode_selects_paper_pair() {
        let config = KisConfig::from_lookup(lookup(&[
            ("KIS_MODE", "vps"),
            ("APP_KEY_PAPER", "paper_key"),
            ("APP_SECRET_PAPER", "paper_secret"),
            ("KIS_ACCT_PAPER", "50000000-01"),
            ("KIS_API_VPS", "http://localhost:8080/"),
            ("KIS_AUTH_RETRY_MAX", "3"),
            ("KIS_AUTH_RETRY_WAIT", "1"),
        ]))
        .unwrap();

        let creds = &config.credentials;
        assert!(creds.is_paper());
        assert_eq!(creds.app_key, "paper_key");
        assert_eq!(creds.base_url, "http://localhost:8080");
        assert_eq!(creds.cano(), "50000000");
        assert_eq!(config.auth_retry.max_attempts, 3);
        assert_eq!(config.auth_retry.wait, Duration::from_secs(1));
        assert_eq!(config.websocket_url, "ws://ops.koreainvestment.com:31000");
    }

    #[test]
    fn test_optional_overrides() {
        let config = KisConfig::from_lookup(lookup(&[
            ("APP_KEY_REAL", "k"),
            ("APP_SECRET_REAL", "s"),
            ("KIS_ACCT_REAL", "12345678"),
            ("MY_AGENT", "my-bot/2.0"),
            ("KIS_HTTP_TIMEOUT_SECS", "3"),
            ("KIS_WS_URL", "ws://127.0.0.1:9000"),
            ("KIS_WS_RECONNECT_MAX", "4"),
            ("KIS_TRADING_WINDOWS", "09:00-12:00"),
        ]))
        .unwrap();

        assert_eq!(config.user_agent, "my-bot/2.0");
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.websocket_url, "ws://127.0.0.1:9000");
        assert_eq!(config.reconnect.max_attempts, 4);
        assert_eq!(config.trading_windows.len(), 1);
        assert_eq!(config.trading_windows[0].to_string(), "09:00-12:00");
    }

    #[test]
    fn test_missing_required_value() {
        let err = KisConfig::from_lookup(lookup(&[
            ("KIS_MODE", "paper"),
            ("APP_KEY_PAPER", "paper_key"),
        ]))
        .unwrap_err();

        match err {
            ExchangeError::Config(msg) => assert!(msg.contains("APP_SECRET_PAPER")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_numeric_value() {
        let err = KisConfig::from_lookup(lookup(&[
            ("APP_KEY_REAL", "k"),
            ("APP_SECRET_REAL", "s"),
            ("KIS_ACCT_REAL", "12345678"),
            ("KIS_AUTH_RETRY_MAX", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ExchangeError::Config(_)));
    }

    #[test]
    fn test_unknown_mode() {
        let err = KisConfig::from_lookup(lookup(&[("KIS_MODE", "sandbox")])).unwrap_err();
        assert!(matches!(err, ExchangeError::Config(_)));
    }

    #[test]
    fn test_secret_not_in_debug_output() {
        let creds = Credentials::new(KisEnvironment::Real, "key", "top-secret", "12345678");
        assert!(!format!("{:?}", creds).contains("top-secret"));
    }
}
