//! KIS 연동 에러 타입.

use thiserror::Error;

/// KIS API 연동 중 발생하는 에러.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// 필수 설정 누락 또는 잘못된 설정값
    #[error("Config error: {0}")]
    Config(String),

    /// 토큰 발급 실패 (재시도 불가 응답 또는 재시도 소진)
    #[error("Authentication failed ({status}): {message}")]
    AuthFailure { status: u16, message: String },

    /// 네트워크/연결 에러
    #[error("Network error: {0}")]
    NetworkError(String),

    /// 타임아웃
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// API 에러 코드
    #[error("API error {code}: {message}")]
    ApiError { code: String, message: String },

    /// 파싱/역직렬화 에러
    #[error("Parse error: {0}")]
    ParseError(String),

    /// 헤더에 넣을 수 없는 값
    #[error("Invalid header value for {0}")]
    InvalidHeader(String),

    /// 토큰 캐시 파일 입출력 에러
    #[error("Token cache error: {0}")]
    TokenCache(String),

    /// WebSocket 에러
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// 호출자가 작업을 취소함
    #[error("Operation cancelled")]
    Cancelled,
}

impl ExchangeError {
    /// 재시도 가능한 에러인지 확인.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::NetworkError(_)
                | ExchangeError::Timeout(_)
                | ExchangeError::WebSocket(_)
        )
    }

    /// 인증 에러인지 확인.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, ExchangeError::AuthFailure { .. })
    }

    /// 재시도하면 안 되는 치명적 에러인지 확인.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExchangeError::Config(_) | ExchangeError::AuthFailure { .. }
        )
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout(err.to_string())
        } else if err.is_decode() {
            ExchangeError::ParseError(err.to_string())
        } else {
            ExchangeError::NetworkError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::ParseError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ExchangeError::WebSocket(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let auth = ExchangeError::AuthFailure {
            status: 403,
            message: "EGW00133".to_string(),
        };
        assert!(auth.is_auth_error());
        assert!(auth.is_fatal());
        assert!(!auth.is_retryable());

        let net = ExchangeError::NetworkError("reset".to_string());
        assert!(net.is_retryable());
        assert!(!net.is_fatal());

        assert!(ExchangeError::Config("APP_KEY_REAL".to_string()).is_fatal());
        assert!(!ExchangeError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = ExchangeError::AuthFailure {
            status: 401,
            message: "invalid appkey".to_string(),
        };
        assert_eq!(err.to_string(), "Authentication failed (401): invalid appkey");
    }
}
