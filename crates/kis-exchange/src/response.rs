//! KIS REST 응답 래퍼.
//!
//! KIS 엔드포인트마다 응답 스키마가 다르기 때문에 본문을 고정된 구조체로
//! 파싱하지 않고 필드 이름 → 값의 일반 맵으로 보관합니다. 성공 여부는
//! HTTP 상태 코드와 도메인 응답 코드(`rt_cd`)를 함께 보고 판단합니다.
//!
//! ```text
//! ok()  ⇔ status == 200 && rt_cd == "0"
//! err() == "[{msg_cd}] {msg1}"   (ok()가 아닐 때)
//! ```

use crate::ExchangeError;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// 도메인 응답 코드 필드.
pub const RT_CD: &str = "rt_cd";
/// 도메인 성공 코드.
pub const RT_CD_SUCCESS: &str = "0";
/// 메시지 코드 필드.
pub const MSG_CD: &str = "msg_cd";
/// 메시지 필드.
pub const MSG1: &str = "msg1";

/// 정규화된 KIS REST 응답.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: u16,
    headers: BTreeMap<String, String>,
    body: Option<Map<String, Value>>,
    raw: String,
}

impl ApiResponse {
    /// 상태 코드, 헤더, 본문 텍스트로 응답 생성.
    ///
    /// `Content-Type`이 JSON이고 최상위가 객체인 경우에만 본문을 파싱합니다.
    pub fn from_parts(status: u16, headers: &HeaderMap, raw: String) -> Self {
        let is_json = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.trim_start().starts_with("application/json"))
            .unwrap_or(false);

        let body = if is_json {
            match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            }
        } else {
            None
        };

        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (normalize_header_name(name.as_str()), v.to_string()))
            })
            .collect();

        Self {
            status,
            headers,
            body,
            raw,
        }
    }

    /// `reqwest` 응답을 읽어 래퍼 생성.
    pub async fn from_reqwest(response: reqwest::Response) -> Result<Self, ExchangeError> {
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let raw = response.text().await?;
        Ok(Self::from_parts(status, &headers, raw))
    }

    /// HTTP 상태 코드.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// 전송 계층과 도메인 모두 성공했는지 확인.
    pub fn ok(&self) -> bool {
        self.status == 200 && self.field_str(RT_CD) == Some(RT_CD_SUCCESS)
    }

    /// 실패 시 `"[msg_cd] msg1"`, 성공 시 빈 문자열.
    pub fn err(&self) -> String {
        if self.ok() {
            String::new()
        } else {
            format!("[{}] {}", self.error_code(), self.error_message())
        }
    }

    /// 본문 필드 조회.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.as_ref()?.get(name)
    }

    /// 문자열 본문 필드 조회.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name)?.as_str()
    }

    /// 본문 필드를 지정한 타입으로 역직렬화.
    ///
    /// 필드가 없거나 타입이 맞지 않으면 `None`.
    pub fn field_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.field(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// `output` 필드를 지정한 타입으로 역직렬화.
    pub fn output<T: DeserializeOwned>(&self) -> Result<T, ExchangeError> {
        let value = self
            .field("output")
            .ok_or_else(|| ExchangeError::ParseError("output 필드가 없습니다".to_string()))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// 본문 전체를 지정한 타입으로 역직렬화.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ExchangeError> {
        let body = self
            .body
            .as_ref()
            .ok_or_else(|| ExchangeError::ParseError("JSON 본문이 없습니다".to_string()))?;
        Ok(serde_json::from_value(Value::Object(body.clone()))?)
    }

    /// 헤더 조회. 대소문자와 `-`/`_` 구분 없이 찾습니다.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&normalize_header_name(name))
            .map(String::as_str)
    }

    /// 응답 헤더 `tr_cont`가 다음 페이지가 있음을 나타내는지 확인.
    pub fn has_more(&self) -> bool {
        matches!(self.header("tr_cont"), Some("F") | Some("M"))
    }

    /// 도메인 성공이 아니면 `ExchangeError::ApiError`로 변환.
    pub fn into_result(self) -> Result<Self, ExchangeError> {
        if self.ok() {
            Ok(self)
        } else {
            Err(ExchangeError::ApiError {
                code: self.error_code().to_string(),
                message: self.error_message().to_string(),
            })
        }
    }
}

/// 풍부한 인터페이스를 기대하는 호출자를 위한 호환 접근자.
impl ApiResponse {
    /// 파싱된 본문.
    pub fn body(&self) -> Option<&Map<String, Value>> {
        self.body.as_ref()
    }

    /// 원본 본문 텍스트.
    pub fn raw_body(&self) -> &str {
        &self.raw
    }

    /// 정규화된 이름의 헤더 맵.
    pub fn header_map(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// `ok()`와 동일.
    pub fn is_ok(&self) -> bool {
        self.ok()
    }

    /// 메시지 코드 (`msg_cd`), 없으면 빈 문자열.
    pub fn error_code(&self) -> &str {
        self.field_str(MSG_CD).unwrap_or("")
    }

    /// 메시지 (`msg1`), 없으면 빈 문자열.
    pub fn error_message(&self) -> &str {
        self.field_str(MSG1).unwrap_or("")
    }
}

/// 헤더 이름 정규화: 소문자, `-` → `_`.
fn normalize_header_name(name: &str) -> String {
    name.to_ascii_lowercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde::Deserialize;

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        headers
    }

    fn response(status: u16, body: &str) -> ApiResponse {
        ApiResponse::from_parts(status, &json_headers(), body.to_string())
    }

    #[test]
    fn test_ok_on_success_sentinel() {
        let resp = response(200, r#"{"rt_cd":"0"}"#);
        assert!(resp.ok());
        assert!(resp.is_ok());
        assert_eq!(resp.err(), "");
    }

    #[test]
    fn test_domain_error_formatting() {
        let resp = response(
            200,
            r#"{"rt_cd":"1","msg_cd":"X1","msg1":"insufficient balance"}"#,
        );
        assert!(!resp.ok());
        assert_eq!(resp.err(), "[X1] insufficient balance");
        assert_eq!(resp.error_code(), "X1");
        assert_eq!(resp.error_message(), "insufficient balance");

        match resp.into_result() {
            Err(ExchangeError::ApiError { code, message }) => {
                assert_eq!(code, "X1");
                assert_eq!(message, "insufficient balance");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_missing_rt_cd_is_failure() {
        let resp = response(200, r#"{"msg1":"no status"}"#);
        assert!(!resp.ok());
        assert_eq!(resp.err(), "[] no status");
    }

    #[test]
    fn test_transport_failure_overrides_domain_success() {
        let resp = response(500, r#"{"rt_cd":"0"}"#);
        assert!(!resp.ok());
    }

    #[test]
    fn test_non_json_body_is_not_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let resp = ApiResponse::from_parts(200, &headers, r#"{"rt_cd":"0"}"#.to_string());

        assert!(resp.body().is_none());
        assert!(!resp.ok());
        assert_eq!(resp.raw_body(), r#"{"rt_cd":"0"}"#);
    }

    #[test]
    fn test_header_lookup_is_normalized() {
        let mut headers = json_headers();
        headers.insert("tr_cont", HeaderValue::from_static("M"));
        let resp = ApiResponse::from_parts(200, &headers, "{}".to_string());

        assert_eq!(
            resp.header("Content-Type"),
            Some("application/json; charset=utf-8")
        );
        assert_eq!(resp.header("content_type"), resp.header("CONTENT-TYPE"));
        assert_eq!(resp.header("TR-CONT"), Some("M"));
        assert!(resp.has_more());
        assert!(resp.header_map().contains_key("content_type"));
        assert!(resp.header("x-missing").is_none());
    }

    #[test]
    fn test_typed_field_access() {
        #[derive(Debug, Deserialize)]
        struct PriceOutput {
            stck_prpr: String,
        }

        let resp = response(
            200,
            r#"{"rt_cd":"0","output":{"stck_prpr":"70000"},"output2":[{"a":"1"},{"a":"2"}]}"#,
        );

        let output: PriceOutput = resp.field_as("output").unwrap();
        assert_eq!(output.stck_prpr, "70000");

        let rows: Vec<serde_json::Value> = resp.field_as("output2").unwrap();
        assert_eq!(rows.len(), 2);

        assert!(resp.field("missing").is_none());
        assert!(resp.field_as::<PriceOutput>("output2").is_none());
    }
}
