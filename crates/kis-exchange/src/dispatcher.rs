//! KIS REST 요청 디스패처.
//!
//! 모든 일반 API 호출은 이 모듈을 거칩니다.
//!
//! 1. 세션 스냅샷 획득 (24시간 경과 시 재인증)
//! 2. 기본 헤더 복제 후 `tr_id`, `tr_cont`, `custtype` 추가
//! 3. 모의투자 모드이면 `tr_id` 첫 글자 T/J/C → V 치환
//! 4. POST (JSON 본문) 또는 GET (쿼리 파라미터)로 전송
//! 5. [`ApiResponse`]로 정규화해 반환 (도메인 실패는 에러가 아님)

use crate::response::ApiResponse;
use crate::session::{header_value, SessionManager};
use crate::ExchangeError;
use reqwest::header::HeaderName;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 개인 고객 구분 코드.
pub const CUSTTYPE_PERSONAL: &str = "P";

/// HTTP 메서드.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// 조회 (쿼리 파라미터)
    Get,
    /// 주문 등 상태 변경 (JSON 본문)
    Post,
}

/// 단일 KIS API 요청.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// API 경로 (예: `/uapi/domestic-stock/v1/quotations/inquire-price`)
    pub path: String,
    /// 거래 ID
    pub tr_id: String,
    /// 연속 조회 구분 ("" | "N")
    pub tr_cont: String,
    /// 요청 파라미터
    pub params: Map<String, Value>,
    /// HTTP 메서드
    pub method: HttpMethod,
    /// 추가 헤더
    pub extra_headers: Vec<(String, String)>,
}

impl ApiRequest {
    /// GET 요청 생성.
    pub fn get(path: impl Into<String>, tr_id: impl Into<String>) -> Self {
        Self::new(path, tr_id, HttpMethod::Get)
    }

    /// POST 요청 생성.
    pub fn post(path: impl Into<String>, tr_id: impl Into<String>) -> Self {
        Self::new(path, tr_id, HttpMethod::Post)
    }

    fn new(path: impl Into<String>, tr_id: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            path: path.into(),
            tr_id: tr_id.into(),
            tr_cont: String::new(),
            params: Map::new(),
            method,
            extra_headers: Vec::new(),
        }
    }

    /// 연속 조회 구분 설정.
    pub fn tr_cont(mut self, tr_cont: impl Into<String>) -> Self {
        self.tr_cont = tr_cont.into();
        self
    }

    /// 파라미터 추가.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// 추가 헤더 설정.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// GET 쿼리 문자열로 쓸 (키, 값) 목록.
    fn query_pairs(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

/// 환경에 맞게 거래 ID 변환.
///
/// 모의투자이고 첫 글자가 T, J, C 중 하나이면 `V`로 바꿉니다.
/// 실전투자에서는 절대 바꾸지 않습니다.
pub fn remap_tr_id(tr_id: &str, is_paper: bool) -> Cow<'_, str> {
    if !is_paper {
        return Cow::Borrowed(tr_id);
    }
    match tr_id.chars().next() {
        Some('T' | 'J' | 'C') => Cow::Owned(format!("V{}", &tr_id[1..])),
        _ => Cow::Borrowed(tr_id),
    }
}

/// 인증된 KIS REST 호출 디스패처.
#[derive(Clone)]
pub struct RequestDispatcher {
    session: Arc<SessionManager>,
}

impl RequestDispatcher {
    /// 세션을 공유하는 디스패처 생성.
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    /// 세션 관리자.
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// 요청 전송.
    ///
    /// 전송 계층 에러와 인증 실패만 `Err`이며, 도메인 실패(`rt_cd != "0"`)는
    /// `ApiResponse::ok()`/`err()`로 확인합니다.
    pub async fn call(&self, request: ApiRequest) -> Result<ApiResponse, ExchangeError> {
        let env = self.session.environment().await?;

        let tr_id = remap_tr_id(&request.tr_id, env.is_paper());
        let url = format!("{}{}", env.base_url(), request.path);

        let mut headers = env.headers().clone();
        headers.insert(
            HeaderName::from_static("tr_id"),
            header_value("tr_id", &tr_id, false)?,
        );
        headers.insert(
            HeaderName::from_static("tr_cont"),
            header_value("tr_cont", &request.tr_cont, false)?,
        );
        headers.insert(
            HeaderName::from_static("custtype"),
            header_value("custtype", CUSTTYPE_PERSONAL, false)?,
        );
        for (name, value) in &request.extra_headers {
            let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
                .map_err(|_| ExchangeError::InvalidHeader(name.clone()))?;
            let value = header_value(name.as_str(), value, false)?;
            headers.insert(name, value);
        }

        debug!(
            path = %request.path,
            tr_id = %tr_id,
            method = ?request.method,
            "Dispatching KIS request"
        );

        let client = self.session.http_client();
        let builder = match request.method {
            HttpMethod::Post => client.post(&url).headers(headers).json(&request.params),
            HttpMethod::Get => client.get(&url).headers(headers).query(&request.query_pairs()),
        };

        let response = ApiResponse::from_reqwest(builder.send().await?).await?;

        if !response.ok() {
            warn!(
                path = %request.path,
                tr_id = %tr_id,
                status = response.status(),
                "KIS request not ok: {}",
                response.err()
            );
        }

        Ok(response)
    }

    /// 취소 가능한 요청 전송.
    ///
    /// 토큰이 취소되면 진행 중인 요청을 버리고 `ExchangeError::Cancelled`를 반환합니다.
    pub async fn call_with_cancel(
        &self,
        request: ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, ExchangeError> {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(ExchangeError::Cancelled),
            result = self.call(request) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remap_paper_mode() {
        assert_eq!(remap_tr_id("TTTC0802U", true), "VTTC0802U");
        assert_eq!(remap_tr_id("JTTT1002U", true), "VTTT1002U");
        assert_eq!(remap_tr_id("CTSC9115R", true), "VTSC9115R");
        assert_eq!(remap_tr_id("FHKST01010100", true), "FHKST01010100");
        assert_eq!(remap_tr_id("", true), "");
    }

    #[test]
    fn test_remap_never_in_real_mode() {
        assert_eq!(remap_tr_id("TTTC0802U", false), "TTTC0802U");
        assert_eq!(remap_tr_id("FHKST01010100", false), "FHKST01010100");
        assert!(matches!(remap_tr_id("TTTC0802U", false), Cow::Borrowed(_)));
    }

    #[test]
    fn test_request_builder_and_query_pairs() {
        let req = ApiRequest::get("/uapi/test", "FHKST01010100")
            .tr_cont("N")
            .param("FID_INPUT_ISCD", "005930")
            .param("ORD_QTY", 10)
            .param("EMPTY", Value::Null)
            .header("hashkey", "abc");

        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.tr_cont, "N");
        assert_eq!(req.extra_headers, vec![("hashkey".to_string(), "abc".to_string())]);

        let mut pairs = req.query_pairs();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("EMPTY".to_string(), String::new()),
                ("FID_INPUT_ISCD".to_string(), "005930".to_string()),
                ("ORD_QTY".to_string(), "10".to_string()),
            ]
        );

        let post = ApiRequest::post("/uapi/order", "TTTC0802U").param("PDNO", "005930");
        assert_eq!(post.method, HttpMethod::Post);
        assert_eq!(Value::Object(post.params), json!({"PDNO": "005930"}));
    }
}
