//! KIS 실시간 시세 WebSocket 클라이언트.
//!
//! 접속 승인키(approval key)를 발급받아 WebSocket에 연결하고 구독 요청을
//! 보낸 뒤 수신 프레임을 해석해 채널로 전달합니다.
//!
//! # 프레임 형식
//!
//! ```text
//! 0|H0STCNT0|001|005930^093015^70000^...   실시간 데이터
//! {"header":{"tr_id":"PINGPONG",...}}      제어 메시지 (JSON)
//! ```
//!
//! # 생명주기
//!
//! ```text
//! Starting → Running → (Reconnecting → Running)* → Stopping → Stopped
//! ```
//!
//! 재연결은 `ReconnectPolicy::max_attempts`가 0보다 클 때만 수행합니다.
//!
//! # 사용 예제
//!
//! ```rust,ignore
//! let client = StreamingClient::from_session(&session);
//! let cancel = CancellationToken::new();
//! let mut handle = client
//!     .start(vec![StreamSubscription::trade("005930")], cancel)
//!     .await?;
//!
//! while let Some(msg) = handle.recv().await {
//!     if let StreamMessage::Realtime(frame) = msg {
//!         println!("현재가: {:?}", frame.last_price());
//!     }
//! }
//! ```

use crate::config::Credentials;
use crate::session::SessionManager;
use crate::tr_id;
use crate::ExchangeError;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 메시지 채널 용량.
const CHANNEL_CAPACITY: usize = 1000;

/// 하트비트 제어 메시지 tr_id.
const PINGPONG: &str = "PINGPONG";

/// WebSocket 핸드셰이크 제한 시간 기본값.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket 재연결 정책 (지수 백오프).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// 최대 재연결 시도 횟수 (0 = 재연결 안 함)
    pub max_attempts: u32,
    /// 첫 재연결 대기 시간
    pub base_delay: Duration,
    /// 최대 대기 시간
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// 재연결 사용 여부.
    pub fn enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// `attempt`번째 (1부터) 재연결 전 대기 시간: `base * 2^(attempt-1)`, 최대 `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// 실시간 구독 하나.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamSubscription {
    /// 거래 ID (예: `H0STCNT0`)
    pub tr_id: String,
    /// 구독 키 (종목코드)
    pub tr_key: String,
}

impl StreamSubscription {
    /// 새 구독 생성.
    pub fn new(tr_id: impl Into<String>, tr_key: impl Into<String>) -> Self {
        Self {
            tr_id: tr_id.into(),
            tr_key: tr_key.into(),
        }
    }

    /// 국내 주식 실시간 체결가 구독.
    pub fn trade(symbol: impl Into<String>) -> Self {
        Self::new(tr_id::WS_KR_TRADE, symbol)
    }
}

/// 접속 승인키 요청 본문.
#[derive(Serialize)]
struct ApprovalRequest<'a> {
    grant_type: &'a str,
    appkey: &'a str,
    secretkey: &'a str,
}

#[derive(Deserialize)]
struct ApprovalResponse {
    approval_key: String,
}

/// WebSocket 접속 승인키 발급 (POST /oauth2/Approval).
///
/// 거래용 접근 토큰과는 별개의 자격 증명입니다.
pub async fn request_approval_key(
    client: &Client,
    credentials: &Credentials,
) -> Result<String, ExchangeError> {
    let url = format!("{}/oauth2/Approval", credentials.base_url);
    let body = ApprovalRequest {
        grant_type: "client_credentials",
        appkey: &credentials.app_key,
        secretkey: credentials.app_secret(),
    };

    let response = client.post(&url).json(&body).send().await?;
    let status = response.status().as_u16();
    let text = response.text().await?;

    if status != 200 {
        return Err(ExchangeError::AuthFailure {
            status,
            message: format!("approval key 발급 실패: {}", text),
        });
    }

    let parsed: ApprovalResponse = serde_json::from_str(&text)?;
    debug!("KIS WebSocket approval key issued");
    Ok(parsed.approval_key)
}

/// 핸드셰이크 쿼리 문자열이 포함된 접속 URL 생성.
///
/// 경로가 없는 URL에는 `/`를 붙여 요청 라인이 `GET /?...`가 되도록 합니다.
pub fn build_connect_url(
    ws_url: &str,
    credentials: &Credentials,
    approval_key: &str,
    subscription: &StreamSubscription,
) -> String {
    let authorization = format!(
        "{}|{}|{}",
        credentials.app_key,
        credentials.app_secret(),
        approval_key
    );
    let base = ws_url.trim_end_matches('/');
    let has_path = base
        .split_once("://")
        .map(|(_, rest)| rest.contains('/'))
        .unwrap_or(false);
    format!(
        "{}{}?authorization={}&tr_type=1&tr_id={}&custtype=P&tr_key={}&content-type=utf8",
        base,
        if has_path { "" } else { "/" },
        urlencoding::encode(&authorization),
        urlencoding::encode(&subscription.tr_id),
        urlencoding::encode(&subscription.tr_key),
    )
}

/// 구독 요청 메시지 생성.
pub fn subscribe_message(approval_key: &str, subscription: &StreamSubscription) -> String {
    json!({
        "header": {
            "approval_key": approval_key,
            "custtype": "P",
            "tr_type": "1",
            "content-type": "utf8",
        },
        "body": {
            "input": {
                "tr_id": subscription.tr_id,
                "tr_key": subscription.tr_key,
            }
        }
    })
    .to_string()
}

/// 실시간 체결 틱.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeTick {
    /// 종목코드
    pub symbol: String,
    /// 체결시간 (HHMMSS)
    pub trade_time: String,
    /// 체결가
    pub price: Decimal,
}

/// `0|`로 시작하는 실시간 데이터 프레임.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeFrame {
    /// 거래 ID
    pub tr_id: String,
    /// 레코드 수
    pub record_count: usize,
    /// `^`로 분리된 위치 기반 필드
    pub fields: Vec<String>,
    /// 원본 텍스트
    pub raw: String,
}

impl RealtimeFrame {
    /// 실시간 데이터 프레임 파싱. 형식이 다르거나 레코드 수가 숫자가 아니면 `None`.
    pub fn parse(text: &str) -> Option<Self> {
        if !text.starts_with("0|") {
            return None;
        }

        let mut parts = text.splitn(4, '|');
        let _flag = parts.next()?;
        let tr_id = parts.next()?;
        let count = parts.next()?;
        let payload = parts.next()?;

        Some(Self {
            tr_id: tr_id.to_string(),
            record_count: count.trim().parse().ok()?,
            fields: payload.split('^').map(str::to_string).collect(),
            raw: text.to_string(),
        })
    }

    /// 레코드별 필드 묶음.
    ///
    /// 레코드 수로 필드가 나누어떨어지지 않으면 전체를 하나의 레코드로 봅니다.
    pub fn records(&self) -> Vec<&[String]> {
        let count = self.record_count.max(1);
        if count > 1 && self.fields.len() % count == 0 {
            self.fields.chunks(self.fields.len() / count).collect()
        } else {
            vec![self.fields.as_slice()]
        }
    }

    /// 체결 프레임의 현재가 (필드 인덱스 2).
    pub fn last_price(&self) -> Option<Decimal> {
        if self.tr_id != tr_id::WS_KR_TRADE {
            return None;
        }
        self.fields.get(2)?.trim().parse().ok()
    }

    /// 체결 프레임의 첫 레코드를 틱으로 변환.
    pub fn trade_tick(&self) -> Option<TradeTick> {
        Some(TradeTick {
            symbol: self.fields.first()?.clone(),
            trade_time: self.fields.get(1)?.clone(),
            price: self.last_price()?,
        })
    }
}

/// 제어 메시지 종류.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlKind {
    /// `PINGPONG` 하트비트
    Heartbeat,
    /// 구독 요청 응답
    SubscribeAck {
        /// `rt_cd == "0"` 여부
        success: bool,
        /// 응답 메시지 (`msg1`)
        message: String,
    },
    /// 그 밖의 메시지
    Other,
}

/// JSON 제어 메시지.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// 헤더의 거래 ID
    pub tr_id: Option<String>,
    /// 종류
    pub kind: ControlKind,
    /// 원본 텍스트
    pub raw: String,
}

impl ControlMessage {
    /// 실시간 데이터가 아닌 프레임 해석.
    pub fn parse(text: &str) -> Self {
        let value: Option<Value> = serde_json::from_str(text).ok();
        let tr_id = value
            .as_ref()
            .and_then(|v| v.pointer("/header/tr_id"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let kind = match (&tr_id, value.as_ref().and_then(|v| v.get("body"))) {
            (Some(id), _) if id == PINGPONG => ControlKind::Heartbeat,
            (_, Some(body)) if body.get("rt_cd").is_some() => ControlKind::SubscribeAck {
                success: body.get("rt_cd").and_then(Value::as_str) == Some("0"),
                message: body
                    .get("msg1")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => ControlKind::Other,
        };

        Self {
            tr_id,
            kind,
            raw: text.to_string(),
        }
    }

    /// 하트비트 여부.
    pub fn is_heartbeat(&self) -> bool {
        self.kind == ControlKind::Heartbeat
    }
}

/// 소비자에게 전달되는 메시지.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    /// 실시간 데이터
    Realtime(RealtimeFrame),
    /// 제어 메시지
    Control(ControlMessage),
    /// 연결 끊김 (사유)
    Disconnected(String),
}

/// 스트림 태스크 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// 승인키 발급 및 첫 연결 중
    Starting,
    /// 수신 중
    Running,
    /// 재연결 대기 중
    Reconnecting,
    /// 종료 처리 중
    Stopping,
    /// 종료됨
    Stopped,
}

/// 실행 중인 스트림 핸들.
pub struct StreamHandle {
    rx: mpsc::Receiver<StreamMessage>,
    state: watch::Receiver<StreamState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// 다음 메시지 수신. 태스크가 끝나면 `None`.
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        self.rx.recv().await
    }

    /// 현재 상태.
    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// 상태 변경 구독.
    pub fn state_receiver(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    /// 취소 토큰.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 스트림을 중지하고 태스크 종료를 기다립니다.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "KIS stream task join failed");
        }
    }
}

/// KIS 실시간 시세 클라이언트.
#[derive(Clone)]
pub struct StreamingClient {
    credentials: Arc<Credentials>,
    ws_url: String,
    reconnect: ReconnectPolicy,
    connect_timeout: Duration,
    http: Client,
}

impl StreamingClient {
    /// 새 클라이언트 생성.
    pub fn new(
        credentials: Arc<Credentials>,
        ws_url: impl Into<String>,
        reconnect: ReconnectPolicy,
        http: Client,
    ) -> Self {
        Self {
            credentials,
            ws_url: ws_url.into(),
            reconnect,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            http,
        }
    }

    /// 핸드셰이크 제한 시간 설정 (기본 10초).
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 세션 설정(인증 정보, URL, 재연결 정책)을 공유하는 클라이언트 생성.
    pub fn from_session(session: &SessionManager) -> Self {
        let config = session.config();
        Self::new(
            Arc::clone(&config.credentials),
            config.websocket_url.clone(),
            config.reconnect,
            session.http_client().clone(),
        )
    }

    /// 승인키를 발급받고 백그라운드 태스크에서 수신을 시작합니다.
    ///
    /// # Errors
    /// 구독 목록이 비어 있거나 승인키 발급에 실패하면 에러를 반환합니다.
    pub async fn start(
        &self,
        subscriptions: Vec<StreamSubscription>,
        cancel: CancellationToken,
    ) -> Result<StreamHandle, ExchangeError> {
        if subscriptions.is_empty() {
            return Err(ExchangeError::Config("구독 목록이 비어 있습니다".to_string()));
        }

        let approval_key = tokio::select! {
            _ = cancel.cancelled() => return Err(ExchangeError::Cancelled),
            key = request_approval_key(&self.http, &self.credentials) => key?,
        };

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(StreamState::Starting);

        let task = StreamTask {
            url: build_connect_url(
                &self.ws_url,
                &self.credentials,
                &approval_key,
                &subscriptions[0],
            ),
            approval_key,
            tr_ids: subscriptions.iter().map(|s| s.tr_id.clone()).collect(),
            subscriptions,
            reconnect: self.reconnect,
            connect_timeout: self.connect_timeout,
            tx,
            state: state_tx,
            cancel: cancel.clone(),
        };

        let handle = tokio::spawn(task.supervise());

        Ok(StreamHandle {
            rx,
            state: state_rx,
            cancel,
            task: handle,
        })
    }
}

/// 연결 종료 사유.
enum Exit {
    /// 취소 또는 소비자 종료
    Shutdown,
    /// 연결 실패/끊김
    Lost(ExchangeError),
}

struct StreamTask {
    url: String,
    approval_key: String,
    subscriptions: Vec<StreamSubscription>,
    tr_ids: HashSet<String>,
    reconnect: ReconnectPolicy,
    connect_timeout: Duration,
    tx: mpsc::Sender<StreamMessage>,
    state: watch::Sender<StreamState>,
    cancel: CancellationToken,
}

impl StreamTask {
    async fn supervise(self) {
        let mut attempt: u32 = 0;

        loop {
            let reason = match self.run_connection(&mut attempt).await {
                Exit::Shutdown => break,
                Exit::Lost(e) => e,
            };

            error!(error = %reason, "KIS WebSocket connection lost");
            if self
                .tx
                .send(StreamMessage::Disconnected(reason.to_string()))
                .await
                .is_err()
            {
                break;
            }

            attempt += 1;
            if attempt > self.reconnect.max_attempts {
                if self.reconnect.enabled() {
                    error!(
                        max_attempts = self.reconnect.max_attempts,
                        "최대 재연결 시도 횟수 초과"
                    );
                }
                break;
            }

            let delay = self.reconnect.delay_for(attempt);
            self.state.send_replace(StreamState::Reconnecting);
            warn!(
                attempt,
                max_attempts = self.reconnect.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "KIS WebSocket 재연결 대기"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        self.state.send_replace(StreamState::Stopping);
        info!("KIS WebSocket stream stopping");
        self.state.send_replace(StreamState::Stopped);
    }

    async fn run_connection(&self, attempt: &mut u32) -> Exit {
        debug!(url = %redact(&self.url), "Connecting KIS WebSocket");

        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return Exit::Shutdown,
            result = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str())) => result,
        };
        let (ws_stream, _) = match connected {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Exit::Lost(e.into()),
            Err(_) => {
                return Exit::Lost(ExchangeError::Timeout(format!(
                    "WebSocket 핸드셰이크 {}ms 초과",
                    self.connect_timeout.as_millis()
                )));
            }
        };
        let (mut write, mut read) = ws_stream.split();

        for subscription in &self.subscriptions {
            let msg = subscribe_message(&self.approval_key, subscription);
            if let Err(e) = write.send(Message::Text(msg)).await {
                return Exit::Lost(e.into());
            }
            debug!(tr_id = %subscription.tr_id, tr_key = %subscription.tr_key, "구독 요청 전송");
        }

        *attempt = 0;
        self.state.send_replace(StreamState::Running);
        info!(subscriptions = self.subscriptions.len(), "KIS WebSocket 연결 성공");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Exit::Shutdown;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if text.starts_with("0|") {
                                match RealtimeFrame::parse(&text) {
                                    None => warn!(frame = %text, "잘못된 실시간 프레임, 무시"),
                                    Some(frame) if !self.tr_ids.contains(&frame.tr_id) => {
                                        debug!(tr_id = %frame.tr_id, "구독하지 않은 tr_id, 무시");
                                    }
                                    Some(frame) => {
                                        if self.tx.send(StreamMessage::Realtime(frame)).await.is_err() {
                                            return Exit::Shutdown;
                                        }
                                    }
                                }
                            } else {
                                let control = ControlMessage::parse(&text);
                                if control.is_heartbeat() {
                                    debug!("PINGPONG 수신, 응답 전송");
                                    if let Err(e) = write.send(Message::Text(text)).await {
                                        return Exit::Lost(e.into());
                                    }
                                } else if let ControlKind::SubscribeAck { success, message } = &control.kind {
                                    if *success {
                                        info!(tr_id = ?control.tr_id, "구독 응답: {}", message);
                                    } else {
                                        warn!(tr_id = ?control.tr_id, "구독 실패: {}", message);
                                    }
                                }
                                if self.tx.send(StreamMessage::Control(control)).await.is_err() {
                                    return Exit::Shutdown;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                return Exit::Lost(e.into());
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("{} {}", f.code, f.reason))
                                .unwrap_or_else(|| "no close frame".to_string());
                            return Exit::Lost(ExchangeError::WebSocket(format!(
                                "서버에서 연결 종료: {}",
                                reason
                            )));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Exit::Lost(e.into()),
                        None => {
                            return Exit::Lost(ExchangeError::WebSocket(
                                "WebSocket 스트림 종료".to_string(),
                            ));
                        }
                    }
                }
            }
        }
    }
}

/// 로그용 URL (쿼리 문자열 제거).
fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
