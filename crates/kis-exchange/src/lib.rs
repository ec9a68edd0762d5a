//! 한국투자증권 (KIS) Open API 연동.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - 접근 토큰 발급, 날짜별 파일 캐시, 24시간 강제 재인증 (`session`)
//! - 인증 헤더 주입과 모의투자 tr_id 변환을 담당하는 REST 디스패처 (`dispatcher`)
//! - 응답 스키마와 무관한 일반 응답 래퍼 (`response`)
//! - 실시간 시세 WebSocket 클라이언트 (`stream`)
//! - 주문 가능 시간 판정 (`market_hours`)
//! - 국내 주식 주문/조회 (`domestic`)

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod domestic;
pub mod error;
pub mod market_hours;
pub mod response;
pub mod session;
pub mod stream;
pub mod token_store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Credentials, KisConfig, KisEnvironment, RetryPolicy};
pub use dispatcher::{remap_tr_id, ApiRequest, HttpMethod, RequestDispatcher};
pub use domestic::{Balance, DomesticStock, OrderReply, OrderSide, ReviseKind, ReviseOrder, StockPrice};
pub use error::*;
pub use market_hours::{HolidayCalendar, KisHolidayCalendar, TradingGate, TradingWindow};
pub use response::ApiResponse;
pub use session::{AuthSource, SessionEnvironment, SessionManager, SessionState};
pub use stream::{
    ControlKind, ControlMessage, RealtimeFrame, ReconnectPolicy, StreamHandle, StreamMessage,
    StreamState, StreamSubscription, StreamingClient, TradeTick,
};
pub use token_store::{CachedToken, TokenStore};

/// KIS API 거래 ID (실전 기준).
///
/// 모의투자 변환은 [`remap_tr_id`]가 처리합니다.
pub mod tr_id {
    /// 국내 주식 현재가 조회
    pub const KR_PRICE: &str = "FHKST01010100";
    /// 국내 주식 현금 매수
    pub const KR_BUY: &str = "TTTC0802U";
    /// 국내 주식 현금 매도
    pub const KR_SELL: &str = "TTTC0801U";
    /// 국내 주식 정정/취소
    pub const KR_REVISE_CANCEL: &str = "TTTC0803U";
    /// 국내 주식 잔고 조회
    pub const KR_BALANCE: &str = "TTTC8434R";
    /// 국내 휴장일 조회
    pub const KR_HOLIDAY: &str = "CTCA0903R";

    /// 실시간 체결가
    pub const WS_KR_TRADE: &str = "H0STCNT0";
    /// 실시간 호가
    pub const WS_KR_ORDERBOOK: &str = "H0STASP0";
}
