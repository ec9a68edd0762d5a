//! CLI 명령어 구현 모듈.

pub mod account;
pub mod auth;
pub mod stream;
pub mod trade;

use anyhow::Context as _;
use kis_exchange::{
    DomesticStock, KisConfig, KisHolidayCalendar, RequestDispatcher, SessionManager,
    StreamingClient, TradingGate,
};
use std::sync::Arc;
use tracing::info;

/// 명령어 공통 의존성.
pub struct Context {
    pub session: Arc<SessionManager>,
    pub domestic: DomesticStock,
    pub gate: TradingGate,
    pub streaming: StreamingClient,
}

impl Context {
    /// 환경 변수 설정으로 세션, 디스패처, 게이트, 스트림 클라이언트 구성.
    pub fn from_env() -> anyhow::Result<Self> {
        let config = KisConfig::from_env().context("KIS 설정 로드 실패")?;
        info!(
            mode = config.credentials.environment.display_name(),
            base_url = %config.credentials.base_url,
            token_dir = %config.token_dir.display(),
            "KIS configuration loaded"
        );

        let windows = config.trading_windows.clone();
        let session = Arc::new(SessionManager::new(config)?);
        let dispatcher = RequestDispatcher::new(Arc::clone(&session));
        let calendar = Arc::new(KisHolidayCalendar::new(dispatcher.clone()));

        Ok(Self {
            streaming: StreamingClient::from_session(&session),
            gate: TradingGate::new(calendar, windows),
            domestic: DomesticStock::new(dispatcher),
            session,
        })
    }
}
