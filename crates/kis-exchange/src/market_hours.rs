//! 주문 가능 시간 판정.
//!
//! 주문을 내는 호출자가 전송 전에 확인하는 게이트입니다. 디스패처는
//! 이 게이트를 직접 사용하지 않습니다.
//!
//! 판정 순서:
//! 1. 토요일/일요일이면 거부
//! 2. 휴장일 조회 결과 개장일이 아니면 거부 (`opnd_yn == "N"`)
//! 3. 설정된 시간대 중 하나에 포함되면 허용 (양 끝 포함)

use crate::dispatcher::{ApiRequest, RequestDispatcher};
use crate::tr_id;
use crate::ExchangeError;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// 국내 휴장일 조회 경로.
pub const HOLIDAY_PATH: &str = "/uapi/domestic-stock/v1/quotations/chk-holiday";

/// 거래 가능 시간대 (닫힌 구간).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradingWindow {
    /// 시작 시각 (포함)
    pub start: NaiveTime,
    /// 종료 시각 (포함)
    pub end: NaiveTime,
}

impl TradingWindow {
    /// 새 시간대 생성.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// 시각이 구간에 포함되는지 확인 (양 끝 포함).
    pub fn contains(&self, time: NaiveTime) -> bool {
        self.start <= time && time <= self.end
    }

    /// 기본 KRX 시간대: 정규장 09:00-15:30, 시간외단일가 15:40-18:00.
    pub fn default_krx() -> Vec<Self> {
        vec![
            Self::new(hm(9, 0), hm(15, 30)),
            Self::new(hm(15, 40), hm(18, 0)),
        ]
    }

    /// `"09:00-15:30,15:40-18:00"` 형식 파싱.
    pub fn parse_list(s: &str) -> Result<Vec<Self>, ExchangeError> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                let invalid =
                    || ExchangeError::Config(format!("잘못된 거래 시간대: {}", part));
                let (start, end) = part.split_once('-').ok_or_else(invalid)?;
                let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").map_err(|_| invalid())?;
                let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").map_err(|_| invalid())?;
                if start > end {
                    return Err(invalid());
                }
                Ok(Self::new(start, end))
            })
            .collect()
    }
}

impl fmt::Display for TradingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

fn hm(hour: u32, min: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, min, 0).unwrap_or(NaiveTime::MIN)
}

/// 개장일 조회.
#[async_trait]
pub trait HolidayCalendar: Send + Sync {
    /// 해당 날짜가 개장일이면 `true`.
    async fn is_open_day(&self, date: NaiveDate) -> Result<bool, ExchangeError>;
}

#[derive(Debug, Deserialize)]
struct HolidayItem {
    #[serde(default)]
    bass_dt: String,
    #[serde(default)]
    opnd_yn: String,
}

/// KIS 휴장일 API 기반 달력 (날짜별 캐시).
pub struct KisHolidayCalendar {
    dispatcher: RequestDispatcher,
    cache: RwLock<HashMap<NaiveDate, bool>>,
}

impl KisHolidayCalendar {
    /// 새 달력 생성.
    pub fn new(dispatcher: RequestDispatcher) -> Self {
        Self {
            dispatcher,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl HolidayCalendar for KisHolidayCalendar {
    async fn is_open_day(&self, date: NaiveDate) -> Result<bool, ExchangeError> {
        if let Some(open) = self.cache.read().await.get(&date) {
            return Ok(*open);
        }

        let bass_dt = date.format("%Y%m%d").to_string();
        let request = ApiRequest::get(HOLIDAY_PATH, tr_id::KR_HOLIDAY)
            .param("BASS_DT", bass_dt.as_str())
            .param("CTX_AREA_NK", "")
            .param("CTX_AREA_FK", "");

        let response = self.dispatcher.call(request).await?.into_result()?;
        let items: Vec<HolidayItem> = response.field_as("output").unwrap_or_default();

        // 조회 결과는 기준일부터 이어지는 목록이므로 해당 날짜 항목을 우선 사용
        let open = items
            .iter()
            .find(|item| item.bass_dt == bass_dt)
            .or_else(|| items.first())
            .map(|item| item.opnd_yn != "N")
            .unwrap_or_else(|| {
                warn!(date = %date, "휴장일 조회 결과가 비어 있음, 개장일로 간주");
                true
            });

        debug!(date = %date, open, "KIS holiday lookup");
        self.cache.write().await.insert(date, open);
        Ok(open)
    }
}

/// 주문 가능 여부 판정기.
#[derive(Clone)]
pub struct TradingGate {
    calendar: Arc<dyn HolidayCalendar>,
    windows: Vec<TradingWindow>,
}

impl TradingGate {
    /// 새 판정기 생성.
    pub fn new(calendar: Arc<dyn HolidayCalendar>, windows: Vec<TradingWindow>) -> Self {
        Self { calendar, windows }
    }

    /// 설정된 시간대.
    pub fn windows(&self) -> &[TradingWindow] {
        &self.windows
    }

    /// KST 로컬 시각 기준으로 주문 가능 여부 판정.
    pub async fn is_tradable(&self, at: NaiveDateTime) -> Result<bool, ExchangeError> {
        if matches!(at.weekday(), Weekday::Sat | Weekday::Sun) {
            debug!(at = %at, "주말, 주문 불가");
            return Ok(false);
        }

        if !self.calendar.is_open_day(at.date()).await? {
            debug!(at = %at, "휴장일, 주문 불가");
            return Ok(false);
        }

        let time = at.time();
        Ok(self.windows.iter().any(|w| w.contains(time)))
    }
}
