//! 시간 소스 추상화.
//!
//! 토큰 만료, 재인증 주기, 날짜별 캐시 파일 선택이 모두 현재 시각에
//! 의존하므로 테스트에서 시간을 고정할 수 있도록 트레이트로 분리합니다.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Asia::Seoul;
use std::sync::{Arc, Mutex};

/// 현재 시각을 제공하는 트레이트.
pub trait Clock: Send + Sync {
    /// 현재 UTC 시각.
    fn now(&self) -> DateTime<Utc>;

    /// 현재 한국 표준시 (KST) 로컬 시각.
    fn now_kst(&self) -> NaiveDateTime {
        self.now().with_timezone(&Seoul).naive_local()
    }

    /// 현재 KST 날짜.
    fn today_kst(&self) -> NaiveDate {
        self.now_kst().date()
    }
}

/// 시스템 시계.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 수동으로 조작하는 시계 (테스트/시뮬레이션용).
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// 주어진 시각으로 고정된 시계 생성.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// 시계를 앞으로 이동.
    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
