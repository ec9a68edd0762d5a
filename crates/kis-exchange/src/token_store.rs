//! 접근 토큰 파일 캐시.
//!
//! KIS는 토큰 발급을 분당 1회로 제한하므로 발급받은 토큰을 날짜별 파일에
//! 저장해 두고 프로세스 재시작 시 재사용합니다.
//!
//! 파일 경로는 `{token_dir}/KIS{YYYYMMDD}` (KST 기준 날짜)이며 내용은
//! `{"token": "...", "expired": "YYYY-MM-DD HH:MM:SS"}` 형식의 JSON입니다.
//! 같은 경로를 여러 프로세스가 공유할 수 있으므로 쓰기는 임시 파일에
//! 기록한 뒤 이름을 바꾸는 방식으로 수행합니다 (마지막 쓰기가 유지됨).

use crate::ExchangeError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Asia::Seoul;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// KIS 만료 시각 형식 (KST).
const KIS_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 캐시된 접근 토큰.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedToken {
    /// 접근 토큰
    pub access_token: String,
    /// 만료 시각
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    /// 새 토큰 생성.
    pub fn new(access_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
        }
    }

    /// KIS 응답 형식 (`access_token_token_expired`, KST)에서 생성.
    pub fn from_kis(access_token: impl Into<String>, expired: &str) -> Result<Self, ExchangeError> {
        let expires_at = parse_kis_datetime(expired).ok_or_else(|| {
            ExchangeError::ParseError(format!("잘못된 토큰 만료 시각: {}", expired))
        })?;
        Ok(Self::new(access_token, expires_at))
    }

    /// 주어진 시각에 아직 유효한지 확인.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// `authorization` 헤더 값.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    /// 만료 시각을 KIS 형식 (KST) 문자열로 반환.
    pub fn expired_kst(&self) -> String {
        self.expires_at
            .with_timezone(&Seoul)
            .format(KIS_DATETIME_FORMAT)
            .to_string()
    }
}

/// 디스크에 저장되는 토큰 파일 형식.
#[derive(Debug, Serialize, Deserialize)]
struct TokenFile {
    token: String,
    expired: String,
}

/// 날짜별 토큰 파일 저장소.
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    /// 새 저장소 생성. 디렉터리는 첫 저장 시 생성됩니다.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// 캐시 디렉터리.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 해당 날짜의 토큰 파일 경로.
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("KIS{}", date.format("%Y%m%d")))
    }

    /// 오늘 날짜의 파일에서 아직 만료되지 않은 토큰을 읽습니다.
    ///
    /// 파일이 없거나 손상되었거나 만료된 경우 `None`을 반환합니다.
    pub async fn load(&self, today: NaiveDate, now: DateTime<Utc>) -> Option<CachedToken> {
        let path = self.path_for(today);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No cached KIS token file");
                return None;
            }
        };

        let file: TokenFile = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Ignoring malformed token file");
                return None;
            }
        };

        let token = match CachedToken::from_kis(file.token, &file.expired) {
            Ok(token) => token,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Ignoring token file with bad expiry");
                return None;
            }
        };

        if token.is_valid_at(now) {
            debug!(expires_at = %token.expires_at, "Using cached KIS token from file");
            Some(token)
        } else {
            debug!(expires_at = %token.expires_at, "Cached KIS token expired");
            None
        }
    }

    /// 토큰을 오늘 날짜 파일에 저장합니다.
    pub async fn save(&self, today: NaiveDate, token: &CachedToken) -> Result<PathBuf, ExchangeError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ExchangeError::TokenCache(format!("{}: {}", self.dir.display(), e)))?;

        let path = self.path_for(today);
        let body = serde_json::to_string(&TokenFile {
            token: token.access_token.clone(),
            expired: token.expired_kst(),
        })?;

        let tmp = path.with_extension(format!("{}.tmp", std::process::id()));
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| ExchangeError::TokenCache(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ExchangeError::TokenCache(format!("{}: {}", path.display(), e)))?;

        info!(path = %path.display(), expires_at = %token.expires_at, "KIS token cached");
        Ok(path)
    }
}

/// KIS 날짜시간 형식 파싱 ("YYYY-MM-DD HH:MM:SS", KST).
pub(crate) fn parse_kis_datetime(s: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), KIS_DATETIME_FORMAT).ok()?;
    let kst = Seoul.from_local_datetime(&naive).single()?;
    Some(kst.with_timezone(&Utc))
}
