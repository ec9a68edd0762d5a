//! 국내 주식 주문/조회.
//!
//! 모든 호출은 [`RequestDispatcher`]를 거치며 실전 tr_id를 넘깁니다.
//! 모의투자 변환은 디스패처가 처리합니다.

use crate::dispatcher::{ApiRequest, RequestDispatcher};
use crate::tr_id;
use crate::ExchangeError;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// 현금 주문 경로.
pub const ORDER_CASH_PATH: &str = "/uapi/domestic-stock/v1/trading/order-cash";
/// 정정/취소 주문 경로.
pub const ORDER_REVISE_PATH: &str = "/uapi/domestic-stock/v1/trading/order-rvsecncl";
/// 잔고 조회 경로.
pub const BALANCE_PATH: &str = "/uapi/domestic-stock/v1/trading/inquire-balance";
/// 현재가 조회 경로.
pub const PRICE_PATH: &str = "/uapi/domestic-stock/v1/quotations/inquire-price";

/// 잔고 연속 조회 최대 페이지 수.
const MAX_BALANCE_PAGES: usize = 20;

/// 지정가 주문 구분.
const ORD_DVSN_LIMIT: &str = "00";

/// 매수/매도 구분.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    /// 매수
    Buy,
    /// 매도
    Sell,
}

impl OrderSide {
    /// 실전 tr_id.
    pub fn tr_id(&self) -> &'static str {
        match self {
            OrderSide::Buy => tr_id::KR_BUY,
            OrderSide::Sell => tr_id::KR_SELL,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// 정정/취소 구분.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviseKind {
    /// 정정 ("01")
    Modify,
    /// 취소 ("02")
    Cancel,
}

impl ReviseKind {
    fn code(&self) -> &'static str {
        match self {
            ReviseKind::Modify => "01",
            ReviseKind::Cancel => "02",
        }
    }
}

/// 정정/취소 주문 요청.
#[derive(Debug, Clone)]
pub struct ReviseOrder {
    /// 한국거래소 전송 주문조직번호
    pub krx_orgno: String,
    /// 원주문번호
    pub original_order_no: String,
    /// 주문 구분 (기본 "00" 지정가)
    pub ord_dvsn: String,
    /// 정정/취소 구분
    pub kind: ReviseKind,
    /// 수량
    pub quantity: u32,
    /// 가격
    pub price: Decimal,
    /// 잔량 전부 여부
    pub all_quantity: bool,
}

/// 주문 응답.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderReply {
    /// 한국거래소 전송 주문조직번호
    #[serde(rename = "KRX_FWDG_ORD_ORGNO", default)]
    pub krx_orgno: String,
    /// 주문번호
    #[serde(rename = "ODNO")]
    pub order_no: String,
    /// 주문시간 (HHMMSS)
    #[serde(rename = "ORD_TMD", default)]
    pub order_time: String,
}

/// 보유 종목.
#[derive(Debug, Clone, Deserialize)]
pub struct Holding {
    /// 종목코드
    #[serde(rename = "pdno")]
    pub symbol: String,
    /// 종목명
    #[serde(rename = "prdt_name", default)]
    pub name: String,
    /// 보유수량
    #[serde(rename = "hldg_qty", deserialize_with = "deserialize_decimal")]
    pub quantity: Decimal,
    /// 매입평균가격
    #[serde(rename = "pchs_avg_pric", deserialize_with = "deserialize_decimal")]
    pub avg_price: Decimal,
    /// 현재가
    #[serde(rename = "prpr", deserialize_with = "deserialize_decimal")]
    pub current_price: Decimal,
    /// 평가손익금액
    #[serde(rename = "evlu_pfls_amt", deserialize_with = "deserialize_decimal")]
    pub profit_loss: Decimal,
}

/// 계좌 요약.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountSummary {
    /// 예수금
    #[serde(rename = "dnca_tot_amt", deserialize_with = "deserialize_decimal")]
    pub cash_balance: Decimal,
    /// 총 평가금액
    #[serde(rename = "tot_evlu_amt", deserialize_with = "deserialize_decimal")]
    pub total_eval_amount: Decimal,
}

/// 계좌 잔고.
#[derive(Debug, Clone, Default)]
pub struct Balance {
    /// 보유 종목 (모든 페이지)
    pub holdings: Vec<Holding>,
    /// 계좌 요약 (마지막 페이지)
    pub summary: Option<AccountSummary>,
    /// 조회한 페이지 수
    pub pages: usize,
}

/// 현재가 시세.
#[derive(Debug, Clone, Deserialize)]
pub struct StockPrice {
    /// 현재가
    #[serde(rename = "stck_prpr", deserialize_with = "deserialize_decimal")]
    pub current_price: Decimal,
    /// 전일대비
    #[serde(rename = "prdy_vrss", deserialize_with = "deserialize_decimal")]
    pub change: Decimal,
    /// 등락률 (%)
    #[serde(rename = "prdy_ctrt", deserialize_with = "deserialize_decimal")]
    pub change_rate: Decimal,
    /// 누적거래량
    #[serde(rename = "acml_vol", deserialize_with = "deserialize_decimal")]
    pub volume: Decimal,
}

/// 국내 주식 API.
#[derive(Clone)]
pub struct DomesticStock {
    dispatcher: RequestDispatcher,
}

impl DomesticStock {
    /// 새 API 핸들 생성.
    pub fn new(dispatcher: RequestDispatcher) -> Self {
        Self { dispatcher }
    }

    /// 디스패처.
    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    /// 현금 지정가 주문.
    pub async fn order_cash(
        &self,
        side: OrderSide,
        symbol: &str,
        quantity: u32,
        price: Decimal,
    ) -> Result<OrderReply, ExchangeError> {
        let env = self.dispatcher.session().environment().await?;
        let request = ApiRequest::post(ORDER_CASH_PATH, side.tr_id())
            .param("CANO", env.account_no())
            .param("ACNT_PRDT_CD", env.product_code())
            .param("PDNO", symbol)
            .param("ORD_DVSN", ORD_DVSN_LIMIT)
            .param("ORD_QTY", quantity.to_string())
            .param("ORD_UNPR", price.trunc().to_string());

        info!(
            "Placing KR {} order: {} x {} @ {}",
            side.label(),
            symbol,
            quantity,
            price
        );

        let reply: OrderReply = self.dispatcher.call(request).await?.into_result()?.output()?;
        info!(order_no = %reply.order_no, symbol, "KR order accepted");
        Ok(reply)
    }

    /// 주문 정정/취소.
    pub async fn order_revise_or_cancel(
        &self,
        order: &ReviseOrder,
    ) -> Result<OrderReply, ExchangeError> {
        let env = self.dispatcher.session().environment().await?;
        let request = ApiRequest::post(ORDER_REVISE_PATH, tr_id::KR_REVISE_CANCEL)
            .param("CANO", env.account_no())
            .param("ACNT_PRDT_CD", env.product_code())
            .param("KRX_FWDG_ORD_ORGNO", order.krx_orgno.as_str())
            .param("ORGN_ODNO", order.original_order_no.as_str())
            .param("ORD_DVSN", order.ord_dvsn.as_str())
            .param("RVSE_CNCL_DVSN_CD", order.kind.code())
            .param("ORD_QTY", order.quantity.to_string())
            .param("ORD_UNPR", order.price.trunc().to_string())
            .param("QTY_ALL_ORD_YN", if order.all_quantity { "Y" } else { "N" });

        info!(
            original_order_no = %order.original_order_no,
            kind = ?order.kind,
            "KR order revise/cancel"
        );

        self.dispatcher.call(request).await?.into_result()?.output()
    }

    /// 잔고 조회 (연속 조회로 모든 페이지 수집).
    pub async fn inquire_balance(&self) -> Result<Balance, ExchangeError> {
        let env = self.dispatcher.session().environment().await?;
        let mut balance = Balance::default();
        let mut tr_cont = String::new();
        let mut ctx_fk = String::new();
        let mut ctx_nk = String::new();

        loop {
            let request = ApiRequest::get(BALANCE_PATH, tr_id::KR_BALANCE)
                .tr_cont(tr_cont.as_str())
                .param("CANO", env.account_no())
                .param("ACNT_PRDT_CD", env.product_code())
                .param("AFHR_FLPR_YN", "N")
                .param("OFL_YN", "")
                .param("INQR_DVSN", "02")
                .param("UNPR_DVSN", "01")
                .param("FUND_STTL_ICLD_YN", "N")
                .param("FNCG_AMT_AUTO_RDPT_YN", "N")
                .param("PRCS_DVSN", "00")
                .param("CTX_AREA_FK100", ctx_fk.as_str())
                .param("CTX_AREA_NK100", ctx_nk.as_str());

            let response = self.dispatcher.call(request).await?.into_result()?;
            balance.pages += 1;

            let holdings: Vec<Holding> = response.field_as("output1").unwrap_or_default();
            balance.holdings.extend(holdings);
            if let Some(summary) = response
                .field_as::<Vec<AccountSummary>>("output2")
                .and_then(|rows| rows.into_iter().next())
            {
                balance.summary = Some(summary);
            }

            if !response.has_more() {
                break;
            }
            if balance.pages >= MAX_BALANCE_PAGES {
                warn!(pages = balance.pages, "잔고 연속 조회 최대 페이지 도달");
                break;
            }

            ctx_fk = response.field_str("ctx_area_fk100").unwrap_or("").to_string();
            ctx_nk = response.field_str("ctx_area_nk100").unwrap_or("").to_string();
            tr_cont = "N".to_string();
            debug!(page = balance.pages, "Fetching next balance page");
        }

        Ok(balance)
    }

    /// 현재가 조회.
    pub async fn inquire_price(&self, symbol: &str) -> Result<StockPrice, ExchangeError> {
        let request = ApiRequest::get(PRICE_PATH, tr_id::KR_PRICE)
            .param("FID_COND_MRKT_DIV_CODE", "J")
            .param("FID_INPUT_ISCD", symbol);

        self.dispatcher.call(request).await?.into_result()?.output()
    }
}

/// 문자열 숫자를 Decimal로 역직렬화 (빈 값은 0).
fn deserialize_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = String::deserialize(deserializer)?;
    let s = s.trim();
    if s.is_empty() || s == "-" {
        return Ok(Decimal::ZERO);
    }
    s.parse::<Decimal>()
        .map_err(|_| serde::de::Error::custom(format!("Invalid decimal: {}", s)))
}
