//! 주문 가능 시간 확인 및 현금 주문 명령.

use super::Context;
use anyhow::{bail, Context as _};
use chrono::NaiveDateTime;
use kis_exchange::{Clock, OrderSide};
use rust_decimal::Decimal;
use tracing::warn;

/// `--at` 값 파싱 (KST).
fn parse_at(s: &str) -> anyhow::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M")
        .with_context(|| format!("시각 형식이 올바르지 않습니다 (YYYY-MM-DD HH:MM): {}", s))
}

pub async fn tradable(ctx: &Context, at: Option<&str>) -> anyhow::Result<()> {
    let at = match at {
        Some(s) => parse_at(s)?,
        None => ctx.session.clock().now_kst(),
    };

    let windows: Vec<String> = ctx.gate.windows().iter().map(ToString::to_string).collect();
    if ctx.gate.is_tradable(at).await? {
        println!("{} 주문 가능", at);
    } else {
        println!("{} 주문 불가 (거래 시간대: {})", at, windows.join(", "));
    }
    Ok(())
}

pub async fn order(
    ctx: &Context,
    side: OrderSide,
    symbol: &str,
    qty: u32,
    price: Decimal,
    ignore_hours: bool,
) -> anyhow::Result<()> {
    if qty == 0 {
        bail!("주문 수량은 1 이상이어야 합니다");
    }

    if ignore_hours {
        warn!("주문 가능 시간 확인 생략");
    } else {
        let now = ctx.session.clock().now_kst();
        if !ctx.gate.is_tradable(now).await? {
            bail!("{} 은(는) 주문 가능 시간이 아닙니다", now);
        }
    }

    let reply = ctx.domestic.order_cash(side, symbol, qty, price).await?;
    println!(
        "주문 접수: 주문번호 {} (시각 {}, 조직번호 {})",
        reply.order_no, reply.order_time, reply.krx_orgno
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_at() {
        let at = parse_at("2024-01-02 15:30").unwrap();
        assert_eq!(at.hour(), 15);
        assert_eq!(at.minute(), 30);
        assert!(parse_at("2024/01/02").is_err());
    }
}
