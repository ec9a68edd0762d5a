//! 잔고/시세 조회 명령.

use super::Context;

pub async fn balance(ctx: &Context) -> anyhow::Result<()> {
    let balance = ctx.domestic.inquire_balance().await?;

    println!("{:<8} {:<20} {:>10} {:>12} {:>12}", "종목", "종목명", "수량", "평균가", "현재가");
    for h in &balance.holdings {
        println!(
            "{:<8} {:<20} {:>10} {:>12} {:>12}",
            h.symbol, h.name, h.quantity, h.avg_price, h.current_price
        );
    }
    if let Some(summary) = &balance.summary {
        println!(
            "\n예수금: {}  총 평가금액: {}",
            summary.cash_balance, summary.total_eval_amount
        );
    }
    Ok(())
}

pub async fn price(ctx: &Context, symbol: &str) -> anyhow::Result<()> {
    let quote = ctx.domestic.inquire_price(symbol).await?;
    println!(
        "{} 현재가: {}원 ({} / {}%)  거래량: {}",
        symbol, quote.current_price, quote.change, quote.change_rate, quote.volume
    );
    Ok(())
}
