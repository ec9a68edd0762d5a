//! 한국투자증권 Open API CLI.
//!
//! # 사용 예시
//!
//! ```bash
//! # 토큰 발급 (캐시 무시)
//! kis auth --force
//!
//! # 지금 주문 가능한지 확인
//! kis tradable
//!
//! # 삼성전자 10주 70,000원 지정가 매수
//! kis buy --symbol 005930 --qty 10 --price 70000
//!
//! # 실시간 체결가 30초 수신
//! kis stream --symbol 005930 --seconds 30
//! ```
//!
//! 설정은 환경 변수 (또는 `.env`)에서 읽습니다. `KIS_MODE=paper`이면 모의투자입니다.

use clap::{Parser, Subcommand};
use kis_exchange::{ExchangeError, OrderSide};
use rust_decimal::Decimal;
use tracing::error;

mod commands;
mod logging;

use commands::Context;
use logging::{init_logging, LogConfig};

#[derive(Parser)]
#[command(name = "kis")]
#[command(about = "KIS Open API client - 한국투자증권 주문/조회/실시간 시세", long_about = None)]
#[command(version)]
struct Cli {
    /// kis_exchange 디버그 로그 출력
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 접근 토큰 발급 (캐시가 있으면 재사용)
    Auth {
        /// 캐시를 무시하고 새로 발급
        #[arg(long)]
        force: bool,
    },

    /// 주문 가능 시간인지 확인
    Tradable {
        /// 확인할 KST 시각 (YYYY-MM-DD HH:MM, 기본: 현재)
        #[arg(long)]
        at: Option<String>,
    },

    /// 현금 매수 (지정가)
    Buy(OrderArgs),

    /// 현금 매도 (지정가)
    Sell(OrderArgs),

    /// 계좌 잔고 조회
    Balance,

    /// 현재가 조회
    Price {
        /// 종목코드 (예: 005930)
        #[arg(short, long)]
        symbol: String,
    },

    /// 실시간 시세 수신
    Stream {
        /// 종목코드
        #[arg(short, long)]
        symbol: String,

        /// 실시간 tr_id
        #[arg(long, default_value = "H0STCNT0")]
        tr_id: String,

        /// 수신 시간 (초, 0 = Ctrl-C까지)
        #[arg(long, default_value = "0")]
        seconds: u64,
    },
}

#[derive(clap::Args)]
struct OrderArgs {
    /// 종목코드
    #[arg(short, long)]
    symbol: String,

    /// 주문 수량
    #[arg(short, long)]
    qty: u32,

    /// 주문 가격 (원)
    #[arg(short, long)]
    price: Decimal,

    /// 주문 가능 시간 확인 생략
    #[arg(long)]
    ignore_hours: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env는 선택 사항
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_logging(&LogConfig::from_env(cli.verbose))?;

    if let Err(e) = run(cli.command).await {
        if let Some(hint) = e.downcast_ref::<ExchangeError>().and_then(failure_hint) {
            error!("{}", hint);
        }
        return Err(e);
    }
    Ok(())
}

async fn run(command: Commands) -> anyhow::Result<()> {
    let ctx = Context::from_env()?;

    match command {
        Commands::Auth { force } => commands::auth::run(&ctx, force).await?,
        Commands::Tradable { at } => commands::trade::tradable(&ctx, at.as_deref()).await?,
        Commands::Buy(args) => {
            commands::trade::order(
                &ctx,
                OrderSide::Buy,
                &args.symbol,
                args.qty,
                args.price,
                args.ignore_hours,
            )
            .await?
        }
        Commands::Sell(args) => {
            commands::trade::order(
                &ctx,
                OrderSide::Sell,
                &args.symbol,
                args.qty,
                args.price,
                args.ignore_hours,
            )
            .await?
        }
        Commands::Balance => commands::account::balance(&ctx).await?,
        Commands::Price { symbol } => commands::account::price(&ctx, &symbol).await?,
        Commands::Stream {
            symbol,
            tr_id,
            seconds,
        } => commands::stream::run(&ctx, &tr_id, &symbol, seconds).await?,
    }

    Ok(())
}

/// 실패 종류에 따른 안내 문구.
fn failure_hint(err: &ExchangeError) -> Option<&'static str> {
    if err.is_fatal() {
        Some("설정 또는 인증 정보를 확인하세요 (APP_KEY_*, APP_SECRET_*, KIS_ACCT_*)")
    } else if err.is_retryable() {
        Some("일시적인 오류입니다. 잠시 후 다시 시도하세요")
    } else {
        None
    }
}
