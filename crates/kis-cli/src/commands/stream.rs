//! 실시간 시세 수신 명령.

use super::Context;
use kis_exchange::{ControlKind, StreamMessage, StreamSubscription};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run(ctx: &Context, tr_id: &str, symbol: &str, seconds: u64) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let mut handle = ctx
        .streaming
        .start(vec![StreamSubscription::new(tr_id, symbol)], cancel.clone())
        .await?;

    let deadline = async {
        if seconds == 0 {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(Duration::from_secs(seconds)).await
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("종료 요청됨");
                break;
            }
            msg = handle.recv() => match msg {
                Some(StreamMessage::Realtime(frame)) => match frame.trade_tick() {
                    Some(tick) => println!("{} {} 현재가: {} 원", tick.trade_time, tick.symbol, tick.price),
                    None => println!("{}", frame.raw),
                },
                Some(StreamMessage::Control(control)) => {
                    if let ControlKind::SubscribeAck { success: false, message } = &control.kind {
                        warn!("구독 실패: {}", message);
                    }
                }
                Some(StreamMessage::Disconnected(reason)) => warn!("연결 끊김: {}", reason),
                None => break,
            },
        }
    }

    handle.stop().await;
    Ok(())
}
