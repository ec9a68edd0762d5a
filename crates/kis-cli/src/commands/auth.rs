//! 토큰 발급 명령.

use super::Context;
use kis_exchange::AuthSource;

pub async fn run(ctx: &Context, force: bool) -> anyhow::Result<()> {
    let source = ctx.session.authenticate(force).await?;
    let env = ctx.session.environment().await?;

    match source {
        AuthSource::Cache => println!("캐시된 토큰 사용"),
        AuthSource::Network { attempts } => println!("토큰 발급 완료 (시도 {}회)", attempts),
    }
    println!(
        "모드: {}  만료: {}",
        env.credentials().environment.display_name(),
        env.expires_at()
    );
    Ok(())
}
