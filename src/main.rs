use clap::Parser;

use retina_service::{init_tracing, load_context, server, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(config.log_format)?;

    let ctx = tokio::task::spawn_blocking({
        let config = config.clone();
        move || load_context(&config)
    })
    .await??;

    server::serve(ctx, config.socket_addr(), config.body_limit_bytes()).await
}
