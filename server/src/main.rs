use tandem_server::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_server=debug,info".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    tandem_server::run(config).await
}
