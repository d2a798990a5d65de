use formdrop_core::Config;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    let (_state, router, background) = formdrop_api::setup::initialize_app(config.clone()).await?;

    formdrop_api::setup::server::start_server(&config, router, background).await?;

    Ok(())
}
