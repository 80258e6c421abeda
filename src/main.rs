use clap::Parser;
use framemark::idp::{CognitoIdp, IdentityProvider};
use framemark::jwks::KeyResolver;
use framemark::settings::Settings;
use framemark::verifier::TokenVerifier;
use framemark::{storage, web};
use miette::Result;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "framemark", version, about = "Video annotation backend")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // load settings
    let settings = Settings::load(&cli.config)?;

    // logging
    let default_filter = if settings.server.debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    fmt().with_env_filter(env_filter).init();
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let db = storage::init(&settings.database).await?;

    // token verification against the pool's published keys
    let resolver = KeyResolver::new(settings.cognito.jwks_url());
    let verifier = TokenVerifier::new(
        resolver,
        settings.cognito.issuer(),
        settings.cognito.client_id.clone(),
    );

    // identity provider client
    let idp: Arc<dyn IdentityProvider> = Arc::new(CognitoIdp::new(
        settings.cognito.service_url(),
        settings.cognito.client_id.clone(),
    ));

    // start web server
    web::serve(settings, db, verifier, idp).await?;
    Ok(())
}
