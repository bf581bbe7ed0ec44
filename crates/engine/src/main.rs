use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use mailforge_engine::Engine;
use mailforge_infra::config::{EngineConfig, MailConfig};
use mailforge_infra::mail::{InMemoryMailTransport, MailTransport, SmtpCredentials, SmtpMailTransport};
use mailforge_infra::store::{InMemoryStore, PostgresStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("invalid configuration")?;
    mailforge_observability::init(&config.logging);

    let transport = mail_transport(&config.mail)?;

    match config.database.url.clone() {
        Some(url) => {
            let store = PostgresStore::connect(&url, config.database.max_connections)
                .await
                .context("failed to connect to the database")?;
            store.migrate().await.context("failed to apply migrations")?;
            run(config, Arc::new(store), transport).await
        }
        None => {
            warn!("MAILFORGE_DATABASE_URL not set; using the in-memory store");
            run(config, Arc::new(InMemoryStore::new()), transport).await
        }
    }
}

async fn run<S: Store + 'static>(
    config: EngineConfig,
    store: Arc<S>,
    transport: Arc<dyn MailTransport>,
) -> anyhow::Result<()> {
    let engine = Engine::build(config, store, transport)?;
    engine.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    info!("shutdown requested");

    engine.shutdown().await?;
    Ok(())
}

fn mail_transport(config: &MailConfig) -> anyhow::Result<Arc<dyn MailTransport>> {
    let Some(host) = config.smtp_host.as_deref() else {
        warn!("MAILFORGE_SMTP_HOST not set; outgoing mail is kept in memory");
        return Ok(Arc::new(InMemoryMailTransport::new()));
    };

    let credentials = match (&config.smtp_username, &config.smtp_password) {
        (Some(username), Some(password)) => Some(SmtpCredentials {
            username: username.clone(),
            password: password.clone(),
        }),
        _ => None,
    };
    let transport = SmtpMailTransport::new(host, config.smtp_port, config.smtp_tls, credentials)
        .with_context(|| format!("invalid SMTP relay {host}"))?;
    info!(host, port = config.smtp_port, "smtp transport configured");
    Ok(Arc::new(transport))
}
