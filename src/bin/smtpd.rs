//! Per-connection SMTP submission daemon
//!
//! Spawned by the super-server with the client on stdin/stdout and the
//! peer's TCP endpoints in environment variables. Exit codes: 0 on a clean
//! session, 1 on initialization failure, 2 on greeting failure, 3 on a
//! session failure.

use postbox_rs::config::Config;
use postbox_rs::connection::Connection;
use postbox_rs::domain::DomainRegistry;
use postbox_rs::filter::SpamcFilter;
use postbox_rs::security::FileCredentialStore;
use postbox_rs::smtp::SmtpSession;
use postbox_rs::storage::Queue;
use tracing::{error, info};

fn load_config() -> postbox_rs::Result<Config> {
    if let Some(path) = std::env::args().nth(1) {
        Config::from_file(path)
    } else if std::path::Path::new("smtpd.toml").exists() {
        Config::from_file("smtpd.toml")
    } else {
        Ok(Config::default())
    }
}

fn init_logging(config: &Config) {
    let level = config
        .logging
        .level
        .parse()
        .unwrap_or(tracing::Level::INFO);
    // stdout carries the protocol stream; logs must go to stderr.
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error loading configuration: {}", e);
            std::process::exit(1);
        }
    };
    init_logging(&config);

    let registry = DomainRegistry::new(&config.storage.domain_root);
    let queue = match Queue::open(&config.storage.queue_path).await {
        Ok(queue) => queue,
        Err(e) => {
            error!("error opening queue: {}", e);
            std::process::exit(1);
        }
    };

    let mut session = SmtpSession::new(Connection::from_stdio(), &config, registry, queue);
    if let Some(command) = &config.smtp.spamc {
        session = session.with_filter(Box::new(SpamcFilter::new(command.clone())));
    }
    if let Some(path) = &config.auth.secrets_path {
        match FileCredentialStore::load(path) {
            Ok(store) => session = session.with_credentials(Box::new(store)),
            Err(e) => {
                error!("error loading secrets: {}", e);
                std::process::exit(1);
            }
        }
    }

    info!("smtpd session starting");
    if let Err(e) = session.greet().await {
        error!("error sending greeting: {}", e);
        std::process::exit(2);
    }
    if let Err(e) = session.run().await {
        error!("error handling connection: {}", e);
        std::process::exit(3);
    }
}
