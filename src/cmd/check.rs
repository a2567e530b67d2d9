//! One-shot update check subcommand

use std::sync::Arc;

use anyhow::{Context, Result};

use drydock::config::Configuration;
use drydock::database::Database;
use drydock::resolver::{SecretSealer, UpdateResolver};

pub async fn run(config_path: &str, image: &str, registry: Option<&str>) -> Result<()> {
    let config = Configuration::load(config_path)?;

    let db = Arc::new(
        Database::open(&config.database.path)
            .with_context(|| format!("opening database at {}", config.database.path))?,
    );
    let resolver = UpdateResolver::new(db, SecretSealer::new(&config.auth.jwt_secret));

    let resolved = resolver
        .check_image(image, None, registry, None)
        .await
        .with_context(|| format!("checking {}", image))?;

    println!("{}", serde_json::to_string_pretty(&resolved.check)?);
    Ok(())
}
