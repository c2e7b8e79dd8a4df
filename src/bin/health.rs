use std::env;

use anyhow::{bail, Result};
use reqwest::Url;
use serde::Deserialize;

#[derive(Deserialize)]
struct Health {
    status: String,
    service: String,
    model_loaded: bool,
}

/// Exits non-zero unless the service at the given URL (or on `PORT`) reports itself healthy.
fn main() -> Result<()> {
    let url = match env::args().nth(1) {
        Some(url) => url,
        None => {
            let port = env::var("PORT").unwrap_or_else(|_| "5001".into());
            format!("http://127.0.0.1:{port}/health")
        }
    };
    let url = Url::parse(&url)?;

    let response = reqwest::blocking::get(url.clone())?;
    if !response.status().is_success() {
        bail!("Request to {url} failed with status {}", response.status());
    }
    let health: Health = response.json()?;
    if health.status != "healthy" {
        bail!("{} reported status {}", health.service, health.status);
    }
    println!(
        "{} is {} (model loaded: {})",
        health.service, health.status, health.model_loaded
    );

    Ok(())
}
