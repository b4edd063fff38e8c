//! Relay channel creation
//!
//! A smee-compatible host hands out a fresh channel by redirecting
//! `/new` to the channel's URL.

use std::time::Duration;

use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::Client;
use tracing::{debug, instrument};
use url::Url;

use crate::error::ChannelError;

/// Public host used when none is configured
pub const DEFAULT_CHANNEL_HOST: &str = "https://smee.io";

const CHANNEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Ask `host` for a new channel and return its URL
#[instrument]
pub async fn create_channel(host: &str) -> Result<Url, ChannelError> {
    let client = Client::builder()
        .redirect(Policy::none())
        .timeout(CHANNEL_TIMEOUT)
        .build()?;

    let new_url = Url::parse(host)?.join("/new")?;
    debug!(url = %new_url, "Requesting new channel");

    let response = client.head(new_url.clone()).send().await?;

    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ChannelError::NoLocation {
            status: response.status().as_u16(),
        })?;

    // Location may be relative to the host
    Ok(new_url.join(location)?)
}
