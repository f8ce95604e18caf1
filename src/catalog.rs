//! Remote catalog client.
//!
//! Fetches one page of the remote media catalog per call.

use crate::config::CatalogSettings;
use crate::media::CatalogPage;
use reqwest::Client;
use std::time::Duration;

/// HTTP client for the paged remote catalog.
#[derive(Clone)]
pub struct CatalogClient {
    client: Client,
    url: String,
    token: Option<String>,
    page_size: u64,
    timeout: Duration,
}

impl CatalogClient {
    pub fn new(client: Client, settings: &CatalogSettings) -> Self {
        Self {
            client,
            url: settings.url.clone(),
            token: settings.token.clone(),
            page_size: settings.page_size,
            timeout: settings.request_timeout(),
        }
    }

    /// Fetch the page starting at `offset`.
    pub async fn fetch_page(&self, offset: u64) -> Result<CatalogPage, reqwest::Error> {
        let size = self.page_size.to_string();
        let offset = offset.to_string();
        let mut request = self
            .client
            .get(&self.url)
            .query(&[("size", size.as_str()), ("offset", offset.as_str())])
            .timeout(self.timeout);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?.error_for_status()?;
        response.json::<CatalogPage>().await
    }
}
