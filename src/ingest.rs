//! Loading code lists from files that admins attach to the dialog.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;

/// Source of code lists, given the location of an uploaded file.
#[async_trait]
pub trait CodeSource: Send + Sync {
    /// Fetch the file and return its codes in file order.
    async fn fetch_codes(&self, url: &str) -> Result<Vec<String>>;
}

/// Downloads code lists over HTTP.
#[derive(Clone)]
pub struct HttpCodeSource {
    client: reqwest::Client,
}

impl HttpCodeSource {
    /// Every download, body included, is aborted after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed setting up the HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl CodeSource for HttpCodeSource {
    async fn fetch_codes(&self, url: &str) -> Result<Vec<String>> {
        let body = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("failed downloading code file from '{}'", url))?
            .text()
            .await
            .context("failed reading code file")?;

        let codes = parse_codes(&body);
        info!("Read {} codes from {}", codes.len(), url);
        Ok(codes)
    }
}

/// Parse delimited text, taking the first field of every non-empty row as a code.
///
/// Fields are separated by `,`, `;` or tabs. A quoted first field is read up to its closing
/// quote, so it may contain separators itself.
pub fn parse_codes(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let field = first_field(line.trim()).trim();
            (!field.is_empty()).then(|| field.to_owned())
        })
        .collect()
}

fn first_field(line: &str) -> &str {
    match line.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next().unwrap_or_default(),
        None => line.split([',', ';', '\t']).next().unwrap_or_default(),
    }
}
