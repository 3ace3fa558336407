//! Shared HTTP context (spec §5: "HTTP connection pool: shared;
//! thread-safe"). A single `reqwest::Client` is built once from
//! `Configuration` and handed by `&` or by cheap `Clone` to the Analyzer,
//! `SegmentFetcher`, and key-fetch code paths.

use crate::config::Configuration;
use std::time::Duration;

#[derive(Clone)]
pub struct HttpContext {
    pub client: reqwest::Client,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl HttpContext {
    pub fn new(config: &Configuration) -> Self {
        let builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .gzip(true);
        let builder = config.apply_proxy(builder);
        let client = builder
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        HttpContext {
            client,
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
        }
    }
}
