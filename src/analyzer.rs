//! Resolve a user-supplied URL into a [`Playlist`] (spec §4.6). Handles
//! direct `.m3u8` URLs, master-playlist variant selection, and scanning an
//! arbitrary web page for an embedded M3U8 reference.

use crate::config::VariantSelection;
use crate::error::AnalyzerError;
use crate::http::HttpContext;
use crate::playlist::{self, Playlist, Variant};
use regex::Regex;
use reqwest::Url;
use std::sync::LazyLock;

const MAX_RECURSION_DEPTH: u32 = 2;

static M3U8_IN_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>]+\.m3u8[^\s"'<>]*"#).unwrap());
static JSON_SOURCE_SRC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""src"\s*:\s*"([^"]+\.m3u8[^"]*)""#).unwrap());
static API_HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href\s*=\s*["']([^"']*?/api/[^"']*)["']"#).unwrap());

pub struct Analyzer<'a> {
    pub http: &'a HttpContext,
    pub variant_selection: VariantSelection,
}

impl<'a> Analyzer<'a> {
    pub fn new(http: &'a HttpContext, variant_selection: VariantSelection) -> Self {
        Analyzer {
            http,
            variant_selection,
        }
    }

    /// Resolve `url` down to a playable [`Playlist`] (spec §4.6).
    pub async fn analyze(&self, url: &str) -> Result<Playlist, AnalyzerError> {
        let parsed = Url::parse(url).map_err(|e| AnalyzerError::InvalidUrl(e.to_string()))?;
        self.analyze_depth(parsed, 0).await
    }

    async fn analyze_depth(&self, url: Url, depth: u32) -> Result<Playlist, AnalyzerError> {
        if looks_like_m3u8(&url) {
            let text = self.fetch_text(&url).await?;
            let playlist = playlist::parse(&text, &url)?;
            return self.resolve_master(playlist, depth).await;
        }

        let candidates = self.discover_candidates(&url).await?;
        let mut tried = Vec::new();
        for candidate in &candidates {
            tried.push(candidate.to_string());
            let Ok(text) = self.fetch_text(candidate).await else {
                continue;
            };
            if let Ok(playlist) = playlist::parse(&text, candidate) {
                if depth + 1 < MAX_RECURSION_DEPTH {
                    if let Ok(resolved) = Box::pin(self.resolve_master(playlist, depth + 1)).await
                    {
                        return Ok(resolved);
                    }
                } else {
                    return Ok(playlist);
                }
            }
        }

        Err(AnalyzerError::NoMediaFound { tried })
    }

    /// If `playlist` is a Master, pick a variant per configuration and
    /// recurse once to fetch its media playlist.
    async fn resolve_master(
        &self,
        playlist: Playlist,
        depth: u32,
    ) -> Result<Playlist, AnalyzerError> {
        match playlist {
            Playlist::Media(_) => Ok(playlist),
            Playlist::Master(variants) => {
                if depth + 1 > MAX_RECURSION_DEPTH {
                    return Err(AnalyzerError::NoMediaFound {
                        tried: variants.iter().map(|v| v.absolute_uri.to_string()).collect(),
                    });
                }
                let chosen = select_variant(&variants, self.variant_selection)
                    .ok_or_else(|| AnalyzerError::NoMediaFound { tried: vec![] })?;
                let text = self.fetch_text(&chosen.absolute_uri).await?;
                let inner = playlist::parse(&text, &chosen.absolute_uri)?;
                Ok(inner)
            }
        }
    }

    async fn fetch_text(&self, url: &Url) -> Result<String, AnalyzerError> {
        let resp = self
            .http
            .client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.text().await?)
    }

    /// Scan an HTML page for M3U8 candidates (spec §4.6 step 2):
    /// `<script>` text, JSON `sources[].src` shapes, and `/api/`-path
    /// `href`s (fetched once and re-scanned).
    async fn discover_candidates(&self, url: &Url) -> Result<Vec<Url>, AnalyzerError> {
        let body = self.fetch_text(url).await?;
        let mut candidates = Vec::new();

        for m in M3U8_IN_TEXT.find_iter(&body) {
            push_unique(&mut candidates, m.as_str(), url);
        }
        for cap in JSON_SOURCE_SRC.captures_iter(&body) {
            push_unique(&mut candidates, &cap[1], url);
        }

        for cap in API_HREF.captures_iter(&body) {
            let api_url = match url.join(&cap[1]) {
                Ok(u) => u,
                Err(_) => continue,
            };
            let Ok(api_body) = self.fetch_text(&api_url).await else {
                continue;
            };
            for m in M3U8_IN_TEXT.find_iter(&api_body) {
                push_unique(&mut candidates, m.as_str(), url);
            }
        }

        Ok(candidates)
    }
}

fn push_unique(candidates: &mut Vec<Url>, raw: &str, base: &Url) {
    if let Ok(u) = base.join(raw) {
        if !candidates.contains(&u) {
            candidates.push(u);
        }
    }
}

fn looks_like_m3u8(url: &Url) -> bool {
    url.path().to_ascii_lowercase().ends_with(".m3u8")
}

fn select_variant(variants: &[Variant], selection: VariantSelection) -> Option<&Variant> {
    match selection {
        VariantSelection::HighestBandwidth => variants.iter().max_by_key(|v| v.bandwidth),
        VariantSelection::LowestBandwidth => variants.iter().min_by_key(|v| v.bandwidth),
        VariantSelection::ClosestTo(target) => variants
            .iter()
            .min_by_key(|v| v.bandwidth.abs_diff(target)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(bandwidth: u64) -> Variant {
        Variant {
            resolution: None,
            bandwidth,
            codec: None,
            absolute_uri: Url::parse("https://example.com/v.m3u8").unwrap(),
        }
    }

    #[test]
    fn highest_bandwidth_selection() {
        let variants = vec![variant(1_280_000), variant(2_560_000)];
        let chosen = select_variant(&variants, VariantSelection::HighestBandwidth).unwrap();
        assert_eq!(chosen.bandwidth, 2_560_000);
    }

    #[test]
    fn lowest_bandwidth_selection() {
        let variants = vec![variant(1_280_000), variant(2_560_000)];
        let chosen = select_variant(&variants, VariantSelection::LowestBandwidth).unwrap();
        assert_eq!(chosen.bandwidth, 1_280_000);
    }

    #[test]
    fn closest_to_selection() {
        let variants = vec![variant(1_280_000), variant(2_560_000), variant(900_000)];
        let chosen =
            select_variant(&variants, VariantSelection::ClosestTo(1_000_000)).unwrap();
        assert_eq!(chosen.bandwidth, 900_000);
    }

    #[test]
    fn detects_m3u8_url_by_path_suffix() {
        let url = Url::parse("https://example.com/stream/index.m3u8?token=abc").unwrap();
        assert!(looks_like_m3u8(&url));
        let url = Url::parse("https://example.com/watch?v=xyz").unwrap();
        assert!(!looks_like_m3u8(&url));
    }
}
