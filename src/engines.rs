//! Fallback snapshot engines that need no browser.
//!
//! `UrlFetchEngine` does a plain HTTP fetch (plus `file://` reads for local
//! fixtures) and `ShellEngine` delegates to an external command. Both honor
//! only the html/text/final_url core of the result; wait and capture policies
//! require a live page and are accepted but ignored.

use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use url::Url;

use pagesnap_core_types::{
    text::strip_html, BrowserEngine, CaptureOptions, EngineError, SnapshotResult, WaitPolicy,
};

/// Plain HTTP(S) fetch with redirect following; `file://` urls read from
/// the local filesystem.
#[derive(Clone, Debug, Default)]
pub struct UrlFetchEngine;

impl UrlFetchEngine {
    pub fn new() -> Self {
        Self
    }

    async fn fetch_file(&self, url: &Url) -> Result<SnapshotResult, EngineError> {
        let path = url
            .to_file_path()
            .map_err(|_| EngineError::InvalidUrl(format!("not a file path: {url}")))?;
        let started = Instant::now();
        let html = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| EngineError::Fetch(format!("read {}: {err}", path.display())))?;
        let load_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let text = strip_html(&html);
        Ok(SnapshotResult::bare(
            html,
            text,
            url.to_string(),
            Some(load_ms),
        ))
    }

    async fn fetch_http(&self, url: &Url) -> Result<SnapshotResult, EngineError> {
        let started = Instant::now();
        let response = reqwest::get(url.clone())
            .await
            .map_err(|err| EngineError::Fetch(err.to_string()))?;

        let status = i64::from(response.status().as_u16());
        let final_url = response.url().to_string();
        // "text/html; charset=utf-8" reports as "text/html"
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| {
                value
                    .split(';')
                    .next()
                    .unwrap_or(value)
                    .trim()
                    .to_ascii_lowercase()
            });

        let html = response
            .text()
            .await
            .map_err(|err| EngineError::Fetch(err.to_string()))?;
        let load_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let text = strip_html(&html);

        let mut result = SnapshotResult::bare(html, text, final_url, Some(load_ms));
        result.page_status = Some(status);
        result.page_content_type = content_type;
        Ok(result)
    }
}

#[async_trait]
impl BrowserEngine for UrlFetchEngine {
    async fn snapshot(
        &self,
        url: &str,
        _wait: Option<WaitPolicy>,
        _capture: Option<CaptureOptions>,
    ) -> Result<SnapshotResult, EngineError> {
        let parsed = Url::parse(url).map_err(|err| EngineError::InvalidUrl(err.to_string()))?;
        match parsed.scheme() {
            "file" => self.fetch_file(&parsed).await,
            "http" | "https" => self.fetch_http(&parsed).await,
            other => Err(EngineError::InvalidUrl(format!(
                "unsupported scheme: {other}"
            ))),
        }
    }
}

/// Runs a user-supplied command with `{url}` substituted and treats its
/// stdout as the page html. Useful behind proxies or for custom fetchers.
#[derive(Clone, Debug)]
pub struct ShellEngine {
    command_template: String,
}

impl ShellEngine {
    pub fn new(command_template: impl Into<String>) -> Self {
        Self {
            command_template: command_template.into(),
        }
    }
}

#[async_trait]
impl BrowserEngine for ShellEngine {
    async fn snapshot(
        &self,
        url: &str,
        _wait: Option<WaitPolicy>,
        _capture: Option<CaptureOptions>,
    ) -> Result<SnapshotResult, EngineError> {
        Url::parse(url).map_err(|err| EngineError::InvalidUrl(err.to_string()))?;
        let command = self.command_template.replace("{url}", url);

        let started = Instant::now();
        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .await
            .map_err(|err| EngineError::Fetch(format!("spawn failed: {err}")))?;
        let load_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(target: "shell-engine", %command, %stderr, "command failed");
            return Err(EngineError::Fetch(format!(
                "command exited with {}",
                output.status
            )));
        }

        let html = String::from_utf8_lossy(&output.stdout).into_owned();
        let text = strip_html(&html);
        Ok(SnapshotResult::bare(
            html,
            text,
            url.to_string(),
            Some(load_ms),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[tokio::test]
    async fn file_urls_read_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "<html><body><p>local fixture</p></body></html>").expect("write");
        let url = Url::from_file_path(file.path()).expect("file url");

        let engine = UrlFetchEngine::new();
        let result = engine
            .snapshot(url.as_str(), None, None)
            .await
            .expect("file fetch succeeds");
        assert!(result.html.contains("local fixture"));
        assert_eq!(result.text, "local fixture");
        assert_eq!(result.final_url, url.as_str());
        assert!(result.page_status.is_none());
    }

    #[tokio::test]
    async fn missing_files_surface_as_fetch_errors() {
        let engine = UrlFetchEngine::new();
        let err = engine
            .snapshot("file:///definitely/not/here.html", None, None)
            .await
            .expect_err("missing file fails");
        assert!(matches!(err, EngineError::Fetch(_)));
    }

    #[tokio::test]
    async fn unsupported_schemes_are_rejected() {
        let engine = UrlFetchEngine::new();
        let err = engine
            .snapshot("ftp://example.com/", None, None)
            .await
            .expect_err("ftp is not supported");
        assert!(matches!(err, EngineError::InvalidUrl(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_engine_captures_stdout() {
        let engine = ShellEngine::new("printf '<html><body>%s</body></html>' '{url}'");
        let result = engine
            .snapshot("https://example.com/", None, None)
            .await
            .expect("shell fetch succeeds");
        assert!(result.html.contains("https://example.com/"));
        assert_eq!(result.text, "https://example.com/");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_engine_reports_nonzero_exit() {
        let engine = ShellEngine::new("exit 3");
        let err = engine
            .snapshot("https://example.com/", None, None)
            .await
            .expect_err("nonzero exit fails");
        assert!(matches!(err, EngineError::Fetch(_)));
    }
}
