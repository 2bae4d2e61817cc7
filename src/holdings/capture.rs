//! Best-effort raw page capture.
//!
//! Every fetched page can be appended, untransformed, to one audit file per
//! refresh run. This path must never fail the refresh: the first IO error
//! disables the writer for the rest of the run.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub struct RawPageCapture {
    path: PathBuf,
    file: Option<File>,
}

impl RawPageCapture {
    /// Opens a capture file named `{symbol}_{UTC timestamp}.jsonl` under
    /// `dir`. Failure to open yields an inactive writer, not an error.
    pub async fn create(dir: &Path, token_symbol: &str) -> Self {
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let path = dir.join(format!("{token_symbol}_{stamp}.jsonl"));
        let file = match fs::create_dir_all(dir).await {
            Ok(()) => match OpenOptions::new().create(true).append(true).open(&path).await {
                Ok(file) => {
                    debug!("raw capture writing to {}", path.display());
                    Some(file)
                }
                Err(e) => {
                    warn!("raw capture disabled, cannot open {}: {e}", path.display());
                    None
                }
            },
            Err(e) => {
                warn!("raw capture disabled, cannot create {}: {e}", dir.display());
                None
            }
        };
        Self { path, file }
    }

    /// A writer that captures nothing, for runs with capture disabled.
    pub fn inactive() -> Self {
        Self {
            path: PathBuf::new(),
            file: None,
        }
    }

    /// Appends one raw page as a single line. Never fails the caller.
    pub async fn append(&mut self, raw_page: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let mut line = raw_page.trim_end().to_string();
        line.push('\n');
        if let Err(e) = file.write_all(line.as_bytes()).await {
            warn!(
                "raw capture disabled after write error on {}: {e}",
                self.path.display()
            );
            self.file = None;
        }
    }

    pub fn is_active(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_pages_to_named_file() {
        let dir = std::env::temp_dir().join(format!("holderscope-capture-{}", std::process::id()));
        let mut capture = RawPageCapture::create(&dir, "SAUCE").await;
        assert!(capture.is_active());
        capture.append(r#"{"balances":[]}"#).await;
        capture.append(r#"{"balances":[{"account":"0.0.1"}]}"#).await;

        let name = capture.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("SAUCE_"));
        assert!(name.ends_with(".jsonl"));

        let contents = tokio::fs::read_to_string(capture.path()).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn inactive_writer_swallows_appends() {
        let mut capture = RawPageCapture::inactive();
        assert!(!capture.is_active());
        capture.append("ignored").await;
    }
}
