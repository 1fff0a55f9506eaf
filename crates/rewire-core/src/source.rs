use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::classifier::RawEvent;

/// Producer of raw window events.
///
/// Delivery is at-least-once and may contain duplicates; the classifier and
/// tracker are idempotent over repeats.
#[async_trait]
pub trait EventSource: Send {
    /// Next event, or `None` once the source is exhausted
    async fn next_event(&mut self) -> Result<Option<RawEvent>>;
}

/// Newline-delimited JSON `RawEvent`s. Blank lines and `#` comments are skipped,
/// malformed lines are logged and dropped.
pub struct JsonLinesSource<R> {
    lines: Lines<BufReader<R>>,
    line_no: usize,
}

impl<R: AsyncRead + Unpin + Send> JsonLinesSource<R> {
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            line_no: 0,
        }
    }
}

impl JsonLinesSource<tokio::fs::File> {
    /// Read events from a file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open event log {}", path.display()))?;
        Ok(Self::new(file))
    }
}

impl JsonLinesSource<tokio::io::Stdin> {
    #[must_use]
    pub fn stdin() -> Self {
        Self::new(tokio::io::stdin())
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> EventSource for JsonLinesSource<R> {
    async fn next_event(&mut self) -> Result<Option<RawEvent>> {
        while let Some(line) = self.lines.next_line().await.context("Failed to read event")? {
            self.line_no += 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match serde_json::from_str::<RawEvent>(line) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => log::warn!("Skipping malformed event on line {}: {e}", self.line_no),
            }
        }
        Ok(None)
    }
}

/// Pump a source into a channel until it ends or the receiver goes away
pub fn spawn_source(
    mut source: Box<dyn EventSource>,
    tx: mpsc::Sender<RawEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.next_event().await {
                Ok(Some(event)) => {
                    if tx.send(event).await.is_err() {
                        log::debug!("Event receiver closed");
                        break;
                    }
                }
                Ok(None) => {
                    log::info!("Event source exhausted");
                    break;
                }
                Err(e) => {
                    log::error!("Event source failed: {e}");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::EventKind;

    const LOG: &str = r#"
# warm-up
{"package":"com.google.android.youtube","kind":"window_state_changed","timestamp":"2024-05-01T20:00:00Z"}

not json
{"package":"com.android.chrome","kind":"window_content_changed","timestamp":"2024-05-01T20:00:01Z","address_bar":{"text":"reddit.com","focused":false}}
"#;

    #[tokio::test]
    async fn test_json_lines_skip_comments_and_garbage() {
        let mut source = JsonLinesSource::new(LOG.as_bytes());

        let first = source.next_event().await.unwrap().unwrap();
        assert_eq!(first.package, "com.google.android.youtube");
        assert_eq!(first.kind, EventKind::WindowStateChanged);
        assert!(first.address_bar.is_none());

        let second = source.next_event().await.unwrap().unwrap();
        assert_eq!(second.address_bar.map(|bar| bar.text).as_deref(), Some("reddit.com"));

        assert!(source.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spawned_source_feeds_channel() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = spawn_source(Box::new(JsonLinesSource::new(LOG.as_bytes())), tx);

        let mut packages = Vec::new();
        while let Some(event) = rx.recv().await {
            packages.push(event.package);
        }
        handle.await.unwrap();
        assert_eq!(packages, vec!["com.google.android.youtube", "com.android.chrome"]);
    }
}
