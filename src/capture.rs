//! Continuous capture of QR payloads from the scan history store.
//!
//! The loop polls the store for rows past a watermark, decodes each row into
//! the session buffer and flushes the buffer to a log file once no new rows
//! have arrived for the inactivity window. A shutdown request interrupts the
//! poll sleep, an in-flight query or a running decode and triggers one final
//! flush.
//!
//! The watermark starts at the store's max id, so rows that predate the
//! process are never replayed. It is advanced before a row is decoded: a row
//! that fails to decode is reported once and never retried.

use crate::config::{CaptureConfig, Config};
use crate::flush::{FlushError, LogWriter};
use crate::frame::FrameDecoder;
use crate::session::SessionBuffer;
use crate::shutdown::Shutdown;
use crate::store::{PayloadRecord, ScanStore, StoreError};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome of one batch of rows.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub decoded: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Capture {
    timing: CaptureConfig,
    store: ScanStore,
    decoder: FrameDecoder,
    writer: LogWriter,
    buffer: SessionBuffer,
    watermark: i64,
    /// Earliest time a failed flush may be retried.
    flush_retry_at: Option<Instant>,
}

impl Capture {
    /// Connect to the store and position the watermark at its current end.
    ///
    /// This is the only fatal error path of monitoring mode.
    pub async fn start(config: &Config) -> Result<Self, StoreError> {
        let store = ScanStore::new(config.store.clone());
        let watermark = store.connect().await?;
        info!(path = %store.path().display(), watermark, "connected to scan history");

        Ok(Self {
            timing: config.capture.clone(),
            store,
            decoder: FrameDecoder::new(&config.decompressor),
            writer: LogWriter::new(&config.output),
            buffer: SessionBuffer::new(Instant::now()),
            watermark,
            flush_retry_at: None,
        })
    }

    pub fn watermark(&self) -> i64 {
        self.watermark
    }

    pub fn buffer(&self) -> &SessionBuffer {
        &self.buffer
    }

    /// Fetch rows past the watermark. Does not advance it.
    pub async fn poll(&self) -> Result<Vec<PayloadRecord>, StoreError> {
        self.store.rows_after(self.watermark).await
    }

    /// Decode a batch into the session buffer, in ascending id order.
    ///
    /// Stops early once `shutdown` fires. A decode cut short that way counts
    /// as failed, and rows after it are left unconsumed.
    pub async fn ingest(
        &mut self,
        rows: Vec<PayloadRecord>,
        shutdown: &mut Shutdown,
    ) -> IngestStats {
        let mut stats = IngestStats::default();
        let count = rows.len();

        for row in rows {
            if shutdown.is_triggered() {
                break;
            }
            // Rows at or below the watermark were already consumed.
            if row.id <= self.watermark {
                debug!(id = row.id, watermark = self.watermark, "ignoring replayed row");
                continue;
            }
            self.watermark = row.id;

            let Some(raw) = row.raw else {
                warn!(id = row.id, "row has no raw content, skipping");
                stats.skipped += 1;
                continue;
            };

            let decoded = tokio::select! {
                biased;
                _ = shutdown.triggered() => None,
                res = self.decoder.decode(raw) => Some(res),
            };
            let Some(decoded) = decoded else {
                warn!(id = row.id, "shutdown requested, abandoning decode");
                stats.failed += 1;
                break;
            };

            match decoded {
                Ok(text) => {
                    debug!(id = row.id, len = text.len(), timestamp = ?row.timestamp, "decoded row");
                    self.buffer.push(text, Instant::now());
                    stats.decoded += 1;
                }
                Err(e) if e.is_environmental() => {
                    error!(id = row.id, error = %e, "decompressor failure");
                    stats.failed += 1;
                }
                Err(e) => {
                    warn!(id = row.id, error = %e, "skipping undecodable row");
                    stats.failed += 1;
                }
            }
        }

        if count > 0 {
            info!(
                rows = count,
                decoded = stats.decoded,
                skipped = stats.skipped,
                failed = stats.failed,
                watermark = self.watermark,
                "processed new rows"
            );
        }
        stats
    }

    /// One poll + decode cycle. Returns the number of new rows seen.
    pub async fn poll_once(&mut self) -> Result<usize, StoreError> {
        let rows = self.poll().await?;
        let count = rows.len();
        self.ingest(rows, &mut Shutdown::never()).await;
        Ok(count)
    }

    /// Whether the session should be flushed after a poll that found
    /// `new_rows` rows.
    pub fn flush_due(&self, new_rows: usize, now: Instant) -> bool {
        !self.buffer.is_empty()
            && new_rows == 0
            && self.buffer.idle_for(now) > self.timing.inactivity()
            && self.flush_retry_at.is_none_or(|at| now >= at)
    }

    /// Write the session to a log file. The buffer is cleared only when the
    /// write succeeds. After a failure `flush_due` holds off for the error
    /// backoff before the next attempt.
    pub fn flush(&mut self, now: Instant) -> Result<Option<PathBuf>, FlushError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let path = match self.writer.flush(&self.buffer.contents()) {
            Ok(path) => path,
            Err(e) => {
                self.flush_retry_at = Some(now + self.timing.error_backoff());
                return Err(e);
            }
        };
        info!(path = %path.display(), fragments = self.buffer.len(), "session complete");
        self.buffer.clear(now);
        self.flush_retry_at = None;
        Ok(Some(path))
    }

    /// Final flush on shutdown. If the write fails the session text goes to
    /// stdout instead of being dropped.
    pub fn flush_on_shutdown(&mut self) -> Option<PathBuf> {
        if self.buffer.is_empty() {
            return None;
        }
        match self.flush(Instant::now()) {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, "final flush failed, dumping session to stdout");
                let text = self.buffer.contents();
                let mut stdout = std::io::stdout().lock();
                if let Err(e) = stdout.write_all(text.as_bytes()).and_then(|()| stdout.flush()) {
                    error!(error = %e, "failed to dump session");
                }
                self.buffer.clear(Instant::now());
                None
            }
        }
    }

    /// Run until `shutdown` fires, then flush whatever is buffered.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        info!(
            log_dir = %self.writer.dir().display(),
            poll_ms = self.timing.poll_interval_ms,
            inactivity_ms = self.timing.inactivity_ms,
            "capture loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                _ = tokio::time::sleep(self.timing.poll_interval()) => {}
            }

            let polled = tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                res = self.poll() => res,
            };

            let rows = match polled {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff_ms = self.timing.error_backoff_ms,
                        "store query failed, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.triggered() => break,
                        _ = tokio::time::sleep(self.timing.error_backoff()) => {}
                    }
                    continue;
                }
            };

            let new_rows = rows.len();
            self.ingest(rows, &mut shutdown).await;
            if shutdown.is_triggered() {
                break;
            }

            let now = Instant::now();
            if self.flush_due(new_rows, now)
                && let Err(e) = self.flush(now)
            {
                warn!(
                    error = %e,
                    fragments = self.buffer.len(),
                    retry_ms = self.timing.error_backoff_ms,
                    "flush failed, keeping session"
                );
            }
        }

        info!(fragments = self.buffer.len(), "capture loop stopping");
        if let Some(path) = self.flush_on_shutdown() {
            info!(path = %path.display(), "final session flushed");
        }
    }
}
