//! User-visible progress output
//!
//! [`ProgressReporter`] is the caller-visible sink a transfer writes its
//! progress to. Diagnostics go through `tracing`; this is only what an
//! operator watching a move should see.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

#[derive(Clone)]
pub struct ProgressReporter {
    pub verbose: bool,
    quiet: bool,
    sink: Sink,
}

impl ProgressReporter {
    pub fn new(verbose: bool) -> Self {
        Self::to_writer(io::stdout(), verbose)
    }

    pub fn new_quiet() -> Self {
        Self {
            verbose: false,
            quiet: true,
            sink: Arc::new(Mutex::new(Box::new(io::sink()))),
        }
    }

    pub fn to_writer(writer: impl Write + Send + 'static, verbose: bool) -> Self {
        Self {
            verbose,
            quiet: false,
            sink: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    fn line(&self, text: &str) {
        if self.quiet {
            return;
        }
        // Progress output is best effort; a closed pipe must not fail a transfer.
        if let Ok(mut sink) = self.sink.lock() {
            let _ = writeln!(sink, "{}", text);
            let _ = sink.flush();
        }
    }

    pub fn section(&self, title: &str) {
        self.line(&format!("\n=== {} ===", title));
    }

    pub fn info(&self, message: &str) {
        self.line(message);
    }

    pub fn step(&self, message: &str) {
        self.line(&format!("  {}", message));
    }

    pub fn success(&self, message: &str) {
        self.line(&format!("OK {}", message));
    }

    pub fn warning(&self, message: &str) {
        self.line(&format!("WARNING: {}", message));
    }

    /// Only shown in verbose mode.
    pub fn detail(&self, message: &str) {
        if self.verbose {
            self.line(&format!("    {}", message));
        }
    }

    pub fn format_size(&self, bytes: u64) -> String {
        format_size(bytes)
    }

    pub fn format_duration(&self, duration: Duration) -> String {
        format_duration(duration)
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("verbose", &self.verbose)
            .field("quiet", &self.quiet)
            .finish()
    }
}

/// Format file size in human-readable units
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}.{:01}s", secs, duration.subsec_millis() / 100)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// In-memory sink whose contents can be read back, e.g. by tests or by an
/// embedding front end that returns the transfer log in its response.
#[derive(Clone, Default)]
pub struct BufferSink {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        match self.inner.lock() {
            Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
        }
    }
}

impl Write for BufferSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("buffer sink poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_only_in_verbose_mode() {
        let sink = BufferSink::new();
        let reporter = ProgressReporter::to_writer(sink.clone(), false);
        reporter.info("copying");
        reporter.detail("layer 1");
        assert_eq!(sink.contents(), "copying\n");

        let sink = BufferSink::new();
        let reporter = ProgressReporter::to_writer(sink.clone(), true);
        reporter.detail("layer 1");
        assert!(sink.contents().contains("layer 1"));
    }

    #[test]
    fn quiet_reporter_writes_nothing() {
        let reporter = ProgressReporter::new_quiet();
        reporter.info("ignored");
        reporter.warning("ignored");
    }

    #[test]
    fn sizes_and_durations() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h2m5s");
    }
}
