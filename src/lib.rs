//! LocalChat agent: the client-side tool-calling loop for local
//! OpenAI-compatible LLM servers (llama.cpp, Ollama, vLLM).
//!
//! - `inference`: SSE parsing, delta normalization and one streamed call
//! - `agent_core`: tool execution, the loop controller, timing and transcript

pub mod agent_core;
pub mod inference;

#[cfg(test)]
pub(crate) mod test_support;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Platform data directory for LocalChat.
///
/// - macOS: `~/Library/Application Support/com.localchat.agent/`
/// - Windows: `{FOLDERID_RoamingAppData}\com.localchat.agent\`
/// - Linux: `$XDG_DATA_HOME/com.localchat.agent/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.localchat/` when none of these resolve.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("com.localchat.agent");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".localchat")
}

/// Log line format for [`init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global tracing subscriber, writing to `agent.log` in `log_dir`.
///
/// Previous logs are rotated first (`agent.log` → `.1` → `.2` → `.3`). The
/// filter comes from `RUST_LOG`, defaulting to `localchat_agent=info,warn`.
/// Returns the path of the active log file.
pub fn init_tracing(log_dir: &Path, format: LogFormat) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join("agent.log");
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let writer = FlushingWriter::new(log_file);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("localchat_agent=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(e) = installed {
        return Err(std::io::Error::other(format!("tracing already initialized: {e}")));
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== localchat-agent starting ==="
    );
    Ok(log_path)
}

/// Shift `agent.log` → `agent.log.1` → … → `.{keep}`, dropping the oldest.
/// Gaps in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let numbered = |i: u32| PathBuf::from(format!("{}.{i}", base_path.display()));

    let _ = std::fs::remove_file(numbered(keep));
    for i in (1..keep).rev() {
        let _ = std::fs::rename(numbered(i), numbered(i + 1));
    }
    if base_path.exists() {
        let _ = std::fs::rename(base_path, numbered(1));
    }
}

/// File writer that flushes after every write so log lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn locked(&self) -> std::io::Result<std::sync::MutexGuard<'_, std::fs::File>> {
        self.file
            .lock()
            .map_err(|e| std::io::Error::other(format!("log file lock poisoned: {e}")))
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self.locked()?;
        let n = file.write(buf)?;
        file.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.locked()?.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
