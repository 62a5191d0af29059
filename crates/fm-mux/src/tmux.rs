use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("tmux not found or not installed")]
    NotAvailable,
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("session '{0}' already exists")]
    SessionExists(String),
    #[error("tmux command failed: {0}")]
    CommandFailed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Multiplexer trait
// ---------------------------------------------------------------------------

/// The seam between the coordinator and the terminal multiplexer. The
/// manager, bus, and audit only see this trait; tests swap in a recording
/// implementation.
#[async_trait::async_trait]
pub trait Multiplexer: Send + Sync {
    /// Whether the multiplexer binary is reachable at all.
    async fn available(&self) -> bool;

    async fn session_exists(&self, name: &str) -> Result<bool, MuxError>;

    async fn create_session(&self, name: &str, cwd: &Path) -> Result<(), MuxError>;

    /// Send a shell line; Enter is appended in the same keystroke batch.
    async fn send_command(&self, name: &str, line: &str) -> Result<(), MuxError>;

    /// Two-phase prompt delivery: type the text, pause, then send Enter
    /// separately. A combined send races the attached assistant's input
    /// handling, so this split must not be collapsed by callers.
    async fn send_prompt(&self, name: &str, text: &str) -> Result<(), MuxError>;

    /// Send a single interrupt (C-c) keystroke.
    async fn send_interrupt(&self, name: &str) -> Result<(), MuxError>;

    async fn kill_session(&self, name: &str) -> Result<(), MuxError>;

    /// Names of all live sessions.
    async fn list_sessions(&self) -> Result<Vec<String>, MuxError>;
}

// ---------------------------------------------------------------------------
// TmuxMultiplexer
// ---------------------------------------------------------------------------

/// Production adapter shelling out to `tmux`.
pub struct TmuxMultiplexer {
    /// Pause between typing a prompt and sending Enter.
    prompt_delay: Duration,
}

impl TmuxMultiplexer {
    pub fn new() -> Self {
        Self {
            prompt_delay: Duration::from_millis(500),
        }
    }

    /// Shorter delays for tests that exercise the real binary.
    pub fn with_prompt_delay(prompt_delay: Duration) -> Self {
        Self { prompt_delay }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, MuxError> {
        let output = Command::new("tmux")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(MuxError::CommandFailed(stderr));
        }
        Ok(output)
    }
}

impl Default for TmuxMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Multiplexer for TmuxMultiplexer {
    async fn available(&self) -> bool {
        Command::new("tmux")
            .arg("-V")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn session_exists(&self, name: &str) -> Result<bool, MuxError> {
        match self.run(&["has-session", "-t", name]).await {
            Ok(_) => Ok(true),
            Err(MuxError::CommandFailed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_session(&self, name: &str, cwd: &Path) -> Result<(), MuxError> {
        if self.session_exists(name).await? {
            return Err(MuxError::SessionExists(name.to_string()));
        }
        let cwd = cwd.to_string_lossy();
        self.run(&["new-session", "-d", "-s", name, "-c", &cwd]).await?;
        tracing::debug!(session = name, "created tmux session");
        Ok(())
    }

    async fn send_command(&self, name: &str, line: &str) -> Result<(), MuxError> {
        if !self.session_exists(name).await? {
            return Err(MuxError::SessionNotFound(name.to_string()));
        }
        self.run(&["send-keys", "-t", name, line, "Enter"]).await?;
        Ok(())
    }

    async fn send_prompt(&self, name: &str, text: &str) -> Result<(), MuxError> {
        if !self.session_exists(name).await? {
            return Err(MuxError::SessionNotFound(name.to_string()));
        }
        // Phase one: type the prompt without submitting it.
        self.run(&["send-keys", "-t", name, text]).await?;
        tokio::time::sleep(self.prompt_delay).await;
        // Phase two: Enter on its own.
        self.run(&["send-keys", "-t", name, "Enter"]).await?;
        tracing::debug!(session = name, bytes = text.len(), "prompt delivered");
        Ok(())
    }

    async fn send_interrupt(&self, name: &str) -> Result<(), MuxError> {
        self.run(&["send-keys", "-t", name, "C-c"]).await?;
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<(), MuxError> {
        if !self.session_exists(name).await? {
            return Err(MuxError::SessionNotFound(name.to_string()));
        }
        self.run(&["kill-session", "-t", name]).await?;
        tracing::debug!(session = name, "killed tmux session");
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, MuxError> {
        let output = match self.run(&["list-sessions", "-F", "#{session_name}"]).await {
            Ok(output) => output,
            // No server running means no sessions, not a failure.
            Err(MuxError::CommandFailed(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = MuxError::SessionNotFound("w-1".into());
        assert_eq!(err.to_string(), "session 'w-1' not found");
        let err = MuxError::NotAvailable;
        assert!(err.to_string().contains("tmux"));
    }

    #[tokio::test]
    async fn availability_probe_does_not_error() {
        // Must return cleanly whether or not tmux is installed.
        let mux = TmuxMultiplexer::new();
        let _ = mux.available().await;
    }
}
