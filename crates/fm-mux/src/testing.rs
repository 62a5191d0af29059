//! In-memory multiplexer double for tests: records every call and keeps a
//! fake session inventory so lifecycle code can run without tmux.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use crate::tmux::{Multiplexer, MuxError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    Created { name: String, cwd: String },
    Command { name: String, line: String },
    Prompt { name: String, text: String },
    Interrupt { name: String },
    Killed { name: String },
}

#[derive(Default)]
pub struct RecordingMux {
    events: Mutex<Vec<MuxEvent>>,
    sessions: Mutex<BTreeSet<String>>,
    unavailable: bool,
    fail_creates: bool,
}

impl RecordingMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mux whose `available()` probe fails.
    pub fn offline() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// A mux where `create_session` errors, for exercising the
    /// agent-created-but-launch-failed path.
    pub fn failing_creates() -> Self {
        Self {
            fail_creates: true,
            ..Self::default()
        }
    }

    /// Pre-seed a live session (as if left over from an earlier run).
    pub fn seed_session(&self, name: &str) {
        self.sessions.lock().expect("sessions lock").insert(name.to_string());
    }

    pub fn events(&self) -> Vec<MuxEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn prompts_sent_to(&self, name: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MuxEvent::Prompt { name: n, text } if n == name => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn commands_sent_to(&self, name: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MuxEvent::Command { name: n, line } if n == name => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn interrupt_count(&self, name: &str) -> usize {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, MuxEvent::Interrupt { name: n } if n == name))
            .count()
    }

    fn record(&self, event: MuxEvent) {
        self.events.lock().expect("events lock").push(event);
    }
}

#[async_trait::async_trait]
impl Multiplexer for RecordingMux {
    async fn available(&self) -> bool {
        !self.unavailable
    }

    async fn session_exists(&self, name: &str) -> Result<bool, MuxError> {
        Ok(self.sessions.lock().expect("sessions lock").contains(name))
    }

    async fn create_session(&self, name: &str, cwd: &Path) -> Result<(), MuxError> {
        if self.fail_creates {
            return Err(MuxError::CommandFailed("simulated create failure".into()));
        }
        let mut sessions = self.sessions.lock().expect("sessions lock");
        if !sessions.insert(name.to_string()) {
            return Err(MuxError::SessionExists(name.to_string()));
        }
        drop(sessions);
        self.record(MuxEvent::Created {
            name: name.to_string(),
            cwd: cwd.to_string_lossy().into_owned(),
        });
        Ok(())
    }

    async fn send_command(&self, name: &str, line: &str) -> Result<(), MuxError> {
        if !self.session_exists(name).await? {
            return Err(MuxError::SessionNotFound(name.to_string()));
        }
        self.record(MuxEvent::Command {
            name: name.to_string(),
            line: line.to_string(),
        });
        Ok(())
    }

    async fn send_prompt(&self, name: &str, text: &str) -> Result<(), MuxError> {
        if !self.session_exists(name).await? {
            return Err(MuxError::SessionNotFound(name.to_string()));
        }
        self.record(MuxEvent::Prompt {
            name: name.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_interrupt(&self, name: &str) -> Result<(), MuxError> {
        self.record(MuxEvent::Interrupt {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<(), MuxError> {
        let removed = self.sessions.lock().expect("sessions lock").remove(name);
        if !removed {
            return Err(MuxError::SessionNotFound(name.to_string()));
        }
        self.record(MuxEvent::Killed {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, MuxError> {
        Ok(self.sessions.lock().expect("sessions lock").iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_lifecycle() {
        let mux = RecordingMux::new();
        mux.create_session("w-1", Path::new("/work")).await.unwrap();
        mux.send_command("w-1", "echo hi").await.unwrap();
        mux.send_prompt("w-1", "do the thing").await.unwrap();
        mux.kill_session("w-1").await.unwrap();

        let events = mux.events();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], MuxEvent::Created { .. }));
        assert!(!mux.session_exists("w-1").await.unwrap());
    }

    #[tokio::test]
    async fn send_to_missing_session_errors() {
        let mux = RecordingMux::new();
        assert!(mux.send_command("ghost", "ls").await.is_err());
        assert!(mux.send_prompt("ghost", "hi").await.is_err());
    }
}
