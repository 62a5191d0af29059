use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp used when a watermark has never advanced.
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now)
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Created,
    Active,
    Terminated,
    Failed,
    Completed,
    Cancelled,
    Paused,
}

impl AgentStatus {
    /// States from which a relaunch is allowed.
    pub fn is_relaunchable(self) -> bool {
        matches!(
            self,
            AgentStatus::Failed
                | AgentStatus::Completed
                | AgentStatus::Cancelled
                | AgentStatus::Paused
                | AgentStatus::Terminated
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Created => "created",
            AgentStatus::Active => "active",
            AgentStatus::Terminated => "terminated",
            AgentStatus::Failed => "failed",
            AgentStatus::Completed => "completed",
            AgentStatus::Cancelled => "cancelled",
            AgentStatus::Paused => "paused",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Worker,
    Background,
}

/// Capability tag every background agent carries.
pub const BACKGROUND_CAPABILITY: &str = "background-agent";

/// A supervised assistant process attached to one multiplexer session.
///
/// `token` is the worker's identity proof; it never appears in tool output
/// except through the token tools, which are admin-gated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub token: String,
    pub agent_id: String,
    pub kind: AgentKind,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub current_task: Option<String>,
    /// Objectives for background agents; `None` for workers.
    pub background_objectives: Option<Vec<String>>,
    pub working_directory: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn is_background(&self) -> bool {
        self.kind == AgentKind::Background
            || self.capabilities.iter().any(|c| c == BACKGROUND_CAPABILITY)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    /// `completed` is terminal: no further updates accepted.
    pub fn is_terminal(self) -> bool {
        self == TaskStatus::Completed
    }

    /// Valid transitions: pending → in_progress → completed | failed | cancelled.
    /// A pending task may also be cancelled or failed directly.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::InProgress)
            | (TaskStatus::Pending, TaskStatus::Cancelled)
            | (TaskStatus::Pending, TaskStatus::Failed)
            | (TaskStatus::InProgress, TaskStatus::Completed)
            | (TaskStatus::InProgress, TaskStatus::Failed)
            | (TaskStatus::InProgress, TaskStatus::Cancelled)
            | (TaskStatus::Failed, TaskStatus::Pending)
            | (TaskStatus::Failed, TaskStatus::InProgress)
            | (TaskStatus::Cancelled, TaskStatus::Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
        };
        write!(f, "{}", label)
    }
}

/// A node in the task graph.
///
/// `child_tasks` mirrors the `parent_task` pointers of its children;
/// `depends_on_tasks` edges must stay acyclic. `notes` is an opaque JSON
/// array whose appends are preserved in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub assigned_to: Option<String>,
    pub created_by: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub parent_task: Option<String>,
    pub child_tasks: Vec<String>,
    pub depends_on_tasks: Vec<String>,
    pub notes: Vec<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_id: impl Into<String>, title: impl Into<String>, created_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            title: title.into(),
            description: String::new(),
            assigned_to: None,
            created_by: created_by.into(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Medium,
            parent_task: None,
            child_tasks: Vec::new(),
            depends_on_tasks: Vec::new(),
            notes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentAction — append-only audit log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAction {
    pub id: i64,
    pub agent_id: String,
    pub action_type: String,
    pub task_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub details: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    AssistanceRequest,
    TaskUpdate,
    Notification,
    StopCommand,
    Broadcast,
    Announcement,
    SystemAlert,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MessageType::Text => "text",
            MessageType::AssistanceRequest => "assistance_request",
            MessageType::TaskUpdate => "task_update",
            MessageType::Notification => "notification",
            MessageType::StopCommand => "stop_command",
            MessageType::Broadcast => "broadcast",
            MessageType::Announcement => "announcement",
            MessageType::SystemAlert => "system_alert",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// How a message should reach its recipient. `Store` skips the live
/// delivery attempt; the recipient sees the message on its next poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    Store,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub message_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub timestamp: DateTime<Utc>,
    pub delivered: bool,
    pub read: bool,
}

// ---------------------------------------------------------------------------
// File locks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    InUse,
    Released,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLock {
    pub id: i64,
    pub filepath: String,
    pub agent_id: String,
    pub locked_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub status: LockState,
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// RAG
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Markdown,
    Context,
    Filemeta,
    Codefile,
    Task,
}

impl SourceType {
    pub const ALL: [SourceType; 5] = [
        SourceType::Markdown,
        SourceType::Context,
        SourceType::Filemeta,
        SourceType::Codefile,
        SourceType::Task,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Markdown => "markdown",
            SourceType::Context => "context",
            SourceType::Filemeta => "filemeta",
            SourceType::Codefile => "codefile",
            SourceType::Task => "task",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagChunk {
    pub id: i64,
    pub source_type: SourceType,
    pub source_ref: String,
    pub chunk_text: String,
    pub indexed_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Key→value containers (project context, file metadata, admin config)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub description: Option<String>,
    pub last_updated: DateTime<Utc>,
    pub updated_by: String,
}

// ---------------------------------------------------------------------------
// Transport sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    Active,
    Disconnected,
    Recovered,
    Expired,
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportStatus::Active => "active",
            TransportStatus::Disconnected => "disconnected",
            TransportStatus::Recovered => "recovered",
            TransportStatus::Expired => "expired",
        };
        write!(f, "{}", label)
    }
}

/// Persistence row for one JSON-RPC transport session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSessionRecord {
    pub session_id: String,
    pub state: serde_json::Value,
    pub status: TransportStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub grace_period_expires: Option<DateTime<Utc>>,
    pub recovery_attempts: i64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
