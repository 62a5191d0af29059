use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use fm_core::store::{CoreError, Store};
use fm_core::types::{AgentMessage, AgentStatus, DeliveryMethod, MessagePriority, MessageType};
use fm_mux::Multiplexer;

use crate::manager::AgentManager;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("unknown recipient '{0}'")]
    UnknownRecipient(String),
    #[error("unknown sender '{0}'")]
    UnknownSender(String),
}

// ---------------------------------------------------------------------------
// AdminNotifier
// ---------------------------------------------------------------------------

/// Delivery seam for the operator's own attached session. How that session
/// is found is the implementation's business; the bus only needs a yes/no.
#[async_trait::async_trait]
pub trait AdminNotifier: Send + Sync {
    async fn send_to_admin_session(&self, message: &str, urgency: &str) -> bool;
}

/// Default notifier: deliver to a tmux session named in the configuration,
/// report `false` when none is configured or the session is gone.
pub struct TmuxAdminNotifier {
    mux: Arc<dyn Multiplexer>,
    session: Option<String>,
}

impl TmuxAdminNotifier {
    pub fn new(mux: Arc<dyn Multiplexer>, session: Option<String>) -> Self {
        Self { mux, session }
    }
}

#[async_trait::async_trait]
impl AdminNotifier for TmuxAdminNotifier {
    async fn send_to_admin_session(&self, message: &str, urgency: &str) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        match self.mux.session_exists(session).await {
            Ok(true) => {}
            _ => return false,
        }
        match self.mux.send_prompt(session, message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session = %session, urgency, error = %e, "admin session delivery failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SendMessageParams {
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub delivery: DeliveryMethod,
}

#[derive(Debug, Clone)]
pub struct AssistanceParams {
    pub agent_id: String,
    pub task_id: Option<String>,
    pub description: String,
    pub urgency: MessagePriority,
    pub context: Option<String>,
    pub suggested_actions: Vec<String>,
    pub blocking: bool,
}

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

/// Persistence-first messaging between agents and the operator. Live
/// delivery through the multiplexer is always best-effort; a failed
/// attempt degrades to "stored only" and the recipient catches up on its
/// next poll.
pub struct MessageBus {
    store: Arc<Store>,
    manager: Arc<AgentManager>,
    mux: Arc<dyn Multiplexer>,
    admin_notifier: Arc<dyn AdminNotifier>,
    /// Spacing between the four stop-command interrupts.
    stop_spacing: Duration,
}

impl MessageBus {
    pub fn new(
        store: Arc<Store>,
        manager: Arc<AgentManager>,
        mux: Arc<dyn Multiplexer>,
        admin_notifier: Arc<dyn AdminNotifier>,
    ) -> Self {
        Self {
            store,
            manager,
            mux,
            admin_notifier,
            stop_spacing: Duration::from_secs(1),
        }
    }

    pub fn with_stop_spacing(mut self, spacing: Duration) -> Self {
        self.stop_spacing = spacing;
        self
    }

    async fn validate_party(&self, id: &str) -> Result<bool, CoreError> {
        if id == "admin" {
            return Ok(true);
        }
        Ok(self.store.get_agent(id).await?.is_some())
    }

    /// Store a message and, when asked, attempt live delivery.
    pub async fn send(&self, params: SendMessageParams) -> Result<AgentMessage, BusError> {
        if !self.validate_party(&params.sender_id).await? {
            return Err(BusError::UnknownSender(params.sender_id));
        }
        if !self.validate_party(&params.recipient_id).await? {
            return Err(BusError::UnknownRecipient(params.recipient_id));
        }

        let mut message = AgentMessage {
            message_id: Uuid::new_v4().simple().to_string(),
            sender_id: params.sender_id,
            recipient_id: params.recipient_id,
            content: params.content,
            message_type: params.message_type,
            priority: params.priority,
            timestamp: Utc::now(),
            delivered: false,
            read: false,
        };
        self.store.insert_message(&message).await?;

        if params.delivery == DeliveryMethod::Live {
            if self.try_live_delivery(&message).await {
                self.store.mark_message_delivered(&message.message_id).await?;
                message.delivered = true;
            }
        }
        Ok(message)
    }

    async fn try_live_delivery(&self, message: &AgentMessage) -> bool {
        if message.recipient_id == "admin" {
            let urgency = format!("{:?}", message.priority).to_lowercase();
            return self
                .admin_notifier
                .send_to_admin_session(&message.content, &urgency)
                .await;
        }
        let session = self.manager.session_for(&message.recipient_id);
        let block = format_message_block(message);
        match self.mux.send_prompt(&session, &block).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(
                    recipient = %message.recipient_id,
                    error = %e,
                    "live delivery failed, message stored only"
                );
                false
            }
        }
    }

    /// Admin-only stop: four interrupts, spaced out, fired at the target's
    /// session regardless of the recipient's recorded state.
    pub async fn send_stop(&self, sender_id: &str, agent_id: &str) -> Result<AgentMessage, BusError> {
        if self.store.get_agent(agent_id).await?.is_none() {
            return Err(BusError::UnknownRecipient(agent_id.to_string()));
        }

        let mut message = AgentMessage {
            message_id: Uuid::new_v4().simple().to_string(),
            sender_id: sender_id.to_string(),
            recipient_id: agent_id.to_string(),
            content: "STOP: cancel your current operation and wait for instructions.".to_string(),
            message_type: MessageType::StopCommand,
            priority: MessagePriority::Urgent,
            timestamp: Utc::now(),
            delivered: false,
            read: false,
        };
        self.store.insert_message(&message).await?;

        let session = self.manager.session_for(agent_id);
        let mut any_sent = false;
        for i in 0..4 {
            match self.mux.send_interrupt(&session).await {
                Ok(()) => any_sent = true,
                Err(e) => {
                    tracing::warn!(session = %session, attempt = i, error = %e, "stop interrupt failed")
                }
            }
            if i < 3 {
                tokio::time::sleep(self.stop_spacing).await;
            }
        }
        if any_sent {
            self.store.mark_message_delivered(&message.message_id).await?;
            message.delivered = true;
        }
        Ok(message)
    }

    /// Fan a message out to every active agent.
    pub async fn broadcast(
        &self,
        sender_id: &str,
        content: &str,
        priority: MessagePriority,
        delivery: DeliveryMethod,
    ) -> Result<Vec<AgentMessage>, BusError> {
        let recipients = self.store.list_agents(Some(AgentStatus::Active), None).await?;
        let mut sent = Vec::new();
        for agent in recipients {
            if agent.agent_id == sender_id {
                continue;
            }
            let message = self
                .send(SendMessageParams {
                    sender_id: sender_id.to_string(),
                    recipient_id: agent.agent_id,
                    content: content.to_string(),
                    message_type: MessageType::Broadcast,
                    priority,
                    delivery,
                })
                .await?;
            sent.push(message);
        }
        Ok(sent)
    }

    /// Assistance request: stored for the operator, pushed at their
    /// attached session when one can be found, and mirrored into the audit
    /// log with the message's own timestamp.
    pub async fn request_assistance(&self, params: AssistanceParams) -> Result<AgentMessage, BusError> {
        if self.store.get_agent(&params.agent_id).await?.is_none() {
            return Err(BusError::UnknownSender(params.agent_id));
        }

        let request_id = Uuid::new_v4().simple().to_string();
        let task = match &params.task_id {
            Some(task_id) => self.store.get_task(task_id).await?,
            None => None,
        };
        let block = format_assistance_block(&params, &request_id, task.as_ref().map(|t| t.title.as_str()));
        let urgency = format!("{:?}", params.urgency).to_lowercase();

        let timestamp = Utc::now();
        let mut message = AgentMessage {
            message_id: request_id.clone(),
            sender_id: params.agent_id.clone(),
            recipient_id: "admin".to_string(),
            content: block.clone(),
            message_type: MessageType::AssistanceRequest,
            priority: params.urgency,
            timestamp,
            delivered: false,
            read: false,
        };
        self.store.insert_message(&message).await?;
        self.store
            .log_action_at(
                &params.agent_id,
                "request_assistance",
                params.task_id.as_deref(),
                Some(serde_json::json!({
                    "request_id": request_id,
                    "urgency": urgency,
                    "blocking": params.blocking,
                })),
                timestamp,
            )
            .await?;

        if self.admin_notifier.send_to_admin_session(&block, &urgency).await {
            self.store.mark_message_delivered(&message.message_id).await?;
            message.delivered = true;
        }
        Ok(message)
    }

    pub async fn get_messages(
        &self,
        recipient_id: &str,
        unread_only: bool,
        limit: u32,
        mark_read: bool,
    ) -> Result<Vec<AgentMessage>, BusError> {
        Ok(self
            .store
            .get_messages(recipient_id, unread_only, limit, mark_read)
            .await?)
    }
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

fn format_message_block(message: &AgentMessage) -> String {
    format!(
        "[message {} from {} | {} | {:?}] {}",
        message.message_id, message.sender_id, message.message_type, message.priority, message.content
    )
}

fn format_assistance_block(
    params: &AssistanceParams,
    request_id: &str,
    task_title: Option<&str>,
) -> String {
    let mut lines = vec![
        "=== ASSISTANCE REQUEST ===".to_string(),
        format!("agent: {}", params.agent_id),
        format!("request_id: {}", request_id),
        format!("urgency: {:?}", params.urgency).to_lowercase(),
        format!("blocking: {}", params.blocking),
    ];
    if let Some(task_id) = &params.task_id {
        match task_title {
            Some(title) => lines.push(format!("task: {} ({})", task_id, title)),
            None => lines.push(format!("task: {}", task_id)),
        }
    }
    lines.push(format!("description: {}", params.description));
    if let Some(context) = &params.context {
        lines.push(format!("context: {}", context));
    }
    if !params.suggested_actions.is_empty() {
        lines.push(format!("suggested: {}", params.suggested_actions.join("; ")));
    }
    lines.push(format!(
        "reply with: send_agent_message(recipient_id=\"{}\", ...) or relaunch_agent(\"{}\")",
        params.agent_id, params.agent_id
    ));
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::CreateAgentParams;
    use crate::test_support::{manager_with, seed_tasks};
    use fm_mux::testing::RecordingMux;
    use std::sync::Mutex;

    struct RecordingNotifier {
        accept: bool,
        delivered: Mutex<Vec<(String, String)>>,
    }

    impl RecordingNotifier {
        fn accepting() -> Self {
            Self { accept: true, delivered: Mutex::new(Vec::new()) }
        }

        fn rejecting() -> Self {
            Self { accept: false, delivered: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait::async_trait]
    impl AdminNotifier for RecordingNotifier {
        async fn send_to_admin_session(&self, message: &str, urgency: &str) -> bool {
            self.delivered
                .lock()
                .expect("delivered lock")
                .push((message.to_string(), urgency.to_string()));
            self.accept
        }
    }

    async fn bus_with(
        mux: Arc<RecordingMux>,
        notifier: Arc<RecordingNotifier>,
    ) -> (MessageBus, Arc<AgentManager>) {
        let manager = manager_with(mux.clone()).await;
        let bus = MessageBus::new(manager.store().clone(), manager.clone(), mux, notifier)
            .with_stop_spacing(Duration::ZERO);
        (bus, manager)
    }

    async fn spawn(manager: &AgentManager, id: &str, task: &str) {
        manager
            .create_agent(CreateAgentParams {
                agent_id: id.into(),
                capabilities: vec![],
                task_ids: vec![task.into()],
                working_directory: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn live_delivery_marks_delivered() {
        let mux = Arc::new(RecordingMux::new());
        let (bus, manager) = bus_with(mux.clone(), Arc::new(RecordingNotifier::accepting())).await;
        seed_tasks(&manager, &["t1", "t2"]).await;
        spawn(&manager, "worker-1", "t1").await;
        spawn(&manager, "worker-2", "t2").await;

        let message = bus
            .send(SendMessageParams {
                sender_id: "worker-1".into(),
                recipient_id: "worker-2".into(),
                content: "lock released on /p/x.js".into(),
                message_type: MessageType::Text,
                priority: MessagePriority::Normal,
                delivery: DeliveryMethod::Live,
            })
            .await
            .unwrap();

        assert!(message.delivered);
        let prompts = mux.prompts_sent_to("worker_2-cdef");
        assert!(prompts.iter().any(|p| p.contains("lock released")));
    }

    #[tokio::test]
    async fn dead_session_degrades_to_stored() {
        let mux = Arc::new(RecordingMux::new());
        let (bus, manager) = bus_with(mux.clone(), Arc::new(RecordingNotifier::accepting())).await;
        seed_tasks(&manager, &["t1", "t2"]).await;
        spawn(&manager, "worker-1", "t1").await;
        spawn(&manager, "worker-2", "t2").await;
        mux.kill_session("worker_2-cdef").await.unwrap();

        let message = bus
            .send(SendMessageParams {
                sender_id: "worker-1".into(),
                recipient_id: "worker-2".into(),
                content: "hello".into(),
                message_type: MessageType::Text,
                priority: MessagePriority::Normal,
                delivery: DeliveryMethod::Live,
            })
            .await
            .unwrap();

        assert!(!message.delivered);
        // Stored for the next poll regardless.
        let pending = bus.get_messages("worker-2", true, 10, false).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn unknown_recipient_rejected() {
        let mux = Arc::new(RecordingMux::new());
        let (bus, manager) = bus_with(mux, Arc::new(RecordingNotifier::accepting())).await;
        seed_tasks(&manager, &["t1"]).await;
        spawn(&manager, "worker-1", "t1").await;

        let err = bus
            .send(SendMessageParams {
                sender_id: "worker-1".into(),
                recipient_id: "nobody".into(),
                content: "hi".into(),
                message_type: MessageType::Text,
                priority: MessagePriority::Normal,
                delivery: DeliveryMethod::Store,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::UnknownRecipient(_)));
    }

    #[tokio::test]
    async fn stop_sends_four_interrupts() {
        let mux = Arc::new(RecordingMux::new());
        let (bus, manager) = bus_with(mux.clone(), Arc::new(RecordingNotifier::accepting())).await;
        seed_tasks(&manager, &["t1"]).await;
        spawn(&manager, "worker-1", "t1").await;

        let message = bus.send_stop("admin", "worker-1").await.unwrap();
        assert!(message.delivered);
        assert_eq!(message.message_type, MessageType::StopCommand);
        assert_eq!(mux.interrupt_count("worker_1-cdef"), 4);
    }

    #[tokio::test]
    async fn broadcast_reaches_active_agents_only() {
        let mux = Arc::new(RecordingMux::new());
        let (bus, manager) = bus_with(mux.clone(), Arc::new(RecordingNotifier::accepting())).await;
        seed_tasks(&manager, &["t1", "t2", "t3"]).await;
        spawn(&manager, "worker-1", "t1").await;
        spawn(&manager, "worker-2", "t2").await;
        spawn(&manager, "worker-3", "t3").await;
        manager.mark_active("worker-1").await.unwrap();
        manager.mark_active("worker-2").await.unwrap();
        manager
            .store()
            .update_agent_status("worker-3", AgentStatus::Paused)
            .await
            .unwrap();

        let sent = bus
            .broadcast("admin", "deploy frozen until further notice", MessagePriority::High, DeliveryMethod::Store)
            .await
            .unwrap();
        let recipients: Vec<&str> = sent.iter().map(|m| m.recipient_id.as_str()).collect();
        assert_eq!(recipients.len(), 2);
        assert!(recipients.contains(&"worker-1"));
        assert!(recipients.contains(&"worker-2"));
    }

    #[tokio::test]
    async fn assistance_request_correlates_audit_row() {
        let mux = Arc::new(RecordingMux::new());
        let notifier = Arc::new(RecordingNotifier::accepting());
        let (bus, manager) = bus_with(mux, notifier.clone()).await;
        seed_tasks(&manager, &["t1"]).await;
        spawn(&manager, "worker-1", "t1").await;

        let message = bus
            .request_assistance(AssistanceParams {
                agent_id: "worker-1".into(),
                task_id: Some("t1".into()),
                description: "merge conflict I cannot resolve".into(),
                urgency: MessagePriority::High,
                context: Some("branch feature/x".into()),
                suggested_actions: vec!["review the diff".into()],
                blocking: true,
            })
            .await
            .unwrap();

        assert!(message.delivered);
        assert!(message.content.contains("ASSISTANCE REQUEST"));
        assert!(message.content.contains("worker-1"));
        assert!(message.content.contains("review the diff"));

        // The audit row carries the exact message timestamp.
        let actions = manager.store().list_actions("worker-1", 10).await.unwrap();
        let action = actions.iter().find(|a| a.action_type == "request_assistance").unwrap();
        assert_eq!(action.timestamp, message.timestamp);
        assert_eq!(action.task_id.as_deref(), Some("t1"));

        let delivered = notifier.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1, "high");
    }

    #[tokio::test]
    async fn assistance_without_admin_session_stays_stored() {
        let mux = Arc::new(RecordingMux::new());
        let (bus, manager) = bus_with(mux, Arc::new(RecordingNotifier::rejecting())).await;
        seed_tasks(&manager, &["t1"]).await;
        spawn(&manager, "worker-1", "t1").await;

        let message = bus
            .request_assistance(AssistanceParams {
                agent_id: "worker-1".into(),
                task_id: None,
                description: "stuck".into(),
                urgency: MessagePriority::Normal,
                context: None,
                suggested_actions: vec![],
                blocking: false,
            })
            .await
            .unwrap();

        assert!(!message.delivered);
        let inbox = bus.get_messages("admin", true, 10, false).await.unwrap();
        assert_eq!(inbox.len(), 1);
    }
}
