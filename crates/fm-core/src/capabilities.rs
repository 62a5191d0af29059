use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ToolCategory
// ---------------------------------------------------------------------------

/// The tool groups the capability gate can switch on or off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolCategory {
    Basic,
    Rag,
    Memory,
    AgentManagement,
    TaskManagement,
    FileManagement,
    AgentCommunication,
    SessionState,
    AssistanceRequest,
    BackgroundAgents,
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ToolCategory::Basic => "basic",
            ToolCategory::Rag => "rag",
            ToolCategory::Memory => "memory",
            ToolCategory::AgentManagement => "agentManagement",
            ToolCategory::TaskManagement => "taskManagement",
            ToolCategory::FileManagement => "fileManagement",
            ToolCategory::AgentCommunication => "agentCommunication",
            ToolCategory::SessionState => "sessionState",
            ToolCategory::AssistanceRequest => "assistanceRequest",
            ToolCategory::BackgroundAgents => "backgroundAgents",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// ToolCategories
// ---------------------------------------------------------------------------

/// Boot-time category map deciding which tool groups get registered.
/// `basic` cannot be switched off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolCategories {
    pub basic: bool,
    pub rag: bool,
    pub memory: bool,
    pub agent_management: bool,
    pub task_management: bool,
    pub file_management: bool,
    pub agent_communication: bool,
    pub session_state: bool,
    pub assistance_request: bool,
    pub background_agents: bool,
}

impl Default for ToolCategories {
    fn default() -> Self {
        Self::minimal()
    }
}

impl ToolCategories {
    /// Only the always-on basics.
    pub fn minimal() -> Self {
        Self {
            basic: true,
            rag: false,
            memory: false,
            agent_management: false,
            task_management: false,
            file_management: false,
            agent_communication: false,
            session_state: false,
            assistance_request: false,
            background_agents: false,
        }
    }

    /// Retrieval plus the key→value stores, nothing agent-shaped.
    pub fn memory_rag() -> Self {
        Self {
            rag: true,
            memory: true,
            session_state: true,
            ..Self::minimal()
        }
    }

    /// Everything on.
    pub fn full() -> Self {
        Self {
            basic: true,
            rag: true,
            memory: true,
            agent_management: true,
            task_management: true,
            file_management: true,
            agent_communication: true,
            session_state: true,
            assistance_request: true,
            background_agents: true,
        }
    }

    /// Background-agent operation without the hierarchical task surface.
    pub fn background() -> Self {
        Self {
            rag: true,
            memory: true,
            agent_communication: true,
            background_agents: true,
            ..Self::minimal()
        }
    }

    /// Look up a named preset.
    pub fn mode(name: &str) -> Option<Self> {
        match name {
            "minimal" => Some(Self::minimal()),
            "memoryRag" | "memory_rag" => Some(Self::memory_rag()),
            "full" => Some(Self::full()),
            "background" => Some(Self::background()),
            _ => None,
        }
    }

    /// Force the invariants that hold regardless of configuration.
    pub fn normalized(mut self) -> Self {
        self.basic = true;
        self
    }

    pub fn is_enabled(&self, category: ToolCategory) -> bool {
        match category {
            ToolCategory::Basic => true,
            ToolCategory::Rag => self.rag,
            ToolCategory::Memory => self.memory,
            ToolCategory::AgentManagement => self.agent_management,
            ToolCategory::TaskManagement => self.task_management,
            ToolCategory::FileManagement => self.file_management,
            ToolCategory::AgentCommunication => self.agent_communication,
            ToolCategory::SessionState => self.session_state,
            ToolCategory::AssistanceRequest => self.assistance_request,
            ToolCategory::BackgroundAgents => self.background_agents,
        }
    }

    pub fn enabled(&self) -> Vec<ToolCategory> {
        [
            ToolCategory::Basic,
            ToolCategory::Rag,
            ToolCategory::Memory,
            ToolCategory::AgentManagement,
            ToolCategory::TaskManagement,
            ToolCategory::FileManagement,
            ToolCategory::AgentCommunication,
            ToolCategory::SessionState,
            ToolCategory::AssistanceRequest,
            ToolCategory::BackgroundAgents,
        ]
        .into_iter()
        .filter(|c| self.is_enabled(*c))
        .collect()
    }

    /// Cross-category dependency warnings. Surfaced at boot, never
    /// auto-corrected.
    pub fn dependency_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.task_management && !self.agent_management {
            warnings.push("taskManagement is enabled without agentManagement: tasks can be created but no worker can be spawned for them".to_string());
        }
        if self.assistance_request && !self.agent_communication {
            warnings.push("assistanceRequest is enabled without agentCommunication: requests are stored but workers cannot poll replies".to_string());
        }
        if self.background_agents && !self.agent_management {
            warnings.push("backgroundAgents is enabled without agentManagement: background sessions cannot be audited".to_string());
        }
        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_is_always_on() {
        let gate = ToolCategories::minimal();
        assert!(gate.is_enabled(ToolCategory::Basic));

        let mut raw = ToolCategories::minimal();
        raw.basic = false;
        assert!(raw.normalized().basic);
        // Even unnormalized maps report basic as enabled.
        let mut off = ToolCategories::minimal();
        off.basic = false;
        assert!(off.is_enabled(ToolCategory::Basic));
    }

    #[test]
    fn modes_resolve_by_name() {
        assert_eq!(ToolCategories::mode("full"), Some(ToolCategories::full()));
        assert_eq!(ToolCategories::mode("memoryRag"), Some(ToolCategories::memory_rag()));
        assert!(ToolCategories::mode("nonsense").is_none());
    }

    #[test]
    fn dependency_warnings_do_not_mutate() {
        let mut gate = ToolCategories::minimal();
        gate.task_management = true;
        let warnings = gate.dependency_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("taskManagement"));
        // still disabled — warnings never auto-correct
        assert!(!gate.agent_management);
    }

    #[test]
    fn wire_format_is_camel_case() {
        let json = serde_json::to_string(&ToolCategories::minimal()).unwrap();
        assert!(json.contains("\"agentManagement\":false"));
        assert!(json.contains("\"basic\":true"));

        let parsed: ToolCategories = serde_json::from_str("{\"rag\":true}").unwrap();
        assert!(parsed.rag);
        assert!(!parsed.task_management);
    }

    #[test]
    fn enabled_list_matches_flags() {
        let gate = ToolCategories::background();
        let enabled = gate.enabled();
        assert!(enabled.contains(&ToolCategory::BackgroundAgents));
        assert!(enabled.contains(&ToolCategory::Basic));
        assert!(!enabled.contains(&ToolCategory::TaskManagement));
    }
}
