//! Skill packaging, discovery, and activation.
//!
//! A [`Skill`] is a packaged capability that manifests in one of three
//! forms when activated for a task:
//!
//! - **Form 1 — Instruction**: the skill's instructions are injected into
//!   the system prompt (first iteration only).
//! - **Form 2 — Compilation**: the skill's scripted actions are compiled
//!   into tool definitions and registered with the local function-tool
//!   protocol, appearing in the tool list from the next iteration on.
//! - **Form 3 — Instantiation**: a specialized sub-agent node template is
//!   produced, kept for later delegation.
//!
//! Discovery is progressive and mode-dependent
//! ([`SkillActivationMode`](crate::config::SkillActivationMode)):
//! `explicit` activates only configured skills, `hybrid` adds rule-based
//! candidates (keyword triggers against the task content) with an optional
//! LLM filter, and `auto` relies on LLM-driven discovery, falling back to
//! rules when no discovery client is attached.
//!
//! Candidates are filtered fail-closed by `required_tools`: a skill whose
//! required tools are missing from the registry is never activated.
//! Every activation publishes a `skill.activate` event.

use crate::agentmesh::client_wrapper::{Message, Role, SharedClient, StreamChunk};
use crate::agentmesh::config::{AgentConfig, SkillActivationMode};
use crate::agentmesh::error::BoxError;
use crate::agentmesh::event::{Event, EventType};
use crate::agentmesh::event_bus::EventBus;
use crate::agentmesh::task::Task;
use crate::agentmesh::tool_protocol::{ToolMetadata, ToolRegistry};
use crate::agentmesh::tool_protocols::{FunctionToolProtocol, ToolFunction};
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// The three activation forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillForm {
    /// Inject instructions into the system prompt.
    Instruction,
    /// Compile scripted actions into registered tools.
    Compilation,
    /// Instantiate a specialized sub-agent node.
    Instantiation,
}

/// An executable action a Form-2 skill compiles into a tool.
#[derive(Clone)]
pub struct ScriptedAction {
    /// Tool metadata the action registers under.
    pub metadata: ToolMetadata,
    /// The action body.
    pub function: ToolFunction,
}

/// Template for a Form-3 specialized sub-agent.
///
/// Carries all four configuration-inheritance channels: a child spawned
/// from the template gets `(parent.enabled_skills ∪ add_skills) \
/// remove_skills` and the same algebra over tools.
#[derive(Debug, Clone, Default)]
pub struct NodeTemplate {
    /// System prompt configuring the specialized node.
    pub system_prompt: String,
    /// Skills enabled beyond the parent's set.
    pub add_skills: Vec<String>,
    /// Parent skills withheld from the node.
    pub remove_skills: Vec<String>,
    /// Extra tools granted to the node.
    pub add_tools: Vec<String>,
    /// Parent tools withheld from the node.
    pub remove_tools: Vec<String>,
}

impl NodeTemplate {
    /// Create a template with the given system prompt and no capability
    /// changes.
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            ..Self::default()
        }
    }

    /// Enable extra skills on nodes spawned from this template.
    pub fn adding_skills(mut self, skills: Vec<&str>) -> Self {
        self.add_skills = skills.into_iter().map(String::from).collect();
        self
    }

    /// Withhold parent skills from nodes spawned from this template.
    pub fn removing_skills(mut self, skills: Vec<&str>) -> Self {
        self.remove_skills = skills.into_iter().map(String::from).collect();
        self
    }

    /// Grant extra tools to nodes spawned from this template.
    pub fn adding_tools(mut self, tools: Vec<&str>) -> Self {
        self.add_tools = tools.into_iter().map(String::from).collect();
        self
    }

    /// Withhold parent tools from nodes spawned from this template.
    pub fn removing_tools(mut self, tools: Vec<&str>) -> Self {
        self.remove_tools = tools.into_iter().map(String::from).collect();
        self
    }
}

/// A node produced by a Form-3 activation, held for later delegation.
#[derive(Debug, Clone)]
pub struct InstantiatedNode {
    /// Generated node id (`<skill>-<uuid8>`).
    pub node_id: String,
    /// The originating skill.
    pub skill: String,
    /// System prompt for the node.
    pub system_prompt: String,
    /// Skills enabled beyond the parent's set.
    pub add_skills: Vec<String>,
    /// Parent skills withheld from the node.
    pub remove_skills: Vec<String>,
    /// Extra tools granted to the node.
    pub add_tools: Vec<String>,
    /// Parent tools withheld from the node.
    pub remove_tools: Vec<String>,
}

/// A packaged capability.
#[derive(Clone)]
pub struct Skill {
    /// Unique skill name.
    pub name: String,
    /// One-line description used for LLM-driven discovery.
    pub description: String,
    /// Instructions injected on activation (all forms carry some).
    pub instructions: String,
    /// How the skill manifests.
    pub form: SkillForm,
    /// Tools that must exist in the registry for activation (fail-closed).
    pub required_tools: Vec<String>,
    /// Keyword triggers for rule-based discovery.
    pub keywords: Vec<String>,
    /// Prompt priority of the injected instructions (MEDIUM..HIGH).
    pub priority: u8,
    /// Scripted actions (Form 2).
    pub actions: Vec<ScriptedAction>,
    /// Sub-agent template (Form 3).
    pub node_template: Option<NodeTemplate>,
}

impl Skill {
    /// Create a Form-1 instruction skill.
    pub fn instruction(
        name: impl Into<String>,
        description: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            instructions: instructions.into(),
            form: SkillForm::Instruction,
            required_tools: Vec::new(),
            keywords: Vec::new(),
            priority: 60,
            actions: Vec::new(),
            node_template: None,
        }
    }

    /// Create a Form-2 compilation skill from scripted actions.
    pub fn compilation(
        name: impl Into<String>,
        description: impl Into<String>,
        actions: Vec<ScriptedAction>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            instructions: String::new(),
            form: SkillForm::Compilation,
            required_tools: Vec::new(),
            keywords: Vec::new(),
            priority: 60,
            actions,
            node_template: None,
        }
    }

    /// Create a Form-3 instantiation skill from a node template.
    pub fn instantiation(
        name: impl Into<String>,
        description: impl Into<String>,
        template: NodeTemplate,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            instructions: String::new(),
            form: SkillForm::Instantiation,
            required_tools: Vec::new(),
            keywords: Vec::new(),
            priority: 60,
            actions: Vec::new(),
            node_template: Some(template),
        }
    }

    /// Add rule-based discovery keywords (builder pattern).
    pub fn with_keywords(mut self, keywords: Vec<&str>) -> Self {
        self.keywords = keywords.into_iter().map(String::from).collect();
        self
    }

    /// Declare tools the skill depends on (builder pattern).
    pub fn with_required_tools(mut self, tools: Vec<&str>) -> Self {
        self.required_tools = tools.into_iter().map(String::from).collect();
        self
    }

    /// Override the instruction priority (builder pattern).
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    fn matches_rules(&self, task_content: &str) -> bool {
        let lowered = task_content.to_lowercase();
        self.keywords.iter().any(|k| lowered.contains(&k.to_lowercase()))
    }
}

/// Process-wide skill registry.
///
/// Registered during initialization, then effectively read-only; per-task
/// activation state lives on the agent, not here.
pub struct SkillRegistry {
    skills: HashMap<String, Arc<Skill>>,
}

impl SkillRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            skills: HashMap::new(),
        }
    }

    /// Register a skill; replaces any existing skill of the same name.
    pub fn register(&mut self, skill: Skill) {
        self.skills.insert(skill.name.clone(), Arc::new(skill));
    }

    /// Register a skill (builder pattern).
    pub fn with_skill(mut self, skill: Skill) -> Self {
        self.register(skill);
        self
    }

    /// Borrow a skill by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Skill>> {
        self.skills.get(name)
    }

    /// All registered skills, sorted by name.
    pub fn list(&self) -> Vec<&Arc<Skill>> {
        let mut out: Vec<&Arc<Skill>> = self.skills.values().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of activating skills for one task.
#[derive(Default)]
pub struct SkillActivation {
    /// Form-1 instruction blocks, with their prompt priority.
    pub injected_instructions: Vec<(String, String, u8)>,
    /// Names of tools compiled and registered by Form-2 skills.
    pub compiled_tools: Vec<String>,
    /// Form-3 node templates instantiated for later delegation.
    pub instantiated_nodes: Vec<InstantiatedNode>,
}

/// Discovers and activates skills for tasks.
pub struct SkillActivator {
    registry: Arc<SkillRegistry>,
    tools: Arc<RwLock<ToolRegistry>>,
    compile_protocol: Arc<FunctionToolProtocol>,
    bus: Arc<EventBus>,
    discovery_client: Option<SharedClient>,
}

impl SkillActivator {
    /// Create an activator over the skill registry and tool registry.
    ///
    /// `compile_protocol` is the local function protocol Form-2 skills
    /// compile into; it must already be registered with the tool registry
    /// under a protocol name so compiled tools surface in the tool list.
    pub fn new(
        registry: Arc<SkillRegistry>,
        tools: Arc<RwLock<ToolRegistry>>,
        compile_protocol: Arc<FunctionToolProtocol>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            tools,
            compile_protocol,
            bus,
            discovery_client: None,
        }
    }

    /// Attach an LLM client used by `hybrid`/`auto` discovery (builder
    /// pattern).
    pub fn with_discovery_client(mut self, client: SharedClient) -> Self {
        self.discovery_client = Some(client);
        self
    }

    /// Discover and activate skills for `task` under `config`.
    ///
    /// Returns the combined activation; activation events are published
    /// per skill.
    pub async fn activate(&self, task: &Task, config: &AgentConfig) -> SkillActivation {
        let candidates = self.discover(task, config).await;
        let mut activation = SkillActivation::default();

        for skill in candidates {
            if !config.skill_allowed(&skill.name) {
                continue;
            }
            if !self.required_tools_present(&skill).await {
                warn!(
                    "skill '{}' skipped: required tools missing",
                    skill.name
                );
                continue;
            }

            match skill.form {
                SkillForm::Instruction => {
                    activation.injected_instructions.push((
                        skill.name.clone(),
                        skill.instructions.clone(),
                        skill.priority,
                    ));
                }
                SkillForm::Compilation => {
                    let mut registered = Vec::new();
                    for action in &skill.actions {
                        self.compile_protocol
                            .register_tool(action.metadata.clone(), Arc::clone(&action.function))
                            .await;
                        registered.push(action.metadata.name.clone());
                    }
                    // Surface the compiled tools in the shared registry.
                    let mut tools = self.tools.write().await;
                    for action in &skill.actions {
                        tools.add_tool(
                            action.metadata.clone(),
                            self.compile_protocol.clone(),
                        );
                    }
                    activation.compiled_tools.extend(registered);
                }
                SkillForm::Instantiation => {
                    if let Some(template) = &skill.node_template {
                        let node_id = format!(
                            "{}-{}",
                            skill.name,
                            &Uuid::new_v4().to_string()[..8]
                        );
                        activation.instantiated_nodes.push(InstantiatedNode {
                            node_id,
                            skill: skill.name.clone(),
                            system_prompt: template.system_prompt.clone(),
                            add_skills: template.add_skills.clone(),
                            remove_skills: template.remove_skills.clone(),
                            add_tools: template.add_tools.clone(),
                            remove_tools: template.remove_tools.clone(),
                        });
                    }
                }
            }

            info!("activated skill '{}' ({:?})", skill.name, skill.form);
            self.bus
                .publish(
                    Event::new(EventType::SkillActivate, task.target_agent.clone())
                        .with_task(task.task_id.as_str())
                        .with_trace(
                            task.metadata.trace_id.clone(),
                            task.metadata.span_id.clone(),
                        )
                        .with_payload(serde_json::json!({
                            "skill": skill.name,
                            "form": format!("{:?}", skill.form),
                        })),
                )
                .await;
        }

        activation
    }

    async fn required_tools_present(&self, skill: &Skill) -> bool {
        if skill.required_tools.is_empty() {
            return true;
        }
        let tools = self.tools.read().await;
        skill.required_tools.iter().all(|t| tools.has_tool(t))
    }

    async fn discover(&self, task: &Task, config: &AgentConfig) -> Vec<Arc<Skill>> {
        let explicit: Vec<Arc<Skill>> = config
            .enabled_skills
            .iter()
            .filter_map(|name| self.registry.get(name).cloned())
            .collect();

        match config.skill_activation_mode {
            SkillActivationMode::Explicit => explicit,
            SkillActivationMode::Hybrid => {
                let mut candidates = explicit;
                for skill in self.registry.list() {
                    if skill.matches_rules(task.content())
                        && !candidates.iter().any(|c| c.name == skill.name)
                    {
                        candidates.push(Arc::clone(skill));
                    }
                }
                if self.discovery_client.is_some() && candidates.len() > 1 {
                    self.llm_filter(task, candidates).await
                } else {
                    candidates
                }
            }
            SkillActivationMode::Auto => {
                if self.discovery_client.is_some() {
                    let all: Vec<Arc<Skill>> =
                        self.registry.list().into_iter().cloned().collect();
                    self.llm_filter(task, all).await
                } else {
                    // No client to drive discovery — fall back to rules.
                    self.registry
                        .list()
                        .into_iter()
                        .filter(|s| s.matches_rules(task.content()))
                        .cloned()
                        .collect()
                }
            }
        }
    }

    /// Ask the discovery client which candidates apply; on any failure the
    /// unfiltered candidate list is kept.
    async fn llm_filter(&self, task: &Task, candidates: Vec<Arc<Skill>>) -> Vec<Arc<Skill>> {
        let client = match &self.discovery_client {
            Some(client) => client,
            None => return candidates,
        };

        let menu: String = candidates
            .iter()
            .map(|s| format!("- {}: {}", s.name, s.description))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Task: {}\n\nCandidate skills:\n{}\n\nReply with the comma-separated names of \
             the skills that apply, or 'none'.",
            task.content(),
            menu
        );

        let selected = match collect_text(
            client,
            &[
                Message::text(Role::System, "You select applicable skills for a task."),
                Message::text(Role::User, prompt),
            ],
        )
        .await
        {
            Ok(text) => text,
            Err(e) => {
                debug!("skill discovery call failed, keeping candidates: {}", e);
                return candidates;
            }
        };

        let lowered = selected.to_lowercase();
        let filtered: Vec<Arc<Skill>> = candidates
            .iter()
            .filter(|s| lowered.contains(&s.name.to_lowercase()))
            .cloned()
            .collect();
        if filtered.is_empty() && !lowered.contains("none") {
            candidates
        } else {
            filtered
        }
    }
}

/// Drain a stream_chat call into its accumulated text.
async fn collect_text(client: &SharedClient, messages: &[Message]) -> Result<String, BoxError> {
    let mut stream = client.stream_chat(messages, None, None).await?;
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        if let StreamChunk::Text { delta } = chunk? {
            text.push_str(&delta);
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::clients::scripted::ScriptedClient;
    use crate::agentmesh::task::TaskAction;
    use crate::agentmesh::tool_protocol::{ToolResult, ToolScope};

    async fn activator(registry: SkillRegistry) -> (SkillActivator, Arc<RwLock<ToolRegistry>>) {
        let compile_protocol = Arc::new(FunctionToolProtocol::new());
        let mut tools = ToolRegistry::new();
        tools
            .add_protocol("functions", compile_protocol.clone())
            .await
            .unwrap();
        let tools = Arc::new(RwLock::new(tools));
        let bus = EventBus::new(100);
        (
            SkillActivator::new(Arc::new(registry), Arc::clone(&tools), compile_protocol, bus),
            tools,
        )
    }

    fn echo_action(name: &str) -> ScriptedAction {
        ScriptedAction {
            metadata: ToolMetadata::new(name, "Compiled action", ToolScope::Context),
            function: Arc::new(|params| Ok(ToolResult::ok(params))),
        }
    }

    #[tokio::test]
    async fn test_explicit_mode_activates_only_configured() {
        let registry = SkillRegistry::new()
            .with_skill(Skill::instruction("cite", "Cite sources", "Always cite."))
            .with_skill(
                Skill::instruction("other", "Other", "Other.").with_keywords(vec!["index"]),
            );
        let (activator, _tools) = activator(registry).await;

        let config = AgentConfig::default()
            .with_skill("cite")
            .with_skill_activation_mode(SkillActivationMode::Explicit);
        let task = Task::new(TaskAction::Execute, "index the repo");
        let activation = activator.activate(&task, &config).await;

        assert_eq!(activation.injected_instructions.len(), 1);
        assert_eq!(activation.injected_instructions[0].0, "cite");
    }

    #[tokio::test]
    async fn test_hybrid_mode_adds_rule_candidates() {
        let registry = SkillRegistry::new().with_skill(
            Skill::instruction("indexer", "Index repositories", "Index carefully.")
                .with_keywords(vec!["index"]),
        );
        let (activator, _tools) = activator(registry).await;

        let config = AgentConfig::default(); // hybrid by default
        let task = Task::new(TaskAction::Execute, "please index the repo");
        let activation = activator.activate(&task, &config).await;
        assert_eq!(activation.injected_instructions.len(), 1);

        // No keyword match, no explicit enable: nothing activates.
        let unrelated = Task::new(TaskAction::Execute, "bake a cake");
        let activation = activator.activate(&unrelated, &config).await;
        assert!(activation.injected_instructions.is_empty());
    }

    #[tokio::test]
    async fn test_required_tools_fail_closed() {
        let registry = SkillRegistry::new().with_skill(
            Skill::instruction("needs-web", "Web research", "Search the web.")
                .with_keywords(vec!["research"])
                .with_required_tools(vec!["web_search"]),
        );
        let (activator, _tools) = activator(registry).await;

        let config = AgentConfig::default();
        let task = Task::new(TaskAction::Execute, "research topic X");
        let activation = activator.activate(&task, &config).await;
        assert!(
            activation.injected_instructions.is_empty(),
            "missing required tool must fail closed"
        );
    }

    #[tokio::test]
    async fn test_compilation_registers_tools() {
        let registry = SkillRegistry::new().with_skill(
            Skill::compilation("scripts", "Scripted helpers", vec![echo_action("script_echo")])
                .with_keywords(vec!["script"]),
        );
        let (activator, tools) = activator(registry).await;

        let config = AgentConfig::default();
        let task = Task::new(TaskAction::Execute, "run the script helper");
        let activation = activator.activate(&task, &config).await;

        assert_eq!(activation.compiled_tools, vec!["script_echo".to_string()]);
        assert!(tools.read().await.has_tool("script_echo"));
    }

    #[tokio::test]
    async fn test_instantiation_produces_node() {
        let registry = SkillRegistry::new().with_skill(
            Skill::instantiation(
                "specialist",
                "Focused sub-agent",
                NodeTemplate::new("You only summarize.")
                    .adding_skills(vec!["digest"])
                    .removing_tools(vec!["delegate_widely"]),
            )
            .with_keywords(vec!["summarize"]),
        );
        let (activator, _tools) = activator(registry).await;

        let config = AgentConfig::default();
        let task = Task::new(TaskAction::Execute, "summarize the findings");
        let activation = activator.activate(&task, &config).await;

        assert_eq!(activation.instantiated_nodes.len(), 1);
        let node = &activation.instantiated_nodes[0];
        assert!(node.node_id.starts_with("specialist-"));
        assert_eq!(node.system_prompt, "You only summarize.");
        // All four inheritance channels flow from the template.
        assert_eq!(node.add_skills, vec!["digest".to_string()]);
        assert!(node.remove_skills.is_empty());
        assert!(node.add_tools.is_empty());
        assert_eq!(node.remove_tools, vec!["delegate_widely".to_string()]);
    }

    #[tokio::test]
    async fn test_llm_filter_narrows_candidates() {
        let registry = SkillRegistry::new()
            .with_skill(
                Skill::instruction("alpha", "Alpha skill", "A.").with_keywords(vec!["work"]),
            )
            .with_skill(
                Skill::instruction("beta", "Beta skill", "B.").with_keywords(vec!["work"]),
            );
        let (activator, _tools) = activator(registry).await;
        let activator = activator.with_discovery_client(Arc::new(ScriptedClient::replying(
            vec!["alpha".to_string()],
        )));

        let config = AgentConfig::default();
        let task = Task::new(TaskAction::Execute, "do the work");
        let activation = activator.activate(&task, &config).await;

        assert_eq!(activation.injected_instructions.len(), 1);
        assert_eq!(activation.injected_instructions[0].0, "alpha");
    }
}
