use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use parley_model::ToolSchema;

// ─── Capability entries ───────────────────────────────────────────────────────

/// One tool exposed by an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the tool input.
    #[serde(default, alias = "inputSchema", alias = "parameters")]
    pub input_schema: Value,
}

/// A registered MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpCapability {
    pub server_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub use_proxy: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tools: Vec<McpToolInfo>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl McpCapability {
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools
            .iter()
            .map(|t| t.name.as_str())
            .filter(|n| !n.is_empty())
            .collect()
    }

    pub fn tool_by_name(&self, name: &str) -> Option<&McpToolInfo> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// One-line description for the LLM system prompt.
    pub fn to_description(&self) -> String {
        let names = self.tool_names();
        let mut tools_desc = names
            .iter()
            .take(10)
            .copied()
            .collect::<Vec<_>>()
            .join(", ");
        if self.tools.len() > 10 {
            tools_desc.push_str(&format!(" 等 {} 个工具", self.tools.len()));
        }
        let desc = if self.description.is_empty() { "无描述" } else { &self.description };
        format!("{}: {} [工具: {}]", self.name, desc, tools_desc)
    }
}

/// A registered skill pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillCapability {
    pub skill_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub trigger_keywords: Vec<String>,
    #[serde(default)]
    pub steps: Vec<Value>,
    #[serde(default)]
    pub required_mcps: Vec<String>,
}

impl SkillCapability {
    pub fn to_description(&self) -> String {
        let keywords = if self.trigger_keywords.is_empty() {
            "无".to_string()
        } else {
            self.trigger_keywords
                .iter()
                .take(5)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        };
        let desc = if self.description.is_empty() { "无描述" } else { &self.description };
        format!("{}: {} [触发词: {}]", self.name, desc, keywords)
    }
}

/// A built-in tool the agent can execute in-process.
#[async_trait]
pub trait BuiltinTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }
    async fn execute(&self, args: Value) -> anyhow::Result<Value>;
}

/// Registry entry wrapping a [`BuiltinTool`].
#[derive(Clone)]
pub struct ToolCapability {
    pub tool: Arc<dyn BuiltinTool>,
}

impl ToolCapability {
    pub fn to_description(&self) -> String {
        let desc = self.tool.description();
        let desc = if desc.is_empty() { "无描述" } else { desc };
        format!("{}: {}", self.tool.name(), desc)
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Three parallel catalogues (MCP / skill / tool) plus the cached description
/// fragment.  Every registration invalidates the cache.
#[derive(Default)]
pub struct CapabilityRegistry {
    mcp_servers: HashMap<String, McpCapability>,
    skills: HashMap<String, SkillCapability>,
    tools: HashMap<String, ToolCapability>,
    description_cache: Mutex<Option<String>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -- MCP --

    pub fn register_mcp(&mut self, mcp: McpCapability) {
        self.mcp_servers.insert(mcp.server_id.clone(), mcp);
        self.invalidate_cache();
    }

    /// Register an MCP server from a loose JSON object (agent ext shape).
    /// Entries without a `server_id` are skipped with a warning.
    pub fn register_mcp_from_value(&mut self, value: &Value) {
        match serde_json::from_value::<McpCapability>(value.clone()) {
            Ok(mcp) if !mcp.server_id.is_empty() => self.register_mcp(mcp),
            Ok(_) => warn!("skipping MCP entry without server_id"),
            Err(e) => warn!(error = %e, "skipping malformed MCP entry"),
        }
    }

    pub fn get_mcp(&self, server_id: &str) -> Option<&McpCapability> {
        self.mcp_servers.get(server_id)
    }

    pub fn get_mcp_tool(&self, server_id: &str, tool_name: &str) -> Option<&McpToolInfo> {
        self.get_mcp(server_id)?.tool_by_name(tool_name)
    }

    pub fn enabled_mcps(&self) -> Vec<&McpCapability> {
        let mut mcps: Vec<_> = self.mcp_servers.values().filter(|m| m.enabled).collect();
        mcps.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        mcps
    }

    // -- Skills --

    pub fn register_skill(&mut self, skill: SkillCapability) {
        self.skills.insert(skill.skill_id.clone(), skill);
        self.invalidate_cache();
    }

    pub fn get_skill(&self, skill_id: &str) -> Option<&SkillCapability> {
        self.skills.get(skill_id)
    }

    pub fn available_skills(&self) -> Vec<&SkillCapability> {
        let mut skills: Vec<_> = self.skills.values().collect();
        skills.sort_by(|a, b| a.skill_id.cmp(&b.skill_id));
        skills
    }

    /// Case-insensitive substring match of any trigger keyword in `text`.
    pub fn find_skill_by_keyword(&self, text: &str) -> Option<&SkillCapability> {
        if text.is_empty() {
            return None;
        }
        let text_lower = text.to_lowercase();
        self.available_skills().into_iter().find(|skill| {
            skill
                .trigger_keywords
                .iter()
                .any(|k| !k.is_empty() && text_lower.contains(&k.to_lowercase()))
        })
    }

    // -- Built-in tools --

    pub fn register_tool(&mut self, tool: Arc<dyn BuiltinTool>) {
        self.tools
            .insert(tool.name().to_string(), ToolCapability { tool });
        self.invalidate_cache();
    }

    pub fn get_tool(&self, tool_name: &str) -> Option<&ToolCapability> {
        self.tools.get(tool_name)
    }

    pub fn available_tools(&self) -> Vec<&ToolCapability> {
        let mut tools: Vec<_> = self.tools.values().collect();
        tools.sort_by(|a, b| a.tool.name().cmp(b.tool.name()));
        tools
    }

    pub async fn execute_tool(&self, tool_name: &str, args: Value) -> anyhow::Result<Value> {
        let cap = self
            .get_tool(tool_name)
            .ok_or_else(|| anyhow::anyhow!("Tool not found: {tool_name}"))?;
        cap.tool.execute(args).await
    }

    // -- Aggregation --

    pub fn has_any_capability(&self) -> bool {
        !self.mcp_servers.is_empty() || !self.skills.is_empty() || !self.tools.is_empty()
    }

    pub fn clear(&mut self) {
        self.mcp_servers.clear();
        self.skills.clear();
        self.tools.clear();
        self.invalidate_cache();
    }

    /// The multi-section system-prompt fragment.  Cached until the next
    /// registration.
    pub fn get_capability_description(&self) -> String {
        if let Some(cached) = self.description_cache.lock().unwrap().as_ref() {
            return cached.clone();
        }

        let mut lines: Vec<String> = Vec::new();

        let mcps = self.enabled_mcps();
        if !mcps.is_empty() {
            lines.push("## 可用的 MCP 工具服务".into());
            for mcp in mcps {
                lines.push(format!("- {}", mcp.to_description()));
            }
            lines.push(String::new());
        }

        let skills = self.available_skills();
        if !skills.is_empty() {
            lines.push("## 可用的技能包".into());
            for skill in skills {
                lines.push(format!("- {}", skill.to_description()));
            }
            lines.push(String::new());
        }

        let tools = self.available_tools();
        if !tools.is_empty() {
            lines.push("## 可用的内置工具".into());
            for tool in tools {
                lines.push(format!("- {}", tool.to_description()));
            }
            lines.push(String::new());
        }

        let description = lines.join("\n");
        *self.description_cache.lock().unwrap() = Some(description.clone());
        description
    }

    /// OpenAI function-calling export.  MCP tools are namespaced
    /// `mcp_<server_id>_<tool_name>`; built-in tools keep their names.
    pub fn get_tools_for_llm(&self) -> Vec<ToolSchema> {
        let mut out = Vec::new();
        for mcp in self.enabled_mcps() {
            for tool in &mcp.tools {
                if tool.name.is_empty() {
                    continue;
                }
                out.push(ToolSchema {
                    name: format!("mcp_{}_{}", mcp.server_id, tool.name),
                    description: tool.description.clone(),
                    parameters: if tool.input_schema.is_object() {
                        tool.input_schema.clone()
                    } else {
                        json!({ "type": "object", "properties": {} })
                    },
                });
            }
        }
        for cap in self.available_tools() {
            out.push(ToolSchema {
                name: cap.tool.name().to_string(),
                description: cap.tool.description().to_string(),
                parameters: cap.tool.parameters_schema(),
            });
        }
        out
    }

    // -- Bulk loading --

    /// Register every MCP server definition from an agent config ext.
    pub fn load_mcp_servers(&mut self, servers: &[Value]) {
        for server in servers {
            self.register_mcp_from_value(server);
        }
    }

    fn invalidate_cache(&mut self) {
        *self.description_cache.lock().unwrap() = None;
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn mcp(server_id: &str, tools: &[&str]) -> McpCapability {
        McpCapability {
            server_id: server_id.into(),
            name: format!("server {server_id}"),
            url: "http://localhost:1234".into(),
            enabled: true,
            use_proxy: true,
            description: String::new(),
            tools: tools
                .iter()
                .map(|n| McpToolInfo {
                    name: (*n).into(),
                    description: String::new(),
                    input_schema: json!({ "type": "object", "properties": {} }),
                })
                .collect(),
            metadata: Map::new(),
        }
    }

    struct EchoTool;

    #[async_trait]
    impl BuiltinTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "回显输入"
        }
        async fn execute(&self, args: Value) -> anyhow::Result<Value> {
            Ok(args)
        }
    }

    #[test]
    fn mcp_tools_are_namespaced_for_llm() {
        let mut reg = CapabilityRegistry::new();
        reg.register_mcp(mcp("srv1", &["send_post", "list_posts"]));
        let tools = reg.get_tools_for_llm();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"mcp_srv1_send_post"));
        assert!(names.contains(&"mcp_srv1_list_posts"));
    }

    #[test]
    fn builtin_tools_keep_their_names() {
        let mut reg = CapabilityRegistry::new();
        reg.register_tool(Arc::new(EchoTool));
        let tools = reg.get_tools_for_llm();
        assert_eq!(tools[0].name, "echo");
    }

    #[test]
    fn disabled_mcp_excluded_everywhere() {
        let mut reg = CapabilityRegistry::new();
        let mut m = mcp("srv1", &["t"]);
        m.enabled = false;
        reg.register_mcp(m);
        assert!(reg.enabled_mcps().is_empty());
        assert!(reg.get_tools_for_llm().is_empty());
        assert_eq!(reg.get_capability_description(), "");
    }

    #[test]
    fn description_has_section_headings() {
        let mut reg = CapabilityRegistry::new();
        reg.register_mcp(mcp("srv1", &["t1", "t2"]));
        reg.register_skill(SkillCapability {
            skill_id: "sk1".into(),
            name: "发帖".into(),
            description: "发一篇帖子".into(),
            trigger_keywords: vec!["发帖".into()],
            steps: vec![],
            required_mcps: vec![],
        });
        reg.register_tool(Arc::new(EchoTool));
        let desc = reg.get_capability_description();
        assert!(desc.contains("## 可用的 MCP 工具服务"));
        assert!(desc.contains("## 可用的技能包"));
        assert!(desc.contains("## 可用的内置工具"));
        assert!(desc.contains("[工具: t1, t2]"));
        assert!(desc.contains("[触发词: 发帖]"));
    }

    #[test]
    fn description_cache_invalidated_on_register() {
        let mut reg = CapabilityRegistry::new();
        reg.register_mcp(mcp("srv1", &["t1"]));
        let first = reg.get_capability_description();
        reg.register_mcp(mcp("srv2", &["t2"]));
        let second = reg.get_capability_description();
        assert_ne!(first, second);
        assert!(second.contains("srv2"));
    }

    #[test]
    fn large_tool_list_truncates_description() {
        let names: Vec<String> = (0..15).map(|i| format!("tool{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut reg = CapabilityRegistry::new();
        reg.register_mcp(mcp("srv1", &refs));
        let desc = reg.get_capability_description();
        assert!(desc.contains("等 15 个工具"));
    }

    #[test]
    fn find_skill_matches_keyword_case_insensitive() {
        let mut reg = CapabilityRegistry::new();
        reg.register_skill(SkillCapability {
            skill_id: "sk1".into(),
            name: "Search".into(),
            description: String::new(),
            trigger_keywords: vec!["Google".into()],
            steps: vec![],
            required_mcps: vec![],
        });
        assert!(reg.find_skill_by_keyword("请帮我 google 一下").is_some());
        assert!(reg.find_skill_by_keyword("不相关").is_none());
        assert!(reg.find_skill_by_keyword("").is_none());
    }

    #[test]
    fn register_mcp_from_value_accepts_loose_shapes() {
        let mut reg = CapabilityRegistry::new();
        reg.register_mcp_from_value(&json!({
            "server_id": "srv9",
            "name": "Nine",
            "url": "http://x",
            "tools": [{ "name": "go", "inputSchema": { "type": "object" } }]
        }));
        let mcp = reg.get_mcp("srv9").unwrap();
        assert_eq!(mcp.tools[0].name, "go");
        assert!(mcp.tools[0].input_schema.is_object());
    }

    #[test]
    fn register_mcp_from_value_skips_missing_id() {
        let mut reg = CapabilityRegistry::new();
        reg.register_mcp_from_value(&json!({ "name": "anonymous" }));
        assert!(!reg.has_any_capability());
    }

    #[tokio::test]
    async fn execute_tool_dispatches() {
        let mut reg = CapabilityRegistry::new();
        reg.register_tool(Arc::new(EchoTool));
        let out = reg.execute_tool("echo", json!({ "a": 1 })).await.unwrap();
        assert_eq!(out["a"], 1);
    }

    #[tokio::test]
    async fn execute_unknown_tool_errors() {
        let reg = CapabilityRegistry::new();
        assert!(reg.execute_tool("nope", json!({})).await.is_err());
    }
}
