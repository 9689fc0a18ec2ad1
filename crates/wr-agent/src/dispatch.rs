use serde_json::json;

use wr_tools::AdvertisedTool;

use crate::approval::ApprovalPolicy;
use crate::provider::ToolSpec;

/// Prefix that routes a tool name to a tool server.
const TOOL_SERVER_PREFIX: &str = "tool-server-";

// ---------------------------------------------------------------------------
// ToolDispatch — tagged routing instead of reflection over names
// ---------------------------------------------------------------------------

/// Where a tool call goes. Unknown names become a variant rather than a
/// dispatch failure, so the loop can inject a typed error tool-result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolDispatch {
    Builtin(BuiltinTool),
    ToolServer { server: String, tool: String },
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinTool {
    HubPost,
    HubSearch,
    HubGetThread,
    HubMention,
}

impl BuiltinTool {
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinTool::HubPost => "hub_post",
            BuiltinTool::HubSearch => "hub_search",
            BuiltinTool::HubGetThread => "hub_get_thread",
            BuiltinTool::HubMention => "hub_mention",
        }
    }
}

impl ToolDispatch {
    /// Route a (trimmed, case-preserved) tool name.
    pub fn parse(name: &str) -> Self {
        let name = name.trim();
        match name {
            "hub_post" => return ToolDispatch::Builtin(BuiltinTool::HubPost),
            "hub_search" => return ToolDispatch::Builtin(BuiltinTool::HubSearch),
            "hub_get_thread" => return ToolDispatch::Builtin(BuiltinTool::HubGetThread),
            "hub_mention" => return ToolDispatch::Builtin(BuiltinTool::HubMention),
            _ => {}
        }
        if let Some(rest) = name.strip_prefix(TOOL_SERVER_PREFIX) {
            if let Some((server, tool)) = rest.split_once('.') {
                if !server.is_empty() && !tool.is_empty() {
                    return ToolDispatch::ToolServer {
                        server: server.to_string(),
                        tool: tool.to_string(),
                    };
                }
            }
        }
        ToolDispatch::Unknown(name.to_string())
    }
}

// ---------------------------------------------------------------------------
// Built-in tool definitions
// ---------------------------------------------------------------------------

/// The hub tools every agent gets regardless of grants.
pub fn builtin_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "hub_post".to_string(),
            description: "Publish a new post to the hub feed.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "content": { "type": "string", "description": "Post body" }
                },
                "required": ["content"]
            }),
        },
        ToolSpec {
            name: "hub_search".to_string(),
            description: "Full-text search over hub posts.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search terms" }
                },
                "required": ["query"]
            }),
        },
        ToolSpec {
            name: "hub_get_thread".to_string(),
            description: "Fetch a post and its full comment thread by id.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "post_id": { "type": "string", "description": "Post id" }
                },
                "required": ["post_id"]
            }),
        },
        ToolSpec {
            name: "hub_mention".to_string(),
            description: "Comment on a post, mentioning its author.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "post_id": { "type": "string", "description": "Post id" },
                    "content": { "type": "string", "description": "Comment body" }
                },
                "required": ["post_id", "content"]
            }),
        },
    ]
}

// ---------------------------------------------------------------------------
// ToolRegistry
// ---------------------------------------------------------------------------

/// One tool offered to the model, with routing and approval metadata.
#[derive(Debug, Clone)]
pub struct ToolEntry {
    pub spec: ToolSpec,
    pub dispatch: ToolDispatch,
    pub approval: ApprovalPolicy,
    /// False for fallback descriptors whose server never started.
    pub available: bool,
}

/// The activation's tool table: builtins plus whatever the tool-server
/// manager discovered, keyed by normalized name.
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<ToolEntry>,
}

impl ToolRegistry {
    /// Registry with the built-in hub tools.
    pub fn with_builtins() -> Self {
        let entries = builtin_tool_specs()
            .into_iter()
            .map(|spec| ToolEntry {
                dispatch: ToolDispatch::parse(&spec.name),
                approval: ApprovalPolicy::Never,
                available: true,
                spec,
            })
            .collect();
        Self { entries }
    }

    /// Add the tools a tool-server manager advertises. Server tools get
    /// the dangerous-pattern policy since their effects are open-ended.
    pub fn register_server_tools(&mut self, advertised: &[AdvertisedTool]) {
        for tool in advertised {
            self.entries.push(ToolEntry {
                spec: ToolSpec {
                    name: tool.qualified_name.clone(),
                    description: tool.tool.description.clone(),
                    input_schema: tool.tool.input_schema.clone(),
                },
                dispatch: ToolDispatch::ToolServer {
                    server: tool.server.clone(),
                    tool: tool.tool.name.clone(),
                },
                approval: ApprovalPolicy::OnDangerousPattern,
                available: tool.available,
            });
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&ToolEntry> {
        self.entries.iter().find(|e| e.spec.name == name)
    }

    /// Specs to advertise to the LLM.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.entries.iter().map(|e| e.spec.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
