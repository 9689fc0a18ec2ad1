use regex::RegexSet;
use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// ApprovalPolicy — auto-policy, no human in the loop
// ---------------------------------------------------------------------------

/// Per-tool approval requirement. There is no human in the loop: `Always`
/// means the call is auto-skipped with an error tool-result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    Never,
    OnDangerousPattern,
    Always,
}

/// Why a call was denied; injected into the context as an error
/// tool-result, never failing the activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    RequiresApproval,
    DangerousPattern(String),
}

impl Denial {
    pub fn message(&self, tool_name: &str) -> String {
        match self {
            Denial::RequiresApproval => {
                format!("tool {tool_name} requires approval and was skipped")
            }
            Denial::DangerousPattern(pattern) => {
                format!("tool {tool_name} arguments matched dangerous pattern `{pattern}`")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AutoApprover
// ---------------------------------------------------------------------------

/// Evaluates a tool call against its declared policy.
pub struct AutoApprover {
    patterns: Vec<String>,
    set: RegexSet,
}

impl AutoApprover {
    /// The stock dangerous-argument patterns.
    pub fn new() -> Self {
        Self::with_patterns(&[
            r"(?i)rm\s+-[a-z]*r[a-z]*f",
            r"(?i)\bsudo\b",
            r"(?i)drop\s+table",
            r"(?i)delete\s+from",
            r"(?i)chmod\s+777",
            r"(?i)curl[^|]*\|\s*(ba)?sh",
            r"(?i)wget[^|]*\|\s*(ba)?sh",
            r"(?i)force[-_ ]?push",
        ])
    }

    pub fn with_patterns(patterns: &[&str]) -> Self {
        let owned: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        // Stock patterns are compile-time constants; a bad operator
        // pattern falls back to matching nothing.
        let set = RegexSet::new(&owned).unwrap_or_else(|_| RegexSet::new(["$^"]).unwrap());
        Self {
            patterns: owned,
            set,
        }
    }

    /// Check a call. `Ok(())` means proceed; `Err` carries the denial to
    /// inject as an error tool-result.
    pub fn check(
        &self,
        policy: ApprovalPolicy,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<(), Denial> {
        match policy {
            ApprovalPolicy::Never => Ok(()),
            ApprovalPolicy::Always => {
                warn!(tool = tool_name, "tool requires approval, auto-skipped");
                Err(Denial::RequiresApproval)
            }
            ApprovalPolicy::OnDangerousPattern => {
                let rendered = arguments.to_string();
                match self.set.matches(&rendered).iter().next() {
                    Some(idx) => {
                        let pattern = self.patterns[idx].clone();
                        warn!(
                            tool = tool_name,
                            pattern = %pattern,
                            "dangerous pattern in tool arguments"
                        );
                        Err(Denial::DangerousPattern(pattern))
                    }
                    None => Ok(()),
                }
            }
        }
    }
}

impl Default for AutoApprover {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
