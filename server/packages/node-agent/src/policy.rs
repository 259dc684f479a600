//! Deny list applied to script text before anything is spawned.

use regress::Regex;

use node_agent_error::AgentError;

/// Ordered `(name, pattern)` pairs. Matched case-insensitively and in
/// multi-line mode against the raw script.
const FORBIDDEN_PATTERNS: &[(&str, &str)] = &[
    (
        "recursive root deletion",
        r"\brm\s+(?:[^\n;&|]*\s)?-[a-z-]*r[a-z-]*\s+(?:[^\n;&|]*\s)?/\*?(?=\s|;|&|\||$)",
    ),
    ("filesystem creation", r"\bmkfs(?:\.\w+)?\b"),
    ("raw disk write", r"\bdd\s+(?:[^\n;&|]*\s)?if="),
    (
        "block device redirection",
        r">\s*/dev/(?:sd[a-z]|hd[a-z]|vd[a-z]|xvd[a-z]|nvme\d|mmcblk\d)",
    ),
    (
        "fork bomb",
        r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
    ),
    (
        "fork bomb",
        r"\b([a-z_]\w*)\s*\(\s*\)\s*\{[^}]*\b\1\s*\|\s*\1\s*&",
    ),
    ("shutdown", r"\bshutdown\s+(?:-\S+\s+)*(?:now|0)\b"),
    ("runlevel 0", r"\b(?:tel)?init\s+0\b"),
    ("halt", r"\bhalt\b"),
    ("poweroff", r"\bpoweroff\b"),
];

struct Rule {
    name: &'static str,
    regex: Regex,
}

/// Immutable after construction; shared by reference across command tasks.
pub struct SecurityPolicy {
    rules: Vec<Rule>,
}

impl std::fmt::Debug for SecurityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityPolicy")
            .field("rules", &self.rules().collect::<Vec<_>>())
            .finish()
    }
}

impl SecurityPolicy {
    pub fn new() -> Result<Self, AgentError> {
        let rules = FORBIDDEN_PATTERNS
            .iter()
            .map(|&(name, pattern)| {
                Regex::with_flags(pattern, "im")
                    .map(|regex| Rule { name, regex })
                    .map_err(|err| AgentError::config(format!("invalid policy rule {name}: {err}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Returns the first rule the script violates.
    pub fn violation(&self, script: &str) -> Option<&'static str> {
        self.rules
            .iter()
            .find(|rule| rule.regex.find(script).is_some())
            .map(|rule| rule.name)
    }

    pub fn check(&self, script: &str) -> Result<(), AgentError> {
        match self.violation(script) {
            Some(rule) => Err(AgentError::PolicyViolation {
                rule: rule.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn rules(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.iter().map(|rule| rule.name)
    }
}
