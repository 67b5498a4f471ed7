use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of an agent in the hierarchy.
///
/// Ids are allocated from a monotonic counter, so ordering by id is ordering
/// by creation and gives deterministic tie-breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

/// Layer of the agent hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentLayer {
    /// Receives escalations and owns final decisions.
    Executive,
    /// Coordinates a single workflow.
    Management,
    /// Pooled domain workers.
    Specialist,
    /// Short-lived burst workers.
    Execution,
}

impl AgentLayer {
    /// All layers, top to bottom.
    pub const ALL: [AgentLayer; 4] = [
        AgentLayer::Executive,
        AgentLayer::Management,
        AgentLayer::Specialist,
        AgentLayer::Execution,
    ];
}

impl fmt::Display for AgentLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentLayer::Executive => write!(f, "executive"),
            AgentLayer::Management => write!(f, "management"),
            AgentLayer::Specialist => write!(f, "specialist"),
            AgentLayer::Execution => write!(f, "execution"),
        }
    }
}

/// Domain skill a worker provides.
///
/// Serialized as a plain lowercase string; unknown names round-trip through
/// [`Specialty::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Specialty {
    /// Gathering information from sources.
    Research,
    /// Collecting or transforming datasets.
    Data,
    /// Comparing, evaluating, interpreting.
    Analysis,
    /// Architecture and planning.
    Design,
    /// Writing or changing code.
    Coding,
    /// Producing prose documents.
    Writing,
    /// Checking work produced by others.
    Review,
    /// Escalation handling (executive layer).
    Executive,
    /// Workflow coordination (management layer).
    Coordination,
    /// Any other skill tag.
    Custom(String),
}

impl Specialty {
    /// Name used in configuration and logs.
    pub fn as_str(&self) -> &str {
        match self {
            Specialty::Research => "research",
            Specialty::Data => "data",
            Specialty::Analysis => "analysis",
            Specialty::Design => "design",
            Specialty::Coding => "coding",
            Specialty::Writing => "writing",
            Specialty::Review => "review",
            Specialty::Executive => "executive",
            Specialty::Coordination => "coordination",
            Specialty::Custom(name) => name,
        }
    }
}

impl fmt::Display for Specialty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Specialty {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "research" => Specialty::Research,
            "data" => Specialty::Data,
            "analysis" => Specialty::Analysis,
            "design" => Specialty::Design,
            "coding" => Specialty::Coding,
            "writing" => Specialty::Writing,
            "review" => Specialty::Review,
            "executive" => Specialty::Executive,
            "coordination" => Specialty::Coordination,
            _ => Specialty::Custom(value),
        }
    }
}

impl From<&str> for Specialty {
    fn from(value: &str) -> Self {
        Specialty::from(value.to_string())
    }
}

impl From<Specialty> for String {
    fn from(value: Specialty) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for Specialty {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Specialty::from(s))
    }
}

/// Scheduling priority for tasks and messages.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Ahead of normal work.
    High,
    /// Must be handled first.
    Critical,
}

impl Priority {
    /// Parse a priority name case-insensitively. Unknown names are `Normal`.
    pub fn parse_level(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "low" => Priority::Low,
            "high" => Priority::High,
            "critical" => Priority::Critical,
            _ => Priority::Normal,
        }
    }
}
