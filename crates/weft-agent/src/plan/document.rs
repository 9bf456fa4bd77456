use serde::{Deserialize, Serialize};

/// A plan as written, before validation. Both the markup reader and the
/// JSON form produce this shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDocument {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub agents: Vec<AgentDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDocument {
    /// Capability name, e.g. `Browser`.
    pub name: String,
    pub id: IdRef,
    #[serde(rename = "dependsOn", default)]
    pub depends_on: DependsOn,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdRef {
    Number(usize),
    Text(String),
}

impl IdRef {
    pub fn raw(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.trim().to_string(),
        }
    }
}

/// Either a comma-separated list or an explicit array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    Text(String),
    List(Vec<IdRef>),
}

impl Default for DependsOn {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl DependsOn {
    /// Raw dependency references with blanks dropped.
    pub fn refs(&self) -> Vec<String> {
        match self {
            Self::Text(s) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Self::List(ids) => ids
                .iter()
                .map(IdRef::raw)
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeDocument {
    Node {
        text: String,
        #[serde(default)]
        input: Option<String>,
        #[serde(default)]
        output: Option<String>,
    },
    ForEach {
        items: ItemsDocument,
        #[serde(default)]
        nodes: Vec<NodeDocument>,
    },
    Watch {
        event: String,
        #[serde(rename = "loop", default)]
        repeat: Flag,
        #[serde(default)]
        description: String,
        #[serde(default)]
        trigger: Vec<NodeDocument>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemsDocument {
    List(Vec<serde_json::Value>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Flag {
    Bool(bool),
    Text(String),
}

impl Default for Flag {
    fn default() -> Self {
        Self::Bool(false)
    }
}

impl Flag {
    pub fn is_true(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Text(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        }
    }
}
