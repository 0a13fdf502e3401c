//! Challenge and resolution entry points.
//!
//! Callers hand over a tree-shaped claim (a claim node with supporting
//! pieces); the wrappers flatten it into the flow body and invoke the
//! engine with the appropriate workflow.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::{RunRequest, WorkflowEngine};
use crate::error::EngineError;

/// Kind of a claim-tree node as seen by the wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Claim,
    Piece,
}

/// Tree-shaped input to a challenge or resolution.
#[derive(Debug, Clone)]
pub struct ClaimNode {
    pub id: String,
    pub kind: NodeKind,
    pub body: String,
    pub children: Vec<ClaimNode>,
}

impl ClaimNode {
    pub fn claim(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Claim,
            body: body.into(),
            children: Vec::new(),
        }
    }

    pub fn piece(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Piece,
            body: body.into(),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: ClaimNode) -> Self {
        self.children.push(child);
        self
    }

    /// Flatten the tree into the flow body: the root claim first, then
    /// supporting pieces depth-first, indented by depth.
    pub fn flatten(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.body);
        for child in &self.children {
            flatten_into(child, 1, &mut out);
        }
        out
    }
}

fn flatten_into(node: &ClaimNode, depth: usize, out: &mut String) {
    out.push('\n');
    for _ in 0..depth {
        out.push_str("  ");
    }
    out.push_str("- ");
    out.push_str(&node.body);
    for child in &node.children {
        flatten_into(child, depth + 1, out);
    }
}

/// The principal a refinement runs as.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub role: String,
}

/// Higher-level entry points over the engine.
#[derive(Clone)]
pub struct Refinery {
    engine: WorkflowEngine,
}

impl Refinery {
    pub fn new(engine: WorkflowEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Run a challenge workflow against a claim tree. Returns the run id.
    pub async fn challenge(
        &self,
        workflow_id: &str,
        node: &ClaimNode,
        principal: &Principal,
        pre_prompt: Option<String>,
        cancel: CancellationToken,
    ) -> Result<String, EngineError> {
        let request = RunRequest {
            workflow_id: workflow_id.to_string(),
            node_id: Some(node.id.clone()),
            user_id: principal.user_id.clone(),
            role: principal.role.clone(),
            pre_prompt,
            body: node.flatten(),
            batch_id: Some(Uuid::new_v4().to_string()),
        };
        self.engine.execute(request, cancel).await
    }

    /// Run a resolution workflow: the claim tree plus the challenge
    /// outputs gathered so far.
    pub async fn resolve(
        &self,
        workflow_id: &str,
        node: &ClaimNode,
        challenge_outputs: &[String],
        principal: &Principal,
        pre_prompt: Option<String>,
        cancel: CancellationToken,
    ) -> Result<String, EngineError> {
        let mut body = node.flatten();
        if !challenge_outputs.is_empty() {
            body.push_str("\n\nChallenges raised:\n");
            for (index, output) in challenge_outputs.iter().enumerate() {
                body.push_str(&format!("{}. {}\n", index + 1, output));
            }
        }

        let request = RunRequest {
            workflow_id: workflow_id.to_string(),
            node_id: Some(node.id.clone()),
            user_id: principal.user_id.clone(),
            role: principal.role.clone(),
            pre_prompt,
            body,
            batch_id: Some(Uuid::new_v4().to_string()),
        };
        self.engine.execute(request, cancel).await
    }
}
