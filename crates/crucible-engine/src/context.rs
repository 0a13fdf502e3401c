//! Execution context threaded through a run.
//!
//! The context is confined to the coordinating task. During fan-out each
//! sibling receives a private clone; the parent merges sibling outputs
//! back after the join, single-writer.

use serde_json::json;
use std::collections::HashMap;

/// Mutable state visible to step templates.
#[derive(Debug, Clone, Default)]
pub struct FlowContext {
    pub body: String,
    pub pre_prompt: String,
    pub previous_response: String,
    /// JSON mapping of sibling outputs after the most recent fan-in.
    pub fan_results: String,
    step_outputs: HashMap<String, String>,
}

impl FlowContext {
    pub fn new(body: impl Into<String>, pre_prompt: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            pre_prompt: pre_prompt.into(),
            ..Self::default()
        }
    }

    /// Output of a previously completed step, if any.
    pub fn step_output(&self, name: &str) -> Option<&str> {
        self.step_outputs.get(name).map(String::as_str)
    }

    /// Record a completed step's output and advance `previous_response`.
    pub fn record_step(&mut self, name: impl Into<String>, output: impl Into<String>) {
        let output = output.into();
        self.previous_response = output.clone();
        self.step_outputs.insert(name.into(), output);
    }

    pub fn set_fan_results(&mut self, json: String) {
        self.fan_results = json;
    }

    /// All recorded step outputs, keyed by step name.
    pub fn outputs(&self) -> &HashMap<String, String> {
        &self.step_outputs
    }

    /// Input blob persisted with each step run.
    pub fn input_blob(&self) -> serde_json::Value {
        json!({
            "body": self.body,
            "pre_prompt": self.pre_prompt,
            "previous_response": self.previous_response,
        })
    }
}
