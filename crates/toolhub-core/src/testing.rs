//! Scripted provider sessions and models for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{LanguageModel, ModelError};
use crate::provider::{ProviderError, ProviderSession};
use crate::types::{text_content, ModelTurn, ToolCallOutput, ToolDescriptor, TurnEntry};

pub struct MockSession {
    descriptors: Vec<ToolDescriptor>,
    list_fails: bool,
    responses: HashMap<String, Result<ToolCallOutput, ProviderError>>,
    calls: Mutex<Vec<(String, Value)>>,
    alive: AtomicBool,
    closed: AtomicBool,
}

impl MockSession {
    pub fn with_descriptors(descriptors: Vec<ToolDescriptor>) -> Self {
        Self {
            descriptors,
            list_fails: false,
            responses: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_tools(names: &[&str]) -> Self {
        Self::with_descriptors(
            names
                .iter()
                .map(|name| {
                    ToolDescriptor::new(*name, format!("{} tool", name), json!({"type": "object"}))
                })
                .collect(),
        )
    }

    pub fn failing_list() -> Self {
        let mut session = Self::with_descriptors(Vec::new());
        session.list_fails = true;
        session
    }

    pub fn describe(mut self, name: &str, description: &str) -> Self {
        if let Some(tool) = self.descriptors.iter_mut().find(|t| t.name == name) {
            tool.description = description.to_string();
        }
        self
    }

    pub fn respond(mut self, name: &str, output: ToolCallOutput) -> Self {
        self.responses.insert(name.to_string(), Ok(output));
        self
    }

    pub fn fail_tool(mut self, name: &str, error: ProviderError) -> Self {
        self.responses.insert(name.to_string(), Err(error));
        self
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderSession for MockSession {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ProviderError> {
        if self.list_fails {
            return Err(ProviderError::Transport("broken pipe".into()));
        }
        Ok(self.descriptors.clone())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallOutput, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments));
        match self.responses.get(name) {
            Some(response) => response.clone(),
            None => Ok(ToolCallOutput {
                content: text_content(format!("{} ok", name)),
                is_error: false,
            }),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A model that replays a fixed sequence of turns and records every request.
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Result<ModelTurn, ModelError>>>,
    repeat: Option<ModelTurn>,
    requests: Mutex<Vec<(Vec<TurnEntry>, Vec<ToolDescriptor>)>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<Result<ModelTurn, ModelError>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every request with the same turn.
    pub fn repeating(turn: ModelTurn) -> Self {
        Self {
            turns: Mutex::new(VecDeque::new()),
            repeat: Some(turn),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// The history and tools passed on the `index`-th call.
    pub fn request(&self, index: usize) -> (Vec<TurnEntry>, Vec<ToolDescriptor>) {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete_turn(
        &self,
        history: &[TurnEntry],
        tools: &[ToolDescriptor],
    ) -> Result<ModelTurn, ModelError> {
        self.requests
            .lock()
            .unwrap()
            .push((history.to_vec(), tools.to_vec()));
        if let Some(turn) = &self.repeat {
            return Ok(turn.clone());
        }
        self.turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::InvalidResponse("script exhausted".into())))
    }
}
