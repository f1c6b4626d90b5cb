use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::conversation::ConversationState;
use crate::error::{HubError, Result};
use crate::llm::LanguageModel;
use crate::provider::SessionSet;
use crate::tool_registry::{ProviderIssue, ToolRegistry};
use crate::types::{content_to_text, ContentBlock, ToolResult, TurnEntry};

/// Default cap on tool-dispatch rounds per query.
pub const DEFAULT_MAX_ROUNDS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    AwaitingModel,
    DispatchingTools,
    Done,
}

/// A tool use waiting to be dispatched.
struct PendingCall {
    id: String,
    name: String,
    arguments: Value,
}

/// Drives the model-call / tool-call cycle for one conversation.
///
/// Owns the provider sessions, the tool registry built from them, and the
/// conversation history. Queries take `&mut self`, so a host sharing one
/// orchestrator between tasks must serialize access itself.
pub struct Orchestrator {
    model: Arc<dyn LanguageModel>,
    sessions: SessionSet,
    registry: ToolRegistry,
    history: ConversationState,
    max_rounds: Option<usize>,
}

impl Orchestrator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            sessions: SessionSet::new(),
            registry: ToolRegistry::new(),
            history: ConversationState::new(),
            max_rounds: Some(DEFAULT_MAX_ROUNDS),
        }
    }

    pub fn from_config(model: Arc<dyn LanguageModel>, config: &AgentConfig) -> Self {
        Self::new(model).with_max_rounds(config.max_rounds())
    }

    /// Cap the number of tool-dispatch rounds per query. `None` removes the cap.
    pub fn with_max_rounds(mut self, max_rounds: Option<usize>) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Take ownership of the sessions and build the tool registry from them.
    /// Returns the problems recorded while listing tools.
    pub async fn initialize(&mut self, sessions: SessionSet) -> &[ProviderIssue] {
        self.sessions = sessions;
        self.registry.refresh(&self.sessions).await;
        self.registry.issues()
    }

    /// Run one user query to completion and return the accumulated output:
    /// model text plus a trace line for every tool call, in emission order.
    pub async fn process_query(&mut self, query: &str) -> Result<String> {
        if self.sessions.is_empty() {
            return Err(HubError::NoSessions);
        }

        let mut working = self.history.working_copy();
        working.push(TurnEntry::user(query));

        let tools = self.registry.tools_for_model();
        let mut output: Vec<String> = Vec::new();
        let mut pending: Vec<PendingCall> = Vec::new();
        let mut rounds = 0usize;
        let mut model_calls = 0usize;
        let mut state = LoopState::AwaitingModel;

        while state != LoopState::Done {
            state = match state {
                LoopState::AwaitingModel => {
                    model_calls += 1;
                    debug!("Model call {} ({} history entries)", model_calls, working.len());

                    let turn = self.model.complete_turn(working.entries(), &tools).await?;

                    for block in &turn.blocks {
                        match block {
                            ContentBlock::Text { text } => output.push(text.clone()),
                            ContentBlock::ToolUse { id, name, arguments } => {
                                pending.push(PendingCall {
                                    id: id.clone(),
                                    name: name.clone(),
                                    arguments: arguments.clone(),
                                })
                            }
                        }
                    }

                    if !turn.blocks.is_empty() {
                        working.push(TurnEntry::Assistant { blocks: turn.blocks });
                    }

                    if pending.is_empty() {
                        LoopState::Done
                    } else {
                        if let Some(max) = self.max_rounds {
                            if rounds >= max {
                                warn!("Hit max tool rounds ({}), abandoning query", max);
                                return Err(HubError::LoopExceeded(max));
                            }
                        }
                        LoopState::DispatchingTools
                    }
                }
                LoopState::DispatchingTools => {
                    rounds += 1;
                    debug!("Dispatching {} tool call(s), round {}", pending.len(), rounds);

                    let mut results = Vec::with_capacity(pending.len());
                    for call in pending.drain(..) {
                        results.push(self.dispatch(call, &mut output).await);
                    }
                    working.push(TurnEntry::ToolResults { results });
                    LoopState::AwaitingModel
                }
                LoopState::Done => LoopState::Done,
            };
        }

        info!(
            "Query finished after {} model call(s) and {} tool round(s)",
            model_calls, rounds
        );
        self.history.replace(working);
        Ok(output.join("\n"))
    }

    /// Run a single tool call. Never fails: every problem becomes an error
    /// result plus a trace line.
    async fn dispatch(&self, call: PendingCall, output: &mut Vec<String>) -> ToolResult {
        let PendingCall { id, name, arguments } = call;

        let Some(session_id) = self.registry.resolve(&name) else {
            let err = HubError::ToolNotFound(name.clone());
            warn!("Model requested unregistered tool '{}'", name);
            output.push(format!("[Error: tool '{}' not found in any connected provider]", name));
            return ToolResult::error(id, err.to_string());
        };

        let session = match self.sessions.get(session_id) {
            Some(session) if session.is_alive() => session,
            _ => {
                warn!("Provider '{}' for tool '{}' is no longer connected", session_id, name);
                output.push(format!(
                    "[Error: provider '{}' for tool '{}' is unavailable]",
                    session_id, name
                ));
                return ToolResult::error(
                    id,
                    format!("Provider for tool '{}' is unavailable", name),
                );
            }
        };

        output.push(format!(
            "[Calling tool {} on {} with args {}]",
            name, session_id, arguments
        ));

        match session.call_tool(&name, arguments).await {
            Ok(result) => {
                let text = content_to_text(&result.content);
                if result.is_error {
                    output.push(format!("[Tool {} reported an error: {}]", name, text));
                } else {
                    output.push(format!("[Tool {} result: {}]", name, text));
                }
                ToolResult {
                    id,
                    content: result.content,
                    is_error: result.is_error,
                }
            }
            Err(e) => {
                let err = HubError::ToolExecution {
                    tool_name: name.clone(),
                    message: e.to_string(),
                };
                warn!("Calling '{}' on provider '{}' failed: {}", name, session_id, e);
                output.push(format!("[Error executing tool {}: {}]", name, e));
                ToolResult::error(id, err.to_string())
            }
        }
    }

    /// Close every session and forget all registry and history state.
    pub async fn shutdown(&mut self) {
        let sessions = self.sessions.drain();
        let count = sessions.len();
        for (id, session) in sessions {
            if let Err(e) = session.close().await {
                warn!("Closing provider '{}' failed: {}", id, e);
            }
        }
        self.registry.clear();
        self.history.clear();
        info!("Orchestrator shut down, {} session(s) closed", count);
    }

    /// Drop one session without rebuilding the registry. Tools it owned stay
    /// visible to the model but resolve to an error result.
    pub fn disconnect(&mut self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            info!("Provider '{}' disconnected", session_id);
        }
        removed
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn has_sessions(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn sessions(&self) -> &SessionSet {
        &self.sessions
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn history(&self) -> &ConversationState {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelError;
    use crate::provider::ProviderError;
    use crate::testing::{MockSession, ScriptedModel};
    use crate::types::{ModelTurn, StopReason};
    use serde_json::json;

    fn text_turn(text: &str) -> ModelTurn {
        ModelTurn::new(vec![ContentBlock::text(text)], StopReason::EndTurn)
    }

    fn tool_turn(calls: &[(&str, &str)]) -> ModelTurn {
        let blocks = calls
            .iter()
            .map(|(id, name)| ContentBlock::tool_use(*id, *name, json!({"q": id})))
            .collect();
        ModelTurn::new(blocks, StopReason::ToolUse)
    }

    async fn orchestrator_with(
        model: Arc<ScriptedModel>,
        sessions: Vec<(&str, Arc<MockSession>)>,
    ) -> Orchestrator {
        let mut set = SessionSet::new();
        for (id, session) in sessions {
            set.insert(id, session);
        }
        let mut orchestrator = Orchestrator::new(model);
        orchestrator.initialize(set).await;
        orchestrator
    }

    #[tokio::test]
    async fn test_text_only_response_uses_one_model_call() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(ModelTurn::new(
            vec![ContentBlock::text("first"), ContentBlock::text("second")],
            StopReason::EndTurn,
        ))]));
        let session = Arc::new(MockSession::with_tools(&["echo"]));
        let mut orchestrator = orchestrator_with(model.clone(), vec![("p", session)]).await;

        let output = orchestrator.process_query("hello").await.unwrap();

        assert_eq!(output, "first\nsecond");
        assert_eq!(model.call_count(), 1);
        let history = orchestrator.history().entries();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], TurnEntry::user("hello"));
        assert!(history[1].is_assistant());
    }

    #[tokio::test]
    async fn test_n_rounds_make_n_plus_one_model_calls() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(tool_turn(&[("t1", "echo")])),
            Ok(tool_turn(&[("t2", "echo")])),
            Ok(text_turn("done")),
        ]));
        let session = Arc::new(MockSession::with_tools(&["echo"]));
        let mut orchestrator = orchestrator_with(model.clone(), vec![("p", session)]).await;

        orchestrator.process_query("go").await.unwrap();

        assert_eq!(model.call_count(), 3);
        let history = orchestrator.history();
        // user + 2 * (assistant, tool results) + final assistant
        assert_eq!(history.len(), 6);
        let entries = history.entries();
        assert!(entries[1].is_assistant() && entries[2].is_tool_results());
        assert!(entries[3].is_assistant() && entries[4].is_tool_results());
        assert!(entries[5].is_assistant());
        assert!(history.is_well_paired());
    }

    #[tokio::test]
    async fn test_text_accumulates_across_turns_in_order() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(ModelTurn::new(
                vec![
                    ContentBlock::text("let me check"),
                    ContentBlock::tool_use("t1", "echo", json!({"msg": "hi"})),
                ],
                StopReason::ToolUse,
            )),
            Ok(text_turn("all good")),
        ]));
        let session = Arc::new(MockSession::with_tools(&["echo"]));
        let mut orchestrator = orchestrator_with(model, vec![("p", session)]).await;

        let output = orchestrator.process_query("check").await.unwrap();
        let lines: Vec<&str> = output.lines().collect();

        assert_eq!(lines.first(), Some(&"let me check"));
        assert_eq!(lines.last(), Some(&"all good"));
        assert!(output.contains("[Calling tool echo on p"));
        assert!(output.contains("[Tool echo result: echo ok]"));

        assert_eq!(
            orchestrator.history().entries()[1],
            TurnEntry::Assistant {
                blocks: vec![
                    ContentBlock::text("let me check"),
                    ContentBlock::tool_use("t1", "echo", json!({"msg": "hi"})),
                ],
            }
        );
    }

    #[tokio::test]
    async fn test_assistant_entry_keeps_block_order() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(ModelTurn::new(
                vec![
                    ContentBlock::tool_use("t1", "echo", json!({})),
                    ContentBlock::text("between"),
                    ContentBlock::tool_use("t2", "echo", json!({})),
                ],
                StopReason::ToolUse,
            )),
            Ok(text_turn("done")),
        ]));
        let session = Arc::new(MockSession::with_tools(&["echo"]));
        let mut orchestrator = orchestrator_with(model, vec![("p", session)]).await;

        let output = orchestrator.process_query("go").await.unwrap();
        assert!(output.starts_with("between\n"));

        let entries = orchestrator.history().entries();
        assert_eq!(
            entries[1],
            TurnEntry::Assistant {
                blocks: vec![
                    ContentBlock::tool_use("t1", "echo", json!({})),
                    ContentBlock::text("between"),
                    ContentBlock::tool_use("t2", "echo", json!({})),
                ],
            }
        );
        let TurnEntry::ToolResults { results } = &entries[2] else {
            panic!("expected tool results after the assistant entry");
        };
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_error_result() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(tool_turn(&[("t1", "teleport")])),
            Ok(text_turn("sorry")),
        ]));
        let session = Arc::new(MockSession::with_tools(&["echo"]));
        let mut orchestrator =
            orchestrator_with(model.clone(), vec![("p", session.clone())]).await;

        let output = orchestrator.process_query("beam me up").await.unwrap();

        assert!(output.contains("teleport"));
        assert!(session.calls().is_empty());

        let TurnEntry::ToolResults { results } = &orchestrator.history().entries()[2] else {
            panic!("expected tool results entry");
        };
        assert_eq!(results.len(), 1);
        assert!(results[0].is_error);
        assert_eq!(results[0].id, "t1");
        assert!(content_to_text(&results[0].content).contains("teleport"));

        // The model saw the error result on its second call.
        let (seen, _) = model.request(1);
        assert!(seen.last().unwrap().is_tool_results());
    }

    #[tokio::test]
    async fn test_failed_call_does_not_abort_batch() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(tool_turn(&[("a", "first"), ("b", "broken"), ("c", "third")])),
            Ok(text_turn("finished")),
        ]));
        let session = Arc::new(
            MockSession::with_tools(&["first", "broken", "third"])
                .fail_tool("broken", ProviderError::Timeout("tools/call".into())),
        );
        let mut orchestrator =
            orchestrator_with(model, vec![("p", session.clone())]).await;

        let output = orchestrator.process_query("run all").await.unwrap();

        let called: Vec<String> = session.calls().into_iter().map(|(name, _)| name).collect();
        assert_eq!(called, vec!["first", "broken", "third"]);

        let TurnEntry::ToolResults { results } = &orchestrator.history().entries()[2] else {
            panic!("expected tool results entry");
        };
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(!results[0].is_error);
        assert!(results[1].is_error);
        assert!(!results[2].is_error);
        assert!(output.contains("[Error executing tool broken: request timed out"));
    }

    #[tokio::test]
    async fn test_provider_reported_error_is_passed_through() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(tool_turn(&[("a", "lookup")])),
            Ok(text_turn("ok")),
        ]));
        let session = Arc::new(MockSession::with_tools(&["lookup"]).respond(
            "lookup",
            crate::types::ToolCallOutput {
                content: crate::types::text_content("no such city"),
                is_error: true,
            },
        ));
        let mut orchestrator = orchestrator_with(model, vec![("p", session)]).await;

        let output = orchestrator.process_query("weather in Atlantis").await.unwrap();

        assert!(output.contains("[Tool lookup reported an error: no such city]"));
        let TurnEntry::ToolResults { results } = &orchestrator.history().entries()[2] else {
            panic!("expected tool results entry");
        };
        assert!(results[0].is_error);
    }

    #[tokio::test]
    async fn test_disconnected_session_yields_error_result() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(tool_turn(&[("a", "remote"), ("b", "local")])),
            Ok(text_turn("partial")),
        ]));
        let gone = Arc::new(MockSession::with_tools(&["remote"]));
        let here = Arc::new(MockSession::with_tools(&["local"]));
        let mut orchestrator = orchestrator_with(
            model,
            vec![("gone", gone.clone()), ("here", here.clone())],
        )
        .await;

        assert!(orchestrator.disconnect("gone"));
        let output = orchestrator.process_query("both").await.unwrap();

        assert!(gone.calls().is_empty());
        assert_eq!(here.calls().len(), 1);
        assert!(output.contains("provider 'gone' for tool 'remote' is unavailable"));
    }

    #[tokio::test]
    async fn test_dead_session_yields_error_result() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(tool_turn(&[("a", "echo")])),
            Ok(text_turn("ok")),
        ]));
        let session = Arc::new(MockSession::with_tools(&["echo"]));
        let mut orchestrator =
            orchestrator_with(model, vec![("p", session.clone())]).await;

        session.set_alive(false);
        orchestrator.process_query("hi").await.unwrap();

        assert!(session.calls().is_empty());
        let TurnEntry::ToolResults { results } = &orchestrator.history().entries()[2] else {
            panic!("expected tool results entry");
        };
        assert!(results[0].is_error);
    }

    #[tokio::test]
    async fn test_shutdown_then_query_fails() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(text_turn("hi"))]));
        let session = Arc::new(MockSession::with_tools(&["echo"]));
        let mut orchestrator =
            orchestrator_with(model.clone(), vec![("p", session.clone())]).await;
        orchestrator.process_query("first").await.unwrap();

        orchestrator.shutdown().await;

        assert!(session.was_closed());
        assert!(orchestrator.registry().is_empty());
        assert!(orchestrator.history().is_empty());
        let err = orchestrator.process_query("second").await.unwrap_err();
        assert!(matches!(err, HubError::NoSessions));
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_uninitialized_orchestrator_fails() {
        let model = Arc::new(ScriptedModel::new(Vec::new()));
        let mut orchestrator = Orchestrator::new(model.clone());
        let err = orchestrator.process_query("hello").await.unwrap_err();
        assert!(matches!(err, HubError::NoSessions));
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_model_error_leaves_history_untouched() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(text_turn("one")),
            Ok(tool_turn(&[("a", "echo")])),
            Err(ModelError::Api {
                status: 529,
                message: "overloaded".into(),
            }),
        ]));
        let session = Arc::new(MockSession::with_tools(&["echo"]));
        let mut orchestrator = orchestrator_with(model, vec![("p", session)]).await;

        orchestrator.process_query("first").await.unwrap();
        assert_eq!(orchestrator.history().len(), 2);

        let err = orchestrator.process_query("second").await.unwrap_err();
        assert!(matches!(err, HubError::Model(_)));
        assert_eq!(orchestrator.history().len(), 2);
    }

    #[tokio::test]
    async fn test_max_rounds_guard() {
        let model = Arc::new(ScriptedModel::repeating(tool_turn(&[("a", "echo")])));
        let session = Arc::new(MockSession::with_tools(&["echo"]));
        let mut set = SessionSet::new();
        set.insert("p", session.clone());
        let mut orchestrator = Orchestrator::new(model.clone()).with_max_rounds(Some(3));
        orchestrator.initialize(set).await;

        let err = orchestrator.process_query("loop").await.unwrap_err();

        assert!(matches!(err, HubError::LoopExceeded(3)));
        assert_eq!(session.calls().len(), 3);
        assert_eq!(model.call_count(), 4);
        assert!(orchestrator.history().is_empty());
    }

    #[tokio::test]
    async fn test_no_tools_offered_when_registry_empty() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(text_turn("plain"))]));
        let session = Arc::new(MockSession::with_tools(&[]));
        let mut orchestrator = orchestrator_with(model.clone(), vec![("p", session)]).await;

        orchestrator.process_query("hi").await.unwrap();

        let (_, tools) = model.request(0);
        assert!(tools.is_empty());
    }

    #[tokio::test]
    async fn test_history_carries_across_queries() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(text_turn("one")),
            Ok(text_turn("two")),
        ]));
        let session = Arc::new(MockSession::with_tools(&["echo"]));
        let mut orchestrator = orchestrator_with(model.clone(), vec![("p", session)]).await;

        orchestrator.process_query("first").await.unwrap();
        orchestrator.process_query("second").await.unwrap();

        let (seen, _) = model.request(1);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], TurnEntry::user("first"));
        assert_eq!(seen[2], TurnEntry::user("second"));
        assert_eq!(orchestrator.history().len(), 4);
    }

    #[tokio::test]
    async fn test_empty_turn_is_not_recorded() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(ModelTurn::new(
            Vec::new(),
            StopReason::EndTurn,
        ))]));
        let session = Arc::new(MockSession::with_tools(&["echo"]));
        let mut orchestrator = orchestrator_with(model, vec![("p", session)]).await;

        let output = orchestrator.process_query("anything?").await.unwrap();

        assert!(output.is_empty());
        assert_eq!(orchestrator.history().len(), 1);
    }
}
