use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use toolhub_core::config::ProviderConfig;
use toolhub_core::error::HubError;
use toolhub_core::provider::{ProviderError, ProviderSession};
use toolhub_core::types::{ToolCallOutput, ToolDescriptor};

use crate::protocol::{
    initialize_params, parse_call_result, parse_line, reply_to_request, Incoming,
    RpcErrorObject, RpcRequest, ToolsPage,
};

type Waiter = oneshot::Sender<Result<Value, RpcErrorObject>>;
type WaiterRx = oneshot::Receiver<Result<Value, RpcErrorObject>>;
type PendingMap = Arc<Mutex<HashMap<u64, Waiter>>>;
type SharedStdin = Arc<tokio::sync::Mutex<ChildStdin>>;

fn lock(pending: &Mutex<HashMap<u64, Waiter>>) -> MutexGuard<'_, HashMap<u64, Waiter>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Register a waiter for `id`. The liveness check runs after the insert: the
/// reader marks the session dead before it clears `pending`, so a waiter is
/// either cleared by the reader or refused here.
fn register_waiter(
    pending: &Mutex<HashMap<u64, Waiter>>,
    alive: &AtomicBool,
    id: u64,
) -> Result<WaiterRx, ProviderError> {
    let (tx, rx) = oneshot::channel();
    lock(pending).insert(id, tx);
    if !alive.load(Ordering::SeqCst) {
        lock(pending).remove(&id);
        return Err(ProviderError::Closed);
    }
    Ok(rx)
}

async fn write_line(
    stdin: &tokio::sync::Mutex<ChildStdin>,
    line: &str,
) -> Result<(), ProviderError> {
    let mut stdin = stdin.lock().await;
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ProviderError::Transport(e.to_string()))?;
    stdin
        .flush()
        .await
        .map_err(|e| ProviderError::Transport(e.to_string()))
}

/// An MCP server running as a child process, spoken to over stdin/stdout.
pub struct StdioSession {
    name: String,
    stdin: SharedStdin,
    child: tokio::sync::Mutex<Option<Child>>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl StdioSession {
    /// Launch the provider process and complete the MCP handshake.
    pub async fn spawn(
        config: &ProviderConfig,
        request_timeout: Duration,
    ) -> Result<Self, HubError> {
        config.validate()?;

        let connect_error = |message: String| HubError::ProviderConnect {
            provider: config.name.clone(),
            message,
        };

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| connect_error(format!("failed to start '{}': {}", config.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| connect_error("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| connect_error("stdout not captured".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(config.name.clone(), stderr));
        }

        let stdin: SharedStdin = Arc::new(tokio::sync::Mutex::new(stdin));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            config.name.clone(),
            stdout,
            stdin.clone(),
            pending.clone(),
            alive.clone(),
        ));

        let session = Self {
            name: config.name.clone(),
            stdin,
            child: tokio::sync::Mutex::new(Some(child)),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            request_timeout,
            reader,
        };

        session
            .handshake()
            .await
            .map_err(|e| connect_error(format!("handshake failed: {}", e)))?;
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn handshake(&self) -> Result<(), ProviderError> {
        let result = self
            .request(
                "initialize",
                Some(initialize_params("toolhub", env!("CARGO_PKG_VERSION"))),
            )
            .await?;

        let server = result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!("Provider '{}' initialized (server: {})", self.name, server);

        self.notify("notifications/initialized").await
    }

    /// Send a request and wait for the matching response.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ProviderError> {
        if !self.is_alive() {
            return Err(ProviderError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = RpcRequest::call(id, method, params).to_line()?;

        // Register before writing so a fast reply cannot race the waiter.
        let rx = register_waiter(&self.pending, &self.alive, id)?;

        if let Err(e) = write_line(&self.stdin, &line).await {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(ProviderError::Rpc {
                code: error.code,
                message: error.message,
            }),
            Ok(Err(_)) => Err(ProviderError::Closed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(ProviderError::Timeout(method.to_string()))
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<(), ProviderError> {
        let line = RpcRequest::notification(method, None).to_line()?;
        write_line(&self.stdin, &line).await
    }
}

#[async_trait]
impl ProviderSession for StdioSession {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ProviderError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen_cursors = HashSet::new();

        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page = ToolsPage::parse(self.request("tools/list", params).await?)?;
            let next = page.next_cursor.clone();
            tools.extend(page.into_descriptors());

            match next {
                Some(next) if seen_cursors.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    warn!("Provider '{}' repeated tools cursor '{}'", self.name, next);
                    break;
                }
                None => break,
            }
        }

        debug!("Provider '{}' listed {} tools", self.name, tools.len());
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallOutput, ProviderError> {
        debug!("Calling tool '{}' on provider '{}'", name, self.name);
        let result = self
            .request(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        parse_call_result(result)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.alive.store(false, Ordering::SeqCst);
        self.reader.abort();
        lock(&self.pending).clear();

        if let Some(mut child) = self.child.lock().await.take() {
            child
                .kill()
                .await
                .map_err(|e| ProviderError::Transport(format!("killing provider: {}", e)))?;
        }
        info!("Provider '{}' closed", self.name);
        Ok(())
    }
}

impl Drop for StdioSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Route responses from the provider's stdout to their waiters and answer the
/// provider's own requests. On EOF the session is marked dead and in-flight
/// requests fail with `Closed`.
async fn read_loop(
    name: String,
    stdout: ChildStdout,
    stdin: SharedStdin,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&line) {
                    Ok(Incoming::Response { id, outcome }) => {
                        let waiter = lock(&pending).remove(&id);
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(outcome);
                            }
                            None => {
                                warn!("Provider '{}' answered unknown request id {}", name, id)
                            }
                        }
                    }
                    Ok(Incoming::Notification { method }) => {
                        debug!("Provider '{}' notification: {}", name, method);
                    }
                    Ok(Incoming::Request { id, method }) => {
                        if method != "ping" {
                            warn!("Provider '{}' sent unsupported request: {}", name, method);
                        }
                        let reply = reply_to_request(&id, &method);
                        if let Err(e) = write_line(&stdin, &reply).await {
                            warn!("Answering '{}' from provider '{}' failed: {}", method, name, e);
                        }
                    }
                    Err(e) => debug!("Ignoring output from provider '{}': {}", name, e),
                }
            }
            Ok(None) => {
                info!("Provider '{}' closed its output", name);
                break;
            }
            Err(e) => {
                warn!("Reading from provider '{}' failed: {}", name, e);
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    lock(&pending).clear();
}

async fn forward_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(provider = %name, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str, command: &str, args: &[&str]) -> ProviderConfig {
        ProviderConfig {
            name: name.into(),
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_connect_error() {
        let config = provider("ghost", "toolhub-no-such-binary", &[]);
        let err = StdioSession::spawn(&config, Duration::from_secs(5))
            .await
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, HubError::ProviderConnect { .. }));
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_invalid_config_is_config_error() {
        let config = provider("empty", "", &[]);
        let err = StdioSession::spawn(&config, Duration::from_secs(5))
            .await
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, HubError::Config(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scripted_server_roundtrip() {
        // Answers initialize, tools/list and one tools/call, then exits.
        let script = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0"}}}'
read line
read line
echo 'server ready'
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"ping","description":"Ping","inputSchema":{"type":"object"}}]}}'
read line
echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"pong"}],"isError":false}}'
"#;
        let config = provider("fake", "sh", &["-c", script]);
        let session = StdioSession::spawn(&config, Duration::from_secs(10))
            .await
            .expect("handshake should succeed");

        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "ping");

        let output = session.call_tool("ping", json!({})).await.unwrap();
        assert_eq!(output.content[0]["text"], "pong");
        assert!(!output.is_error);

        session.close().await.unwrap();
        assert!(!session.is_alive());
        assert!(matches!(
            session.call_tool("ping", json!({})).await,
            Err(ProviderError::Closed)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rpc_error_is_reported() {
        let script = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}'
read line
read line
echo '{"jsonrpc":"2.0","id":2,"error":{"code":-32602,"message":"Unknown tool"}}'
read line
"#;
        let config = provider("strict", "sh", &["-c", script]);
        let session = StdioSession::spawn(&config, Duration::from_secs(10))
            .await
            .expect("handshake should succeed");

        let err = session.call_tool("nope", json!({})).await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::Rpc {
                code: -32602,
                message: "Unknown tool".into()
            }
        );
        session.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cycling_cursors_stop_pagination() {
        // Cursors go a -> b -> a; the third page must end the listing.
        let script = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}'
read line
read line
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"one","inputSchema":{"type":"object"}}],"nextCursor":"a"}}'
read line
echo '{"jsonrpc":"2.0","id":3,"result":{"tools":[{"name":"two","inputSchema":{"type":"object"}}],"nextCursor":"b"}}'
read line
echo '{"jsonrpc":"2.0","id":4,"result":{"tools":[{"name":"three","inputSchema":{"type":"object"}}],"nextCursor":"a"}}'
read line
"#;
        let config = provider("pager", "sh", &["-c", script]);
        let session = StdioSession::spawn(&config, Duration::from_secs(10))
            .await
            .expect("handshake should succeed");

        let tools = session.list_tools().await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two", "three"]);
        session.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_server_ping_is_answered() {
        // The server pings mid-listing and only answers tools/list once the
        // ping reply arrives.
        let script = r##"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}'
read line
read line
echo '{"jsonrpc":"2.0","id":"srv-1","method":"ping"}'
read reply
case "$reply" in
  *'"id":"srv-1"'*'"result"'*) tool=pong_received ;;
  *) tool=unexpected_reply ;;
esac
echo "{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"tools\":[{\"name\":\"$tool\",\"inputSchema\":{\"type\":\"object\"}}]}}"
read line
"##;
        let config = provider("pinger", "sh", &["-c", script]);
        let session = StdioSession::spawn(&config, Duration::from_secs(10))
            .await
            .expect("handshake should succeed");

        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools[0].name, "pong_received");
        session.close().await.unwrap();
    }

    #[test]
    fn test_waiter_refused_after_reader_exit() {
        let pending = Mutex::new(HashMap::new());
        let alive = AtomicBool::new(true);
        assert!(register_waiter(&pending, &alive, 1).is_ok());
        assert_eq!(lock(&pending).len(), 1);

        // Reader saw EOF: marked dead, then cleared.
        alive.store(false, Ordering::SeqCst);
        lock(&pending).clear();

        assert!(matches!(
            register_waiter(&pending, &alive, 2),
            Err(ProviderError::Closed)
        ));
        assert!(lock(&pending).is_empty());
    }
}
