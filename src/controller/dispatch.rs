//! Command table and dispatcher
//!
//! Maps a request's command name to its handler, enforces the enablement
//! policy and turns every handler failure (including panics) into an error
//! reply addressed to the originating client. Restart and shutdown do not run
//! a handler; they surface a [`ControlSignal`] to the lifecycle instead.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::error::DispatchError;
use super::message::{ControlSignal, Params, Reply, Request};
use crate::provider::{PaperListQuery, Provider, Span};

/// Every command the server understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Paper selection table
    GetPaperList,
    /// Full view of one paper
    GetPaperData,
    /// Comments of a paper
    GetComments,
    /// Replace the comments of a paper
    SaveComments,
    /// Create a manual event
    NewEvent,
    /// Delete a manual event
    DeleteEvent,
    /// Move an event's interval
    ResizeEvent,
    /// Toggle the false-positive flag of a reach event
    FalsePositive,
    /// Create a manual context
    NewContext,
    /// Delete a manual context
    DeleteContext,
    /// Replace the groundings associated with an event
    SaveEventContexts,
    /// Activate the second annotation pass of a paper
    SecondAnnotationPass,
    /// Load the bundled sample paper
    ToyLoad,
    /// Message of the day
    Motd,
    /// Connectivity check
    TestConnection,
    /// Diagnostic no-op
    Test,
    /// Liveness check
    Ping,
    /// Restart the controller instance
    Restart,
    /// Shut the server down
    Shutdown,
}

impl Command {
    /// The whole command table
    pub const ALL: [Command; 19] = [
        Command::GetPaperList,
        Command::GetPaperData,
        Command::GetComments,
        Command::SaveComments,
        Command::NewEvent,
        Command::DeleteEvent,
        Command::ResizeEvent,
        Command::FalsePositive,
        Command::NewContext,
        Command::DeleteContext,
        Command::SaveEventContexts,
        Command::SecondAnnotationPass,
        Command::ToyLoad,
        Command::Motd,
        Command::TestConnection,
        Command::Test,
        Command::Ping,
        Command::Restart,
        Command::Shutdown,
    ];

    /// Look up a command by its wire name
    pub fn parse(name: &str) -> Option<Command> {
        Command::ALL.into_iter().find(|command| command.as_str() == name)
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::GetPaperList => "get_paper_list",
            Command::GetPaperData => "get_paper_data",
            Command::GetComments => "get_comments",
            Command::SaveComments => "save_comments",
            Command::NewEvent => "new_event",
            Command::DeleteEvent => "delete_event",
            Command::ResizeEvent => "resize_event",
            Command::FalsePositive => "false_positive",
            Command::NewContext => "new_context",
            Command::DeleteContext => "delete_context",
            Command::SaveEventContexts => "save_event_contexts",
            Command::SecondAnnotationPass => "second_annotation_pass",
            Command::ToyLoad => "toy_load",
            Command::Motd => "motd",
            Command::TestConnection => "test_connection",
            Command::Test => "test",
            Command::Ping => "ping",
            Command::Restart => "restart",
            Command::Shutdown => "shutdown",
        }
    }

    /// Control signal raised instead of running a handler
    pub fn signal(&self) -> Option<ControlSignal> {
        match self {
            Command::Restart => Some(ControlSignal::Restart),
            Command::Shutdown => Some(ControlSignal::Shutdown),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-command enablement; names absent from the map are enabled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandPolicy(BTreeMap<String, bool>);

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::allow_all()
            .with("resize_event", true)
            .with("toy_load", false)
    }
}

impl CommandPolicy {
    /// Policy that enables everything
    pub fn allow_all() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style override
    pub fn with(mut self, command: &str, enabled: bool) -> Self {
        self.set(command, enabled);
        self
    }

    /// Enable or disable a command
    pub fn set(&mut self, command: &str, enabled: bool) {
        self.0.insert(command.to_string(), enabled);
    }

    /// Apply the debug switch: diagnostics are only reachable in debug mode
    pub fn for_debug(mut self, debug: bool) -> Self {
        if !debug {
            self.set(Command::Test.as_str(), false);
        }
        self
    }

    /// Whether a command name may be executed
    pub fn is_enabled(&self, command: &str) -> bool {
        self.0.get(command).copied().unwrap_or(true)
    }

    /// Names explicitly disabled
    pub fn disabled(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|(_, enabled)| !**enabled)
            .map(|(name, _)| name.as_str())
    }
}

/// Result of dispatching one request
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// A normal reply
    Reply(Reply),
    /// A flow-transfer command: acknowledge, then hand the signal on
    Control {
        /// Acknowledgement for the originating client (`data: null`)
        reply: Reply,
        /// Signal for the lifecycle
        signal: ControlSignal,
    },
}

impl Dispatched {
    /// The reply to deliver
    pub fn reply(&self) -> &Reply {
        match self {
            Dispatched::Reply(reply) | Dispatched::Control { reply, .. } => reply,
        }
    }

    /// Signal raised, if any
    pub fn signal(&self) -> Option<ControlSignal> {
        match self {
            Dispatched::Reply(_) => None,
            Dispatched::Control { signal, .. } => Some(*signal),
        }
    }

    /// Split into reply and signal
    pub fn into_parts(self) -> (Reply, Option<ControlSignal>) {
        match self {
            Dispatched::Reply(reply) => (reply, None),
            Dispatched::Control { reply, signal } => (reply, Some(signal)),
        }
    }
}

enum Handled {
    Data(Value),
    Control(ControlSignal),
}

/// Executes requests against the provider
pub struct Dispatcher<P> {
    provider: Arc<Mutex<P>>,
    policy: CommandPolicy,
    motd_file: Option<PathBuf>,
}

impl<P> Clone for Dispatcher<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            policy: self.policy.clone(),
            motd_file: self.motd_file.clone(),
        }
    }
}

impl<P: Provider> Dispatcher<P> {
    /// Create a dispatcher over a shared provider
    pub fn new(provider: Arc<Mutex<P>>, policy: CommandPolicy, motd_file: Option<PathBuf>) -> Self {
        Self {
            provider,
            policy,
            motd_file,
        }
    }

    /// The shared provider
    pub fn provider(&self) -> &Arc<Mutex<P>> {
        &self.provider
    }

    /// The enablement policy in force
    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    /// Error reply for input that could not be decoded into a request
    pub fn malformed(reason: &str) -> Reply {
        Reply::failure(Value::Null, "", &DispatchError::Parse(reason.to_string()))
    }

    /// Dispatch one request; never fails, errors become error replies
    pub async fn dispatch(&self, request: Request) -> Dispatched {
        let outcome = AssertUnwindSafe(self.execute(&request))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(Handled::Data(data))) => Dispatched::Reply(Reply::success(&request, data)),
            Ok(Ok(Handled::Control(signal))) => {
                debug!(command = %request.command, signal = %signal, "control command received");
                Dispatched::Control {
                    reply: Reply::success(&request, Value::Null),
                    signal,
                }
            }
            Ok(Err(err)) => {
                debug!(command = %request.command, code = err.code(), error = %err, "command failed");
                Dispatched::Reply(Reply::failure(request.id, request.command, &err))
            }
            Err(payload) => {
                let message = panic_message(&*payload);
                error!(command = %request.command, panic = %message, "command handler panicked");
                let err = DispatchError::Panicked(message);
                Dispatched::Reply(Reply::failure(request.id, request.command, &err))
            }
        }
    }

    async fn execute(&self, request: &Request) -> Result<Handled, DispatchError> {
        if !self.policy.is_enabled(&request.command) {
            warn!(command = %request.command, "client requested a disabled command");
            return Err(DispatchError::Disabled(request.command.clone()));
        }

        let Some(command) = Command::parse(&request.command) else {
            warn!(command = %request.command, "client requested an unknown command");
            return Err(DispatchError::InvalidCommand(request.command.clone()));
        };

        if let Some(signal) = command.signal() {
            return Ok(Handled::Control(signal));
        }

        let params = &request.params;
        let data = match command {
            Command::GetPaperList => self.cmd_get_paper_list(params).await?,
            Command::GetPaperData => self.cmd_get_paper_data(params).await?,
            Command::GetComments => self.cmd_get_comments(params).await?,
            Command::SaveComments => self.cmd_save_comments(params).await?,
            Command::NewEvent => self.cmd_new_event(params).await?,
            Command::DeleteEvent => self.cmd_delete_event(params).await?,
            Command::ResizeEvent => self.cmd_resize_event(params).await?,
            Command::FalsePositive => self.cmd_false_positive(params).await?,
            Command::NewContext => self.cmd_new_context(params).await?,
            Command::DeleteContext => self.cmd_delete_context(params).await?,
            Command::SaveEventContexts => self.cmd_save_event_contexts(params).await?,
            Command::SecondAnnotationPass => self.cmd_second_annotation_pass(params).await?,
            Command::ToyLoad => self.cmd_toy_load().await?,
            Command::Motd => self.cmd_motd().await?,
            Command::TestConnection => json!({ "text": "The connection is working." }),
            Command::Test => Value::Bool(true),
            Command::Ping => json!("pong"),
            Command::Restart | Command::Shutdown => Value::Null,
        };
        Ok(Handled::Data(data))
    }

    async fn cmd_get_paper_list(&self, params: &Params) -> Result<Value, DispatchError> {
        let query = PaperListQuery {
            draw: params.optional_u64("draw")?.unwrap_or(0),
            search: params
                .optional_str("search")?
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            start: params.optional_u64("start")?.unwrap_or(0) as usize,
            length: optional_length(params, "length")?,
        };
        let list = self.provider.lock().await.paper_list(query).await?;
        Ok(serde_json::to_value(list)?)
    }

    async fn cmd_get_paper_data(&self, params: &Params) -> Result<Value, DispatchError> {
        let paper_id = params.require_str("paperID")?;
        let data = self.provider.lock().await.paper_data(paper_id).await?;
        Ok(serde_json::to_value(data)?)
    }

    async fn cmd_get_comments(&self, params: &Params) -> Result<Value, DispatchError> {
        let paper_id = params.require_str("paperID")?;
        let comments = self.provider.lock().await.comments(paper_id).await?;
        Ok(serde_json::to_value(comments)?)
    }

    async fn cmd_save_comments(&self, params: &Params) -> Result<Value, DispatchError> {
        let paper_id = params.require_str("paperID")?;
        let comments = params.require_str("comments")?.to_string();
        self.provider
            .lock()
            .await
            .save_comments(paper_id, comments)
            .await?;
        Ok(Value::Bool(true))
    }

    async fn cmd_new_event(&self, params: &Params) -> Result<Value, DispatchError> {
        let span = span_param(params)?;
        let event = self.provider.lock().await.create_event(span).await?;
        Ok(serde_json::to_value(event)?)
    }

    async fn cmd_delete_event(&self, params: &Params) -> Result<Value, DispatchError> {
        let paper_id = params.require_str("paperID")?;
        let event_id = params.require_u64("serverID")?;
        self.provider
            .lock()
            .await
            .delete_event(paper_id, event_id)
            .await?;
        Ok(Value::Bool(true))
    }

    async fn cmd_resize_event(&self, params: &Params) -> Result<Value, DispatchError> {
        let event_id = params.require_u64("serverID")?;
        let start = require_u32(params, "newStart")?;
        let end = require_u32(params, "newEnd")?;
        self.provider
            .lock()
            .await
            .resize_event(event_id, start, end)
            .await?;
        Ok(Value::Bool(true))
    }

    async fn cmd_false_positive(&self, params: &Params) -> Result<Value, DispatchError> {
        let paper_id = params.require_str("paperID")?;
        let event_id = params.require_u64("serverID")?;
        let flag = self
            .provider
            .lock()
            .await
            .toggle_false_positive(paper_id, event_id)
            .await?;
        Ok(json!({ "serverID": event_id, "false_positive": flag }))
    }

    async fn cmd_new_context(&self, params: &Params) -> Result<Value, DispatchError> {
        let span = span_param(params)?;
        let text = params.require_str("contextText")?.to_string();
        let context = self.provider.lock().await.create_context(span, text).await?;
        Ok(serde_json::to_value(context)?)
    }

    async fn cmd_delete_context(&self, params: &Params) -> Result<Value, DispatchError> {
        let paper_id = params.require_str("paperID")?;
        let context_id = params.require_u64("serverID")?;
        self.provider
            .lock()
            .await
            .delete_context(paper_id, context_id)
            .await?;
        Ok(Value::Bool(true))
    }

    async fn cmd_save_event_contexts(&self, params: &Params) -> Result<Value, DispatchError> {
        let event_id = params.require_u64("serverID")?;
        let groundings = params.require_str_list("groundings")?;
        self.provider
            .lock()
            .await
            .save_event_contexts(event_id, groundings)
            .await?;
        Ok(Value::Bool(true))
    }

    async fn cmd_second_annotation_pass(&self, params: &Params) -> Result<Value, DispatchError> {
        let paper_id = params.require_str("paperID")?;
        let pass = self
            .provider
            .lock()
            .await
            .second_annotation_pass(paper_id)
            .await?;
        Ok(serde_json::to_value(pass)?)
    }

    async fn cmd_toy_load(&self) -> Result<Value, DispatchError> {
        let report = self.provider.lock().await.toy_load().await?;
        Ok(serde_json::to_value(report)?)
    }

    async fn cmd_motd(&self) -> Result<Value, DispatchError> {
        let path = self.motd_file.as_ref().ok_or_else(|| {
            DispatchError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no message of the day is configured",
            ))
        })?;
        let text = tokio::fs::read_to_string(path).await?;
        Ok(Value::String(text))
    }
}

fn require_u32(params: &Params, key: &str) -> Result<u32, DispatchError> {
    u32::try_from(params.require_u64(key)?).map_err(|_| DispatchError::invalid_param(key))
}

fn span_param(params: &Params) -> Result<Span, DispatchError> {
    Ok(Span {
        paper_id: params.require_str("paperID")?.to_string(),
        line_num: require_u32(params, "lineNum")?,
        start: require_u32(params, "newStart")?,
        end: require_u32(params, "newEnd")?,
    })
}

// DataTables sends -1 for "all rows".
fn optional_length(params: &Params, key: &str) -> Result<Option<usize>, DispatchError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_i64() {
            Some(n) if n < 0 => Ok(None),
            Some(n) => Ok(Some(n as usize)),
            None => Err(DispatchError::invalid_param(key)),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MemoryProvider, PaperList, ProviderResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher(policy: CommandPolicy) -> Dispatcher<MemoryProvider> {
        Dispatcher::new(
            Arc::new(Mutex::new(MemoryProvider::with_toy_data())),
            policy,
            None,
        )
    }

    fn request(command: &str, params: Params) -> Request {
        Request::new(1, command, params)
    }

    #[test]
    fn command_table_round_trips_names() {
        for command in Command::ALL {
            assert_eq!(Command::parse(command.as_str()), Some(command));
        }
        assert_eq!(Command::parse("view"), None);
        assert_eq!(Command::Shutdown.signal(), Some(ControlSignal::Shutdown));
        assert_eq!(Command::Ping.signal(), None);
    }

    #[test]
    fn default_policy_disables_toy_load_only() {
        let policy = CommandPolicy::default();
        assert!(!policy.is_enabled("toy_load"));
        assert!(policy.is_enabled("resize_event"));
        assert!(policy.is_enabled("ping"));
        assert_eq!(policy.disabled().collect::<Vec<_>>(), vec!["toy_load"]);
        assert!(!policy.for_debug(false).is_enabled("test"));
    }

    #[tokio::test]
    async fn unknown_command_gets_invalid_input_reply() {
        let reply = dispatcher(CommandPolicy::default())
            .dispatch(request("frobnicate", Params::new()))
            .await;
        let Dispatched::Reply(reply) = reply else {
            panic!("unknown command must not raise a signal");
        };
        assert_eq!(reply.command, "frobnicate");
        assert_eq!(reply.error_code(), Some("invalid_command"));
        assert_eq!(reply.error_message(), Some("Invalid input to server."));
    }

    #[tokio::test]
    async fn disabled_command_is_refused() {
        let reply = dispatcher(CommandPolicy::default())
            .dispatch(request("toy_load", Params::new()))
            .await;
        assert_eq!(reply.reply().error_message(), Some("Command disabled: toy_load"));
        assert_eq!(reply.signal(), None);
    }

    #[tokio::test]
    async fn control_commands_are_acknowledged_with_null() {
        let dispatched = dispatcher(CommandPolicy::default())
            .dispatch(request("restart", Params::new()))
            .await;
        let (reply, signal) = dispatched.into_parts();
        assert_eq!(signal, Some(ControlSignal::Restart));
        assert_eq!(reply.data, Value::Null);
        assert!(!reply.is_error());
    }

    #[tokio::test]
    async fn missing_parameter_names_the_key() {
        let reply = dispatcher(CommandPolicy::default())
            .dispatch(request("get_paper_data", Params::new()))
            .await;
        assert_eq!(reply.reply().error_code(), Some("invalid_params"));
        assert!(reply.reply().error_message().unwrap().contains("paperID"));
    }

    #[tokio::test]
    async fn provider_errors_become_error_replies() {
        let reply = dispatcher(CommandPolicy::default())
            .dispatch(request(
                "get_paper_data",
                Params::new().with("paperID", "PMC0000000"),
            ))
            .await;
        assert_eq!(reply.reply().error_code(), Some("provider_error"));
    }

    #[tokio::test]
    async fn motd_reads_the_configured_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motd.txt");
        std::fs::write(&path, "welcome").unwrap();
        let dispatcher = Dispatcher::new(
            Arc::new(Mutex::new(MemoryProvider::new())),
            CommandPolicy::default(),
            Some(path),
        );
        let reply = dispatcher.dispatch(request("motd", Params::new())).await;
        assert_eq!(reply.reply().data, json!("welcome"));
    }

    struct Exploding {
        calls: Arc<AtomicUsize>,
    }

    impl Provider for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        async fn shutdown(&mut self) -> ProviderResult<()> {
            Ok(())
        }

        async fn paper_list(&mut self, _query: PaperListQuery) -> ProviderResult<PaperList> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("paper index corrupted");
        }
    }

    #[tokio::test]
    async fn handler_panic_becomes_error_reply() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(
            Arc::new(Mutex::new(Exploding {
                calls: Arc::clone(&calls),
            })),
            CommandPolicy::default(),
            None,
        );

        let reply = dispatcher
            .dispatch(request("get_paper_list", Params::new()))
            .await;
        assert_eq!(reply.reply().error_code(), Some("handler_panicked"));
        assert!(reply.reply().error_message().unwrap().contains("paper index corrupted"));

        // The provider lock is released by the unwind.
        let reply = dispatcher
            .dispatch(request("get_paper_list", Params::new()))
            .await;
        assert_eq!(reply.reply().error_code(), Some("handler_panicked"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
