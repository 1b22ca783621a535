// ABOUTME: Terminal REPL - reads prompts, drives the dispatcher, prints streamed records
// ABOUTME: Slash commands switch threads and reset sessions; Ctrl-C cancels the running query

use anyhow::Result;
use codebridge_agent::{OutputRecord, RecordKind};
use codebridge_core::{
    CallerContext, QueryDispatcher, QueryError, QueryRequest, SessionKey, SessionRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Prompt(String),
    /// Drop the current session; the next prompt starts fresh
    New,
    /// Switch to another thread (empty = direct)
    Thread(Option<String>),
    Sessions,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Self::Prompt(line.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match name {
            "new" | "reset" => Self::New,
            "thread" => Self::Thread((!arg.is_empty()).then(|| arg.to_string())),
            "sessions" => Self::Sessions,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => Self::Unknown(other.to_string()),
        }
    }
}

const HELP: &str = "\
Commands:
  /new              start a fresh conversation in this thread
  /thread [name]    switch thread (no name = direct)
  /sessions         list live sessions
  /help             this text
  /quit             exit
Anything else is sent as a prompt. Ctrl-C cancels a running query.
At the prompt Ctrl-C only clears the line; use /quit or Ctrl-D to exit.";

/// Printed when Ctrl-C arrives with no query running
const IDLE_INTERRUPT_HINT: &str = "(use /quit or Ctrl-D to exit)";

/// Text to print for one record, if any
pub fn render(record: &OutputRecord) -> Option<String> {
    match record.kind() {
        RecordKind::Init => record.session_id().map(|id| format!("[session {}]", id)),
        RecordKind::Assistant => record.text(),
        RecordKind::ToolUse => {
            let mut out = record.text().map(|t| format!("{}\n", t)).unwrap_or_default();
            let names: Vec<_> = record.tool_uses().into_iter().map(|t| t.name).collect();
            out.push_str(&format!("[tool: {}]", names.join(", ")));
            Some(out)
        }
        RecordKind::Error => Some(format!(
            "[error: {}]",
            record
                .error_message()
                .unwrap_or_else(|| "unknown error".to_string())
        )),
        RecordKind::Result => record.usage().map(|u| {
            let mut summary = format!("[tokens in {} / out {}", u.input_tokens, u.output_tokens);
            if let Some(cost) = u.cost_usd {
                summary.push_str(&format!(", ${:.4}", cost));
            }
            summary.push(']');
            summary
        }),
        RecordKind::System | RecordKind::ToolResult | RecordKind::Other => None,
    }
}

pub struct ReplOptions {
    pub user: String,
    pub channel: String,
    pub thread: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub system_prompt: Option<String>,
    /// Attach a caller context so sensitive actions ask for permission
    pub interactive: bool,
}

pub struct Repl {
    dispatcher: QueryDispatcher,
    registry: Arc<SessionRegistry>,
    options: ReplOptions,
}

impl Repl {
    pub fn new(
        dispatcher: QueryDispatcher,
        registry: Arc<SessionRegistry>,
        options: ReplOptions,
    ) -> Self {
        Self {
            dispatcher,
            registry,
            options,
        }
    }

    fn key(&self) -> SessionKey {
        SessionKey::new(
            &self.options.user,
            &self.options.channel,
            self.options.thread.as_deref(),
        )
    }

    fn request(&self, prompt: String) -> QueryRequest {
        let mut request = QueryRequest::new(prompt)
            .with_session(self.registry.get_or_create(self.key()));
        if let Some(ref dir) = self.options.working_dir {
            request = request.with_working_dir(dir.clone());
        }
        if let Some(ref text) = self.options.system_prompt {
            request = request.with_system_prompt(text.clone());
        }
        if self.options.interactive {
            request = request.with_caller_context(CallerContext {
                channel: self.options.channel.clone(),
                thread: self.options.thread.clone(),
                user: self.options.user.clone(),
            });
        }
        request
    }

    /// Send one prompt and print its records until the stream ends
    pub async fn ask(&self, prompt: String) -> Result<(), QueryError> {
        let cancel = CancellationToken::new();
        let mut stream = self
            .dispatcher
            .stream_query(self.request(prompt).with_cancel(cancel.clone()))
            .await?;

        let mut interrupted = false;
        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = tokio::signal::ctrl_c(), if !interrupted => {
                    eprintln!("\n[cancelling]");
                    cancel.cancel();
                    interrupted = true;
                    continue;
                }
            };
            match item {
                Some(Ok(record)) => {
                    if let Some(text) = render(&record) {
                        println!("{}", text);
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        println!(
            "codebridge ({} transport). /help for commands.",
            self.dispatcher.transport_name()
        );
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        loop {
            stdout.write_all(format!("{}> ", self.key()).as_bytes()).await?;
            stdout.flush().await?;

            // Once a query has polled ctrl_c the default SIGINT exit is gone
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => {
                    println!("\n{}", IDLE_INTERRUPT_HINT);
                    continue;
                }
            };
            let Some(line) = line else {
                break;
            };
            match Command::parse(&line) {
                Command::Empty => {}
                Command::Quit => break,
                Command::Help => println!("{}", HELP),
                Command::New => {
                    if let Some(old) = self.registry.remove(&self.key()) {
                        self.dispatcher.release(&old);
                    }
                    println!("[new conversation]");
                }
                Command::Thread(thread) => {
                    self.options.thread = thread;
                    println!("[thread {}]", self.key().thread());
                }
                Command::Sessions => {
                    for key in self.registry.keys() {
                        let token = self
                            .registry
                            .get(&key)
                            .and_then(|s| s.continuation_token())
                            .unwrap_or_else(|| "-".to_string());
                        println!("{}  {}", key, token);
                    }
                }
                Command::Unknown(name) => println!("Unknown command /{}. Try /help", name),
                Command::Prompt(prompt) => {
                    if let Err(e) = self.ask(prompt).await {
                        println!("[failed: {}]", e);
                    }
                }
            }
        }
        Ok(())
    }
}
