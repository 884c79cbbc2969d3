//! Line-oriented terminal front end.

use std::path::PathBuf;
use std::sync::Arc;

use chatwire_client::{ApiEndpoint, ChannelManager, SessionClient, SnapshotLoader};
use chatwire_engine::{ReadModelReader, SessionId};
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::controller::{ChatController, ControllerConfig};
use crate::error::{AppResult, EndpointSnafu, ReadInputSnafu};
use crate::render::TerminalRenderer;
use crate::settings::Settings;

const HELP: &str = "\
commands:
  /open <id>       switch to an existing session
  /new [title]     create a session and switch to it
  /delete <id>     delete a session
  /upload <path>   attach a .csv or .pdf file to the current session
  /quit            exit
anything else is sent as a message to the current session";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Send(String),
    Open(SessionId),
    New(Option<String>),
    Delete(SessionId),
    Upload(PathBuf),
    Help,
    Quit,
    Invalid(String),
}

/// Parses one line; blank lines yield `None`.
pub fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Input::Send(line.to_string()));
    };

    let (name, argument) = match command.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (command, ""),
    };
    let input = match name {
        "open" => session_argument(argument, Input::Open),
        "delete" => session_argument(argument, Input::Delete),
        "new" => Input::New((!argument.is_empty()).then(|| argument.to_string())),
        "upload" if !argument.is_empty() => Input::Upload(PathBuf::from(argument)),
        "upload" => Input::Invalid("usage: /upload <path>".to_string()),
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => Input::Invalid(format!("unknown command /{other}, try /help")),
    };
    Some(input)
}

fn session_argument(argument: &str, make: fn(SessionId) -> Input) -> Input {
    match argument.parse::<u64>() {
        Ok(raw) => make(SessionId::new(raw)),
        Err(_) => Input::Invalid(format!("'{argument}' is not a session id")),
    }
}

enum Flow {
    Continue,
    Quit,
}

struct Shell {
    controller: ChatController,
    sessions: SessionClient,
    active: Option<SessionId>,
}

impl Shell {
    async fn handle(&mut self, input: Input) -> AppResult<Flow> {
        match input {
            Input::Send(text) => {
                if self.active.is_none() {
                    println!("open or create a session first (/open <id>, /new)");
                } else if !self.controller.reader().load().is_seeded {
                    println!("history is still loading, try again in a moment");
                } else {
                    self.controller.send(text)?;
                }
            }
            Input::Open(session_id) => self.open(session_id)?,
            Input::New(title) => match self.sessions.create_session(title).await {
                Ok(session) => {
                    println!("created session {} ({})", session.id, session.title);
                    self.open(session.id)?;
                }
                Err(error) => {
                    tracing::warn!(error = %error, "failed to create session");
                    println!("could not create session: {error}");
                }
            },
            Input::Delete(session_id) => match self.sessions.delete_session(session_id).await {
                Ok(()) => {
                    println!("deleted session {session_id}");
                    if self.active == Some(session_id) {
                        self.active = None;
                        self.controller.deactivate()?;
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %error,
                        "failed to delete session"
                    );
                    println!("could not delete session {session_id}: {error}");
                }
            },
            Input::Upload(path) => {
                let Some(session_id) = self.active else {
                    println!("open a session before uploading");
                    return Ok(Flow::Continue);
                };
                match self.sessions.upload(session_id, &path).await {
                    Ok(artifact) => {
                        println!("uploaded {}", artifact.file_name);
                        self.controller.attach_artifact(session_id, artifact)?;
                    }
                    Err(error) => {
                        tracing::warn!(session_id = %session_id, error = %error, "upload failed");
                        println!("upload failed: {error}");
                    }
                }
            }
            Input::Help => println!("{HELP}"),
            Input::Quit => return Ok(Flow::Quit),
            Input::Invalid(message) => println!("{message}"),
        }
        Ok(Flow::Continue)
    }

    fn open(&mut self, session_id: SessionId) -> AppResult<()> {
        self.controller.activate(session_id)?;
        self.active = Some(session_id);
        Ok(())
    }
}

/// Runs the terminal front end until `/quit` or end of input.
pub async fn run(settings: Arc<Settings>) -> AppResult<()> {
    let endpoint = ApiEndpoint::new(&settings.server_url, settings.request_timeout()).context(
        EndpointSnafu {
            stage: "build-rest-endpoint",
        },
    )?;
    let controller = ChatController::spawn(
        ControllerConfig::from(settings.as_ref()),
        SnapshotLoader::new(endpoint.clone()),
        ChannelManager::new(settings.channel_config()),
    );
    let renderer = tokio::spawn(render_loop(controller.reader()));
    tracing::info!(
        server_url = %settings.server_url,
        channel_url = %settings.channel_url,
        "chatwire started"
    );
    println!("{HELP}");

    let mut shell = Shell {
        controller,
        sessions: SessionClient::new(endpoint),
        active: None,
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let result = loop {
        let line = match lines.next_line().await.context(ReadInputSnafu {
            stage: "read-terminal-line",
        }) {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(error) => break Err(error),
        };
        let Some(input) = parse_input(&line) else {
            continue;
        };
        match shell.handle(input).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break Ok(()),
            Err(error) => break Err(error),
        }
    };

    shell.controller.shutdown().await;
    renderer.abort();
    result
}

async fn render_loop(reader: ReadModelReader) {
    let mut renderer = TerminalRenderer::new(std::io::stdout());
    let mut seen = 0;
    loop {
        let model = reader.changed_since(seen).await;
        seen = model.revision;
        if let Err(error) = renderer.render(&model) {
            tracing::warn!(error = %error, "failed to write to the terminal");
            return;
        }
    }
}
