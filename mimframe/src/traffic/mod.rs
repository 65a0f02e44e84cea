use {
    crate::{prelude::*, server::TrafficServer},
    lib_record::{Direction, Tag, STREAM_SEP},
    std::{path::PathBuf, sync::Arc},
    tokio::{io::AsyncWriteExt, net::TcpStream, sync::Mutex},
};

pub mod command;
pub mod edits;
pub mod inproc;
pub mod socket;

pub use self::{
    command::{CommandKill, CommandLine},
    edits::{FileEdit, FileKind},
    inproc::InProcMessage,
    socket::SocketMessage,
};

/// The write side of the inbound connection, shared between a question and
/// all of its responses. Writes are best-effort; the SUT may have died and
/// the server still wants to finish recording what happened
#[derive(Clone)]
pub struct ResponseHandle {
    inner: Arc<Mutex<Option<TcpStream>>>,
}

impl ResponseHandle {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(stream))),
        }
    }

    /// A handle with nowhere to write, for traffic that answers nobody
    pub fn sink() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn write(&self, text: &str) {
        let mut guard = self.inner.lock().await;
        if let Some(stream) = guard.as_mut() {
            if let Err(e) = stream.write_all(text.as_bytes()).await {
                debug!("Ignoring failed write to the SUT: {}", e);
            }
        }
    }

    pub async fn close(&self) {
        self.inner.lock().await.take();
    }
}

/// A free-text message bound for the SUT (stdout/stderr chunks, in-process
/// response renderings)
pub struct TextMessage {
    pub text: String,
    pub handle: ResponseHandle,
}

/// An exit status message. Carries the raw text as recorded alongside the
/// parsed status, which alone decides whether there is anything to record
pub struct ExitMessage {
    pub text: String,
    pub status: i32,
    pub handle: ResponseHandle,
}

impl ExitMessage {
    pub fn new(text: String, handle: ResponseHandle) -> Self {
        let status = text.trim().parse().unwrap_or_else(|_| {
            warn!("'{}' is not a valid exit status, assuming 0", text.trim());
            0
        });
        Self {
            text,
            status,
            handle,
        }
    }
}

/// Every kind of traffic the server understands, stimulus and response alike
pub enum Traffic {
    CommandLine(CommandLine),
    CommandKill(CommandKill),
    ClientSocket(SocketMessage),
    ServerState(SocketMessage),
    Server(SocketMessage),
    Stdout(TextMessage),
    Stderr(TextMessage),
    Exit(ExitMessage),
    InProc(InProcMessage),
    InProcResponse(TextMessage),
    FileEdit(FileEdit),
}

impl Traffic {
    pub fn tag(&self) -> Tag {
        match self {
            Self::CommandLine(_) | Self::CommandKill(_) => Tag::Cmd,
            Self::ClientSocket(_) => Tag::Cli,
            Self::ServerState(_) | Self::Server(_) => Tag::Srv,
            Self::Stdout(_) => Tag::Out,
            Self::Stderr(_) => Tag::Err,
            Self::Exit(_) => Tag::Exc,
            Self::InProc(_) => Tag::Pyt,
            Self::InProcResponse(_) => Tag::Ret,
            Self::FileEdit(_) => Tag::Fil,
        }
    }

    /// The canonical direction. Once the SUT has announced itself as a server
    /// the socket conventions swap: what it sends out is semantically a
    /// response, what its peers send in is a stimulus
    pub fn direction(&self, swapped: bool) -> Direction {
        match self {
            Self::CommandLine(_) | Self::CommandKill(_) | Self::InProc(_) => Direction::In,
            Self::Stdout(_)
            | Self::Stderr(_)
            | Self::Exit(_)
            | Self::InProcResponse(_)
            | Self::FileEdit(_) => Direction::Out,
            Self::ClientSocket(_) => {
                if swapped {
                    Direction::Out
                } else {
                    Direction::In
                }
            }
            Self::ServerState(_) | Self::Server(_) => {
                if swapped {
                    Direction::In
                } else {
                    Direction::Out
                }
            }
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::CommandLine(cmd) => cmd.text(),
            Self::CommandKill(kill) => kill.text(),
            Self::ClientSocket(message) | Self::ServerState(message) | Self::Server(message) => {
                &message.text
            }
            Self::Stdout(message) | Self::Stderr(message) | Self::InProcResponse(message) => {
                &message.text
            }
            Self::Exit(message) => &message.text,
            Self::InProc(message) => message.text(),
            Self::FileEdit(edit) => &edit.name,
        }
    }

    /// The single canonical record form, `dir` + `tag` + `:` + text
    pub fn description(&self, swapped: bool) -> String {
        format!("{}{}:{}", self.direction(swapped), self.tag(), self.text())
    }

    pub fn has_info(&self) -> bool {
        match self {
            Self::CommandKill(_) => false,
            Self::Exit(message) => message.status != 0,
            _ => !self.text().is_empty(),
        }
    }

    /// An enquiry-only question is left out of the record unless its answer
    /// carries information of its own
    pub fn enquiry_only(&self, responses: &[Traffic]) -> bool {
        match self {
            Self::InProc(message) => message.enquiry_only(responses.is_empty()),
            _ => false,
        }
    }

    pub fn marked_for_replay(&self, items: &[String]) -> bool {
        match self {
            Self::CommandLine(cmd) => items.iter().any(|item| item == cmd.command_name()),
            Self::InProc(message) => message.marked_for_replay(items),
            // Some things can't be disabled and hence can't be added on piecemeal afterwards
            _ => true,
        }
    }

    pub fn makes_asynchronous_edits(&self, async_commands: &[String]) -> bool {
        match self {
            Self::CommandLine(cmd) => async_commands.iter().any(|c| c == cmd.command_name()),
            _ => false,
        }
    }

    pub fn find_possible_file_edits(&self) -> Vec<PathBuf> {
        match self {
            Self::CommandLine(cmd) => cmd.find_possible_file_edits(),
            _ => Vec::new(),
        }
    }

    pub fn handle(&self) -> ResponseHandle {
        match self {
            Self::CommandLine(cmd) => cmd.handle(),
            Self::CommandKill(kill) => kill.handle(),
            Self::ClientSocket(message) | Self::ServerState(message) | Self::Server(message) => {
                message.handle.clone()
            }
            Self::Stdout(message) | Self::Stderr(message) | Self::InProcResponse(message) => {
                message.handle.clone()
            }
            Self::Exit(message) => message.handle.clone(),
            Self::InProc(message) => message.handle(),
            Self::FileEdit(_) => ResponseHandle::sink(),
        }
    }

    /// Appends this traffic to the transcript. For file edits the store copy
    /// rides along with the record, so the stored tree and the transcript
    /// stay in step
    pub fn record(&self, server: &TrafficServer, request: u64) {
        if !self.has_info() {
            return;
        }
        if let Self::CommandKill(_) = self {
            // recovered on replay from the exit code, never recorded
            return;
        }

        let text = match self {
            Self::InProcResponse(message) => {
                apply_alterations(&message.text, &server.config.alterations)
            }
            _ => self.text().to_string(),
        };
        let mut desc = format!(
            "{}{}:{}",
            self.direction(server.registry.swapped()),
            self.tag(),
            text
        );
        if !desc.ends_with('\n') {
            desc.push('\n');
        }
        server.recorder.record(&desc, request);

        if let Self::FileEdit(edit) = self {
            edit.store();
        }
    }

    /// Performs this traffic's side effects against its real destination and
    /// returns whatever response traffic those produced
    pub async fn forward_to_destination(&self, server: &TrafficServer) -> Vec<Traffic> {
        match self {
            Self::CommandLine(cmd) => cmd.forward(server).await,
            Self::CommandKill(kill) => kill.forward(server),
            Self::ClientSocket(message) => socket::forward_client(message, server).await,
            Self::ServerState(_) => Vec::new(),
            Self::Stdout(message) | Self::Stderr(message) => {
                message
                    .handle
                    .write(&format!("{}{}", message.text, STREAM_SEP))
                    .await;
                Vec::new()
            }
            Self::Server(message) => {
                message.handle.write(&message.text).await;
                message.handle.close().await;
                Vec::new()
            }
            Self::InProcResponse(message) => {
                message.handle.write(&message.text).await;
                message.handle.close().await;
                Vec::new()
            }
            Self::Exit(message) => {
                message.handle.write(&message.text).await;
                message.handle.close().await;
                Vec::new()
            }
            Self::InProc(message) => {
                debug!(
                    "No live in-process surface, nothing to forward for '{}'",
                    message.text()
                );
                Vec::new()
            }
            Self::FileEdit(edit) => {
                edit.apply();
                Vec::new()
            }
        }
    }

    /// Hook for reshaping replayed responses before they are processed;
    /// only command line traffic needs it
    pub fn filter_replay(&self, responses: Vec<Traffic>) -> Vec<Traffic> {
        match self {
            Self::CommandLine(cmd) => cmd.filter_replay(responses),
            _ => responses,
        }
    }
}

pub fn apply_alterations(text: &str, alterations: &[(regex::Regex, String)]) -> String {
    alterations.iter().fold(text.to_string(), |out, (find, replace)| {
        find.replace_all(&out, replace.as_str()).into_owned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_zero_carries_no_info() {
        assert!(!Traffic::Exit(ExitMessage::new("0\n".into(), ResponseHandle::sink())).has_info());
        assert!(Traffic::Exit(ExitMessage::new("2".into(), ResponseHandle::sink())).has_info());
    }

    #[test]
    fn descriptions_swap_for_socket_traffic_only() {
        let cli = Traffic::ClientSocket(SocketMessage {
            text: "ping".into(),
            handle: ResponseHandle::sink(),
        });
        assert_eq!(cli.description(false), "<-CLI:ping");
        assert_eq!(cli.description(true), "->CLI:ping");

        let out = Traffic::Stdout(TextMessage {
            text: "x".into(),
            handle: ResponseHandle::sink(),
        });
        assert_eq!(out.description(false), "->OUT:x");
        assert_eq!(out.description(true), "->OUT:x");
    }

    #[test]
    fn alterations_apply_in_order() {
        let alterations = vec![
            (regex::Regex::new("secret-[0-9]+").unwrap(), "TOKEN".to_string()),
            (regex::Regex::new("TOKEN").unwrap(), "<hidden>".to_string()),
        ];
        assert_eq!(
            apply_alterations("got secret-1234 back", &alterations),
            "got <hidden> back"
        );
    }
}
