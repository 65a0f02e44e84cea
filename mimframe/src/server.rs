use {
    crate::{
        cli::ProgramArgs,
        prelude::*,
        recorder::RecordHandler,
        replay::ReplayIndex,
        tracker::EditTracker,
        traffic::{
            socket, CommandKill, CommandLine, ExitMessage, FileEdit, InProcMessage,
            ResponseHandle, SocketMessage, TextMessage, Traffic,
        },
    },
    futures::future::{self, BoxFuture, FutureExt},
    lib_record::{Request, Tag, TERMINATE},
    once_cell::sync::OnceCell,
    regex::Regex,
    std::{
        collections::{HashMap, HashSet},
        path::PathBuf,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
    },
    tokio::{io::AsyncReadExt, net::TcpListener, net::TcpStream, sync::mpsc},
    tracing_futures::Instrument,
};

/// Shared registries with process lifetime: the peer address is write-once
/// and read lock-free after registration, the rest are guarded individually
pub struct Registry {
    peer: OnceCell<(String, u16)>,
    swapped: AtomicBool,
    pids: Mutex<HashMap<String, u32>>,
    attributes_seen: Mutex<HashSet<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            peer: OnceCell::new(),
            swapped: AtomicBool::new(false),
            pids: Mutex::new(HashMap::new()),
            attributes_seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_peer(&self, peer: (String, u16)) {
        if self.peer.set(peer).is_ok() {
            // The SUT is a server itself now; the socket direction
            // conventions swap, and stay swapped for the life of the process
            self.swapped.store(true, Ordering::SeqCst);
            if let Some((host, port)) = self.peer.get() {
                info!("Registered peer at {}:{}", host, port);
            }
        }
    }

    pub fn peer(&self) -> Option<(String, u16)> {
        self.peer.get().cloned()
    }

    pub fn swapped(&self) -> bool {
        self.swapped.load(Ordering::SeqCst)
    }

    pub fn register_pid(&self, proxy_pid: &str, pid: u32) {
        self.pids
            .lock()
            .expect("pid table lock poisoned")
            .insert(proxy_pid.to_string(), pid);
    }

    pub fn unregister_pid(&self, proxy_pid: &str) {
        self.pids
            .lock()
            .expect("pid table lock poisoned")
            .remove(proxy_pid);
    }

    pub fn pid(&self, proxy_pid: &str) -> Option<u32> {
        self.pids
            .lock()
            .expect("pid table lock poisoned")
            .get(proxy_pid)
            .copied()
    }

    /// Whether this attribute description has been asked before, remembering
    /// it either way
    pub fn attribute_seen(&self, description: &str) -> bool {
        !self
            .attributes_seen
            .lock()
            .expect("attribute cache lock poisoned")
            .insert(description.to_string())
    }
}

/// The slice of program configuration the traffic handlers need at runtime
pub struct ServerConfig {
    pub transfer_env: HashMap<String, Vec<String>>,
    pub async_edit_commands: Vec<String>,
    pub alterations: Vec<(Regex, String)>,
    pub test_path: Option<String>,
}

pub struct TrafficServer {
    pub config: ServerConfig,
    pub recorder: RecordHandler,
    pub replay: ReplayIndex,
    pub tracker: Mutex<EditTracker>,
    pub registry: Registry,
    pub has_async_edits: AtomicBool,
}

impl TrafficServer {
    pub fn from_args(args: &ProgramArgs) -> CrateResult<Self> {
        if !args.intercept_modules().is_empty() {
            info!(
                "In-process interception configured for: {}",
                args.intercept_modules().join(", ")
            );
        }
        Ok(Self {
            config: ServerConfig {
                transfer_env: args.transfer_env().clone(),
                async_edit_commands: args.async_edit_commands().to_vec(),
                alterations: args.alterations().to_vec(),
                test_path: args.test_path().map(String::from),
            },
            recorder: RecordHandler::new(args.record_file().map(PathBuf::from)),
            replay: ReplayIndex::load(args.replay_file(), args.replay_items().to_vec())?,
            tracker: Mutex::new(EditTracker::new(
                args.ignore_edits().to_vec(),
                args.record_edits_dir().map(PathBuf::from),
                args.replay_edits_dir().map(PathBuf::from),
            )),
            registry: Registry::new(),
            has_async_edits: AtomicBool::new(false),
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            config: ServerConfig {
                transfer_env: HashMap::new(),
                async_edit_commands: Vec::new(),
                alterations: Vec::new(),
                test_path: None,
            },
            recorder: RecordHandler::new(None),
            replay: ReplayIndex::load(None, Vec::new()).unwrap(),
            tracker: Mutex::new(EditTracker::new(Vec::new(), None, None)),
            registry: Registry::new(),
            has_async_edits: AtomicBool::new(false),
        }
    }

    /// Builds typed traffic from a raw request payload. A recognised prefix
    /// with a broken payload falls back to raw client socket traffic
    pub fn parse_traffic(&self, text: String, handle: ResponseHandle) -> Traffic {
        match Request::parse(&text) {
            Ok(Request::ServerState { text }) => {
                Traffic::ServerState(socket::server_state(text, handle, &self.registry))
            }
            Ok(Request::CommandLine {
                argv,
                env,
                cwd,
                proxy_pid,
            }) => Traffic::CommandLine(CommandLine::new(
                argv,
                env,
                cwd,
                proxy_pid,
                handle,
                &self.config.transfer_env,
            )),
            Ok(Request::CommandKill { signal, proxy_pid }) => {
                Traffic::CommandKill(CommandKill::new(signal, proxy_pid, handle))
            }
            Ok(Request::InProcImport { module }) => {
                Traffic::InProc(InProcMessage::import(module, handle))
            }
            Ok(Request::InProcAttribute { target, attr }) => Traffic::InProc(
                InProcMessage::attribute(target, attr, handle, &self.registry),
            ),
            Ok(Request::InProcSetAttribute {
                target,
                attr,
                value,
            }) => Traffic::InProc(InProcMessage::set_attribute(target, attr, value, handle)),
            Ok(Request::InProcCall {
                target,
                attr,
                args,
                kwargs,
            }) => Traffic::InProc(InProcMessage::call(target, attr, args, kwargs, handle)),
            Ok(Request::ClientSocket { text }) => {
                Traffic::ClientSocket(SocketMessage { text, handle })
            }
            Err(e) => {
                CrateError::from(e).log(Level::WARN);
                Traffic::ClientSocket(SocketMessage { text, handle })
            }
        }
    }

    fn replay_active_for(&self, traffic: &Traffic) -> bool {
        if self.replay.is_empty() {
            false
        } else if self.replay.items().is_empty() {
            true
        } else {
            traffic.marked_for_replay(self.replay.items())
        }
    }

    /// The per-request pipeline: flush deferred edits, process the message,
    /// hand the request back to the serializer, reset the tracker
    pub async fn process(&self, traffic: Traffic, request: u64) {
        if !self.replay_active_for(&traffic) {
            // File changes may have landed since the last request as a side
            // effect of asynchronous work; they belong before this message
            let pending = {
                self.tracker
                    .lock()
                    .expect("tracker lock poisoned")
                    .latest_edits()
            };
            for edit in pending {
                self.process_inner(Traffic::FileEdit(edit), request).await;
            }
        }

        let makes_async = traffic.makes_asynchronous_edits(&self.config.async_edit_commands);
        self.process_inner(traffic, request).await;
        if makes_async {
            self.has_async_edits.store(true, Ordering::SeqCst);
        }

        self.recorder.request_complete(request);
        if !self.has_async_edits.load(Ordering::SeqCst) {
            self.tracker
                .lock()
                .expect("tracker lock poisoned")
                .clear();
        }
    }

    fn process_inner<'s>(&'s self, traffic: Traffic, request: u64) -> BoxFuture<'s, ()> {
        async move {
            debug!("Processing {} traffic", traffic.tag());
            let has_edits = {
                let mut tracker = self.tracker.lock().expect("tracker lock poisoned");
                tracker.add_possible_edits(
                    traffic.find_possible_file_edits(),
                    self.replay.is_active_for_all(),
                )
            };

            let responses = self.get_responses(&traffic, has_edits).await;
            let should_record = !traffic.enquiry_only(&responses);
            if should_record {
                traffic.record(self, request);
            }

            for response in responses {
                debug!(
                    "Response of type {} with text {:?}",
                    response.tag(),
                    response.text()
                );
                if should_record {
                    response.record(self, request);
                }
                for chained in response.forward_to_destination(self).await {
                    self.process_inner(chained, request).await;
                }
                debug!("Completed response of type {}", response.tag());
            }
        }
        .boxed()
    }

    async fn get_responses(&self, traffic: &Traffic, has_edits: bool) -> Vec<Traffic> {
        if self.replay_active_for(traffic) {
            debug!("Replay active for current message");
            let swapped = self.registry.swapped();
            let mut replayed = Vec::new();
            let mut files_matched = Vec::new();
            for (tag, text) in self.replay.responses_for(
                &traffic.description(swapped),
                traffic.has_info(),
                traffic.enquiry_only(&[]),
            ) {
                if let Some(response) =
                    self.make_response_traffic(traffic, tag, text, &mut files_matched)
                {
                    replayed.push(response);
                }
            }
            traffic.filter_replay(replayed)
        } else {
            let responses = traffic.forward_to_destination(self).await;
            // Only if the message itself can produce file edits do we look
            if has_edits {
                let mut all: Vec<Traffic> = {
                    self.tracker
                        .lock()
                        .expect("tracker lock poisoned")
                        .latest_edits()
                        .into_iter()
                        .map(Traffic::FileEdit)
                        .collect()
                };
                all.extend(responses);
                all
            } else {
                responses
            }
        }
    }

    fn make_response_traffic(
        &self,
        question: &Traffic,
        tag: Tag,
        text: String,
        files_matched: &mut Vec<PathBuf>,
    ) -> Option<Traffic> {
        match tag {
            Tag::Fil => {
                let name = text.trim().to_string();
                let tracker = self.tracker.lock().expect("tracker lock poisoned");
                let (stored, kind) = tracker.stored_file(&name)?;
                let active = tracker.file_being_edited(&name, kind, files_matched)?;
                debug!(
                    "File being edited for '{}' : will replace {} with {}",
                    name,
                    active.display(),
                    stored.display()
                );
                let changed = tracker.find_files_and_links(&stored);
                Some(Traffic::FileEdit(FileEdit::replayed(
                    name, active, stored, changed,
                )))
            }
            Tag::Cli => Some(Traffic::ClientSocket(SocketMessage {
                text,
                handle: question.handle(),
            })),
            Tag::Srv => Some(Traffic::Server(SocketMessage {
                text,
                handle: question.handle(),
            })),
            Tag::Out => Some(Traffic::Stdout(TextMessage {
                text,
                handle: question.handle(),
            })),
            Tag::Err => Some(Traffic::Stderr(TextMessage {
                text,
                handle: question.handle(),
            })),
            Tag::Exc => Some(Traffic::Exit(ExitMessage::new(text, question.handle()))),
            Tag::Ret => Some(Traffic::InProcResponse(TextMessage {
                text,
                handle: question.handle(),
            })),
            _ => None,
        }
    }
}

/// Binds an OS-assigned port on the local hostname, announces `host:port` on
/// stdout, and dispatches one handler per inbound request until told to stop.
/// Requests are numbered in accept order; that number alone decides where
/// their records land in the transcript
pub async fn serve() -> CrateResult<()> {
    let server = Arc::new(TrafficServer::from_args(cli!())?);
    info!("Starting traffic server");

    let host = hostname();
    let mut listener = match TcpListener::bind((host.as_str(), 0)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("Could not bind {}: {}, falling back to loopback", host, e);
            TcpListener::bind("127.0.0.1:0")
                .await
                .map_err(CrateError::from)
                .log(Level::ERROR)?
        }
    };
    let port = listener.local_addr()?.port();
    announce(&host, port)?;
    info!("Listening at: {}:{}", host, port);

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let mut workers = Vec::new();
    let mut request_count: u64 = 0;

    loop {
        let socket = tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, client)) => {
                    debug!("Accepted connection from: {}", client);
                    socket
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        request_count += 1;
        let task = handle_request(
            server.clone(),
            socket,
            request_count,
            shutdown_tx.clone(),
        )
        .instrument(always_span!("request", number = request_count));

        if cli!().sequential() {
            task.await;
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
        } else {
            workers.push(tokio::spawn(task));
        }
    }

    // Join the in-flight handlers so nothing records after shutdown;
    // a repeated terminate sentinel only fills the already-closed channel
    future::join_all(workers).await;
    info!("Shut down traffic server");
    Ok(())
}

async fn handle_request(
    server: Arc<TrafficServer>,
    mut socket: TcpStream,
    number: u64,
    mut shutdown: mpsc::Sender<()>,
) {
    debug!("Received incoming request...");
    let mut raw = Vec::new();
    if let Err(e) = socket.read_to_end(&mut raw).await {
        warn!("Failed to read the request: {}", e);
        return;
    }
    let text = String::from_utf8_lossy(&raw).into_owned();
    trace!("Request text : {}", text);

    if text.starts_with(TERMINATE) {
        info!("Told to shut down!");
        let _ = shutdown.try_send(());
        return;
    }

    let traffic = server.parse_traffic(text, ResponseHandle::new(socket));
    server.process(traffic, number).await;
    debug!("Finished processing incoming request");
}

fn announce(host: &str, port: u16) -> CrateResult<()> {
    use std::io::Write;
    // Tell our caller, so they can tell the program being handled
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{}:{}", host, port)?;
    out.flush()?;
    Ok(())
}

#[cfg(unix)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    } else {
        "localhost".to_string()
    }
}

#[cfg(not(unix))]
fn hostname() -> String {
    "localhost".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use {
        std::{fs, net::Shutdown},
        tokio::io::AsyncWriteExt,
    };

    fn replaying_server(dir: &std::path::Path, transcript: &str) -> TrafficServer {
        let path = dir.join("transcript");
        fs::write(&path, transcript).unwrap();
        let mut server = TrafficServer::for_tests();
        server.replay = ReplayIndex::load(Some(&path), Vec::new()).unwrap();
        server
    }

    fn recording_server(record: PathBuf) -> TrafficServer {
        let mut server = TrafficServer::for_tests();
        server.recorder = RecordHandler::new(Some(record));
        server
    }

    #[tokio::test]
    async fn command_replay_round_trips_over_a_socket() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(replaying_server(
            dir.path(),
            "<-CMD:ls\n->OUT:a\nb\n->ERR:\n->EXC:0\n",
        ));

        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cwd = std::env::current_dir()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        let request =
            format!("SUT_COMMAND_LINE:['ls']:SUT_SEP:{{}}:SUT_SEP:{}:SUT_SEP:17", cwd);

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(request.as_bytes()).await.unwrap();
            stream.shutdown(Shutdown::Write).unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await.unwrap();
            String::from_utf8_lossy(&reply).into_owned()
        });

        let (socket, _) = listener.accept().await.unwrap();
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        handle_request(server, socket, 1, shutdown_tx).await;

        let reply = client.await.unwrap();
        assert_eq!(reply, "a\nb\n|TT_CMD_SEP|\n|TT_CMD_SEP|0\n");
    }

    #[tokio::test]
    async fn live_commands_are_recorded_with_their_streams() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("record");
        let server = recording_server(record.clone());

        let cwd = std::env::current_dir()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), std::env::var("PATH").unwrap());

        let traffic = Traffic::CommandLine(CommandLine::new(
            vec!["echo".into(), "hi".into()],
            env,
            cwd,
            "17".into(),
            ResponseHandle::sink(),
            &server.config.transfer_env,
        ));
        server.process(traffic, 1).await;

        // empty stderr and a zero exit status carry no info
        assert_eq!(
            fs::read_to_string(&record).unwrap(),
            "<-CMD:echo hi\n->OUT:hi\n"
        );
        // invariant: the tracker starts fresh for the next request
        assert!(server.tracker.lock().unwrap().is_clear());
    }

    #[tokio::test]
    async fn server_state_swaps_directions_and_chains_peer_replies() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("record");
        let server = recording_server(record.clone());

        // a fake peer that answers "ok" to whatever arrives
        let mut peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let peer_task = tokio::spawn(async move {
            let (mut socket, _) = peer.accept().await.unwrap();
            let mut payload = Vec::new();
            socket.read_to_end(&mut payload).await.unwrap();
            socket.write_all(b"ok").await.unwrap();
            payload
        });

        let announce = server.parse_traffic(
            format!("SUT_SERVER:up on {}\n", peer_addr),
            ResponseHandle::sink(),
        );
        server.process(announce, 1).await;
        assert!(server.registry.swapped());

        let outbound = server.parse_traffic("payload".to_string(), ResponseHandle::sink());
        server.process(outbound, 2).await;

        assert_eq!(peer_task.await.unwrap(), b"payload".to_vec());
        assert_eq!(
            fs::read_to_string(&record).unwrap(),
            format!(
                "<-SRV:up on {}\n->CLI:payload\n<-SRV:ok\n",
                peer_addr
            )
        );
    }

    #[tokio::test]
    async fn enquiry_only_attribute_reads_stay_out_of_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("record");
        let server = recording_server(record.clone());

        let read = server.parse_traffic(
            "SUT_PYTHON_ATTR:config:SUT_SEP:cache_dir".to_string(),
            ResponseHandle::sink(),
        );
        server.process(read, 1).await;

        // no answer came back, so the question is not worth recording
        assert!(!record.exists() || fs::read_to_string(&record).unwrap().is_empty());
    }
}
