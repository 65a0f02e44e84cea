use {
    crate::{
        prelude::*,
        server::TrafficServer,
        traffic::{ExitMessage, ResponseHandle, TextMessage, Traffic},
    },
    std::{
        collections::HashMap,
        fs, iter,
        path::{Path, PathBuf},
        process::Stdio,
    },
    tokio::process::Command,
};

/// A command line invocation intercepted on the SUT side. The canonical text
/// captures the working directory and significant environment alongside the
/// quoted argument list, so the record stands on its own
pub struct CommandLine {
    text: String,
    command_name: String,
    cmd_args: Vec<String>,
    env: HashMap<String, String>,
    cwd: String,
    proxy_pid: String,
    handle: ResponseHandle,
}

impl CommandLine {
    pub fn new(
        argv: Vec<String>,
        env: HashMap<String, String>,
        cwd: String,
        proxy_pid: String,
        handle: ResponseHandle,
        transfer_env: &HashMap<String, Vec<String>>,
    ) -> Self {
        debug!("Received command with cwd = {}", cwd);
        let full_command = argv
            .first()
            .map(|arg| arg.replace('\\', "/"))
            .unwrap_or_default();
        let command_name = basename(&full_command);
        let cmd_args: Vec<String> = argv.into_iter().skip(1).collect();

        let (vars_set, vars_unset) = filter_environment(&env, &command_name, transfer_env);
        let cmd_string = iter::once(command_name.clone())
            .chain(cmd_args.iter().cloned())
            .map(|arg| quote_arg(&arg))
            .collect::<Vec<_>>()
            .join(" ");
        let text = format!(
            "{}{}",
            env_string(&cwd, &vars_set, &vars_unset),
            cmd_string
        );

        Self {
            text,
            command_name,
            cmd_args,
            env,
            cwd,
            proxy_pid,
            handle,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn command_name(&self) -> &str {
        &self.command_name
    }

    pub fn handle(&self) -> ResponseHandle {
        self.handle.clone()
    }

    fn has_changed_working_directory(&self) -> bool {
        std::env::current_dir()
            .map(|dir| dir.to_string_lossy() != self.cwd.as_str())
            .unwrap_or(true)
    }

    /// Paths this command might edit: its working directory when it differs
    /// from ours, plus any argument word naming an absolute path (it may not
    /// exist yet) or an existing path relative to the working directory
    pub fn find_possible_file_edits(&self) -> Vec<PathBuf> {
        let mut edits = Vec::new();
        let changed_cwd = self.has_changed_working_directory();
        if changed_cwd {
            edits.push(PathBuf::from(&self.cwd));
        }
        for arg in &self.cmd_args {
            for word in file_words(arg) {
                let path = Path::new(&word);
                if path.is_absolute() {
                    edits.push(path.to_path_buf());
                } else if !changed_cwd {
                    let full = Path::new(&self.cwd).join(&word);
                    if full.exists() {
                        edits.push(full);
                    }
                }
            }
        }
        // don't want to in effect mark the same file twice
        remove_sub_paths(&mut edits);
        debug!("Might edit in {:?}", edits);
        edits
    }

    pub async fn forward(&self, server: &TrafficServer) -> Vec<Traffic> {
        debug!("Running real command with args : {:?}", self.cmd_args);
        let mut command = Command::new(&self.command_name);
        command
            .args(&self.cmd_args)
            .env_clear()
            .envs(&self.env)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = match command.spawn() {
            Ok(child) => child,
            Err(_) => {
                return self.make_response(
                    String::new(),
                    format!(
                        "ERROR: Traffic server could not find command '{}' in PATH\n",
                        self.command_name
                    ),
                    1,
                )
            }
        };

        server.registry.register_pid(&self.proxy_pid, child.id());
        let output = child.wait_with_output().await;
        server.registry.unregister_pid(&self.proxy_pid);

        match output {
            Ok(output) => self.make_response(
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code(output.status),
            ),
            Err(e) => {
                CrateError::from(e).log(Level::WARN);
                self.make_response(String::new(), String::new(), 1)
            }
        }
    }

    fn make_response(&self, output: String, errors: String, status: i32) -> Vec<Traffic> {
        vec![
            Traffic::Stdout(TextMessage {
                text: output,
                handle: self.handle.clone(),
            }),
            Traffic::Stderr(TextMessage {
                text: errors,
                handle: self.handle.clone(),
            }),
            Traffic::Exit(ExitMessage::new(status.to_string(), self.handle.clone())),
        ]
    }

    /// Replayed command responses always come back as stdout, stderr, exit in
    /// that order, after any leading file edits. Streams that were empty when
    /// recorded never made it into the transcript, so they are restored here
    pub fn filter_replay(&self, mut responses: Vec<Traffic>) -> Vec<Traffic> {
        let mut insert = 0;
        while insert < responses.len() && matches!(responses[insert], Traffic::FileEdit(_)) {
            insert += 1;
        }

        if insert == responses.len() || !matches!(responses[insert], Traffic::Stdout(_)) {
            responses.insert(
                insert,
                Traffic::Stdout(TextMessage {
                    text: String::new(),
                    handle: self.handle.clone(),
                }),
            );
        }
        insert += 1;
        if insert == responses.len() || !matches!(responses[insert], Traffic::Stderr(_)) {
            responses.insert(
                insert,
                Traffic::Stderr(TextMessage {
                    text: String::new(),
                    handle: self.handle.clone(),
                }),
            );
        }
        insert += 1;
        if insert == responses.len() || !matches!(responses[insert], Traffic::Exit(_)) {
            responses.insert(
                insert,
                Traffic::Exit(ExitMessage::new("0".into(), self.handle.clone())),
            );
        }
        responses
    }
}

/// A signal aimed at a previously spawned command, addressed by proxy pid.
/// Never recorded; replay recovers the outcome from the exit code instead
pub struct CommandKill {
    text: String,
    signal: i32,
    proxy_pid: String,
    handle: ResponseHandle,
}

impl CommandKill {
    pub fn new(signal: i32, proxy_pid: String, handle: ResponseHandle) -> Self {
        Self {
            text: signal.to_string(),
            signal,
            proxy_pid,
            handle,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn handle(&self) -> ResponseHandle {
        self.handle.clone()
    }

    pub fn forward(&self, server: &TrafficServer) -> Vec<Traffic> {
        match server.registry.pid(&self.proxy_pid) {
            Some(pid) => send_signal(pid, self.signal),
            None => debug!("No child registered under proxy pid {}", self.proxy_pid),
        }
        Vec::new()
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc != 0 {
        warn!("Failed to deliver signal {} to pid {}", signal, pid);
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: i32) {
    warn!(
        "Signal forwarding is not supported on this platform (pid {}, signal {})",
        pid, signal
    );
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn quote_arg(arg: &str) -> String {
    if arg.contains(' ') {
        format!("\"{}\"", arg)
    } else {
        arg.to_string()
    }
}

/// Only variables named in the transfer list are compared; anything matching
/// our own environment is noise and left out of the record
fn filter_environment(
    env: &HashMap<String, String>,
    command_name: &str,
    transfer_env: &HashMap<String, Vec<String>>,
) -> (Vec<(String, String)>, Vec<String>) {
    let mut vars: Vec<&String> = transfer_env
        .get(command_name)
        .into_iter()
        .flatten()
        .collect();
    vars.extend(transfer_env.get("default").into_iter().flatten());

    let mut vars_set = Vec::new();
    let mut vars_unset = Vec::new();
    for var in vars {
        let value = env.get(var);
        let current = std::env::var(var).ok();
        debug!(
            "Checking environment {}={:?} against {:?}",
            var, value, current
        );
        if value != current.as_ref() {
            match value {
                None => vars_unset.push(var.clone()),
                Some(value) => vars_set.push((var.clone(), value.clone())),
            }
        }
    }
    (vars_set, vars_unset)
}

fn env_string(cwd: &str, vars_set: &[(String, String)], vars_unset: &[String]) -> String {
    let mut rec = String::new();
    let changed_cwd = std::env::current_dir()
        .map(|dir| dir.to_string_lossy() != cwd)
        .unwrap_or(true);
    if changed_cwd {
        rec.push_str(&format!("cd {}; ", cwd.replace('\\', "/")));
    }
    if vars_set.is_empty() && vars_unset.is_empty() {
        return rec;
    }
    rec.push_str("env ");
    for var in vars_unset {
        rec.push_str(&format!("--unset={} ", var));
    }
    for (var, value) in vars_set {
        rec.push_str(&format!("'{}={}' ", var, env_value_string(var, value)));
    }
    rec
}

/// Substitutes our own value of the variable back to `$VAR` where possible,
/// keeping the record portable across machines
fn env_value_string(var: &str, value: &str) -> String {
    match std::env::var(var) {
        Ok(old) if !old.is_empty() && old != value => value.replace(&old, &format!("${}", var)),
        _ => value.to_string(),
    }
}

fn file_words(arg: &str) -> Vec<String> {
    if arg.starts_with('-') {
        // look for something of the kind --logfile=/path
        arg.split('=').skip(1).map(String::from).collect()
    } else {
        // otherwise assume we could have multiple words in quotes
        arg.split_whitespace().map(String::from).collect()
    }
}

fn remove_sub_paths(paths: &mut Vec<PathBuf>) {
    let real: Vec<String> = paths
        .iter()
        .map(|path| {
            fs::canonicalize(path)
                .unwrap_or_else(|_| path.clone())
                .to_string_lossy()
                .into_owned()
        })
        .collect();

    let mut keep = vec![true; paths.len()];
    for (index, one) in real.iter().enumerate() {
        if real
            .iter()
            .any(|two| one != two && one.starts_with(two.as_str()))
        {
            keep[index] = false;
        }
    }
    let mut flags = keep.into_iter();
    paths.retain(|_| flags.next().unwrap_or(true));
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|sig| -sig))
            .unwrap_or(1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(1)
    }
}
