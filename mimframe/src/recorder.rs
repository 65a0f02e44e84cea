use {
    crate::prelude::*,
    std::{
        collections::HashMap,
        fs::OpenOptions,
        io::Write,
        path::PathBuf,
        sync::Mutex,
    },
};

/// Serializes record output so that traffic appears in the transcript in the
/// order requests arrived, not the order in which they complete. Text for the
/// request currently holding the counter is appended directly; anything else
/// is buffered until the counter reaches its request number
pub struct RecordHandler {
    file: Option<PathBuf>,
    state: Mutex<CacheState>,
}

struct CacheState {
    recording_request: u64,
    cache: HashMap<u64, String>,
    completed: Vec<u64>,
}

impl RecordHandler {
    pub fn new(file: Option<PathBuf>) -> Self {
        Self {
            file,
            state: Mutex::new(CacheState {
                recording_request: 1,
                cache: HashMap::new(),
                completed: Vec::new(),
            }),
        }
    }

    pub fn record(&self, text: &str, request: u64) {
        let mut state = self.state.lock().expect("record lock poisoned");
        if request == state.recording_request {
            if let Some(pending) = state.cache.remove(&request) {
                self.do_record(&pending);
            }
            self.do_record(text);
        } else {
            state.cache.entry(request).or_default().push_str(text);
        }
    }

    pub fn request_complete(&self, request: u64) {
        let mut state = self.state.lock().expect("record lock poisoned");
        if request == state.recording_request {
            self.advance(&mut state);
        } else {
            state.completed.push(request);
        }
    }

    /// Flushes the current request's buffer and hands the counter to the next
    /// request, transitively draining any that completed out of order
    fn advance(&self, state: &mut CacheState) {
        loop {
            let current = state.recording_request;
            if let Some(pending) = state.cache.remove(&current) {
                self.do_record(&pending);
            }
            state.recording_request += 1;
            let next = state.recording_request;
            match state.completed.iter().position(|r| *r == next) {
                Some(done) => {
                    state.completed.swap_remove(done);
                }
                None => break,
            }
        }
    }

    // Open, append, flush and close per call; a crashing worker can then
    // never leave the transcript in a half-written state
    fn do_record(&self, text: &str) {
        let path = match self.file {
            Some(ref path) => path,
            None => return,
        };

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| {
                file.write_all(text.as_bytes())
                    .and_then(|_| file.flush())
            })
            .unwrap_or_else(|e| {
                CrateError::from(e).log(Level::ERROR);
            })
    }
}
