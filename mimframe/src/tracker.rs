use {
    crate::{
        prelude::*,
        traffic::edits::{self, FileEdit, FileKind},
    },
    chrono::NaiveDateTime,
    std::{
        collections::{BTreeMap, HashMap},
        ffi::OsStr,
        path::{Path, PathBuf},
        time::UNIX_EPOCH,
    },
    walkdir::WalkDir,
};

/// Watches the filesystem trees the SUT has named as possibly edited. A
/// snapshot of `(mtime, size)` per sub-path taken before traffic is compared
/// against a fresh walk afterwards; the differences become file-edit traffic.
/// During pure replay no snapshots are kept, the pre-state is synthetic
pub struct EditTracker {
    ignore_names: Vec<String>,
    record_dir: Option<PathBuf>,
    replay_dir: Option<PathBuf>,
    top_level: Vec<PathBuf>,
    snapshot: BTreeMap<PathBuf, (Option<i64>, u64)>,
    edit_counts: HashMap<String, u32>,
}

impl EditTracker {
    pub fn new(
        ignore_names: Vec<String>,
        record_dir: Option<PathBuf>,
        replay_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            ignore_names,
            record_dir,
            replay_dir,
            top_level: Vec::new(),
            snapshot: BTreeMap::new(),
            edit_counts: HashMap::new(),
        }
    }

    /// Registers possible edits for the current message. The most recent
    /// edits are the most relevant, so fresh paths go to the front of the
    /// watched list. Returns whether anything was declared at all
    pub fn add_possible_edits(&mut self, edits: Vec<PathBuf>, skip_snapshot: bool) -> bool {
        let declared = !edits.is_empty();
        for file in edits {
            self.top_level.retain(|known| known != &file);
            self.top_level.insert(0, file.clone());

            // edit times aren't interesting when doing pure replay
            if !skip_snapshot {
                for sub_path in self.find_files_and_links(&file) {
                    let info = self.latest_modification(&sub_path);
                    debug!(
                        "Adding possible sub-path edit for {} with mod time {} and size {}",
                        sub_path.display(),
                        format_mtime(info.0),
                        info.1
                    );
                    self.snapshot.insert(sub_path, info);
                }
            }
        }
        declared
    }

    /// Rewalks every watched path and turns the differences against the
    /// snapshot into file-edit traffic, one per top-level path with changes.
    /// Disappeared sub-paths are attributed to the highest ancestor that
    /// actually vanished
    pub fn latest_edits(&mut self) -> Vec<FileEdit> {
        let mut traffic = Vec::new();
        let mut removed_paths = Vec::new();

        for file in self.top_level.clone() {
            let mut changed = Vec::new();
            let new_paths = self.find_files_and_links(&file);
            for sub_path in &new_paths {
                let info = self.latest_modification(sub_path);
                if self.snapshot.get(sub_path) != Some(&info) {
                    changed.push(sub_path.clone());
                    self.snapshot.insert(sub_path.clone(), info);
                }
            }

            let prefix = format!("{}/", file.to_string_lossy());
            for old_path in self.snapshot.keys() {
                if (*old_path == file || old_path.to_string_lossy().starts_with(&prefix))
                    && !new_paths.contains(old_path)
                {
                    let removed = find_removed_path(old_path);
                    debug!(
                        "Deletion of {} - registering {}",
                        old_path.display(),
                        removed.display()
                    );
                    removed_paths.push(old_path.clone());
                    if !changed.contains(&removed) {
                        changed.push(removed);
                    }
                }
            }

            if !changed.is_empty() {
                if let Some(edit) = self.make_recorded(&file, changed) {
                    traffic.push(edit);
                }
            }
        }

        for path in removed_paths {
            self.snapshot.remove(&path);
        }
        traffic
    }

    /// The next message starts fresh unless asynchronous edits are in play
    pub fn clear(&mut self) {
        self.top_level.clear();
        self.snapshot.clear();
    }

    pub fn is_clear(&self) -> bool {
        self.top_level.is_empty() && self.snapshot.is_empty()
    }

    /// Every file and link under a watched path, ignore names pruned.
    /// Directories themselves are not listed, only what they contain
    pub fn find_files_and_links(&self, path: &Path) -> Vec<PathBuf> {
        if !path.exists() {
            return Vec::new();
        }
        if path.is_file() || edits::is_symlink(path) {
            return vec![path.to_path_buf()];
        }

        WalkDir::new(path)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !self.is_ignored(entry.file_name()))
            .filter_map(|result| result.ok())
            .filter(|entry| !entry.file_type().is_dir())
            .map(|entry| entry.into_path())
            .collect()
    }

    fn is_ignored(&self, name: &OsStr) -> bool {
        self.ignore_names
            .iter()
            .any(|ignored| name == OsStr::new(ignored))
    }

    fn latest_modification(&self, path: &Path) -> (Option<i64>, u64) {
        match std::fs::metadata(path) {
            Ok(meta) => {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                    .map(|elapsed| elapsed.as_secs() as i64);
                (mtime, meta.len())
            }
            Err(_) => (None, 0),
        }
    }

    fn make_recorded(&mut self, file: &Path, changed: Vec<PathBuf>) -> Option<FileEdit> {
        let record_dir = match self.record_dir {
            Some(ref dir) => dir.clone(),
            None => {
                warn!(
                    "File edits under {} detected but no record directory is configured",
                    file.display()
                );
                return None;
            }
        };

        let name = self.edit_name(base_name(file));
        let stored = record_dir.join(&name);
        debug!(
            "File being edited for '{}' : will store {} as {}",
            name,
            file.display(),
            stored.display()
        );
        for path in &changed {
            debug!("- changed {}", path.display());
        }
        Some(FileEdit::recorded(name, file.to_path_buf(), stored, changed))
    }

    /// Repeats of the same logical name within a run get a numbered suffix
    fn edit_name(&mut self, name: String) -> String {
        let times_used = self.edit_counts.entry(name.clone()).or_insert(0);
        *times_used += 1;
        if *times_used > 1 {
            format!("{}.edit_{}", name, times_used)
        } else {
            name
        }
    }

    /// Resolves a replayed logical name against the store, probing the
    /// marker suffixes
    pub fn stored_file(&self, name: &str) -> Option<(PathBuf, FileKind)> {
        edits::probe_stored(self.replay_dir.as_deref()?, name)
    }

    /// Maps a replayed logical name to the active path it stands for: an
    /// exact basename match of compatible file type wins, otherwise the
    /// watched path with the best common prefix/suffix score
    pub fn file_being_edited(
        &self,
        given_name: &str,
        file_type: FileKind,
        files_matched: &mut Vec<PathBuf>,
    ) -> Option<PathBuf> {
        // drop the internal disambiguation suffix
        let file_name = given_name.split(".edit_").next().unwrap_or(given_name);

        let mut best_match = None;
        let mut best_score = -1;
        for edited in &self.top_level {
            match file_type {
                FileKind::Directory if edited.is_file() => continue,
                FileKind::File if edited.is_dir() => continue,
                _ => {}
            }

            let edited_name = base_name(edited);
            if edited_name == file_name && !files_matched.contains(edited) {
                files_matched.push(edited.clone());
                best_match = Some(edited.clone());
                break;
            } else {
                let score = file_match_score(file_name, &edited_name);
                if score > best_score {
                    best_match = Some(edited.clone());
                    best_score = score;
                }
            }
        }

        best_match.map(rewrite_cygdrive)
    }
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// We know this path is removed; walking up, the most concise removal to
/// store is the highest ancestor that is itself gone
fn find_removed_path(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
            find_removed_path(parent)
        }
        _ => path.to_path_buf(),
    }
}

fn file_match_score(given: &str, actual: &str) -> i64 {
    if actual.contains(".edit_") {
        return -1;
    }
    let given: Vec<char> = given.chars().collect();
    let actual: Vec<char> = actual.chars().collect();
    let forward = given
        .iter()
        .zip(actual.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let backward = given
        .iter()
        .rev()
        .zip(actual.iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    (forward + backward) as i64
}

/// Windows tests may refer to paths by their cygwin alias
fn rewrite_cygdrive(path: PathBuf) -> PathBuf {
    let text = path.to_string_lossy();
    if text.starts_with("/cygdrive/") && text.len() > 11 {
        PathBuf::from(format!("{}:{}", &text[10..11], &text[11..]))
    } else {
        path
    }
}

fn format_mtime(mtime: Option<i64>) -> String {
    mtime
        .and_then(|secs| NaiveDateTime::from_timestamp_opt(secs, 0))
        .map(|time| time.format("%d%b%H:%M:%S").to_string())
        .unwrap_or_else(|| "<gone>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tracker_for(dir: &Path) -> EditTracker {
        EditTracker::new(Vec::new(), Some(dir.join("edits")), None)
    }

    #[test]
    fn watched_list_is_most_recent_first_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = tracker_for(dir.path());

        let a = dir.path().join("a");
        let b = dir.path().join("b");
        tracker.add_possible_edits(vec![a.clone()], false);
        tracker.add_possible_edits(vec![b.clone()], false);
        tracker.add_possible_edits(vec![a.clone()], false);

        assert_eq!(tracker.top_level, vec![a, b]);
    }

    #[test]
    fn grown_files_and_new_files_are_changes() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();
        fs::write(work.join("existing"), "1").unwrap();

        let mut tracker = tracker_for(dir.path());
        tracker.add_possible_edits(vec![work.clone()], false);

        fs::write(work.join("existing"), "123456").unwrap();
        fs::write(work.join("fresh"), "x").unwrap();

        let edits = tracker.latest_edits();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].name, "work");
        assert_eq!(
            edits[0].changed,
            vec![work.join("existing"), work.join("fresh")]
        );

        // nothing moved since, so nothing more to report
        assert!(tracker.latest_edits().is_empty());
    }

    #[test]
    fn removed_subtrees_collapse_to_their_highest_gone_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(work.join("sub")).unwrap();
        fs::write(work.join("sub").join("a"), "a").unwrap();
        fs::write(work.join("sub").join("b"), "b").unwrap();

        let mut tracker = tracker_for(dir.path());
        tracker.add_possible_edits(vec![work.clone()], false);

        fs::remove_dir_all(work.join("sub")).unwrap();
        let edits = tracker.latest_edits();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].changed, vec![work.join("sub")]);

        // the dead sub-paths are forgotten, not reported again
        assert!(tracker.latest_edits().is_empty());
    }

    #[test]
    fn ignored_names_never_enter_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(work.join("cache")).unwrap();
        fs::write(work.join("kept"), "1").unwrap();
        fs::write(work.join("cache").join("junk"), "1").unwrap();

        let tracker = EditTracker::new(
            vec!["cache".to_string()],
            Some(dir.path().join("edits")),
            None,
        );
        assert_eq!(tracker.find_files_and_links(&work), vec![work.join("kept")]);
    }

    #[test]
    fn repeated_logical_names_get_numbered() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = tracker_for(dir.path());
        assert_eq!(tracker.edit_name("log".into()), "log");
        assert_eq!(tracker.edit_name("log".into()), "log.edit_2");
        assert_eq!(tracker.edit_name("log".into()), "log.edit_3");
        assert_eq!(tracker.edit_name("other".into()), "other");
    }

    #[test]
    fn replayed_names_resolve_against_the_watched_list() {
        let dir = tempfile::tempdir().unwrap();
        let results = dir.path().join("results.log");
        let data = dir.path().join("data");
        fs::write(&results, "x").unwrap();
        fs::create_dir(&data).unwrap();

        let mut tracker = tracker_for(dir.path());
        tracker.add_possible_edits(vec![results.clone(), data.clone()], false);

        let mut matched = Vec::new();
        // exact basename, compatible type
        assert_eq!(
            tracker.file_being_edited("results.log", FileKind::File, &mut matched),
            Some(results.clone())
        );
        // an already matched path is not handed out twice; scoring falls back
        // to the closest remaining basename
        assert_eq!(
            tracker.file_being_edited("results.log", FileKind::Unknown, &mut matched),
            Some(results.clone())
        );

        // the numbered suffix is internal and dropped before matching
        let mut matched = Vec::new();
        assert_eq!(
            tracker.file_being_edited("results.log.edit_2", FileKind::File, &mut matched),
            Some(results)
        );

        // type mismatches are skipped entirely
        let mut matched = Vec::new();
        assert_eq!(
            tracker.file_being_edited("data", FileKind::Directory, &mut matched),
            Some(data)
        );
    }

    #[test]
    fn clear_resets_all_tracking_state() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();
        fs::write(work.join("f"), "1").unwrap();

        let mut tracker = tracker_for(dir.path());
        tracker.add_possible_edits(vec![work], false);
        assert!(!tracker.is_clear());
        tracker.clear();
        assert!(tracker.is_clear());
    }
}
