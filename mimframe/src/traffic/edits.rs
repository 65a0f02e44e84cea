use {
    crate::prelude::*,
    std::{
        fs, io,
        path::{Path, PathBuf},
    },
};

/// Stores a relative link target recorded from a symlink
pub const LINK_SUFFIX: &str = ".SYMLINK";
/// Zero byte marker meaning "remove this path on replay"
pub const DELETE_SUFFIX: &str = ".DELETION";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileKind {
    File,
    Directory,
    Unknown,
}

/// One observed (or replayed) edit of a watched top-level path. The stored
/// side mirrors the active side under the edits root, path for path
#[derive(Debug, Clone)]
pub struct FileEdit {
    pub name: String,
    pub active: PathBuf,
    pub stored: PathBuf,
    pub changed: Vec<PathBuf>,
    pub reproduce: bool,
}

impl FileEdit {
    pub fn recorded(name: String, active: PathBuf, stored: PathBuf, changed: Vec<PathBuf>) -> Self {
        Self {
            name,
            active,
            stored,
            changed,
            reproduce: false,
        }
    }

    pub fn replayed(name: String, active: PathBuf, stored: PathBuf, changed: Vec<PathBuf>) -> Self {
        Self {
            name,
            active,
            stored,
            changed,
            reproduce: true,
        }
    }

    /// Recording side: copy the changed paths of the active tree into the store
    pub fn store(&self) {
        if !self.reproduce {
            copy_changed(&self.active, &self.stored, &self.changed);
        }
    }

    /// Replay side: apply the stored paths back over the active tree
    pub fn apply(&self) {
        if self.reproduce {
            copy_changed(&self.stored, &self.active, &self.changed);
        }
    }
}

/// Looks a logical name up in the replay edits directory, probing the plain
/// name and both marker suffixes
pub fn probe_stored(replay_dir: &Path, name: &str) -> Option<(PathBuf, FileKind)> {
    let candidates = [
        name.to_string(),
        format!("{}{}", name, LINK_SUFFIX),
        format!("{}{}", name, DELETE_SUFFIX),
    ];
    for candidate in &candidates {
        let path = replay_dir.join(candidate);
        if path.exists() {
            let kind = file_kind(&path);
            return Some((path, kind));
        }
    }
    None
}

fn file_kind(path: &Path) -> FileKind {
    if path.to_string_lossy().ends_with(DELETE_SUFFIX) {
        FileKind::Unknown
    } else if path.is_dir() {
        FileKind::Directory
    } else {
        FileKind::File
    }
}

pub(crate) fn is_symlink(path: &Path) -> bool {
    path.symlink_metadata()
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}

/// The shared copy routine: destination paths are derived from source paths
/// by replacing the source root with the destination root. Failures are
/// diagnostics, never fatal
fn copy_changed(src_root: &Path, dst_root: &Path, changed: &[PathBuf]) {
    let src_root_text = src_root.to_string_lossy().into_owned();
    let dst_root_text = dst_root.to_string_lossy().into_owned();

    for src in changed {
        let dst = PathBuf::from(
            src.to_string_lossy()
                .replace(&src_root_text, &dst_root_text),
        );
        if let Err(e) = copy_path(src, &dst) {
            warn!(
                "Could not transfer {} to {}: {}",
                src.display(),
                dst.display(),
                e
            );
        }
    }
}

fn copy_path(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        if !parent.is_dir() {
            fs::create_dir_all(parent)?;
        }
    }

    let src_text = src.to_string_lossy().into_owned();
    let dst_text = dst.to_string_lossy().into_owned();
    if src_text.ends_with(LINK_SUFFIX) {
        restore_link(src, Path::new(&dst_text.replace(LINK_SUFFIX, "")))
    } else if is_symlink(src) {
        store_link_as_file(src, Path::new(&format!("{}{}", dst_text, LINK_SUFFIX)))
    } else if src_text.ends_with(DELETE_SUFFIX) {
        remove_path(Path::new(&dst_text.replace(DELETE_SUFFIX, "")))
    } else if !src.exists() {
        fs::File::create(format!("{}{}", dst_text, DELETE_SUFFIX)).map(|_| ())
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}

#[cfg(unix)]
fn restore_link(src: &Path, dst: &Path) -> io::Result<()> {
    let target = fs::read_to_string(src)?.trim().to_string();
    if !is_symlink(dst) {
        std::os::unix::fs::symlink(target, dst)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn restore_link(_src: &Path, dst: &Path) -> io::Result<()> {
    warn!("Cannot restore symlink {} on this platform", dst.display());
    Ok(())
}

/// Record relative links as such: the link's own parent directory prefix is
/// stripped from the stored target
fn store_link_as_file(src: &Path, dst: &Path) -> io::Result<()> {
    let target = fs::read_link(src)?;
    let mut text = target.to_string_lossy().into_owned();
    if let Some(parent) = src.parent() {
        text = text.replace(&format!("{}/", parent.to_string_lossy()), "");
    }
    fs::write(dst, format!("{}\n", text))
}

fn remove_path(path: &Path) -> io::Result<()> {
    if path.is_file() || is_symlink(path) {
        fs::remove_file(path)
    } else if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let active = dir.path().join("work");
        let stored = dir.path().join("store").join("work");
        fs::create_dir_all(active.join("sub")).unwrap();
        fs::write(active.join("sub").join("data"), "payload").unwrap();

        let edit = FileEdit::recorded(
            "work".into(),
            active.clone(),
            stored.clone(),
            vec![active.join("sub").join("data")],
        );
        edit.store();
        assert_eq!(
            fs::read_to_string(stored.join("sub").join("data")).unwrap(),
            "payload"
        );

        // now replay the store back over a clean active tree
        fs::remove_dir_all(&active).unwrap();
        let replayed = FileEdit::replayed(
            "work".into(),
            active.clone(),
            stored.clone(),
            vec![stored.join("sub").join("data")],
        );
        replayed.apply();
        assert_eq!(
            fs::read_to_string(active.join("sub").join("data")).unwrap(),
            "payload"
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_stored_as_relative_targets() {
        let dir = tempfile::tempdir().unwrap();
        let active = dir.path().join("tree");
        let stored = dir.path().join("store").join("tree");
        fs::create_dir_all(&active).unwrap();
        fs::write(active.join("real"), "x").unwrap();
        std::os::unix::fs::symlink(active.join("real"), active.join("link")).unwrap();

        let edit = FileEdit::recorded(
            "tree".into(),
            active.clone(),
            stored.clone(),
            vec![active.join("link")],
        );
        edit.store();

        let marker = stored.join(format!("link{}", LINK_SUFFIX));
        assert_eq!(fs::read_to_string(&marker).unwrap(), "real\n");

        // replaying the marker recreates the link
        fs::remove_file(active.join("link")).unwrap();
        let replayed = FileEdit::replayed(
            "tree".into(),
            active.clone(),
            stored.clone(),
            vec![marker],
        );
        replayed.apply();
        assert!(is_symlink(&active.join("link")));
        assert_eq!(
            fs::read_link(active.join("link")).unwrap(),
            PathBuf::from("real")
        );
    }

    #[test]
    fn vanished_sources_become_deletion_markers_and_back() {
        let dir = tempfile::tempdir().unwrap();
        let active = dir.path().join("area");
        let stored = dir.path().join("store").join("area");
        fs::create_dir_all(&active).unwrap();

        // recording a path that no longer exists leaves a marker in the store
        let gone = active.join("scratch");
        let edit = FileEdit::recorded("area".into(), active.clone(), stored.clone(), vec![gone]);
        edit.store();
        let marker = stored.join(format!("scratch{}", DELETE_SUFFIX));
        assert!(marker.exists());

        // replaying the marker removes the active path
        fs::write(active.join("scratch"), "stale").unwrap();
        let replayed =
            FileEdit::replayed("area".into(), active.clone(), stored.clone(), vec![marker]);
        replayed.apply();
        assert!(!active.join("scratch").exists());
    }

    #[test]
    fn stored_names_resolve_with_suffix_probing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("plain"), "x").unwrap();
        fs::write(dir.path().join(format!("gone{}", DELETE_SUFFIX)), "").unwrap();

        let (path, kind) = probe_stored(dir.path(), "plain").unwrap();
        assert_eq!(kind, FileKind::File);
        assert!(path.ends_with("plain"));

        let (_, kind) = probe_stored(dir.path(), "gone").unwrap();
        assert_eq!(kind, FileKind::Unknown);

        assert!(probe_stored(dir.path(), "missing").is_none());
    }
}
