use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use filetime::FileTime;
use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Suffix for the previous copy kept while a file is being replaced.
pub const TEMP_SUFFIX: &str = ".temp";

/// Hidden means the final path component starts with a dot.
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// Modification time in epoch milliseconds.
pub fn modified_millis(meta: &std::fs::Metadata) -> io::Result<i64> {
    let modified = meta.modified()?;
    let millis = match modified.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_millis() as i64,
        Err(before) => -(before.duration().as_millis() as i64),
    };
    Ok(millis)
}

pub async fn mtime_of(path: &Path) -> io::Result<i64> {
    let meta = fs::metadata(path).await?;
    modified_millis(&meta)
}

pub fn set_modified_millis(path: &Path, millis: i64) -> io::Result<()> {
    let secs = millis.div_euclid(1000);
    let nanos = (millis.rem_euclid(1000) * 1_000_000) as u32;
    filetime::set_file_mtime(path, FileTime::from_unix_time(secs, nanos))
}

/// `<path>.temp` next to `path`.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

/// Joins a peer-supplied relative path onto `root`.
///
/// Returns `None` for absolute paths, drive prefixes and any `..`
/// component, so the result always stays inside `root`.
pub fn resolve_relative(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

/// Path of `path` below `base` as a wire string, or `None` when it is not
/// below `base` or not valid UTF-8.
pub fn relative_wire_path(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    relative.to_str().map(str::to_owned)
}

/// Children of `dir` sorted by name.
pub async fn read_dir_sorted(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut children = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        children.push(entry.path());
    }
    children.sort();
    Ok(children)
}

/// Every regular file and directory below `dir`, as paths relative to
/// `base`. Hidden entries (and everything under them) and unreadable
/// directories are skipped. `dir` itself is not listed.
pub fn list_tree(base: &Path, dir: &Path) -> Vec<String> {
    let mut listed = Vec::new();

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry.path()));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping unreadable entry: {}", e);
                continue;
            }
        };

        let file_type = entry.file_type();
        if !file_type.is_file() && !file_type.is_dir() {
            continue;
        }

        match relative_wire_path(base, entry.path()) {
            Some(relative) => listed.push(relative),
            None => warn!("Skipping unrepresentable path {}", entry.path().display()),
        }
    }

    listed
}
