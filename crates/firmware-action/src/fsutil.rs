use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::error::{Error, ErrorKind, Result};

const MAX_FILENAME_BYTES: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Missing,
    File,
    Dir,
}

pub fn path_kind(p: &Path) -> Result<PathKind> {
    match fs::metadata(p) {
        Ok(meta) if meta.is_dir() => Ok(PathKind::Dir),
        Ok(_) => Ok(PathKind::File),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PathKind::Missing),
        Err(e) => Err(Error::msg(format!("failed to stat {}: {e}", p.display()))),
    }
}

pub fn check_exists(p: &Path) -> Result<()> {
    match path_kind(p)? {
        PathKind::Missing => Err(Error::new(ErrorKind::NotExist, p.display().to_string())),
        _ => Ok(()),
    }
}

pub fn check_not_exists(p: &Path) -> Result<()> {
    match path_kind(p)? {
        PathKind::Missing => Ok(()),
        _ => Err(Error::new(ErrorKind::Exist, p.display().to_string())),
    }
}

pub fn check_is_file(p: &Path) -> Result<()> {
    match path_kind(p)? {
        PathKind::Missing => Err(Error::new(ErrorKind::NotExist, p.display().to_string())),
        PathKind::Dir => Err(Error::new(
            ErrorKind::PathIsDirectory,
            p.display().to_string(),
        )),
        PathKind::File => Ok(()),
    }
}

pub fn check_is_dir(p: &Path) -> Result<()> {
    match path_kind(p)? {
        PathKind::Missing => Err(Error::new(ErrorKind::NotExist, p.display().to_string())),
        PathKind::File => Err(Error::msg(format!("{} is not a directory", p.display()))),
        PathKind::Dir => Ok(()),
    }
}

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    check_is_file(src)?;
    check_not_exists(dst)?;
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    fs::copy(src, dst).map_err(|e| {
        Error::msg(format!(
            "failed to copy {} -> {}: {e}",
            src.display(),
            dst.display()
        ))
    })?;
    Ok(())
}

/// Recursively copies `src` to `dst`. The destination must not exist yet.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    check_is_dir(src)?;
    check_not_exists(dst)?;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| Error::msg(format!("walk failed: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        let target = dst.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            ensure_dir(&target)?;
        } else if ft.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| {
                Error::msg(format!(
                    "failed to copy {} -> {}: {e}",
                    entry.path().display(),
                    target.display()
                ))
            })?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = fs::read_link(src)
        .map_err(|e| Error::msg(format!("failed to read link {}: {e}", src.display())))?;
    std::os::unix::fs::symlink(&target, dst).map_err(|e| {
        Error::msg(format!(
            "failed to create symlink {} -> {}: {e}",
            dst.display(),
            target.display()
        ))
    })
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst)
        .map(|_| ())
        .map_err(|e| Error::msg(format!("failed to copy {}: {e}", src.display())))
}

pub fn move_path(src: &Path, dst: &Path) -> Result<()> {
    check_exists(src)?;
    check_not_exists(dst)?;
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    match path_kind(src)? {
        PathKind::Dir => {
            copy_dir(src, dst)?;
            fs::remove_dir_all(src)?;
        }
        _ => {
            copy_file(src, dst)?;
            fs::remove_file(src)?;
        }
    }
    Ok(())
}

pub fn dir_is_empty(p: &Path) -> Result<bool> {
    let mut it = fs::read_dir(p)
        .map_err(|e| Error::msg(format!("failed to read dir {}: {e}", p.display())))?;
    Ok(it.next().is_none())
}

/// Reports whether any regular file reachable from `roots` was modified after `since`.
/// Missing roots are skipped; anything under `exclude` is not considered.
pub fn any_file_newer_than(roots: &[PathBuf], since: SystemTime, exclude: &[PathBuf]) -> Result<bool> {
    let exclude: Vec<PathBuf> = exclude.iter().map(|p| normalize(p)).collect();
    for root in roots {
        if path_kind(root)? == PathKind::Missing {
            continue;
        }
        let walker = WalkDir::new(root).follow_links(false).into_iter();
        for entry in walker.filter_entry(|e| !is_excluded(e.path(), &exclude)) {
            let entry = entry.map_err(|e| Error::msg(format!("walk failed: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry.metadata().map_err(|e| {
                Error::msg(format!("failed to stat {}: {e}", entry.path().display()))
            })?;
            let mtime = filetime::FileTime::from_last_modification_time(&meta);
            if mtime > filetime::FileTime::from_system_time(since) {
                tracing::debug!(path = %entry.path().display(), "modified since checkpoint");
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn is_excluded(p: &Path, exclude: &[PathBuf]) -> bool {
    if exclude.is_empty() {
        return false;
    }
    let p = normalize(p);
    exclude.iter().any(|ex| p.starts_with(ex))
}

/// Lexical normalization: absolute against the cwd, `.` dropped, `..` folded.
pub fn normalize(p: &Path) -> PathBuf {
    let base = if p.is_absolute() {
        PathBuf::new()
    } else {
        std::env::current_dir().unwrap_or_default()
    };
    let mut out = base;
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Turns `name` + `ext` into a file name made only of `[A-Za-z0-9._-]`,
/// at most 255 bytes long.
pub fn filenamify(name: &str, ext: &str) -> String {
    fn clean(s: &str) -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    let mut name = clean(name);
    let ext = clean(ext);
    let suffix_len = if ext.is_empty() { 0 } else { ext.len() + 1 };
    let room = MAX_FILENAME_BYTES.saturating_sub(suffix_len);
    name.truncate(room);

    let mut out = if ext.is_empty() {
        name
    } else {
        format!("{name}.{ext}")
    };
    // Only reachable when the extension alone is too long.
    out.truncate(MAX_FILENAME_BYTES);
    out
}

pub fn file_name_str(p: &Path) -> Result<String> {
    p.file_name()
        .and_then(|s| s.to_str())
        .map(ToOwned::to_owned)
        .ok_or_else(|| Error::msg(format!("path has no file name: {}", p.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn classify_paths() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("a.txt");
        fs::write(&file, b"x").expect("write");

        assert_eq!(path_kind(tmp.path()).unwrap(), PathKind::Dir);
        assert_eq!(path_kind(&file).unwrap(), PathKind::File);
        assert_eq!(path_kind(&tmp.path().join("nope")).unwrap(), PathKind::Missing);

        assert!(check_is_file(tmp.path()).unwrap_err().is(ErrorKind::PathIsDirectory));
        assert!(check_not_exists(&file).unwrap_err().is(ErrorKind::Exist));
        assert!(
            check_exists(&tmp.path().join("nope"))
                .unwrap_err()
                .is(ErrorKind::NotExist)
        );
    }

    #[test]
    fn copy_dir_and_move() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/blob.bin"), b"blob").unwrap();

        let dst = tmp.path().join("dst");
        copy_dir(&src, &dst).expect("copy dir");
        assert_eq!(fs::read(dst.join("nested/blob.bin")).unwrap(), b"blob");
        assert!(copy_dir(&src, &dst).unwrap_err().is(ErrorKind::Exist));

        let moved = tmp.path().join("moved");
        move_path(&dst, &moved).expect("move");
        assert!(!dst.exists());
        assert!(moved.join("nested/blob.bin").is_file());
    }

    #[test]
    fn newer_file_detection_respects_exclusions() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().to_path_buf();
        let state = root.join(".firmware-action");
        fs::create_dir_all(&state).unwrap();
        let src = root.join("main.c");
        fs::write(&src, b"int main;").unwrap();
        fs::write(state.join("ts.txt"), b"x").unwrap();

        let checkpoint = SystemTime::now();
        let old = filetime::FileTime::from_system_time(checkpoint - Duration::from_secs(60));
        filetime::set_file_mtime(&src, old).unwrap();
        let new = filetime::FileTime::from_system_time(checkpoint + Duration::from_secs(60));
        filetime::set_file_mtime(state.join("ts.txt"), new).unwrap();

        let roots = vec![root.clone()];
        assert!(!any_file_newer_than(&roots, checkpoint, &[state.clone()]).unwrap());
        assert!(any_file_newer_than(&roots, checkpoint, &[]).unwrap());

        filetime::set_file_mtime(&src, new).unwrap();
        assert!(any_file_newer_than(&roots, checkpoint, &[state]).unwrap());
    }

    #[test]
    fn filenamify_sanitizes_and_truncates() {
        assert_eq!(filenamify("coreboot-example", "txt"), "coreboot-example.txt");
        assert_eq!(filenamify("my module/α", "json"), "my_module__.json");

        let long = "x".repeat(400);
        let out = filenamify(&long, "json");
        assert_eq!(out.len(), 255);
        assert!(out.ends_with(".json"));

        for (name, ext) in [("", ""), ("a b", "c d"), ("ok", &"e".repeat(300)[..])] {
            let out = filenamify(name, ext);
            assert!(out.len() <= 255);
            assert!(
                out.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            );
        }
    }

    #[test]
    fn normalize_folds_dots() {
        assert_eq!(normalize(Path::new("/a/./b/../c/")), PathBuf::from("/a/c"));
    }
}
