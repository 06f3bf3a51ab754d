use crate::EnvError;
use std::path::{Path, PathBuf};

/// Maps a Windows drive path (`E:\db\nr`, `e:/db/nr`) to its WSL mount (`/mnt/e/db/nr`).
///
/// Anything not rooted at a drive letter (relative paths, UNC shares) has no mount.
pub fn windows_to_wsl(host_path: &Path) -> Result<String, EnvError> {
    let raw = host_path.to_string_lossy().replace('\\', "/");
    let fail = |reason: &str| EnvError::PathTranslation {
        path: host_path.to_path_buf(),
        reason: reason.to_string(),
    };

    let mut chars = raw.chars();
    let drive = match (chars.next(), chars.next()) {
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic() => letter.to_ascii_lowercase(),
        _ => return Err(fail("path is not under a drive letter")),
    };
    let rest = &raw[2..];
    if !rest.is_empty() && !rest.starts_with('/') {
        return Err(fail("drive-relative paths are not supported"));
    }

    let segments: Vec<&str> = rest
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    if segments.iter().any(|segment| *segment == "..") {
        return Err(fail("parent components are not supported"));
    }
    if segments.is_empty() {
        return Ok(format!("/mnt/{drive}"));
    }
    Ok(format!("/mnt/{drive}/{}", segments.join("/")))
}

/// Inverse of [`windows_to_wsl`]; `None` for paths outside `/mnt/<drive>`.
pub fn wsl_to_windows(env_path: &str) -> Option<PathBuf> {
    let rest = env_path.strip_prefix("/mnt/")?;
    let (drive, remainder) = match rest.split_once('/') {
        Some((drive, remainder)) => (drive, remainder),
        None => (rest, ""),
    };
    let mut letters = drive.chars();
    let letter = letters.next().filter(|ch| ch.is_ascii_alphabetic())?;
    if letters.next().is_some() {
        return None;
    }
    let remainder = remainder.trim_end_matches('/').replace('/', "\\");
    Some(PathBuf::from(format!(
        "{}:\\{remainder}",
        letter.to_ascii_uppercase()
    )))
}
