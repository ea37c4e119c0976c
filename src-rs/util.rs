use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub fn write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    ensure_parent_dir(path)?;
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).with_context(|| format!("failed to write JSON: {}", path.display()))?;
    Ok(())
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .with_context(|| format!("failed to create parent directory: {}", parent.display())),
        _ => Ok(()),
    }
}

/// `out/leaf.png` -> `out/leaf.json`. A path without a file name gets
/// `overlay.json` beside it.
pub fn default_sidecar_for(image: &Path) -> PathBuf {
    if image.file_stem().is_none() {
        return image.join("overlay.json");
    }
    image.with_extension("json")
}

/// Recorded in sidecars so they stay valid when read from elsewhere.
pub fn abs_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Used in scratch reply file names.
pub fn timestamp_compact() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

pub fn timestamp_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn truncate_text(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    text.chars().take(limit).collect::<String>() + "\n...<truncated>..."
}

/// Whether `name` resolves to an executable file on `PATH`.
pub fn command_exists(name: &str) -> bool {
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&paths).any(|dir| is_executable(&dir.join(name)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn writes_json_pretty_into_new_dirs() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a").join("b.json");
        write_json_pretty(&target, &json!({"ok": true})).unwrap();
        let back: Value = serde_json::from_str(&fs::read_to_string(&target).unwrap()).unwrap();
        assert_eq!(back["ok"], json!(true));
    }

    #[test]
    fn bare_file_name_needs_no_parent() {
        assert!(ensure_parent_dir(Path::new("leaf.json")).is_ok());
    }

    #[test]
    fn sidecar_swaps_extension() {
        assert_eq!(
            default_sidecar_for(Path::new("out/leaf.png")),
            PathBuf::from("out/leaf.json")
        );
        assert_eq!(default_sidecar_for(Path::new("leaf")), PathBuf::from("leaf.json"));
        assert_eq!(default_sidecar_for(Path::new("/")), PathBuf::from("/overlay.json"));
    }

    #[test]
    fn abs_path_anchors_relative_paths() {
        let relative = abs_path(Path::new("out/leaf.png"));
        assert!(relative.is_absolute());
        assert!(relative.ends_with("out/leaf.png"));

        let absolute = env::temp_dir().join("leaf.png");
        assert_eq!(abs_path(&absolute), absolute);
    }

    #[test]
    fn timestamps_have_fixed_shapes() {
        let compact = timestamp_compact();
        assert_eq!(compact.len(), 15);
        assert_eq!(compact.as_bytes()[8], b'-');

        let iso = timestamp_iso();
        assert!(iso.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&iso).is_ok());
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_text("abc", 5), "abc");
        assert_eq!(truncate_text("ééééé", 2), "éé\n...<truncated>...");
    }

    #[cfg(unix)]
    #[test]
    fn finds_commands_on_path() {
        assert!(command_exists("sh"));
        assert!(!command_exists("leafscope-no-such-command"));
    }
}
