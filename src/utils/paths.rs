use std::path::{Path, PathBuf};

fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

/// Picks the directory for rolling log files: the configured override first,
/// then `logs/` next to the executable, then a relative `logs/`.
pub fn resolve_log_dir(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        if let Some(dir) = ensure_dir(path) {
            return dir;
        }
        tracing::warn!("log directory {} is not writable, falling back", path.display());
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join("logs");
            if let Some(found) = ensure_dir(&candidate) {
                return found;
            }
        }
    }

    PathBuf::from("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_dir_is_created_and_used() {
        let target = std::env::temp_dir().join(format!(
            "launcher-downloads-logs-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&target);

        let resolved = resolve_log_dir(Some(target.as_path()));
        assert_eq!(resolved, target);
        assert!(target.is_dir());

        let _ = std::fs::remove_dir_all(&target);
    }

    #[test]
    fn empty_override_is_ignored() {
        let resolved = resolve_log_dir(Some(Path::new("")));
        assert!(resolved.ends_with("logs"));
    }
}
