//! Per-session data directory provisioning
//!
//! Clones the template into `session_<id>`, injects the session's runtime
//! configuration, and trims startup weight. The clone is the worker's whole
//! world: the terminal runs portable inside it and never touches shared
//! state. Credentials are never written here; the password reaches the
//! worker only over its stdin pipe.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::template::copy_tree;

/// No update checks, error-level terminal logs capped at 1 MB
const COMMON_INI: &str = "[General]\nSkipUpdate=1\n\n[Logs]\nLevel=error\nMaxLogSizeMB=1\n";

/// Chart profiles and bundled MQL5 programs cleared to cut startup footprint
const SCRUB_SUBDIRS: &[&str] = &["profiles/charts/Default", "MQL5/Experts", "MQL5/Indicators"];

/// Path of a session's data directory under the sessions root
pub fn session_dir(base: &Path, session_id: &str) -> PathBuf {
    base.join(format!("session_{session_id}"))
}

/// Clone the template into a fresh data dir for `session_id`
///
/// An existing directory for the same id is removed first. A failure partway
/// leaves the partial directory in place; the session-create error path is
/// responsible for calling [`remove`].
pub fn provision(base: &Path, template: &Path, session_id: &str) -> io::Result<PathBuf> {
    let data_dir = session_dir(base, session_id);

    if data_dir.exists() {
        fs::remove_dir_all(&data_dir)?;
    }

    copy_tree(template, &data_dir)?;

    let config_dir = data_dir.join("Config");
    fs::create_dir_all(&config_dir)?;
    fs::write(config_dir.join("common.ini"), COMMON_INI)?;

    for sub in SCRUB_SUBDIRS {
        clear_dir_contents(&data_dir.join(sub))?;
    }

    debug!(session_id, data_dir = %data_dir.display(), "Session directory provisioned");
    Ok(data_dir)
}

/// Remove a session's data dir, ignoring errors; returns whether it was removed
pub fn remove(base: &Path, session_id: &str) -> bool {
    let data_dir = session_dir(base, session_id);
    if !data_dir.exists() {
        return false;
    }
    match fs::remove_dir_all(&data_dir) {
        Ok(()) => true,
        Err(e) => {
            warn!(session_id, error = %e, "Failed to remove session directory");
            false
        }
    }
}

/// Empty a directory without removing the directory itself; absent dirs are fine
fn clear_dir_contents(dir: &Path) -> io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if fs::symlink_metadata(&path)?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_template(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("terminal64.exe"), b"terminal binary").unwrap();
        fs::write(dir.join("portable_mode"), b"portable").unwrap();
        fs::create_dir_all(dir.join("Config")).unwrap();
        fs::write(dir.join("Config").join("terminal.ini"), b"[Window]").unwrap();
        fs::create_dir_all(dir.join("profiles/charts/Default")).unwrap();
        fs::write(dir.join("profiles/charts/Default").join("chart01.chr"), b"chart").unwrap();
        fs::create_dir_all(dir.join("MQL5/Experts")).unwrap();
        fs::write(dir.join("MQL5/Experts").join("ExpertMACD.ex5"), b"ea").unwrap();
        fs::create_dir_all(dir.join("MQL5/Files")).unwrap();
    }

    #[test]
    fn test_provision_clones_template() {
        let tmp = TempDir::new().unwrap();
        let template = tmp.path().join("_template");
        fake_template(&template);

        let data_dir = provision(tmp.path(), &template, "abc123").unwrap();

        assert_eq!(data_dir, tmp.path().join("session_abc123"));
        assert!(data_dir.join("terminal64.exe").is_file());
        assert!(data_dir.join("portable_mode").is_file());
        assert!(data_dir.join("Config").join("terminal.ini").is_file());
    }

    #[test]
    fn test_provision_writes_common_ini() {
        let tmp = TempDir::new().unwrap();
        let template = tmp.path().join("_template");
        fake_template(&template);

        let data_dir = provision(tmp.path(), &template, "abc123").unwrap();
        let ini = fs::read_to_string(data_dir.join("Config").join("common.ini")).unwrap();
        assert!(ini.contains("SkipUpdate=1"));
        assert!(ini.contains("Level=error"));
        assert!(ini.contains("MaxLogSizeMB=1"));
    }

    #[test]
    fn test_provision_scrubs_startup_weight() {
        let tmp = TempDir::new().unwrap();
        let template = tmp.path().join("_template");
        fake_template(&template);

        let data_dir = provision(tmp.path(), &template, "abc123").unwrap();

        // Directories stay, their contents go
        assert!(data_dir.join("profiles/charts/Default").is_dir());
        assert!(!data_dir.join("profiles/charts/Default/chart01.chr").exists());
        assert!(data_dir.join("MQL5/Experts").is_dir());
        assert!(!data_dir.join("MQL5/Experts/ExpertMACD.ex5").exists());
    }

    #[test]
    fn test_provision_replaces_existing_dir() {
        let tmp = TempDir::new().unwrap();
        let template = tmp.path().join("_template");
        fake_template(&template);

        let stale = session_dir(tmp.path(), "abc123");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("stale.txt"), b"old run").unwrap();

        let data_dir = provision(tmp.path(), &template, "abc123").unwrap();
        assert!(!data_dir.join("stale.txt").exists());
        assert!(data_dir.join("terminal64.exe").is_file());
    }

    #[test]
    fn test_remove_is_safe_to_repeat() {
        let tmp = TempDir::new().unwrap();
        let template = tmp.path().join("_template");
        fake_template(&template);

        provision(tmp.path(), &template, "abc123").unwrap();
        assert!(remove(tmp.path(), "abc123"));
        assert!(!remove(tmp.path(), "abc123"));
        assert!(!session_dir(tmp.path(), "abc123").exists());
    }

    #[test]
    fn test_sessions_are_isolated() {
        let tmp = TempDir::new().unwrap();
        let template = tmp.path().join("_template");
        fake_template(&template);

        let a = provision(tmp.path(), &template, "aaa").unwrap();
        let b = provision(tmp.path(), &template, "bbb").unwrap();

        fs::write(a.join("MQL5/Files/state.dat"), b"session a").unwrap();
        assert!(!b.join("MQL5/Files/state.dat").exists());
    }
}
