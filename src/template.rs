//! Terminal installation template
//!
//! Builds `<sessions-base>/_template` once per process: the terminal
//! executable, its dynamic libraries, and a configured keep-list of
//! installation subtrees, plus the files that force the terminal into a
//! self-contained, headless, no-update mode. Session directories are cheap
//! clones of this template.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::BridgeConfig;

/// Marker file that tells the terminal to treat its directory as the install root
pub const PORTABLE_MARKER: &str = "portable_mode";

/// Empty MQL5 skeleton every installation expects to find
pub const MQL5_SUBDIRS: &[&str] = &["Files", "Libraries", "Experts", "Scripts", "Include"];

/// Off-screen 1x1 window, silent startup, no auto-update, no news, API on
const TERMINAL_INI: &str = "\
[Window]\n\
Left=-32000\n\
Top=-32000\n\
Width=1\n\
Height=1\n\
Minimized=1\n\
\n\
[Startup]\n\
Mode=silent\n\
\n\
[Common]\n\
AutoUpdate=0\n\
News=0\n\
API=1\n";

/// Extensions considered dynamic libraries at the installation root
const LIBRARY_EXTENSIONS: &[&str] = &["dll", "so", "dylib"];

/// Builds and re-validates the canonical template directory
#[derive(Debug, Clone)]
pub struct TemplateBuilder {
    template_dir: PathBuf,
    source_exe: PathBuf,
    keep_subtrees: Vec<String>,
}

impl TemplateBuilder {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            template_dir: config.template_dir(),
            source_exe: config.portable_terminal_path.clone(),
            keep_subtrees: config.template_keep_subtrees.clone(),
        }
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    /// Ensure the template exists, building it if necessary
    ///
    /// Idempotent: if the template already holds the terminal executable the
    /// call returns immediately. I/O errors propagate to the session-create
    /// path; nothing is reported at startup.
    pub fn ensure(&self) -> io::Result<PathBuf> {
        let exe_name = self.source_exe.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "portable terminal path has no file name: {}",
                    self.source_exe.display()
                ),
            )
        })?;

        if self.template_dir.join(exe_name).exists() {
            debug!(template = %self.template_dir.display(), "Template already built");
            return Ok(self.template_dir.clone());
        }

        if !self.source_exe.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "terminal executable not found: {}",
                    self.source_exe.display()
                ),
            ));
        }

        info!(
            template = %self.template_dir.display(),
            source = %self.source_exe.display(),
            "Building terminal template"
        );

        fs::create_dir_all(&self.template_dir)?;

        let install_root = self
            .source_exe
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        // Terminal executable plus every dynamic library at the install root
        fs::copy(&self.source_exe, self.template_dir.join(exe_name))?;
        for entry in fs::read_dir(&install_root)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() && is_dynamic_library(&path) {
                fs::copy(&path, self.template_dir.join(entry.file_name()))?;
            }
        }

        // Configured subtrees; missing ones become empty directories
        for sub in &self.keep_subtrees {
            let src = install_root.join(sub);
            let dst = self.template_dir.join(sub);
            if src.is_dir() {
                copy_tree(&src, &dst)?;
            } else {
                fs::create_dir_all(&dst)?;
            }
        }

        fs::write(self.template_dir.join(PORTABLE_MARKER), "portable")?;

        let config_dir = self.template_dir.join("Config");
        fs::create_dir_all(&config_dir)?;
        fs::write(config_dir.join("terminal.ini"), TERMINAL_INI)?;

        for sub in MQL5_SUBDIRS {
            fs::create_dir_all(self.template_dir.join("MQL5").join(sub))?;
        }

        info!(template = %self.template_dir.display(), "Terminal template ready");
        Ok(self.template_dir.clone())
    }
}

fn is_dynamic_library(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| LIBRARY_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Recursively replicate a directory, preserving symbolic links on Unix
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let meta = fs::symlink_metadata(&src_path)?;

        if meta.file_type().is_symlink() {
            replicate_symlink(&src_path, &dst_path)?;
        } else if meta.is_dir() {
            copy_tree(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn replicate_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let target = fs::read_link(src)?;
    std::os::unix::fs::symlink(target, dst)
}

#[cfg(not(unix))]
fn replicate_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    // Symlinks need privileges on Windows; fall back to a content copy
    fs::copy(src, dst).map(|_| ())
}
