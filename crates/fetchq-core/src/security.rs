//! Security collaborator: path containment, filename sanitisation and
//! executable-risk labelling.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// Filename used when the URL and the caller yield nothing usable.
pub const DEFAULT_FILENAME: &str = "download.bin";

/// Why a file might be dangerous to open. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLabel {
    Executable,
    Script,
    Installer,
    MacroDocument,
}

impl fmt::Display for RiskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLabel::Executable => write!(f, "executable"),
            RiskLabel::Script => write!(f, "script"),
            RiskLabel::Installer => write!(f, "installer"),
            RiskLabel::MacroDocument => write!(f, "macro_document"),
        }
    }
}

pub trait Security: Send + Sync {
    /// Joins `relative` under `base`, refusing anything that would escape it.
    fn safe_join(&self, base: &Path, relative: &Path) -> Result<PathBuf, FetchError>;

    fn sanitize_filename(&self, name: &str) -> String;

    /// Risk label for `path`, if any. Never blocks a download.
    fn classify_executable_risk(&self, path: &Path) -> Option<RiskLabel>;

    /// Directory a file named `filename` should land in under `base`, and
    /// whether that directory is a quarantine.
    fn choose_final_dir(&self, base: &Path, filename: &str) -> (PathBuf, bool);
}

/// Lexical containment, Linux filename rules and extension-based risk labels.
#[derive(Debug, Clone)]
pub struct DefaultSecurity {
    pub quarantine_dir: String,
    /// When false, risky files stay in the base directory.
    pub quarantine_risky: bool,
}

impl Default for DefaultSecurity {
    fn default() -> Self {
        Self {
            quarantine_dir: "quarantine".to_string(),
            quarantine_risky: true,
        }
    }
}

impl Security for DefaultSecurity {
    fn safe_join(&self, base: &Path, relative: &Path) -> Result<PathBuf, FetchError> {
        let mut out = base.to_path_buf();
        let mut pushed = false;
        for comp in relative.components() {
            match comp {
                Component::Normal(part) => {
                    out.push(part);
                    pushed = true;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(FetchError::UnsafePath(format!(
                        "{} escapes {}",
                        relative.display(),
                        base.display()
                    )));
                }
            }
        }
        if !pushed {
            return Err(FetchError::UnsafePath(format!(
                "{} names no file under {}",
                relative.display(),
                base.display()
            )));
        }
        Ok(out)
    }

    fn sanitize_filename(&self, name: &str) -> String {
        let sanitized = sanitize_filename_for_linux(name);
        if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
            DEFAULT_FILENAME.to_string()
        } else {
            sanitized
        }
    }

    fn classify_executable_risk(&self, path: &Path) -> Option<RiskLabel> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "exe" | "com" | "scr" | "msi" | "dll" | "jar" | "elf" => Some(RiskLabel::Executable),
            "sh" | "bash" | "bat" | "cmd" | "ps1" | "vbs" | "js" | "py" | "pl" => {
                Some(RiskLabel::Script)
            }
            "deb" | "rpm" | "appimage" | "run" | "pkg" | "dmg" => Some(RiskLabel::Installer),
            "docm" | "xlsm" | "pptm" => Some(RiskLabel::MacroDocument),
            _ => None,
        }
    }

    fn choose_final_dir(&self, base: &Path, filename: &str) -> (PathBuf, bool) {
        if self.quarantine_risky && self.classify_executable_risk(Path::new(filename)).is_some() {
            (base.join(&self.quarantine_dir), true)
        } else {
            (base.to_path_buf(), false)
        }
    }
}

/// Sanitizes a candidate filename for safe use on Linux.
///
/// - Replaces NUL, `/`, `\`, whitespace and control characters with `_`
/// - Collapses consecutive underscores
/// - Trims leading/trailing dots and underscores
/// - Limits length to 255 bytes (Linux NAME_MAX)
pub fn sanitize_filename_for_linux(name: &str) -> String {
    const NAME_MAX: usize = 255;

    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = false;
    for c in name.chars() {
        let unsafe_char = c == '\0' || c == '/' || c == '\\' || c.is_control() || c.is_whitespace();
        if unsafe_char || c == '_' {
            if !prev_underscore {
                out.push('_');
            }
            prev_underscore = true;
        } else {
            out.push(c);
            prev_underscore = false;
        }
    }

    let trimmed = out.trim_matches(|c| c == '.' || c == '_');
    if trimmed.len() <= NAME_MAX {
        return trimmed.to_string();
    }
    let mut take = NAME_MAX;
    while take > 0 && !trimmed.is_char_boundary(take) {
        take -= 1;
    }
    trimmed[..take].to_string()
}

/// Last path segment of `url`, if any.
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    if segment == "." || segment == ".." {
        return None;
    }
    Some(segment.to_string())
}
