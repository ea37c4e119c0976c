use crate::palette::Palette;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "LEAFSCOPE_CONFIG";
pub const OUT_DIR_ENV: &str = "LEAFSCOPE_OUT_DIR";
pub const CODEX_BIN_ENV: &str = "LEAFSCOPE_CODEX_BIN";
pub const MODEL_ENV: &str = "LEAFSCOPE_MODEL";
pub const TIMEOUT_ENV: &str = "LEAFSCOPE_TIMEOUT";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Scratch space for generator reply files.
    pub out_dir: PathBuf,
    pub codex_bin: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: u64,
    /// Class label -> color string, layered over the built-in palette.
    pub palette: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from(".leafscope"),
            codex_bin: None,
            model: None,
            timeout_secs: 120,
            palette: BTreeMap::new(),
        }
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl Settings {
    /// Load from `path`, or from `$LEAFSCOPE_CONFIG` when no path is given,
    /// then apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = env::var(CONFIG_ENV).ok().and_then(non_blank).map(PathBuf::from);
        let mut settings = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        settings.apply_env(|name| env::var(name).ok());
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("config not found: {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid config JSON: {}", path.display()))
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(OUT_DIR_ENV).and_then(non_blank) {
            self.out_dir = PathBuf::from(dir);
        }
        if let Some(bin) = lookup(CODEX_BIN_ENV).and_then(non_blank) {
            self.codex_bin = Some(bin);
        }
        if let Some(model) = lookup(MODEL_ENV).and_then(non_blank) {
            self.model = Some(model);
        }
        if let Some(raw) = lookup(TIMEOUT_ENV).and_then(non_blank) {
            match raw.parse::<u64>() {
                Ok(secs) => self.timeout_secs = secs,
                Err(_) => log::warn!("ignoring {TIMEOUT_ENV}={raw:?}: not a whole number of seconds"),
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn palette(&self) -> Palette {
        Palette::with_overrides(&self.palette)
    }
}
