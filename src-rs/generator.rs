use crate::content::Section;
use crate::error::GenerationError;
use crate::util::{command_exists, timestamp_compact, truncate_text};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn title(self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

pub trait TextGenerator: Send + Sync {
    fn generate(&self, turns: &[Turn]) -> Result<String, GenerationError>;
}

/// System prompt scoping replies to one detected disease.
pub fn assistant_system_prompt(category: &str) -> String {
    format!(
        "You are a helpful assistant specializing in rice cultivation. The user has detected {category} in their rice plants. \
Provide accurate, helpful information specifically related to rice cultivation, including symptoms, treatment, and prevention methods for this disease. \
Be concise but informative. Format your response in a clear, easy-to-read way. Only respond to prompts related to rice plants."
    )
}

/// One round trip asking for all four sections under exact headers.
pub fn sections_prompt(category: &str) -> Vec<Turn> {
    let mut request = format!(
        "Describe {category} disease in rice plants. Answer in exactly four sections, \
each introduced by a line of the form `### <Header>` using these headers verbatim:\n"
    );
    for section in Section::ALL {
        request.push_str("### ");
        request.push_str(section.header());
        request.push('\n');
    }
    request.push_str("Do not add any other headers.");
    vec![Turn::system(assistant_system_prompt(category)), Turn::user(request)]
}

/// Prompt for a single section, used by scoped retries.
pub fn section_prompt(category: &str, section: Section) -> Vec<Turn> {
    let ask = match section {
        Section::General => format!("Provide general information about {category} disease in rice plants."),
        Section::Symptoms => format!("List the symptoms of {category} disease in rice plants."),
        Section::Treatment => format!("List the treatment methods for {category} disease in rice plants."),
        Section::Prevention => format!("List the prevention methods for {category} disease in rice plants."),
    };
    vec![
        Turn::system(assistant_system_prompt(category)),
        Turn::user(format!("{ask} Reply with the text only, no headers.")),
    ]
}

/// Flatten turns into a plain transcript for single-prompt backends.
pub fn render_transcript(turns: &[Turn]) -> String {
    let mut out = String::new();
    for turn in turns {
        out.push_str(turn.role.title());
        out.push_str(":\n");
        out.push_str(turn.content.trim());
        out.push_str("\n\n");
    }
    out.push_str("Assistant:\n");
    out
}

/// Runs `codex exec` once per request.
#[derive(Debug, Clone)]
pub struct CodexExecGenerator {
    pub bin: String,
    pub model: Option<String>,
    pub timeout: Duration,
    pub work_dir: PathBuf,
}

impl CodexExecGenerator {
    pub fn new(bin: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            model: None,
            timeout: Duration::from_secs(120),
            work_dir: work_dir.into(),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn scratch_path(&self) -> PathBuf {
        let rand = rand::thread_rng().gen_range(1000..9999);
        self.work_dir.join(format!(
            "reply-{}-{}-{rand}.md",
            timestamp_compact(),
            std::process::id()
        ))
    }
}

impl TextGenerator for CodexExecGenerator {
    fn generate(&self, turns: &[Turn]) -> Result<String, GenerationError> {
        fs::create_dir_all(&self.work_dir)?;
        let reply_path = self.scratch_path();

        let mut cmd = Command::new(&self.bin);
        cmd.arg("exec").arg("--output-last-message").arg(&reply_path);
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        cmd.arg("-");
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        log::debug!("spawning {} exec ({} turns)", self.bin, turns.len());
        let mut child = cmd.spawn().map_err(|err| GenerationError::Spawn {
            command: format!("{} exec", self.bin),
            message: err.to_string(),
        })?;

        // Drained concurrently so a chatty child never blocks on a full pipe.
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(render_transcript(turns).as_bytes()) {
                log::warn!("failed to write prompt to {}: {err}", self.bin);
            }
        }

        let timeout = self.timeout.max(Duration::from_secs(10));
        let Some(status) = child.wait_timeout(timeout)? else {
            let _ = child.kill();
            let _ = child.wait();
            let _ = fs::remove_file(&reply_path);
            return Err(GenerationError::Timeout(timeout));
        };

        let stderr = stderr_reader
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        let reply = fs::read_to_string(&reply_path).unwrap_or_default();
        let _ = fs::remove_file(&reply_path);

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(GenerationError::Failed {
                code: status.code().unwrap_or(1),
                stderr_tail: truncate_text(stderr.trim(), 600),
            });
        }
        if reply.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(reply)
    }
}

/// Explicit override first, then `codex` or `codex-auto` on PATH.
pub fn resolve_codex_executable(override_bin: Option<&str>) -> Option<String> {
    if let Some(bin) = override_bin {
        let trimmed = bin.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    ["codex", "codex-auto"]
        .into_iter()
        .find(|name| command_exists(name))
        .map(ToString::to_string)
}
