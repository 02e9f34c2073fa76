//! Parsers for this crate's two external configuration formats: a
//! mount's `config.toml` and the daemon-wide `config.json` client
//! directory map. Grounded on `tvix-store`'s binaries, which
//! parse their own TOML/JSON config with `serde`/`toml`/`serde_json`
//! rather than a hand-rolled reader.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{EdenError, Result};

/// One mount's `config.toml`: which repository backs it, and any bind
/// mounts layered over the checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    pub repository: RepositoryConfig,
    #[serde(default, rename = "bind-mounts")]
    pub bind_mounts: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub kind: RepositoryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryKind {
    Git,
    Hg,
}

impl MountConfig {
    /// Parses a mount's `config.toml`. Unknown top-level keys are
    /// ignored; an unrecognized `type` value is a hard parse error
    /// rather than being silently ignored, since the repository backend
    /// it names is not optional.
    pub fn parse_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| EdenError::Io(format!("invalid config.toml: {e}")))
    }
}

/// The daemon-wide `config.json`: every mount's client directory,
/// keyed by its checkout path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientDirectoryMap {
    pub mounts: BTreeMap<PathBuf, PathBuf>,
}

impl ClientDirectoryMap {
    /// Parses `config.json`, tolerating `//`-style line comments and
    /// trailing commas before object/array closers. No JSON5 crate sits
    /// anywhere in this dependency lineage, so the tolerant pass is a
    /// small hand-rolled preprocessing step feeding plain `serde_json`,
    /// rather than pulling in a second JSON parser for one format.
    pub fn parse_json(text: &str) -> Result<Self> {
        let cleaned = strip_comments_and_trailing_commas(text);
        let raw: BTreeMap<String, String> = serde_json::from_str(&cleaned)
            .map_err(|e| EdenError::Io(format!("invalid config.json: {e}")))?;
        Ok(Self {
            mounts: raw
                .into_iter()
                .map(|(k, v)| (PathBuf::from(k), PathBuf::from(v)))
                .collect(),
        })
    }
}

/// Strips `//` line comments (outside of string literals) and removes a
/// trailing comma immediately before a `}` or `]`.
fn strip_comments_and_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            _ => out.push(c),
        }
    }

    let mut result = String::with_capacity(out.len());
    let mut iter = out.chars().peekable();
    while let Some(c) = iter.next() {
        if c == ',' {
            let mut lookahead = iter.clone();
            let mut saw_closer = false;
            while let Some(&next) = lookahead.peek() {
                if next.is_whitespace() {
                    lookahead.next();
                    continue;
                }
                saw_closer = next == '}' || next == ']';
                break;
            }
            if saw_closer {
                continue;
            }
        }
        result.push(c);
    }
    result
}

/// The privileged mount helper's wire protocol. Only the message
/// shapes are modeled here: the helper process and its socket
/// transport are out of scope, but the `Channel` needs a typed contract
/// for what it would send across one.
pub mod privhelper {
    use std::os::fd::RawFd;
    use std::path::PathBuf;

    /// One request to the privileged helper, tagged with a
    /// monotonically increasing transaction id.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Request {
        pub transaction_id: u64,
        pub body: RequestBody,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RequestBody {
        Mount { path: PathBuf },
        Unmount { path: PathBuf },
        BindMount { src: PathBuf, dst: PathBuf },
        TakeoverShutdown { path: PathBuf },
        TakeoverStartup { path: PathBuf, bind_mounts: Vec<PathBuf> },
        SetLogFile { fd: RawFd },
        SetDaemonTimeout { nanos: u64 },
        SetUseEdenfs { enabled: bool },
    }

    /// The helper's reply to one request, matched by `transaction_id`.
    /// `Mount` is the only request that returns a file descriptor (the
    /// opened kernel device).
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Response {
        pub transaction_id: u64,
        pub result: Result<Option<RawFd>, String>,
    }
}
