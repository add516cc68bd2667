//! Expands backlog entries into concrete raw log files.
//!
//! Entries come in three shapes:
//!
//! | Shape          | Example                              |
//! |----------------|--------------------------------------|
//! | device prefix  | `0BFD7754/`                          |
//! | session prefix | `0BFD7754/00000001/`                 |
//! | file           | `0BFD7754/00000001/00000001.MF4`     |
//!
//! A trailing `/` is optional on prefixes and is added during normalization.

use serde::Serialize;
use tracing::{debug, info};

use crate::error::ResolveError;
use crate::storage::ObjectStore;

/// Raw log file extensions picked up when enumerating a session.
pub const LOG_FILE_EXTENSIONS: &[&str] = &[".MF4", ".MFC", ".MFE", ".MFM"];

/// A classified backlog entry. Prefixes always carry their trailing `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BacklogEntry {
    Device { prefix: String },
    Session { prefix: String },
    File { path: String },
}

impl BacklogEntry {
    /// Classifies a raw backlog string by its segment count and trailing segment.
    pub fn parse(raw: &str) -> Result<Self, ResolveError> {
        let unrecognized = || ResolveError::Unrecognized {
            entry: raw.to_string(),
        };

        let (body, trailing) = match raw.strip_suffix('/') {
            Some(body) => (body, true),
            None => (raw, false),
        };
        let segments: Vec<&str> = body.split('/').collect();
        if body.is_empty() || segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
            return Err(unrecognized());
        }

        let last = segments[segments.len() - 1];
        if is_file_name(last) {
            // Files never carry a trailing separator.
            return match (trailing, segments.len()) {
                (false, 3) => Ok(BacklogEntry::File {
                    path: raw.to_string(),
                }),
                _ => Err(unrecognized()),
            };
        }

        let prefix = normalize_prefix(raw);
        match segments.len() {
            1 => Ok(BacklogEntry::Device { prefix }),
            2 => Ok(BacklogEntry::Session { prefix }),
            _ => Err(unrecognized()),
        }
    }
}

/// Appends a trailing `/` to a prefix that lacks one. Idempotent.
pub fn normalize_prefix(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        let normalized = format!("{path}/");
        info!(from = path, to = %normalized, "Adding missing trailing slash to prefix");
        normalized
    }
}

fn is_file_name(segment: &str) -> bool {
    segment.contains('.')
}

/// A concrete raw log file at `<device>/<session>/<file>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResolvedFile {
    pub device_id: String,
    pub session_id: String,
    pub file_name: String,
    pub full_path: String,
}

impl ResolvedFile {
    /// Splits a three-segment key; returns `None` for any other shape.
    pub fn from_key(key: &str) -> Option<Self> {
        let mut parts = key.split('/');
        let (device, session, file) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || [device, session, file].iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(Self {
            device_id: device.to_string(),
            session_id: session.to_string(),
            file_name: file.to_string(),
            full_path: key.to_string(),
        })
    }

    /// `<device>/<session>/`, the grouping key used by the scheduler.
    pub fn session_prefix(&self) -> String {
        format!("{}/{}/", self.device_id, self.session_id)
    }
}

/// Turns backlog entries into files by listing the input store.
pub struct PathResolver<'a> {
    store: &'a dyn ObjectStore,
    extensions: Vec<String>,
}

impl<'a> PathResolver<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self {
            store,
            extensions: LOG_FILE_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// Replaces the extensions accepted during session enumeration.
    pub fn with_extensions(mut self, extensions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.into().to_ascii_uppercase())
            .collect();
        self
    }

    fn has_valid_extension(&self, name: &str) -> bool {
        let upper = name.to_ascii_uppercase();
        self.extensions.iter().any(|ext| upper.ends_with(ext.as_str()))
    }

    /// Resolves every entry in order. All entries are classified before the
    /// first listing, so a malformed entry fails the run without any I/O.
    ///
    /// The result may contain duplicates; see [`super::dedup`].
    pub async fn resolve(&self, entries: &[String]) -> Result<Vec<ResolvedFile>, ResolveError> {
        let parsed = entries
            .iter()
            .map(|raw| BacklogEntry::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let mut files = Vec::new();
        for entry in parsed {
            match entry {
                BacklogEntry::Device { prefix } => {
                    let sessions = self.list_sessions(&prefix).await?;
                    info!(device = %prefix, sessions = sessions.len(), "Expanding device prefix");
                    for session in sessions {
                        files.extend(self.list_session_files(&session).await?);
                    }
                }
                BacklogEntry::Session { prefix } => {
                    files.extend(self.list_session_files(&prefix).await?);
                }
                BacklogEntry::File { path } => {
                    // `parse` guarantees exactly three segments.
                    if let Some(file) = ResolvedFile::from_key(&path) {
                        files.push(file);
                    }
                }
            }
        }

        Ok(files)
    }

    /// Session prefixes below a device prefix, sorted.
    async fn list_sessions(&self, device_prefix: &str) -> Result<Vec<String>, ResolveError> {
        debug!(prefix = device_prefix, "Listing sessions");
        let sessions = self
            .store
            .list_dirs(device_prefix)
            .await
            .map_err(|source| ResolveError::Listing {
                prefix: device_prefix.to_string(),
                source,
            })?;
        Ok(sessions
            .into_iter()
            .map(|session| format!("{device_prefix}{session}/"))
            .collect())
    }

    /// Log files directly inside a session prefix, sorted.
    async fn list_session_files(&self, session_prefix: &str) -> Result<Vec<ResolvedFile>, ResolveError> {
        let keys = self.list(session_prefix).await?;
        let mut files: Vec<ResolvedFile> = keys
            .iter()
            .filter(|key| self.has_valid_extension(key))
            .filter_map(|key| ResolvedFile::from_key(key))
            .collect();
        files.sort_by(|a, b| a.full_path.cmp(&b.full_path));

        info!(session = session_prefix, files = files.len(), "Found log files in session");
        Ok(files)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ResolveError> {
        debug!(prefix, "Listing input store");
        self.store
            .list(prefix)
            .await
            .map_err(|source| ResolveError::Listing {
                prefix: prefix.to_string(),
                source,
            })
    }
}
