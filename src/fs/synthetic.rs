//! Synthetic files: fixed-content metadata files and the cached editable
//! documents that proxy a server resource as plain text.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;

use crate::api::{Api, AssignmentUpdate};
use crate::fs::error::FsError;
use crate::fs::rubric;

/// How long a cached synthetic file serves reads without refetching.
pub const CACHE_TTL: Duration = Duration::from_secs(60);

/// Writing exactly this (modulo surrounding whitespace) and flushing
/// throws away the local edit and refetches from the server.
pub const RESET_SENTINEL: &[u8] = b"__RESET__";

/// A failed parse of an edited synthetic document. Reaches the user as
/// `EPERM`; the message goes to the log.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ParseError(pub String);

impl ParseError {
    pub fn new(message: impl Into<String>) -> ParseError {
        ParseError(message.into())
    }
}

/// Overwrites `buf` at `offset` with `data`, NUL-padding up to `offset`
/// first when it lies past the end. The old tail survives only where it
/// extends beyond the written range.
pub fn splice_into(buf: &mut Vec<u8>, offset: usize, data: &[u8]) {
    if offset > buf.len() {
        buf.resize(offset, 0);
    }
    let end = offset + data.len();
    if buf.len() > end {
        buf[offset..end].copy_from_slice(data);
    } else {
        buf.truncate(offset);
        buf.extend_from_slice(data);
    }
}

/// Shortens or NUL-extends `buf` to exactly `length` bytes.
pub fn resize_bytes(buf: &mut Vec<u8>, length: usize) {
    buf.resize(length, 0);
}

#[derive(Debug)]
pub enum SyntheticFile {
    /// Immutable content computed at node creation (`.cg-mode`,
    /// `.api.socket`, the id files, the rubric help text).
    Static(Vec<u8>),
    Cached(CachedFile),
}

impl SyntheticFile {
    pub fn fixed(data: impl Into<Vec<u8>>) -> SyntheticFile {
        SyntheticFile::Static(data.into())
    }

    pub fn writable(&self) -> bool {
        matches!(self, SyntheticFile::Cached(_))
    }
}

/// The server resource a cached synthetic file exposes, plus whatever
/// per-kind bookkeeping its serialiser needs.
#[derive(Debug)]
pub enum CachedResource {
    Grade {
        submission_id: i64,
        /// Last grade seen from the server, rounded; a flush that rounds
        /// to the same value skips the request.
        grade: Option<f64>,
    },
    Feedback {
        submission_id: i64,
    },
    Settings {
        assignment_id: i64,
    },
    RubricSelect {
        submission_id: i64,
        student: String,
        /// 0-based line index of each rendered item → rubric item id.
        lookup: HashMap<usize, i64>,
    },
    RubricEdit {
        assignment_id: i64,
        append_only: bool,
        /// id hash → server id, rebuilt on every serialisation.
        lookup: HashMap<String, i64>,
    },
}

#[derive(Debug)]
pub struct CachedFile {
    pub resource: CachedResource,
    data: Vec<u8>,
    has_data: bool,
    fetched_at: Option<Instant>,
    mtime: SystemTime,
    pub overwrite: bool,
}

impl CachedFile {
    pub fn new(resource: CachedResource) -> CachedFile {
        CachedFile {
            resource,
            data: Vec::new(),
            has_data: false,
            fetched_at: None,
            mtime: SystemTime::now(),
            overwrite: false,
        }
    }

    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }

    fn fresh(&self) -> bool {
        self.has_data
            && self
                .fetched_at
                .is_some_and(|fetched| fetched.elapsed() < CACHE_TTL)
    }

    /// The bytes a read sees: an in-progress edit, a fresh enough cache,
    /// or a newly serialised server fetch.
    pub fn bytes(&mut self, api: &mut Api) -> Result<&[u8], FsError> {
        if !self.fresh() && !self.overwrite {
            self.refetch(api)?;
        }
        Ok(&self.data)
    }

    fn refetch(&mut self, api: &mut Api) -> Result<(), FsError> {
        let fresh = self.fetch(api)?;
        if fresh != self.data {
            // Editors watch mtime to notice out-of-band changes.
            self.mtime = SystemTime::now() + Duration::from_secs(1);
        }
        self.data = fresh;
        self.has_data = true;
        self.fetched_at = Some(Instant::now());
        Ok(())
    }

    pub fn write(&mut self, api: &mut Api, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        if !self.has_data {
            self.refetch(api)?;
        }
        self.overwrite = true;
        splice_into(&mut self.data, offset as usize, data);
        Ok(data.len() as u32)
    }

    pub fn truncate(&mut self, api: &mut Api, length: u64) -> Result<(), FsError> {
        self.bytes(api)?;
        resize_bytes(&mut self.data, length as usize);
        self.overwrite = true;
        Ok(())
    }

    /// Parses the edited document and pushes it to the server. No-op
    /// without an outstanding edit; `__RESET__` discards the edit.
    pub fn flush(&mut self, api: &mut Api) -> Result<(), FsError> {
        if !self.overwrite {
            return Ok(());
        }

        if trim_ascii(&self.data) == RESET_SENTINEL {
            self.overwrite = false;
            self.has_data = false;
            self.refetch(api)?;
            return Ok(());
        }

        match self.send(api) {
            Ok(()) => {}
            Err(FsError::Api(err)) => {
                // Server rejected the document for a reason we cannot map
                // onto an errno; the edit stays local.
                log::error!("error from server: {} ({})", err.message, err.description);
                return Err(FsError::PermissionDenied);
            }
            Err(err) => return Err(err),
        }

        self.overwrite = false;
        self.has_data = false;
        self.refetch(api)?;
        Ok(())
    }

    fn fetch(&mut self, api: &mut Api) -> Result<Vec<u8>, FsError> {
        match &mut self.resource {
            CachedResource::Grade {
                submission_id,
                grade,
            } => {
                let submission = api.backend().submission(*submission_id)?;
                match submission.grade {
                    None => Ok(Vec::new()),
                    Some(value) => {
                        let rounded = round2(value);
                        *grade = Some(rounded);
                        Ok(format!("{}\n", format_decimal(rounded)).into_bytes())
                    }
                }
            }
            CachedResource::Feedback { submission_id } => Ok(api
                .backend()
                .submission(*submission_id)?
                .comment
                .unwrap_or_default()
                .into_bytes()),
            CachedResource::Settings { assignment_id } => {
                let assignment = api.backend().assignment(*assignment_id)?;
                Ok(render_settings(
                    &assignment.name,
                    &assignment.state,
                    &assignment.deadline,
                ))
            }
            CachedResource::RubricSelect {
                submission_id,
                student,
                lookup,
            } => rubric::render_selection(api, *submission_id, student, lookup),
            CachedResource::RubricEdit {
                assignment_id,
                lookup,
                ..
            } => rubric::render_editor(api, *assignment_id, lookup),
        }
    }

    fn send(&mut self, api: &mut Api) -> Result<(), FsError> {
        match &mut self.resource {
            CachedResource::Grade {
                submission_id,
                grade,
            } => {
                let parsed = parse_grade(&self.data).map_err(reject)?;
                match parsed {
                    None => api.backend().set_grade(*submission_id, None)?,
                    Some(value) => {
                        if Some(round2(value)) == *grade {
                            return Ok(());
                        }
                        if !(0.0..=10.0).contains(&value) {
                            return Err(FsError::PermissionDenied);
                        }
                        api.backend().set_grade(*submission_id, Some(value))?;
                    }
                }
                Ok(())
            }
            CachedResource::Feedback { submission_id } => {
                let text = std::str::from_utf8(&self.data)
                    .map_err(|_| ParseError::new("feedback is not valid UTF-8"))
                    .map_err(reject)?;
                api.backend().set_feedback(*submission_id, text)?;
                Ok(())
            }
            CachedResource::Settings { assignment_id } => {
                let settings = parse_settings(&self.data).map_err(reject)?;
                api.backend().set_assignment(*assignment_id, &settings)?;
                Ok(())
            }
            CachedResource::RubricSelect {
                submission_id,
                lookup,
                ..
            } => {
                let selected = rubric::parse_selection(&self.data, lookup).map_err(reject)?;
                api.backend().select_rubric_items(*submission_id, &selected)?;
                Ok(())
            }
            CachedResource::RubricEdit {
                assignment_id,
                append_only,
                lookup,
            } => rubric::save_editor(api, *assignment_id, &self.data, *append_only, lookup),
        }
    }
}

/// Logs a parse failure and turns it into the errno the user sees.
fn reject(err: ParseError) -> FsError {
    log::warn!("rejecting edited synthetic file: {}", err);
    FsError::PermissionDenied
}

fn trim_ascii(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &data[start..end]
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Renders a grade the way the platform shows it: two decimals at most,
/// integral grades keeping one.
pub fn format_decimal(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// `None` means "delete the grade".
fn parse_grade(data: &[u8]) -> Result<Option<f64>, ParseError> {
    let text = std::str::from_utf8(data)
        .map_err(|_| ParseError::new("grade file is not valid UTF-8"))?;
    if text.trim().is_empty() {
        return Ok(None);
    }

    let lines: Vec<&str> = text.split('\n').filter(|l| !l.is_empty()).collect();
    if lines.len() != 1 {
        return Err(ParseError::new("expected a single line with one number"));
    }
    lines[0]
        .trim()
        .parse::<f64>()
        .map(Some)
        .map_err(|_| ParseError::new(format!("invalid grade: {:?}", lines[0])))
}

const SETTINGS_KEYS: [&str; 3] = ["deadline", "name", "state"];

fn render_settings(name: &str, state: &str, deadline: &str) -> Vec<u8> {
    let state = match state {
        "grading" | "submitting" => "open",
        other => other,
    };
    let mut lines = vec![
        format!("deadline = {}", deadline),
        format!("name = {}", name),
        format!("state = {}", state),
    ];
    lines.sort();
    lines.push(String::new());
    lines.join("\n").into_bytes()
}

fn parse_settings(data: &[u8]) -> Result<AssignmentUpdate, ParseError> {
    let text = std::str::from_utf8(data)
        .map_err(|_| ParseError::new("settings file is not valid UTF-8"))?;

    let mut values: HashMap<&str, String> = HashMap::new();
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| ParseError::new(format!("missing '=' in line {:?}", line)))?;
        let key = key.trim();
        let key = SETTINGS_KEYS
            .iter()
            .copied()
            .find(|k| *k == key)
            .ok_or_else(|| ParseError::new(format!("unknown setting {:?}", key)))?;
        if values.insert(key, value.trim().to_owned()).is_some() {
            return Err(ParseError::new(format!("duplicate setting {:?}", key)));
        }
    }

    if values.len() != SETTINGS_KEYS.len() {
        return Err(ParseError::new("missing settings keys"));
    }

    Ok(AssignmentUpdate {
        name: values.remove("name").expect("checked above"),
        state: values.remove("state").expect("checked above"),
        deadline: values.remove("deadline").expect("checked above"),
    })
}
