//! Typed client for the review platform's HTTP+JSON API.
//!
//! The engine talks to [`Api`], which forwards to a swappable
//! [`ApiBackend`]. `HttpBackend` is the real thing; `InMemoryBackend`
//! holds a mutable model of the server and is what the test suite mounts
//! against.

mod http;
mod in_memory;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpBackend;
pub use in_memory::{InMemoryBackend, RemoteState, SharedRemoteState};

pub const DEFAULT_BASE_URL: &str = "https://codegra.de/api/v1";

/// Error codes the server attaches to failed requests. Only a couple are
/// meaningful to the filesystem; the rest are carried through for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    IncorrectPermission,
    NotLoggedIn,
    ObjectIdNotFound,
    ObjectWrongType,
    MissingRequiredParam,
    InvalidParam,
    RequestTooLarge,
    LoginFailure,
    InactiveUser,
    InvalidUrl,
    ObjectNotFound,
    BlockedAssignment,
    InvalidCredentials,
    InvalidState,
    InvalidOauthRequest,
    DisabledFeature,
    #[serde(other)]
    Unknown,
}

/// Structured error decoded from any response with status >= 400.
#[derive(Debug, Error)]
#[error("{message} - {description} [{code:?}]")]
pub struct ApiError {
    pub status: u16,
    pub code: ApiErrorCode,
    pub message: String,
    pub description: String,
}

impl ApiError {
    /// A transport-level failure (timeout, connection refused) that never
    /// produced a server error document.
    pub fn transport(message: impl Into<String>) -> Self {
        ApiError {
            status: 0,
            code: ApiErrorCode::Unknown,
            message: message.into(),
            description: String::new(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Course {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Assignment {
    pub id: i64,
    pub name: String,
    pub state: String,
    pub deadline: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Submission {
    pub id: i64,
    pub user: User,
    pub created_at: String,
    #[serde(default)]
    pub assignee: Option<User>,
    #[serde(default)]
    pub grade: Option<f64>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// One entry of a submission's file tree. Directories carry `entries`,
/// leaves do not.
#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub entries: Option<Vec<FileEntry>>,
}

/// Metadata for a single server file, as returned by the files endpoint
/// and by create/rename/write operations.
#[derive(Debug, Clone, Deserialize)]
pub struct FileMeta {
    pub id: i64,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modification_date: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RubricItem {
    pub id: i64,
    pub header: String,
    pub description: String,
    pub points: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RubricRow {
    pub id: i64,
    pub header: String,
    pub description: String,
    pub items: Vec<RubricItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectedItem {
    pub id: i64,
}

/// A submission's rubric together with the currently selected items.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmissionRubric {
    pub rubrics: Vec<RubricRow>,
    pub selected: Vec<SelectedItem>,
}

/// Replacement rubric sent with a PUT. Rows and items without an id are
/// created server-side; rows and items with one are updated in place.
#[derive(Debug, Clone, Serialize)]
pub struct RubricRowUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub header: String,
    pub description: String,
    pub items: Vec<RubricItemUpdate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RubricItemUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub header: String,
    pub description: String,
    pub points: f64,
}

/// Assignment settings accepted by the PATCH endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AssignmentUpdate {
    pub name: String,
    pub state: String,
    pub deadline: String,
}

/// Inline comments of one file, keyed by 0-based line number (as a string,
/// which is how the server serialises map keys).
pub type FileComments = serde_json::Map<String, serde_json::Value>;

/// The remote API surface the engine needs. Implementations must not
/// retry internally; the engine decides what a failure means.
pub trait ApiBackend: Send {
    /// The signed-in user, known from login time.
    fn user(&self) -> &User;

    fn courses(&mut self) -> ApiResult<Vec<Course>>;
    fn submissions(&mut self, assignment_id: i64) -> ApiResult<Vec<Submission>>;
    fn submission_files(&mut self, submission_id: i64) -> ApiResult<FileEntry>;

    fn file_meta(&mut self, submission_id: i64, path: &str) -> ApiResult<FileMeta>;
    fn create_file(&mut self, submission_id: i64, path: &str, data: &[u8]) -> ApiResult<FileMeta>;
    fn rename_file(&mut self, file_id: i64, new_path: &str) -> ApiResult<FileMeta>;
    fn read_file(&mut self, file_id: i64) -> ApiResult<Vec<u8>>;
    fn write_file(&mut self, file_id: i64, data: &[u8]) -> ApiResult<FileMeta>;
    fn delete_file(&mut self, file_id: i64) -> ApiResult<()>;

    fn assignment(&mut self, assignment_id: i64) -> ApiResult<Assignment>;
    fn set_assignment(&mut self, assignment_id: i64, settings: &AssignmentUpdate) -> ApiResult<()>;

    fn assignment_rubric(&mut self, assignment_id: i64) -> ApiResult<Vec<RubricRow>>;
    fn set_assignment_rubric(
        &mut self,
        assignment_id: i64,
        rows: &[RubricRowUpdate],
    ) -> ApiResult<()>;
    fn submission_rubric(&mut self, submission_id: i64) -> ApiResult<SubmissionRubric>;
    fn select_rubric_items(&mut self, submission_id: i64, items: &[i64]) -> ApiResult<()>;

    fn submission(&mut self, submission_id: i64) -> ApiResult<Submission>;
    fn set_grade(&mut self, submission_id: i64, grade: Option<f64>) -> ApiResult<()>;
    fn set_feedback(&mut self, submission_id: i64, feedback: &str) -> ApiResult<()>;

    fn file_comments(&mut self, file_id: i64) -> ApiResult<FileComments>;
    fn add_comment(&mut self, file_id: i64, line: u64, message: &str) -> ApiResult<()>;
    fn delete_comment(&mut self, file_id: i64, line: u64) -> ApiResult<()>;
}

/// Owner of the backend. The engine holds exactly one of these; it is
/// constructed once at login and injected, never reached through globals.
pub struct Api {
    backend: Box<dyn ApiBackend>,
}

impl Api {
    pub fn new<B: ApiBackend + 'static>(backend: B) -> Self {
        Api {
            backend: Box::new(backend),
        }
    }

    pub fn backend(&mut self) -> &mut dyn ApiBackend {
        self.backend.as_mut()
    }

    pub fn user(&self) -> &User {
        self.backend.user()
    }
}

impl std::fmt::Debug for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Api").finish_non_exhaustive()
    }
}
