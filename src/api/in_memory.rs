//! An API backend holding a mutable model of the server, used by the test
//! suite to mount an engine without any network.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use super::{
    ApiBackend, ApiError, ApiErrorCode, ApiResult, Assignment, AssignmentUpdate, Course,
    FileComments, FileEntry, FileMeta, RubricItem, RubricRow, RubricRowUpdate, SelectedItem,
    Submission, SubmissionRubric, User,
};

/// Handle to the model, shared between the backend given to the engine and
/// the test that wants to assert on server-side state afterwards.
pub type SharedRemoteState = Arc<Mutex<RemoteState>>;

fn not_found() -> ApiError {
    ApiError {
        status: 404,
        code: ApiErrorCode::ObjectIdNotFound,
        message: "not found".into(),
        description: "the requested object does not exist".into(),
    }
}

/// Everything the fake server remembers.
pub struct RemoteState {
    pub user: User,
    pub courses: Vec<Course>,
    pub assignments: HashMap<i64, Assignment>,
    pub submissions: HashMap<i64, Vec<Submission>>,
    submission_assignment: HashMap<i64, i64>,
    pub file_trees: HashMap<i64, FileEntry>,
    pub file_contents: HashMap<i64, Vec<u8>>,
    pub rubrics: HashMap<i64, Vec<RubricRow>>,
    pub selections: HashMap<i64, Vec<i64>>,
    pub comments: HashMap<i64, BTreeMap<u64, String>>,
    /// When set, the next mutating call fails with this error instead.
    pub fail_next: Option<ApiError>,
    next_id: i64,
}

impl RemoteState {
    pub fn new(user_name: &str) -> RemoteState {
        RemoteState {
            user: User {
                id: 1,
                name: user_name.to_owned(),
            },
            courses: Vec::new(),
            assignments: HashMap::new(),
            submissions: HashMap::new(),
            submission_assignment: HashMap::new(),
            file_trees: HashMap::new(),
            file_contents: HashMap::new(),
            rubrics: HashMap::new(),
            selections: HashMap::new(),
            comments: HashMap::new(),
            fail_next: None,
            next_id: 100,
        }
    }

    pub fn fresh_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn add_course(&mut self, name: &str) -> i64 {
        let id = self.fresh_id();
        self.courses.push(Course {
            id,
            name: name.to_owned(),
            assignments: Vec::new(),
        });
        id
    }

    pub fn add_assignment(
        &mut self,
        course_id: i64,
        name: &str,
        state: &str,
        deadline: &str,
    ) -> i64 {
        let id = self.fresh_id();
        let assignment = Assignment {
            id,
            name: name.to_owned(),
            state: state.to_owned(),
            deadline: deadline.to_owned(),
        };
        self.assignments.insert(id, assignment.clone());
        let course = self
            .courses
            .iter_mut()
            .find(|c| c.id == course_id)
            .expect("unknown course");
        course.assignments.push(assignment);
        self.rubrics.entry(id).or_default();
        id
    }

    pub fn add_submission(
        &mut self,
        assignment_id: i64,
        user: (i64, &str),
        created_at: &str,
        tld: &str,
    ) -> i64 {
        let id = self.fresh_id();
        let root_id = self.fresh_id();
        self.submissions
            .entry(assignment_id)
            .or_default()
            .push(Submission {
                id,
                user: User {
                    id: user.0,
                    name: user.1.to_owned(),
                },
                created_at: created_at.to_owned(),
                assignee: None,
                grade: None,
                comment: None,
            });
        self.submission_assignment.insert(id, assignment_id);
        self.file_trees.insert(
            id,
            FileEntry {
                id: root_id,
                name: tld.to_owned(),
                entries: Some(Vec::new()),
            },
        );
        self.selections.entry(id).or_default();
        id
    }

    pub fn assign_submission(&mut self, submission_id: i64, assignee: (i64, &str)) {
        for subs in self.submissions.values_mut() {
            for sub in subs.iter_mut() {
                if sub.id == submission_id {
                    sub.assignee = Some(User {
                        id: assignee.0,
                        name: assignee.1.to_owned(),
                    });
                }
            }
        }
    }

    /// Inserts a file (or directory when `contents` is `None`) below the
    /// submission's top-level directory, creating parents as needed.
    /// `path` is relative to the TLD.
    pub fn add_file(&mut self, submission_id: i64, path: &str, contents: &[u8]) -> i64 {
        let id = self.insert_path(submission_id, path, false);
        self.file_contents.insert(id, contents.to_vec());
        id
    }

    pub fn add_directory(&mut self, submission_id: i64, path: &str) -> i64 {
        self.insert_path(submission_id, path, true)
    }

    fn insert_path(&mut self, submission_id: i64, path: &str, is_dir: bool) -> i64 {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let mut ids = Vec::new();
        for _ in 0..components.len() {
            ids.push(self.fresh_id());
        }

        let root = self
            .file_trees
            .get_mut(&submission_id)
            .expect("unknown submission");
        if components.is_empty() {
            return root.id;
        }
        let mut current = root;
        let last = components.len() - 1;
        for (depth, part) in components.iter().enumerate() {
            let entries = current.entries.as_mut().expect("file in directory position");
            let position = entries.iter().position(|e| e.name == *part);
            let index = match position {
                Some(index) => index,
                None => {
                    entries.push(FileEntry {
                        id: ids[depth],
                        name: (*part).to_owned(),
                        entries: if depth < last || is_dir {
                            Some(Vec::new())
                        } else {
                            None
                        },
                    });
                    entries.len() - 1
                }
            };
            current = &mut entries[index];
        }
        current.id
    }

    pub fn add_rubric_row(&mut self, assignment_id: i64, header: &str, description: &str) -> i64 {
        let id = self.fresh_id();
        self.rubrics
            .entry(assignment_id)
            .or_default()
            .push(RubricRow {
                id,
                header: header.to_owned(),
                description: description.to_owned(),
                items: Vec::new(),
            });
        id
    }

    pub fn add_rubric_item(
        &mut self,
        assignment_id: i64,
        row_id: i64,
        header: &str,
        description: &str,
        points: f64,
    ) -> i64 {
        let id = self.fresh_id();
        let row = self
            .rubrics
            .get_mut(&assignment_id)
            .and_then(|rows| rows.iter_mut().find(|r| r.id == row_id))
            .expect("unknown rubric row");
        row.items.push(RubricItem {
            id,
            header: header.to_owned(),
            description: description.to_owned(),
            points,
        });
        id
    }

    pub fn submission_mut(&mut self, submission_id: i64) -> Option<&mut Submission> {
        self.submissions
            .values_mut()
            .flatten()
            .find(|s| s.id == submission_id)
    }

    fn take_fault(&mut self) -> ApiResult<()> {
        match self.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn find_entry<'a>(entry: &'a FileEntry, components: &[&str]) -> Option<&'a FileEntry> {
        match components.split_first() {
            None => Some(entry),
            Some((head, rest)) => entry
                .entries
                .as_ref()?
                .iter()
                .find(|e| e.name == *head)
                .and_then(|e| Self::find_entry(e, rest)),
        }
    }

    fn remove_entry(entry: &mut FileEntry, id: i64) -> Option<FileEntry> {
        let entries = entry.entries.as_mut()?;
        if let Some(index) = entries.iter().position(|e| e.id == id) {
            return Some(entries.remove(index));
        }
        for child in entries.iter_mut() {
            if let Some(found) = Self::remove_entry(child, id) {
                return Some(found);
            }
        }
        None
    }

    fn entry_size(&self, entry: &FileEntry) -> u64 {
        self.file_contents
            .get(&entry.id)
            .map(|c| c.len() as u64)
            .unwrap_or(0)
    }

    /// Resolves a full server path (TLD included, trailing slash on
    /// directories) within one submission's tree.
    fn lookup_path(&self, submission_id: i64, path: &str) -> Option<&FileEntry> {
        let root = self.file_trees.get(&submission_id)?;
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let (tld, rest) = components.split_first()?;
        if root.name != *tld {
            return None;
        }
        Self::find_entry(root, rest)
    }
}

pub struct InMemoryBackend {
    state: SharedRemoteState,
    user: User,
}

impl InMemoryBackend {
    pub fn new(state: RemoteState) -> InMemoryBackend {
        let user = state.user.clone();
        InMemoryBackend {
            state: Arc::new(Mutex::new(state)),
            user,
        }
    }

    /// A second backend over the same model, e.g. to mount the same
    /// "server" twice.
    pub fn from_shared(state: &SharedRemoteState) -> InMemoryBackend {
        let user = state.lock().unwrap().user.clone();
        InMemoryBackend {
            state: Arc::clone(state),
            user,
        }
    }

    pub fn state(&self) -> SharedRemoteState {
        Arc::clone(&self.state)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }
}

impl ApiBackend for InMemoryBackend {
    fn user(&self) -> &User {
        &self.user
    }

    fn courses(&mut self) -> ApiResult<Vec<Course>> {
        Ok(self.lock().courses.clone())
    }

    fn submissions(&mut self, assignment_id: i64) -> ApiResult<Vec<Submission>> {
        Ok(self
            .lock()
            .submissions
            .get(&assignment_id)
            .cloned()
            .unwrap_or_default())
    }

    fn submission_files(&mut self, submission_id: i64) -> ApiResult<FileEntry> {
        self.lock()
            .file_trees
            .get(&submission_id)
            .cloned()
            .ok_or_else(not_found)
    }

    fn file_meta(&mut self, submission_id: i64, path: &str) -> ApiResult<FileMeta> {
        let state = self.lock();
        let entry = state
            .lookup_path(submission_id, path)
            .ok_or_else(not_found)?;
        Ok(FileMeta {
            id: entry.id,
            size: Some(state.entry_size(entry)),
            modification_date: Some(1_600_000_000.0),
        })
    }

    fn create_file(&mut self, submission_id: i64, path: &str, data: &[u8]) -> ApiResult<FileMeta> {
        let mut state = self.lock();
        state.take_fault()?;
        let is_dir = path.ends_with('/');
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let relative = components[1..].join("/");
        if state.lookup_path(submission_id, path).is_some() {
            return Err(ApiError {
                status: 400,
                code: ApiErrorCode::InvalidParam,
                message: "file exists".into(),
                description: String::new(),
            });
        }
        let id = state.insert_path(submission_id, &relative, is_dir);
        if !is_dir {
            state.file_contents.insert(id, data.to_vec());
        }
        Ok(FileMeta {
            id,
            size: Some(data.len() as u64),
            modification_date: Some(1_600_000_000.0),
        })
    }

    fn rename_file(&mut self, file_id: i64, new_path: &str) -> ApiResult<FileMeta> {
        let mut state = self.lock();
        state.take_fault()?;

        let submission_id = *state
            .file_trees
            .iter()
            .find(|(_, root)| {
                Self::contains(root, file_id)
            })
            .map(|(id, _)| id)
            .ok_or_else(not_found)?;

        let root = state.file_trees.get_mut(&submission_id).unwrap();
        let mut removed = RemoteState::remove_entry(root, file_id).ok_or_else(not_found)?;

        let components: Vec<&str> = new_path.split('/').filter(|c| !c.is_empty()).collect();
        let (_, rest) = components.split_first().ok_or_else(not_found)?;
        let (name, parents) = rest.split_last().ok_or_else(not_found)?;
        removed.name = (*name).to_owned();

        // Renames keep content but re-identify the entry, like the real
        // server does.
        let new_id = state.fresh_id();
        if let Some(contents) = state.file_contents.remove(&removed.id) {
            state.file_contents.insert(new_id, contents);
        }
        let old_id = removed.id;
        let mut renamed = removed;
        renamed.id = new_id;

        let parent_path = parents.join("/");
        let root = state.file_trees.get_mut(&submission_id).unwrap();
        let parent = if parent_path.is_empty() {
            root
        } else {
            Self::find_entry_mut(root, &parent_path).ok_or_else(not_found)?
        };
        parent
            .entries
            .as_mut()
            .ok_or_else(not_found)?
            .push(renamed);

        if let Some(comments) = state.comments.remove(&old_id) {
            state.comments.insert(new_id, comments);
        }

        Ok(FileMeta {
            id: new_id,
            size: None,
            modification_date: None,
        })
    }

    fn read_file(&mut self, file_id: i64) -> ApiResult<Vec<u8>> {
        self.lock()
            .file_contents
            .get(&file_id)
            .cloned()
            .ok_or_else(not_found)
    }

    fn write_file(&mut self, file_id: i64, data: &[u8]) -> ApiResult<FileMeta> {
        let mut state = self.lock();
        state.take_fault()?;
        if !state.file_contents.contains_key(&file_id) {
            return Err(not_found());
        }
        state.file_contents.insert(file_id, data.to_vec());
        Ok(FileMeta {
            id: file_id,
            size: Some(data.len() as u64),
            modification_date: Some(1_600_000_000.0),
        })
    }

    fn delete_file(&mut self, file_id: i64) -> ApiResult<()> {
        let mut state = self.lock();
        state.take_fault()?;
        let submission_id = *state
            .file_trees
            .iter()
            .find(|(_, root)| Self::contains(root, file_id))
            .map(|(id, _)| id)
            .ok_or_else(not_found)?;
        let root = state.file_trees.get_mut(&submission_id).unwrap();
        RemoteState::remove_entry(root, file_id).ok_or_else(not_found)?;
        state.file_contents.remove(&file_id);
        Ok(())
    }

    fn assignment(&mut self, assignment_id: i64) -> ApiResult<Assignment> {
        self.lock()
            .assignments
            .get(&assignment_id)
            .cloned()
            .ok_or_else(not_found)
    }

    fn set_assignment(&mut self, assignment_id: i64, settings: &AssignmentUpdate) -> ApiResult<()> {
        let mut state = self.lock();
        state.take_fault()?;
        let assignment = state
            .assignments
            .get_mut(&assignment_id)
            .ok_or_else(not_found)?;
        assignment.name = settings.name.clone();
        // `open` is how the server presents grading/submitting states;
        // writing it back keeps the stored state, like the real server.
        if settings.state != "open" || !matches!(assignment.state.as_str(), "grading" | "submitting")
        {
            assignment.state = settings.state.clone();
        }
        assignment.deadline = settings.deadline.clone();
        Ok(())
    }

    fn assignment_rubric(&mut self, assignment_id: i64) -> ApiResult<Vec<RubricRow>> {
        Ok(self
            .lock()
            .rubrics
            .get(&assignment_id)
            .cloned()
            .unwrap_or_default())
    }

    fn set_assignment_rubric(
        &mut self,
        assignment_id: i64,
        rows: &[RubricRowUpdate],
    ) -> ApiResult<()> {
        let mut state = self.lock();
        state.take_fault()?;
        let mut stored = Vec::with_capacity(rows.len());
        for row in rows {
            let row_id = match row.id {
                Some(id) => id,
                None => state.fresh_id(),
            };
            let mut items = Vec::with_capacity(row.items.len());
            for item in &row.items {
                let item_id = match item.id {
                    Some(id) => id,
                    None => state.fresh_id(),
                };
                items.push(RubricItem {
                    id: item_id,
                    header: item.header.clone(),
                    description: item.description.clone(),
                    points: item.points,
                });
            }
            stored.push(RubricRow {
                id: row_id,
                header: row.header.clone(),
                description: row.description.clone(),
                items,
            });
        }
        state.rubrics.insert(assignment_id, stored);
        Ok(())
    }

    fn submission_rubric(&mut self, submission_id: i64) -> ApiResult<SubmissionRubric> {
        let state = self.lock();
        let assignment_id = match state.submission_assignment.get(&submission_id) {
            Some(id) => *id,
            None => return Ok(SubmissionRubric::default()),
        };
        Ok(SubmissionRubric {
            rubrics: state
                .rubrics
                .get(&assignment_id)
                .cloned()
                .unwrap_or_default(),
            selected: state
                .selections
                .get(&submission_id)
                .map(|ids| ids.iter().map(|&id| SelectedItem { id }).collect())
                .unwrap_or_default(),
        })
    }

    fn select_rubric_items(&mut self, submission_id: i64, items: &[i64]) -> ApiResult<()> {
        let mut state = self.lock();
        state.take_fault()?;
        state.selections.insert(submission_id, items.to_vec());
        Ok(())
    }

    fn submission(&mut self, submission_id: i64) -> ApiResult<Submission> {
        self.lock()
            .submission_mut(submission_id)
            .map(|s| s.clone())
            .ok_or_else(not_found)
    }

    fn set_grade(&mut self, submission_id: i64, grade: Option<f64>) -> ApiResult<()> {
        let mut state = self.lock();
        state.take_fault()?;
        let submission = state.submission_mut(submission_id).ok_or_else(not_found)?;
        submission.grade = grade;
        Ok(())
    }

    fn set_feedback(&mut self, submission_id: i64, feedback: &str) -> ApiResult<()> {
        let mut state = self.lock();
        state.take_fault()?;
        let submission = state.submission_mut(submission_id).ok_or_else(not_found)?;
        submission.comment = Some(feedback.to_owned());
        Ok(())
    }

    fn file_comments(&mut self, file_id: i64) -> ApiResult<FileComments> {
        let state = self.lock();
        let mut map = FileComments::new();
        if let Some(comments) = state.comments.get(&file_id) {
            for (line, msg) in comments {
                map.insert(
                    line.to_string(),
                    serde_json::json!({ "line": line, "msg": msg }),
                );
            }
        }
        Ok(map)
    }

    fn add_comment(&mut self, file_id: i64, line: u64, message: &str) -> ApiResult<()> {
        let mut state = self.lock();
        state.take_fault()?;
        state
            .comments
            .entry(file_id)
            .or_default()
            .insert(line, message.to_owned());
        Ok(())
    }

    fn delete_comment(&mut self, file_id: i64, line: u64) -> ApiResult<()> {
        let mut state = self.lock();
        state.take_fault()?;
        let comments = state.comments.get_mut(&file_id).ok_or_else(not_found)?;
        if comments.remove(&line).is_none() {
            return Err(not_found());
        }
        Ok(())
    }
}

impl InMemoryBackend {
    fn contains(entry: &FileEntry, id: i64) -> bool {
        if entry.id == id {
            return true;
        }
        entry
            .entries
            .as_ref()
            .is_some_and(|entries| entries.iter().any(|e| Self::contains(e, id)))
    }

    fn find_entry_mut<'a>(root: &'a mut FileEntry, path: &str) -> Option<&'a mut FileEntry> {
        let mut current = root;
        for part in path.split('/').filter(|c| !c.is_empty()) {
            current = current
                .entries
                .as_mut()?
                .iter_mut()
                .find(|e| e.name == part)?;
        }
        Some(current)
    }
}
