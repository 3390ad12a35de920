//! The real API backend: blocking HTTP with a bearer token.

use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Deserialize;
use serde_json::json;

use super::{
    ApiBackend, ApiError, ApiErrorCode, ApiResult, Assignment, AssignmentUpdate, Course,
    FileComments, FileEntry, FileMeta, RubricRow, RubricRowUpdate, Submission, SubmissionRubric,
    User,
};

/// Per-request timeout. Kernel callbacks block on these requests, so they
/// must stay short.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Characters escaped in query values (server paths may contain anything).
const QUERY_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'=')
    .add(b'?');

fn encode(value: &str) -> String {
    utf8_percent_encode(value, QUERY_VALUE).to_string()
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    user: User,
}

#[derive(Debug, Deserialize)]
struct ErrorDocument {
    code: ApiErrorCode,
    message: String,
    description: String,
}

pub struct HttpBackend {
    client: reqwest::blocking::Client,
    base: String,
    token: String,
    /// `student` when mounted fixed, `auto` otherwise. Sent as the `owner`
    /// query parameter on every file fetch.
    owner: &'static str,
    user: User,
}

impl HttpBackend {
    /// Logs in and returns a backend bound to the resulting session token.
    pub fn login(
        base: Option<&str>,
        username: &str,
        password: &str,
        fixed: bool,
    ) -> ApiResult<HttpBackend> {
        let mut base = base.unwrap_or(super::DEFAULT_BASE_URL).to_owned();
        while base.ends_with('/') {
            base.pop();
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ApiError::transport(err.to_string()))?;

        let response = client
            .post(format!("{}/login", base))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .map_err(|err| ApiError::transport(err.to_string()))?;
        let response = check(response)?;

        let login: LoginResponse = response
            .json()
            .map_err(|err| ApiError::transport(err.to_string()))?;

        Ok(HttpBackend {
            client,
            base,
            token: login.access_token,
            owner: if fixed { "student" } else { "auto" },
            user: login.user,
        })
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: String,
    ) -> reqwest::blocking::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> ApiResult<T> {
        let response = check(send(self.request(reqwest::Method::GET, url))?)?;
        response
            .json()
            .map_err(|err| ApiError::transport(err.to_string()))
    }
}

fn send(builder: reqwest::blocking::RequestBuilder) -> ApiResult<reqwest::blocking::Response> {
    builder
        .send()
        .map_err(|err| ApiError::transport(err.to_string()))
}

/// Uniform error decoding: any status >= 400 becomes a structured
/// [`ApiError`]. Responses that fail to carry the error document still
/// produce one, with the code left unknown.
fn check(response: reqwest::blocking::Response) -> ApiResult<reqwest::blocking::Response> {
    let status = response.status();
    if status.as_u16() < 400 {
        return Ok(response);
    }

    let err = match response.json::<ErrorDocument>() {
        Ok(doc) => ApiError {
            status: status.as_u16(),
            code: doc.code,
            message: doc.message,
            description: doc.description,
        },
        Err(_) => ApiError {
            status: status.as_u16(),
            code: ApiErrorCode::Unknown,
            message: format!("HTTP {}", status),
            description: String::new(),
        },
    };
    Err(err)
}

impl ApiBackend for HttpBackend {
    fn user(&self) -> &User {
        &self.user
    }

    fn courses(&mut self) -> ApiResult<Vec<Course>> {
        self.get_json(format!("{}/courses/?extended=true", self.base))
    }

    fn submissions(&mut self, assignment_id: i64) -> ApiResult<Vec<Submission>> {
        self.get_json(format!("{}/assignments/{}/submissions/", self.base, assignment_id))
    }

    fn submission_files(&mut self, submission_id: i64) -> ApiResult<FileEntry> {
        self.get_json(format!(
            "{}/submissions/{}/files/?owner={}",
            self.base, submission_id, self.owner
        ))
    }

    fn file_meta(&mut self, submission_id: i64, path: &str) -> ApiResult<FileMeta> {
        self.get_json(format!(
            "{}/submissions/{}/files/?path={}&owner={}",
            self.base,
            submission_id,
            encode(path),
            self.owner
        ))
    }

    fn create_file(&mut self, submission_id: i64, path: &str, data: &[u8]) -> ApiResult<FileMeta> {
        let url = format!(
            "{}/submissions/{}/files/?path={}&owner={}",
            self.base,
            submission_id,
            encode(path),
            self.owner
        );
        let response = check(send(
            self.request(reqwest::Method::POST, url).body(data.to_vec()),
        )?)?;
        response
            .json()
            .map_err(|err| ApiError::transport(err.to_string()))
    }

    fn rename_file(&mut self, file_id: i64, new_path: &str) -> ApiResult<FileMeta> {
        let url = format!(
            "{}/code/{}?operation=rename&new_path={}",
            self.base,
            file_id,
            encode(new_path)
        );
        let response = check(send(self.request(reqwest::Method::PATCH, url))?)?;
        response
            .json()
            .map_err(|err| ApiError::transport(err.to_string()))
    }

    fn read_file(&mut self, file_id: i64) -> ApiResult<Vec<u8>> {
        let url = format!("{}/code/{}", self.base, file_id);
        let response = check(send(self.request(reqwest::Method::GET, url))?)?;
        let bytes = response
            .bytes()
            .map_err(|err| ApiError::transport(err.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn write_file(&mut self, file_id: i64, data: &[u8]) -> ApiResult<FileMeta> {
        let url = format!("{}/code/{}", self.base, file_id);
        let response = check(send(
            self.request(reqwest::Method::PATCH, url).body(data.to_vec()),
        )?)?;
        response
            .json()
            .map_err(|err| ApiError::transport(err.to_string()))
    }

    fn delete_file(&mut self, file_id: i64) -> ApiResult<()> {
        let url = format!("{}/code/{}", self.base, file_id);
        check(send(self.request(reqwest::Method::DELETE, url))?)?;
        Ok(())
    }

    fn assignment(&mut self, assignment_id: i64) -> ApiResult<Assignment> {
        self.get_json(format!("{}/assignments/{}", self.base, assignment_id))
    }

    fn set_assignment(&mut self, assignment_id: i64, settings: &AssignmentUpdate) -> ApiResult<()> {
        let url = format!("{}/assignments/{}", self.base, assignment_id);
        check(send(
            self.request(reqwest::Method::PATCH, url).json(settings),
        )?)?;
        Ok(())
    }

    fn assignment_rubric(&mut self, assignment_id: i64) -> ApiResult<Vec<RubricRow>> {
        let url = format!("{}/assignments/{}/rubrics/", self.base, assignment_id);
        let response = send(self.request(reqwest::Method::GET, url))?;
        // An assignment without a rubric is not an error.
        if response.status().as_u16() == 404 {
            return Ok(Vec::new());
        }
        check(response)?
            .json()
            .map_err(|err| ApiError::transport(err.to_string()))
    }

    fn set_assignment_rubric(
        &mut self,
        assignment_id: i64,
        rows: &[RubricRowUpdate],
    ) -> ApiResult<()> {
        let url = format!("{}/assignments/{}/rubrics/", self.base, assignment_id);
        check(send(
            self.request(reqwest::Method::PUT, url)
                .json(&json!({ "rows": rows })),
        )?)?;
        Ok(())
    }

    fn submission_rubric(&mut self, submission_id: i64) -> ApiResult<SubmissionRubric> {
        let url = format!("{}/submissions/{}/rubrics/", self.base, submission_id);
        let response = send(self.request(reqwest::Method::GET, url))?;
        if response.status().as_u16() == 404 {
            return Ok(SubmissionRubric::default());
        }
        check(response)?
            .json()
            .map_err(|err| ApiError::transport(err.to_string()))
    }

    fn select_rubric_items(&mut self, submission_id: i64, items: &[i64]) -> ApiResult<()> {
        let url = format!("{}/submissions/{}/rubricitems/", self.base, submission_id);
        check(send(
            self.request(reqwest::Method::PATCH, url)
                .json(&json!({ "items": items })),
        )?)?;
        Ok(())
    }

    fn submission(&mut self, submission_id: i64) -> ApiResult<Submission> {
        self.get_json(format!("{}/submissions/{}", self.base, submission_id))
    }

    fn set_grade(&mut self, submission_id: i64, grade: Option<f64>) -> ApiResult<()> {
        let url = format!("{}/submissions/{}", self.base, submission_id);
        check(send(
            self.request(reqwest::Method::PATCH, url)
                .json(&json!({ "grade": grade })),
        )?)?;
        Ok(())
    }

    fn set_feedback(&mut self, submission_id: i64, feedback: &str) -> ApiResult<()> {
        let url = format!("{}/submissions/{}", self.base, submission_id);
        check(send(
            self.request(reqwest::Method::PATCH, url)
                .json(&json!({ "feedback": feedback })),
        )?)?;
        Ok(())
    }

    fn file_comments(&mut self, file_id: i64) -> ApiResult<FileComments> {
        self.get_json(format!("{}/code/{}?type=feedback", self.base, file_id))
    }

    fn add_comment(&mut self, file_id: i64, line: u64, message: &str) -> ApiResult<()> {
        let url = format!("{}/code/{}/comments/{}", self.base, file_id, line);
        check(send(
            self.request(reqwest::Method::PUT, url)
                .json(&json!({ "comment": message })),
        )?)?;
        Ok(())
    }

    fn delete_comment(&mut self, file_id: i64, line: u64) -> ApiResult<()> {
        let url = format!("{}/code/{}/comments/{}", self.base, file_id, line);
        check(send(self.request(reqwest::Method::DELETE, url))?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_values_are_percent_encoded() {
        assert_eq!(encode("dir/my file.c"), "dir/my%20file.c");
        assert_eq!(encode("50% done&more"), "50%25%20done%26more");
    }
}
