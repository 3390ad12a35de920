//! End-to-end scenarios against an engine mounted on the in-memory
//! backend: grading round-trips, rubric editing policies, fixed-mode
//! behaviour, and the control-socket protocol.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use cgfs::{
    Api, ApiError, ApiErrorCode, ControlListener, Engine, EngineOptions, FsError,
    InMemoryBackend, NodeId, RemoteState, SharedRemoteState,
};

const MOUNTPOINT: &str = "/mnt/cg";
const ALICE_DIR: &str = "alice - 2026-02-01T10:00:00";
const BOB_DIR: &str = "bob - 2026-02-03T12:00:00";

struct Fixture {
    engine: Engine,
    state: SharedRemoteState,
    assignment_id: i64,
    alice_submission: i64,
    _scratch: tempfile::TempDir,
}

fn build(options: EngineOptions) -> Fixture {
    let mut state = RemoteState::new("teacher");
    let course = state.add_course("Programming 101");
    let assignment_id =
        state.add_assignment(course, "Assignment 1", "grading", "2026-06-01T10:00:00");

    let row = state.add_rubric_row(assignment_id, "Style", "General code style");
    state.add_rubric_item(assignment_id, row, "Messy", "Hard to follow", 1.0);
    state.add_rubric_item(assignment_id, row, "Clean", "Reads well", 5.0);

    let alice_submission =
        state.add_submission(assignment_id, (2, "alice"), "2026-02-01T10:00:00", "top");
    state.add_file(alice_submission, "dir/x.c", b"int main() {}\n");
    state.add_file(alice_submission, "hello.py", b"print('hi')\n");

    let bob_submission =
        state.add_submission(assignment_id, (3, "bob"), "2026-02-03T12:00:00", "top");
    state.add_file(bob_submission, "y.c", b"int y;\n");

    let backend = InMemoryBackend::new(state);
    let shared = backend.state();
    let scratch = tempfile::tempdir().unwrap();
    let engine = Engine::new(
        Api::new(backend),
        options,
        Path::new(MOUNTPOINT),
        scratch.path(),
        "unused",
    )
    .unwrap();

    Fixture {
        engine,
        state: shared,
        assignment_id,
        alice_submission,
        _scratch: scratch,
    }
}

fn alice_path(rest: &str) -> String {
    format!("Programming 101/Assignment 1/{}/{}", ALICE_DIR, rest)
}

fn read_all(engine: &mut Engine, path: &str) -> Vec<u8> {
    let id = engine.resolve(path).unwrap();
    let fh = engine.open(id, false).unwrap();
    let data = engine.read(fh, 0, 1 << 20).unwrap();
    engine.release(fh).unwrap();
    data
}

/// Replaces a file's content the way an editor does: truncate, write,
/// flush, close.
fn write_all(engine: &mut Engine, path: &str, data: &[u8]) -> Result<(), FsError> {
    let id = engine.resolve(path)?;
    let fh = engine.open(id, false)?;
    engine.truncate(id, 0)?;
    if !data.is_empty() {
        engine.write(fh, 0, data)?;
    }
    let flushed = engine.flush(fh);
    engine.release(fh)?;
    flushed
}

#[test]
fn grade_round_trip() {
    let mut fx = build(EngineOptions::default());
    let grade_path = alice_path(".cg-grade");

    assert_eq!(read_all(&mut fx.engine, &grade_path), b"");

    write_all(&mut fx.engine, &grade_path, b"7.5\n").unwrap();
    assert_eq!(read_all(&mut fx.engine, &grade_path), b"7.5\n");
    {
        let mut state = fx.state.lock().unwrap();
        let submission = state.submission_mut(fx.alice_submission).unwrap();
        assert_eq!(submission.grade, Some(7.5));
    }

    // Out of range grades never reach the server.
    assert!(matches!(
        write_all(&mut fx.engine, &grade_path, b"11.0\n"),
        Err(FsError::PermissionDenied)
    ));
    {
        let mut state = fx.state.lock().unwrap();
        assert_eq!(
            state.submission_mut(fx.alice_submission).unwrap().grade,
            Some(7.5)
        );
    }

    // An empty file deletes the grade.
    write_all(&mut fx.engine, &grade_path, b"__RESET__").unwrap();
    write_all(&mut fx.engine, &grade_path, b"").unwrap();
    assert_eq!(read_all(&mut fx.engine, &grade_path), b"");
    {
        let mut state = fx.state.lock().unwrap();
        assert_eq!(state.submission_mut(fx.alice_submission).unwrap().grade, None);
    }
}

#[test]
fn writing_the_same_grade_skips_the_server_call() {
    let mut fx = build(EngineOptions::default());
    let grade_path = alice_path(".cg-grade");

    write_all(&mut fx.engine, &grade_path, b"6.0\n").unwrap();

    // A flush of the identical grade must not hit the (now failing)
    // grade endpoint.
    fx.state.lock().unwrap().fail_next = Some(ApiError {
        status: 500,
        code: ApiErrorCode::Unknown,
        message: "server exploded".into(),
        description: String::new(),
    });
    write_all(&mut fx.engine, &grade_path, b"6.0\n").unwrap();
    assert!(fx.state.lock().unwrap().fail_next.take().is_some());
}

#[test]
fn feedback_round_trip_and_reset() {
    let mut fx = build(EngineOptions::default());
    let feedback_path = alice_path(".cg-feedback");

    assert_eq!(read_all(&mut fx.engine, &feedback_path), b"");

    write_all(&mut fx.engine, &feedback_path, b"Good work!\nNice tests.\n").unwrap();
    assert_eq!(
        read_all(&mut fx.engine, &feedback_path),
        b"Good work!\nNice tests.\n"
    );

    // An abandoned edit disappears with the reset sentinel.
    let original = read_all(&mut fx.engine, &feedback_path);
    let id = fx.engine.resolve(&feedback_path).unwrap();
    let fh = fx.engine.open(id, false).unwrap();
    fx.engine.write(fh, 0, b"half finished thou").unwrap();
    fx.engine.release(fh).unwrap();
    write_all(&mut fx.engine, &feedback_path, b"  __RESET__\n").unwrap();
    assert_eq!(read_all(&mut fx.engine, &feedback_path), original);
}

#[test]
fn settings_flush_is_idempotent() {
    let mut fx = build(EngineOptions::default());
    let settings_path = "Programming 101/Assignment 1/.cg-assignment-settings.ini";

    let rendered = read_all(&mut fx.engine, settings_path);
    assert_eq!(
        std::str::from_utf8(&rendered).unwrap(),
        "deadline = 2026-06-01T10:00:00\nname = Assignment 1\nstate = open\n"
    );

    write_all(&mut fx.engine, settings_path, &rendered).unwrap();

    let state = fx.state.lock().unwrap();
    let assignment = &state.assignments[&fx.assignment_id];
    assert_eq!(assignment.name, "Assignment 1");
    assert_eq!(assignment.state, "grading");
    assert_eq!(assignment.deadline, "2026-06-01T10:00:00");
}

#[test]
fn settings_reject_bad_documents() {
    let mut fx = build(EngineOptions::default());
    let settings_path = "Programming 101/Assignment 1/.cg-assignment-settings.ini";

    let original = read_all(&mut fx.engine, settings_path);
    assert!(matches!(
        write_all(&mut fx.engine, settings_path, b"name = x\n"),
        Err(FsError::PermissionDenied)
    ));

    // The server never saw the broken document.
    let state = fx.state.lock().unwrap();
    assert_eq!(state.assignments[&fx.assignment_id].name, "Assignment 1");
    drop(state);

    write_all(&mut fx.engine, settings_path, b"__RESET__").unwrap();
    assert_eq!(read_all(&mut fx.engine, settings_path), original);
}

#[test]
fn rubric_selection_toggles_and_toggles_back() {
    let mut fx = build(EngineOptions::default());
    let rubric_path = alice_path(".cg-rubric.md");

    let original = String::from_utf8(read_all(&mut fx.engine, &rubric_path)).unwrap();
    assert!(original.starts_with("# The rubric of alice"));
    assert!(original.contains("- [ ] Clean (5.0) - Reads well"));

    let checked = original.replace("- [ ] Clean", "- [x] Clean");
    write_all(&mut fx.engine, &rubric_path, checked.as_bytes()).unwrap();
    {
        let state = fx.state.lock().unwrap();
        assert_eq!(state.selections[&fx.alice_submission].len(), 1);
    }
    let after = String::from_utf8(read_all(&mut fx.engine, &rubric_path)).unwrap();
    assert!(after.contains("- [x] Clean"));

    // Unchecking leaves no selected items.
    let unchecked = after.replace("- [x] Clean", "- [ ] Clean");
    write_all(&mut fx.engine, &rubric_path, unchecked.as_bytes()).unwrap();
    let state = fx.state.lock().unwrap();
    assert!(state.selections[&fx.alice_submission].is_empty());
}

#[test]
fn rubric_edit_append_only_blocks_deletions() {
    let mut fx = build(EngineOptions::default());
    let editor_path = "Programming 101/Assignment 1/.cg-edit-rubric.md";

    let original = String::from_utf8(read_all(&mut fx.engine, editor_path)).unwrap();
    assert!(original.contains("Messy"));
    assert!(original.contains("Clean"));

    let without_clean: String = original
        .lines()
        .filter(|line| !line.contains("Clean"))
        .collect::<Vec<_>>()
        .join("\n");
    assert!(matches!(
        write_all(&mut fx.engine, editor_path, without_clean.as_bytes()),
        Err(FsError::PermissionDenied)
    ));

    // Server rubric unchanged.
    {
        let state = fx.state.lock().unwrap();
        assert_eq!(state.rubrics[&fx.assignment_id][0].items.len(), 2);
    }

    // The reset sentinel restores the server's version.
    write_all(&mut fx.engine, editor_path, b"__RESET__").unwrap();
    assert_eq!(
        read_all(&mut fx.engine, editor_path),
        original.as_bytes()
    );
}

#[test]
fn rubric_edit_can_delete_with_the_flag() {
    let mut fx = build(EngineOptions {
        rubric_append_only: false,
        ..EngineOptions::default()
    });
    let editor_path = "Programming 101/Assignment 1/.cg-edit-rubric.md";

    let original = String::from_utf8(read_all(&mut fx.engine, editor_path)).unwrap();
    let without_clean: String = original
        .lines()
        .filter(|line| !line.contains("Clean"))
        .collect::<Vec<_>>()
        .join("\n");
    write_all(&mut fx.engine, editor_path, without_clean.as_bytes()).unwrap();

    let after = String::from_utf8(read_all(&mut fx.engine, editor_path)).unwrap();
    assert!(after.contains("Messy"));
    assert!(!after.contains("Clean"));

    let state = fx.state.lock().unwrap();
    let rows = &state.rubrics[&fx.assignment_id];
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].items.len(), 1);
    assert_eq!(rows[0].items[0].header, "Messy");
}

#[test]
fn rubric_edit_appends_new_rows_and_items() {
    let mut fx = build(EngineOptions::default());
    let editor_path = "Programming 101/Assignment 1/.cg-edit-rubric.md";

    let original = String::from_utf8(read_all(&mut fx.engine, editor_path)).unwrap();
    let extended = format!(
        "{}\n\n# Correctness\n  Does it work at all\n{}\n- (0.0) Broken - Nothing runs\n- (3.0) Works - All good\n",
        original,
        "-".repeat(20),
    );
    write_all(&mut fx.engine, editor_path, extended.as_bytes()).unwrap();

    let state = fx.state.lock().unwrap();
    let rows = &state.rubrics[&fx.assignment_id];
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].header, "Correctness");
    assert_eq!(rows[1].description, "Does it work at all");
    assert_eq!(rows[1].items.len(), 2);
    assert_eq!(rows[1].items[1].header, "Works");
    assert_eq!(rows[1].items[1].points, 3.0);
}

#[test]
fn cross_submission_rename_is_rejected() {
    let mut fx = build(EngineOptions::default());

    let alice = fx
        .engine
        .resolve(&format!("Programming 101/Assignment 1/{}", ALICE_DIR))
        .unwrap();
    let bob = fx
        .engine
        .resolve(&format!("Programming 101/Assignment 1/{}", BOB_DIR))
        .unwrap();
    // Populate both submissions.
    fx.engine.readdir(alice).unwrap();
    fx.engine.readdir(bob).unwrap();

    let before_alice = fx.engine.readdir(alice).unwrap();
    let before_bob = fx.engine.readdir(bob).unwrap();

    assert!(matches!(
        fx.engine.rename(alice, "hello.py", bob, "hello.py"),
        Err(FsError::PermissionDenied)
    ));

    assert_eq!(fx.engine.readdir(alice).unwrap(), before_alice);
    assert_eq!(fx.engine.readdir(bob).unwrap(), before_bob);
}

#[test]
fn moves_across_directories_of_one_submission_work() {
    let mut fx = build(EngineOptions::default());

    let submission = fx
        .engine
        .resolve(&format!("Programming 101/Assignment 1/{}", ALICE_DIR))
        .unwrap();
    let dir = fx.engine.resolve(&alice_path("dir")).unwrap();

    fx.engine
        .rename(submission, "hello.py", dir, "moved.py")
        .unwrap();
    assert_eq!(
        read_all(&mut fx.engine, &alice_path("dir/moved.py")),
        b"print('hi')\n"
    );
    assert!(matches!(
        fx.engine.resolve(&alice_path("hello.py")),
        Err(FsError::NotFound)
    ));
}

#[test]
fn data_file_edits_reach_the_server_on_flush() {
    let mut fx = build(EngineOptions::default());
    let path = alice_path("dir/x.c");

    write_all(&mut fx.engine, &path, b"int main() { return 1; }\n").unwrap();
    assert_eq!(
        read_all(&mut fx.engine, &path),
        b"int main() { return 1; }\n"
    );

    let state = fx.state.lock().unwrap();
    assert!(state
        .file_contents
        .values()
        .any(|c| c == b"int main() { return 1; }\n"));
}

#[test]
fn control_socket_round_trip() {
    let mut state = RemoteState::new("teacher");
    let course = state.add_course("Programming 101");
    let assignment = state.add_assignment(course, "Assignment 1", "grading", "2026-06-01");
    let submission = state.add_submission(assignment, (2, "alice"), "2026-02-01T10:00:00", "top");
    state.add_file(submission, "dir/x.c", b"int main() {}\n");

    let backend = InMemoryBackend::new(state);
    let scratch = tempfile::tempdir().unwrap();
    let listener = ControlListener::bind(scratch.path()).unwrap();
    let address = listener.address().to_owned();

    let engine = Engine::new(
        Api::new(backend),
        EngineOptions::default(),
        Path::new(MOUNTPOINT),
        scratch.path(),
        &address,
    )
    .unwrap();
    let engine = Arc::new(Mutex::new(engine));
    let server = listener.serve(Arc::clone(&engine));

    let file = format!("{}/Programming 101/Assignment 1/{}/dir/x.c", MOUNTPOINT, ALICE_DIR);

    let response = request(&address, json!({ "op": "is_file", "file": file }));
    assert_eq!(response, json!({ "ok": true }));

    let response = request(
        &address,
        json!({ "op": "is_file", "file": format!("{}/{}", MOUNTPOINT, "missing.c") }),
    );
    assert_eq!(response["ok"], json!(false));
    assert_eq!(response["error"], json!("File not found"));

    let grade_file = format!(
        "{}/Programming 101/Assignment 1/{}/.cg-grade",
        MOUNTPOINT, ALICE_DIR
    );
    let response = request(&address, json!({ "op": "is_file", "file": grade_file }));
    assert_eq!(response, json!({ "ok": false }));

    let response = request(
        &address,
        json!({ "op": "set_feedback", "file": file, "line": 5, "message": "hi" }),
    );
    assert_eq!(response, json!({ "ok": true }));

    let response = request(&address, json!({ "op": "get_feedback", "file": file }));
    assert_eq!(response["ok"], json!(true));
    assert_eq!(response["data"]["5"]["msg"], json!("hi"));

    let response = request(
        &address,
        json!({ "op": "delete_feedback", "file": file, "line": 5 }),
    );
    assert_eq!(response, json!({ "ok": true }));

    let response = request(&address, json!({ "op": "get_feedback", "file": file }));
    assert_eq!(response["data"].as_object().unwrap().len(), 0);

    let response = request(&address, json!({ "op": "get_feedback", "file": grade_file }));
    assert_eq!(response["error"], json!("File not a server file"));

    let response = request(&address, json!({ "op": "frobnicate" }));
    assert_eq!(response["error"], json!("unknown op"));

    server.shutdown();
}

fn request(address: &str, body: Value) -> Value {
    let mut stream = UnixStream::connect(address).unwrap();
    stream.write_all(body.to_string().as_bytes()).unwrap();
    stream.shutdown(Shutdown::Write).unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    serde_json::from_slice(&response).unwrap()
}

#[test]
fn unresolved_node_ids_report_not_found() {
    let mut fx = build(EngineOptions::default());
    assert!(matches!(
        fx.engine.getattr(NodeId(999_999)),
        Err(FsError::NotFound)
    ));
    assert!(matches!(
        fx.engine.lookup(NodeId(999_999), "x"),
        Err(FsError::NotFound)
    ));
}

#[test]
fn descending_into_a_file_is_not_a_directory() {
    let mut fx = build(EngineOptions::default());
    let file = fx.engine.resolve(&alice_path("hello.py")).unwrap();
    assert!(matches!(
        fx.engine.lookup(file, "nested"),
        Err(FsError::NotADirectory)
    ));
}
