//! Rendering and parsing of the two rubric documents.
//!
//! `.cg-rubric.md` shows a submission's rubric with checkboxes and maps
//! checked lines back onto item ids through a line-number lookup.
//! `.cg-edit-rubric.md` lets graders edit the rubric itself; real ids are
//! replaced by short SHA-256 hashes recorded in a hash → id lookup so a
//! round-trip never exposes or depends on raw ids.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::api::{Api, RubricItem, RubricItemUpdate, RubricRow, RubricRowUpdate};
use crate::fs::error::FsError;
use crate::fs::synthetic::{format_decimal, ParseError};

/// Help text served as `.cg-edit-rubric.help` next to every editable
/// rubric file.
pub const EDITOR_HELP: &str = "\
This file lets you edit the rubric of the assignment.

The format is one block per rubric category:

# [id] Category name
  Category description, indented by
  two spaces. Blank lines are allowed.
-----------------------------
- [id] (5.0) First item - Description of the item
- [id] (1.0) Second item - Multiline
  description

The bracketed ids are hashes generated by the file system; do not edit
them. Leave the brackets off to create a new category or item. Item
headers cannot contain a newline before the '-' that separates the
header from the description.

Removing an existing category or item is only allowed when the file
system was mounted with rubric editing enabled. The file is rewritten
after every save, so make sure your editor reloads it.

Write __RESET__ to the file to throw away your changes.
";

const RULE: &str = "-------------------------------------------------------------------------------";

/// First 16 hex characters of the id's SHA-256, recorded in `lookup`.
fn hash_id(id: i64, lookup: &mut HashMap<String, i64>) -> String {
    let digest = Sha256::digest(id.to_string().as_bytes());
    let mut hash = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hash.push_str(&format!("{:02x}", byte));
    }
    lookup.insert(hash.clone(), id);
    hash
}

fn indent_continuations(text: &str) -> String {
    text.replace('\n', "\n  ")
}

fn sorted_by_points(mut items: Vec<RubricItem>) -> Vec<RubricItem> {
    items.sort_by(|a, b| {
        a.points
            .partial_cmp(&b.points)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    items
}

/// Serialises a submission's rubric with selection checkboxes, rebuilding
/// the 0-based line-number → item-id lookup as it goes.
pub fn render_selection(
    api: &mut Api,
    submission_id: i64,
    student: &str,
    lookup: &mut HashMap<usize, i64>,
) -> Result<Vec<u8>, FsError> {
    lookup.clear();
    let rubric = api.backend().submission_rubric(submission_id)?;
    let selected: Vec<i64> = rubric.selected.iter().map(|s| s.id).collect();

    let mut out = String::new();
    let mut line = 0;

    if rubric.rubrics.is_empty() {
        out.push_str("# This assignment does not have a rubric!\n");
        return Ok(out.into_bytes());
    }

    out.push_str(&format!("# The rubric of {}\n\n", student));
    line += 2;

    for row in rubric.rubrics {
        out.push_str("## ");
        out.push_str(&row.header);
        out.push('\n');
        line += 1;

        if !row.description.is_empty() {
            out.push_str("  ");
            out.push_str(&indent_continuations(&row.description));
            out.push('\n');
            line += row.description.matches('\n').count() + 1;
        }

        out.push_str(RULE);
        out.push('\n');
        line += 1;

        for item in sorted_by_points(row.items) {
            lookup.insert(line, item.id);
            out.push_str(if selected.contains(&item.id) {
                "- [x] "
            } else {
                "- [ ] "
            });
            out.push_str(&indent_continuations(&item.header));
            out.push_str(&format!(" ({}) - ", format_decimal(item.points)));
            out.push_str(&indent_continuations(&item.description));
            out.push('\n');

            line += item.header.matches('\n').count()
                + item.description.matches('\n').count()
                + 1;
        }

        out.push('\n');
        line += 1;
    }

    // Drop the blank line after the last row.
    out.pop();
    Ok(out.into_bytes())
}

/// Collects the ids of every checked line. A check on a line that never
/// carried an item is an error.
pub fn parse_selection(
    data: &[u8],
    lookup: &HashMap<usize, i64>,
) -> Result<Vec<i64>, ParseError> {
    let mut selected = Vec::new();
    for (index, line) in data.split(|&b| b == b'\n').enumerate() {
        if line.starts_with(b"- [x]") || line.starts_with(b"- [X]") {
            match lookup.get(&index) {
                Some(id) => selected.push(*id),
                None => {
                    return Err(ParseError::new(format!(
                        "line {} does not contain a rubric item",
                        index
                    )))
                }
            }
        }
    }
    Ok(selected)
}

/// Serialises the assignment rubric in editable form, rebuilding the
/// hash → id lookup.
pub fn render_editor(
    api: &mut Api,
    assignment_id: i64,
    lookup: &mut HashMap<String, i64>,
) -> Result<Vec<u8>, FsError> {
    lookup.clear();
    let rows = api.backend().assignment_rubric(assignment_id)?;

    let mut out = String::new();
    for row in rows {
        out.push_str(&format!("# [{}] ", hash_id(row.id, lookup)));
        out.push_str(&row.header);
        out.push('\n');

        if !row.description.is_empty() {
            out.push_str("  ");
            out.push_str(&indent_continuations(&row.description));
            out.push('\n');
        }

        out.push_str(RULE);
        out.push('\n');

        for item in sorted_by_points(row.items) {
            out.push_str(&format!("- [{}] ", hash_id(item.id, lookup)));
            out.push_str(&format!("({}) ", format_decimal(item.points)));
            out.push_str(&indent_continuations(&item.header));
            out.push_str(" - ");
            out.push_str(&indent_continuations(&item.description));
            out.push('\n');
        }
        out.push('\n');
    }

    // Drop the blank line after the last row.
    out.pop();
    Ok(out.into_bytes())
}

#[derive(Debug, PartialEq)]
pub struct ParsedItem {
    pub id_hash: Option<String>,
    pub points: f64,
    pub header: String,
    pub description: String,
}

#[derive(Debug, PartialEq)]
pub struct ParsedRow {
    pub id_hash: Option<String>,
    pub header: String,
    pub description: String,
    pub items: Vec<ParsedItem>,
}

/// Byte cursor for the hand-written descent below. Only ASCII bytes are
/// ever inspected, so slicing at cursor positions keeps UTF-8 intact.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Cursor<'a> {
        Cursor { data, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn rest_starts_with(&self, prefix: &[u8]) -> bool {
        self.data[self.pos.min(self.data.len())..].starts_with(prefix)
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.bump();
        }
    }

    /// Everything up to (and consuming) the next newline, or to the end.
    fn take_line(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if byte == b'\n' {
                break;
            }
            self.bump();
        }
        let line = utf8(&self.data[start..self.pos])?;
        if !self.at_end() {
            self.bump();
        }
        Ok(line)
    }

    /// Everything up to (excluding) `delimiter`, which must appear.
    fn take_until(&mut self, delimiter: u8) -> Result<String, ParseError> {
        let start = self.pos;
        loop {
            match self.peek() {
                Some(byte) if byte == delimiter => break,
                Some(_) => self.bump(),
                None => {
                    return Err(ParseError::new(format!(
                        "unexpected end of file, expected {:?}",
                        delimiter as char
                    )))
                }
            }
        }
        let taken = utf8(&self.data[start..self.pos])?;
        self.bump();
        Ok(taken)
    }
}

fn utf8(data: &[u8]) -> Result<String, ParseError> {
    String::from_utf8(data.to_vec()).map_err(|_| ParseError::new("document is not valid UTF-8"))
}

/// A description block: lines (leading spaces stripped) until one starts
/// with any of `ends` or the input runs out.
fn parse_description(
    cursor: &mut Cursor<'_>,
    ends: &[&[u8]],
    strip_trailing: bool,
) -> Result<String, ParseError> {
    let mut lines: Vec<String> = Vec::new();
    loop {
        if ends.iter().any(|end| cursor.rest_starts_with(end)) {
            break;
        }
        cursor.skip_spaces();
        if cursor.at_end() {
            break;
        }
        lines.push(cursor.take_line()?);
    }
    if strip_trailing {
        while lines.last().is_some_and(|line| line.trim().is_empty()) {
            lines.pop();
        }
    }
    Ok(lines.join("\n"))
}

/// An optional `[hash]` marker (cursor positioned at a possible `[`).
fn parse_id_hash(cursor: &mut Cursor<'_>) -> Result<Option<String>, ParseError> {
    if cursor.peek() != Some(b'[') {
        return Ok(None);
    }
    cursor.bump();
    let hash = cursor.take_until(b']')?;
    cursor.skip_spaces();
    Ok(Some(hash))
}

/// The item list of one row: every `- …` entry until the next `#` row
/// header or the end of the document.
fn parse_items(cursor: &mut Cursor<'_>) -> Result<Vec<ParsedItem>, ParseError> {
    let mut items = Vec::new();

    while !cursor.at_end() && cursor.peek() != Some(b'#') {
        // Skip the leading '-' of the item line.
        cursor.bump();
        cursor.skip_spaces();

        let id_hash = parse_id_hash(cursor)?;

        if cursor.peek() != Some(b'(') {
            return Err(ParseError::new("expected '(<points>)' after the item marker"));
        }
        cursor.bump();
        let points_text = cursor.take_until(b')')?;
        cursor.skip_spaces();
        let points: f64 = points_text
            .trim()
            .parse()
            .map_err(|_| ParseError::new(format!("invalid points value {:?}", points_text)))?;

        let mut header_bytes = Vec::new();
        loop {
            match cursor.peek() {
                Some(b'-') => break,
                Some(b'\n') => {
                    return Err(ParseError::new(
                        "Item header cannot contain a newline, you probably \
                         missed a \"-\" in your header",
                    ))
                }
                Some(byte) => {
                    header_bytes.push(byte);
                    cursor.bump();
                }
                None => {
                    return Err(ParseError::new("unexpected end of file in an item header"))
                }
            }
        }
        cursor.bump();
        cursor.skip_spaces();
        let header = utf8(&header_bytes)?.trim().to_owned();

        let description = parse_description(cursor, &[b"-" as &[u8], b"#"], true)?;

        items.push(ParsedItem {
            id_hash,
            points,
            header,
            description,
        });
    }

    Ok(items)
}

/// One row: header line (after the `#`), description block, rule line,
/// item list.
fn parse_row(cursor: &mut Cursor<'_>) -> Result<ParsedRow, ParseError> {
    cursor.skip_spaces();
    let id_hash = parse_id_hash(cursor)?;
    let header = cursor.take_line()?;
    let description = parse_description(cursor, &[b"---" as &[u8]], false)?;

    // Skip the remainder of the rule line.
    loop {
        match cursor.peek() {
            Some(b'\n') => break,
            Some(_) => cursor.bump(),
            None => return Err(ParseError::new("unexpected end of file in a rubric row")),
        }
    }
    cursor.bump();

    let items = parse_items(cursor)?;
    Ok(ParsedRow {
        id_hash,
        header,
        description,
        items,
    })
}

/// Parses a whole editable rubric document: zero or more rows.
pub fn parse_editor(data: &[u8]) -> Result<Vec<ParsedRow>, ParseError> {
    let mut cursor = Cursor::new(data);
    let mut rows = Vec::new();
    while !cursor.at_end() {
        if cursor.peek() != Some(b'#') {
            return Err(ParseError::new("expected '#' at the start of a rubric row"));
        }
        cursor.bump();
        rows.push(parse_row(&mut cursor)?);
    }
    Ok(rows)
}

/// Parses the edited document and replaces the assignment rubric.
///
/// In append-only mode every known hash must be used exactly once, which
/// forbids deleting or duplicating existing rows and items through the
/// file. With append-only disabled, leftover hashes mean deletions and
/// are allowed.
pub fn save_editor(
    api: &mut Api,
    assignment_id: i64,
    data: &[u8],
    append_only: bool,
    lookup: &mut HashMap<String, i64>,
) -> Result<(), FsError> {
    let rows = match parse_editor(data) {
        Ok(rows) => rows,
        Err(err) => {
            log::warn!("the rubric could not be parsed: {}", err);
            return Err(FsError::PermissionDenied);
        }
    };

    let mut remaining = lookup.clone();
    let mut resolve = |hash: &str| -> Result<i64, FsError> {
        match remaining.get(hash).copied() {
            Some(id) => {
                if append_only {
                    remaining.remove(hash);
                }
                Ok(id)
            }
            None => {
                log::warn!("unknown rubric id hash {:?}", hash);
                Err(FsError::PermissionDenied)
            }
        }
    };

    let mut updates = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut items = Vec::with_capacity(row.items.len());
        for item in &row.items {
            items.push(RubricItemUpdate {
                id: item.id_hash.as_deref().map(&mut resolve).transpose()?,
                header: item.header.clone(),
                description: item.description.clone(),
                points: item.points,
            });
        }

        let id = row.id_hash.as_deref().map(&mut resolve).transpose()?;
        if id.is_none() && items.iter().any(|item| item.id.is_some()) {
            log::warn!("a new rubric row cannot contain existing items");
            return Err(FsError::PermissionDenied);
        }
        updates.push(RubricRowUpdate {
            id,
            header: row.header.clone(),
            description: row.description.clone(),
            items,
        });
    }
    drop(resolve);

    if append_only && !remaining.is_empty() {
        log::error!("you cannot delete rubric items using the file system");
        return Err(FsError::PermissionDenied);
    }

    api.backend().set_assignment_rubric(assignment_id, &updates)?;
    *lookup = remaining;
    Ok(())
}
