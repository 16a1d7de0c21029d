//! A self-correcting patch engine for diffs emitted by language models.
//!
//! `vpatch` applies patches written in the V4A format — a unified-diff-like
//! syntax built around `*** Begin Patch` / `*** End Patch` blocks with
//! per-file `Add`, `Delete`, and `Update` directives. Model-generated patches
//! are frequently *close* to the target file without being bit-exact:
//! whitespace drifts, Unicode look-alike punctuation creeps in, hunk headers
//! are malformed, and narration surrounds the diff. This crate repairs those
//! trivially safe defects and applies the patch deterministically; anything
//! genuinely ambiguous fails loudly instead of being guessed at.
//!
//! ## Core Features
//!
//! - **Chatter-Tolerant:** A sanitizer pass strips model narration, CRLF
//!   endings, and stray control characters before parsing.
//! - **Context-Driven:** Hunks are located by matching their context lines
//!   through a ladder of increasingly tolerant comparisons — byte-exact,
//!   trailing-whitespace-insensitive, whitespace-insensitive, and finally a
//!   Unicode canonicalisation that folds look-alike dashes, quotes, and
//!   spaces to ASCII.
//! - **Audited Tolerance:** Every repaired deviation adds to a *fuzz* score
//!   returned alongside the parse, so callers can review how far the patch
//!   strayed from the file. A failed match is always a hard error; the
//!   engine never writes a file it could not locate context for.
//! - **Pure Core:** All filesystem access is injected as `read`/`write`/
//!   `remove` callbacks, so the engine itself is a pure transformation from
//!   patch text plus file snapshots to a commit.
//!
//! ## Main Workflow
//!
//! 1. **Parsing:** [`text_to_patch`] turns one patch block into a [`Patch`]
//!    (a map from path to [`PatchAction`]) plus its fuzz score. The original
//!    contents of every updated or deleted file must be supplied up front;
//!    [`identify_files_needed`] tells you which those are.
//! 2. **Committing:** [`patch_to_commit`] replays the parsed chunks against
//!    the original contents and produces a [`Commit`] — the final state of
//!    every touched file.
//! 3. **Applying:** [`apply_commit`] dispatches the commit through injected
//!    callbacks. [`process_patch`] bundles all of the above, including
//!    splitting multi-block input.
//!
//! ## Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use vpatch::{patch_to_commit, text_to_patch, FileChange};
//!
//! # fn main() -> Result<(), vpatch::DiffError> {
//! let mut files = HashMap::new();
//! files.insert("hello.py".to_string(), "def f():\n    pass\n".to_string());
//!
//! let patch_text = "\
//! *** Begin Patch
//! *** Update File: hello.py
//! @@
//!  def f():
//! -    pass
//! +    raise NotImplementedError()
//! *** End Patch";
//!
//! let (patch, fuzz) = text_to_patch(patch_text, &files)?;
//! assert_eq!(fuzz, 0);
//!
//! let commit = patch_to_commit(&patch, &files)?;
//! match &commit.changes["hello.py"] {
//!     FileChange::Update { new_content, .. } => {
//!         assert_eq!(new_content, "def f():\n    raise NotImplementedError()\n");
//!     }
//!     _ => unreachable!(),
//! }
//! # Ok(())
//! # }
//! ```
use log::{debug, info, trace, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

// --- Patch Markers ---

const BEGIN_PATCH_MARKER: &str = "*** Begin Patch";
const END_PATCH_MARKER: &str = "*** End Patch";
const ADD_FILE_MARKER: &str = "*** Add File: ";
const DELETE_FILE_MARKER: &str = "*** Delete File: ";
const UPDATE_FILE_MARKER: &str = "*** Update File: ";
const MOVE_TO_MARKER: &str = "*** Move to: ";
const EOF_MARKER: &str = "*** End of File";
const ANCHOR_MARKER: &str = "@@ ";

/// Directives that end the body of an `Add File` action.
const FILE_SCOPE_PREFIXES: &[&str] = &[
    END_PATCH_MARKER,
    "*** Update File:",
    "*** Delete File:",
    "*** Add File:",
];

/// Directives that end the body of an `Update File` action.
const UPDATE_TERMINATORS: &[&str] = &[
    END_PATCH_MARKER,
    "*** Update File:",
    "*** Delete File:",
    "*** Add File:",
    "*** End of File",
];

// --- Fuzz Penalties ---
//
// Every tolerated deviation adds one of these to the parse's fuzz score.
// The score is advisory: the engine never compares it to a threshold.

const TRAILING_WHITESPACE_FUZZ: u64 = 1;
const SURROUNDING_WHITESPACE_FUZZ: u64 = 100;
const UNICODE_FOLD_FUZZ: u64 = 1000;
const EOF_ANCHOR_IGNORED_FUZZ: u64 = 10000;
const NEARBY_WINDOW_FUZZ: u64 = 50000;

// --- Error Types ---

/// Represents the possible errors that can occur while parsing or applying
/// a patch.
///
/// No variant is ever recovered from inside the engine: deviations that can
/// be repaired safely are repaired silently (and recorded in the fuzz
/// score) *before* an error would be raised. Everything else aborts the
/// whole patch block.
#[derive(Error, Debug)]
pub enum DiffError {
    /// The patch text does not form a `*** Begin Patch` / `*** End Patch`
    /// envelope.
    #[error("patch text must start with '*** Begin Patch' and end with '*** End Patch'")]
    InvalidPatchEnvelope,
    /// A `*** Begin Patch` line was never followed by `*** End Patch`.
    #[error("'*** Begin Patch' on line {0} has no matching '*** End Patch'")]
    UnterminatedBlock(usize),
    /// A line at document scope starts with none of the recognised
    /// directives.
    #[error("unrecognised line at patch scope: '{0}'")]
    UnknownLine(String),
    /// An `Update File` or `Delete File` directive names a file that is not
    /// among the loaded originals.
    #[error("file to update or delete was not found: '{0}'")]
    MissingFile(String),
    /// An `Add File` directive names a file that already exists.
    #[error("file to add already exists: '{0}'")]
    FileAlreadyExists(String),
    /// The same path appears in more than one directive of a single block.
    #[error("path appears more than once in the patch: '{0}'")]
    DuplicatePath(String),
    /// A file referenced by the patch could not be read from the host.
    #[error("could not read file referenced by the patch: '{0}'")]
    FileNotFound(String),
    /// A hunk's context could not be located anywhere in the original file.
    #[error("context cannot be located in '{path}' after line {cursor}:\n{context}")]
    InvalidContext {
        path: String,
        cursor: usize,
        context: String,
    },
    /// A hunk anchored at end-of-file could not be located.
    #[error("end-of-file context cannot be located in '{path}':\n{context}")]
    InvalidEofContext { path: String, context: String },
    /// A `***` line appeared inside a chunk body without being a recognised
    /// directive.
    #[error("unrecognised directive inside an update hunk: '{0}'")]
    InvalidHunkLine(String),
    /// A chunk section consumed no lines (for example two consecutive `@@`
    /// headers).
    #[error("update hunk contains no chunk lines (stopped at '{0}')")]
    EmptyHunk(String),
    /// A line inside an `Add File` body did not start with `+`.
    #[error("line in an add-file body must start with '+': '{0}'")]
    InvalidAddFileLine(String),
    /// A chunk points past the end of the original file.
    #[error("{path}: chunk starts at line {index} but the file has {len} lines")]
    ChunkOutOfRange {
        path: String,
        index: usize,
        len: usize,
    },
    /// Chunks overlap or are not in ascending order.
    #[error("{path}: chunk at line {index} overlaps the previous chunk")]
    ChunkOrderViolation { path: String, index: usize },
    /// The applier refuses to touch absolute paths.
    #[error("absolute paths are not allowed: '{0}'")]
    AbsolutePath(String),
    /// An injected filesystem callback failed.
    #[error("I/O error while applying '{path}': {source}")]
    Filesystem {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// --- Data Structures ---

/// The kind of change a [`PatchAction`] performs on its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Add,
    Delete,
    Update,
}

/// One contiguous edit inside an `Update` action.
///
/// `orig_index` is the line index in the original file where the edit
/// begins; `del_lines` are removed there and `ins_lines` inserted in their
/// place. Within one action, chunks are non-overlapping and strictly
/// ascending in `orig_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub orig_index: usize,
    pub del_lines: Vec<String>,
    pub ins_lines: Vec<String>,
}

/// All parsed changes for a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchAction {
    pub kind: ActionKind,
    /// Ordered edits; empty for `Add` and `Delete`.
    pub chunks: Vec<Chunk>,
    /// Full text of the file being created; present iff `kind` is `Add`.
    pub new_file: Option<String>,
    /// Rename target; only valid when `kind` is `Update`.
    pub move_path: Option<String>,
}

/// A parsed patch block: a map from source path to the action taken on it.
///
/// Each path appears at most once; a duplicate is a fatal parse error. The
/// map is ordered so iteration (and therefore apply order) is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    pub actions: BTreeMap<String, PatchAction>,
}

/// The final state of one file after a patch, as recorded in a [`Commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Add {
        new_content: String,
    },
    Delete {
        old_content: String,
    },
    Update {
        old_content: String,
        new_content: String,
        move_path: Option<String>,
    },
}

/// The set of file states a patch resolves to. Paths whose content is
/// unchanged are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Commit {
    pub changes: BTreeMap<String, FileChange>,
}

// --- Sanitizer ---

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\*\*\*|---|\+\+\+|@@|[ +-])").expect("token regex"));

/// Transforms raw patch text into a clean sequence of lines.
///
/// Line endings are normalised to `\n`, outer whitespace is trimmed, and
/// only lines that look like patch tokens (directives, hunk headers, and
/// ` `/`+`/`-` chunk lines) survive — everything else is model narration
/// and is dropped silently. Surviving lines are right-trimmed and stripped
/// of stray control characters (with a warning per altered line). Leading
/// whitespace is never touched; it is significant for diff semantics.
pub fn sanitize_patch_text(text: &str) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines = Vec::new();
    for line in normalized.trim().split('\n') {
        if !TOKEN_RE.is_match(line) {
            trace!("sanitizer dropped non-patch line: '{}'", line);
            continue;
        }
        let line = line.trim_end();
        if line.chars().any(is_stripped_control) {
            let cleaned: String = line.chars().filter(|c| !is_stripped_control(*c)).collect();
            warn!("stripped control characters from patch line: '{}'", cleaned);
            lines.push(cleaned);
        } else {
            lines.push(line.to_string());
        }
    }
    lines
}

/// Control characters removed by the sanitizer. Tabs stay; newlines are
/// already gone by the time this runs.
fn is_stripped_control(c: char) -> bool {
    matches!(
        c,
        '\u{0000}'..='\u{0008}' | '\u{000B}' | '\u{000C}' | '\u{000E}'..='\u{001F}'
    )
}

// --- Header Repair ---

static HUNK_HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^@@ -(\d+)(?:[ ,](\d+))? \+(\d+)(?:[ ,](\d+))? @@$").expect("hunk header regex")
});

/// Rewrites a recognisable numeric hunk header into the canonical
/// `@@ -S,D +S,I @@` form, supplying `0` for missing counts.
///
/// Returns `None` for every other line, including `@@` headers that carry
/// anchor text rather than line numbers.
///
/// # Example
///
/// ```
/// assert_eq!(
///     vpatch::repair_hunk_header("@@ -3 +3 @@"),
///     Some("@@ -3,0 +3,0 @@".to_string())
/// );
/// assert_eq!(vpatch::repair_hunk_header("@@ def f():"), None);
/// ```
pub fn repair_hunk_header(line: &str) -> Option<String> {
    let caps = HUNK_HEADER_RE.captures(line)?;
    let del = caps.get(2).map_or("0", |m| m.as_str());
    let ins = caps.get(4).map_or("0", |m| m.as_str());
    Some(format!("@@ -{},{} +{},{} @@", &caps[1], del, &caps[3], ins))
}

/// Sanitizes and header-repairs raw patch text in one pass.
fn patch_lines(text: &str) -> Vec<String> {
    sanitize_patch_text(text)
        .into_iter()
        .map(|line| repair_hunk_header(&line).unwrap_or(line))
        .collect()
}

// --- Block Splitting ---

/// Splits raw patch text into self-contained blocks.
///
/// A block spans from a `*** Begin Patch` line to the next `*** End Patch`
/// line; both markers are kept. Lines outside any block are ignored. The
/// input is sanitized and header-repaired first, so the returned blocks are
/// ready for [`text_to_patch`].
///
/// # Errors
///
/// Returns [`DiffError::UnterminatedBlock`] if a `*** Begin Patch` is never
/// closed.
pub fn split_patch_text(text: &str) -> Result<Vec<String>, DiffError> {
    let lines = patch_lines(text);
    let blocks = split_blocks(&lines)?;
    Ok(blocks.into_iter().map(|block| block.join("\n")).collect())
}

fn split_blocks(lines: &[String]) -> Result<Vec<Vec<String>>, DiffError> {
    let mut blocks = Vec::new();
    let mut block: Vec<String> = Vec::new();
    let mut begin_line: Option<usize> = None;

    for (i, line) in lines.iter().enumerate() {
        if begin_line.is_none() {
            if line.as_str() == BEGIN_PATCH_MARKER {
                begin_line = Some(i + 1);
                block.push(line.clone());
            } else {
                trace!("ignoring line outside any patch block: '{}'", line);
            }
        } else {
            block.push(line.clone());
            if line.as_str() == END_PATCH_MARKER {
                blocks.push(std::mem::take(&mut block));
                begin_line = None;
            }
        }
    }

    if let Some(start) = begin_line {
        return Err(DiffError::UnterminatedBlock(start));
    }
    Ok(blocks)
}

// --- Pre-scan ---

/// Lists the existing files a patch will read, in first-seen order.
///
/// These are the targets of `Update File` and `Delete File` directives; the
/// host loads them before calling [`text_to_patch`]. `Add File` targets are
/// not included — they do not exist yet.
///
/// # Example
///
/// ```
/// let text = "*** Begin Patch\n*** Update File: a.txt\n*** Delete File: b.txt\n*** Add File: c.txt\n+x\n*** End Patch";
/// assert_eq!(vpatch::identify_files_needed(text), vec!["a.txt", "b.txt"]);
/// ```
pub fn identify_files_needed(text: &str) -> Vec<String> {
    scan_paths(text, &[UPDATE_FILE_MARKER, DELETE_FILE_MARKER])
}

/// Lists the files a patch will create, in first-seen order.
pub fn identify_files_added(text: &str) -> Vec<String> {
    scan_paths(text, &[ADD_FILE_MARKER])
}

fn scan_paths(text: &str, prefixes: &[&str]) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.trim_end();
        for prefix in prefixes {
            if let Some(path) = line.strip_prefix(prefix) {
                let path = path.trim().to_string();
                if !path.is_empty() && !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
    }
    paths
}

// --- Parser ---

/// Parses a single patch block into a [`Patch`] and its fuzz score.
///
/// The input may be raw model output: it is sanitized and header-repaired
/// internally, and the first surviving line must be `*** Begin Patch`. The
/// parse is a pure function of its inputs — no I/O happens here, which is
/// why the original contents of every updated or deleted file must be
/// provided in `originals`.
///
/// # Errors
///
/// Any of the parse- or match-level [`DiffError`] variants. Notably,
/// context that cannot be located under any tolerance is
/// [`DiffError::InvalidContext`]; the engine never guesses.
pub fn text_to_patch(
    text: &str,
    originals: &HashMap<String, String>,
) -> Result<(Patch, u64), DiffError> {
    let lines = patch_lines(text);
    if lines.first().map(String::as_str) != Some(BEGIN_PATCH_MARKER) {
        return Err(DiffError::InvalidPatchEnvelope);
    }
    let blocks = split_blocks(&lines)?;
    let Some(block) = blocks.first() else {
        return Err(DiffError::InvalidPatchEnvelope);
    };
    if blocks.len() > 1 {
        warn!(
            "patch text contains {} blocks; parsing the first only",
            blocks.len()
        );
    }

    let mut parser = Parser::new(originals, block);
    parser.parse()?;
    debug!(
        "parsed {} action(s) with fuzz {}",
        parser.patch.actions.len(),
        parser.fuzz
    );
    Ok((parser.patch, parser.fuzz))
}

struct Parser<'a> {
    originals: &'a HashMap<String, String>,
    lines: &'a [String],
    /// Position in `lines`; starts past the `*** Begin Patch` marker.
    index: usize,
    patch: Patch,
    fuzz: u64,
}

impl<'a> Parser<'a> {
    fn new(originals: &'a HashMap<String, String>, lines: &'a [String]) -> Self {
        Self {
            originals,
            lines,
            index: 1,
            patch: Patch::default(),
            fuzz: 0,
        }
    }

    /// True when the cursor sits on a line starting with one of `prefixes`,
    /// or past the end of input.
    fn is_done(&self, prefixes: &[&str]) -> bool {
        match self.lines.get(self.index) {
            None => true,
            Some(line) => prefixes.iter().any(|p| line.starts_with(p)),
        }
    }

    /// Consumes the current line if it starts with `prefix`, returning the
    /// remainder.
    fn read_str(&mut self, prefix: &str) -> Option<String> {
        let text = self.lines.get(self.index)?.strip_prefix(prefix)?.to_string();
        self.index += 1;
        Some(text)
    }

    fn parse(&mut self) -> Result<(), DiffError> {
        while !self.is_done(&[END_PATCH_MARKER]) {
            if let Some(path) = self.read_str(UPDATE_FILE_MARKER) {
                let path = path.trim().to_string();
                self.check_duplicate(&path)?;
                let move_path = self.read_str(MOVE_TO_MARKER).map(|p| p.trim().to_string());
                let originals = self.originals;
                let text = originals
                    .get(&path)
                    .ok_or_else(|| DiffError::MissingFile(path.clone()))?;
                debug!("parsing update for '{}'", path);
                let mut action = self.parse_update_body(&path, text)?;
                action.move_path = move_path;
                self.patch.actions.insert(path, action);
                continue;
            }
            if let Some(path) = self.read_str(DELETE_FILE_MARKER) {
                let path = path.trim().to_string();
                self.check_duplicate(&path)?;
                if !self.originals.contains_key(&path) {
                    return Err(DiffError::MissingFile(path));
                }
                debug!("parsing delete for '{}'", path);
                self.patch.actions.insert(
                    path,
                    PatchAction {
                        kind: ActionKind::Delete,
                        chunks: Vec::new(),
                        new_file: None,
                        move_path: None,
                    },
                );
                continue;
            }
            if let Some(path) = self.read_str(ADD_FILE_MARKER) {
                let path = path.trim().to_string();
                self.check_duplicate(&path)?;
                if self.originals.contains_key(&path) {
                    return Err(DiffError::FileAlreadyExists(path));
                }
                debug!("parsing add for '{}'", path);
                let action = self.parse_add_body()?;
                self.patch.actions.insert(path, action);
                continue;
            }
            return Err(DiffError::UnknownLine(self.lines[self.index].clone()));
        }

        if self.lines.get(self.index).map(String::as_str) != Some(END_PATCH_MARKER) {
            return Err(DiffError::InvalidPatchEnvelope);
        }
        self.index += 1;
        Ok(())
    }

    fn check_duplicate(&self, path: &str) -> Result<(), DiffError> {
        if self.patch.actions.contains_key(path) {
            return Err(DiffError::DuplicatePath(path.to_string()));
        }
        Ok(())
    }

    fn parse_add_body(&mut self) -> Result<PatchAction, DiffError> {
        let mut lines: Vec<String> = Vec::new();
        while !self.is_done(FILE_SCOPE_PREFIXES) {
            let line = &self.lines[self.index];
            let Some(content) = line.strip_prefix('+') else {
                return Err(DiffError::InvalidAddFileLine(line.clone()));
            };
            lines.push(content.to_string());
            self.index += 1;
        }
        Ok(PatchAction {
            kind: ActionKind::Add,
            chunks: Vec::new(),
            new_file: Some(lines.join("\n")),
            move_path: None,
        })
    }

    fn parse_update_body(&mut self, path: &str, text: &str) -> Result<PatchAction, DiffError> {
        let orig_lines: Vec<String> = text.split('\n').map(String::from).collect();
        let mut action = PatchAction {
            kind: ActionKind::Update,
            chunks: Vec::new(),
            new_file: None,
            move_path: None,
        };
        // Position in `orig_lines` the next section may match at or after.
        let mut cursor = 0usize;

        while !self.is_done(UPDATE_TERMINATORS) {
            let mut saw_header = false;
            if let Some(anchor) = self.read_str(ANCHOR_MARKER) {
                saw_header = true;
                if !anchor.trim().is_empty() {
                    cursor = self.seek_anchor(&orig_lines, &anchor, cursor, path);
                }
            } else if self.lines[self.index].as_str() == "@@" {
                saw_header = true;
                self.index += 1;
            }
            if !saw_header && cursor != 0 {
                return Err(DiffError::InvalidHunkLine(self.lines[self.index].clone()));
            }

            let section = peek_next_section(self.lines, self.index)?;
            let (found, fuzz) = find_context(&orig_lines, &section.context, cursor, section.eof);
            let Some(match_index) = found else {
                let context = section.context.join("\n");
                return Err(if section.eof {
                    DiffError::InvalidEofContext {
                        path: path.to_string(),
                        context,
                    }
                } else {
                    DiffError::InvalidContext {
                        path: path.to_string(),
                        cursor,
                        context,
                    }
                });
            };
            if fuzz > 0 {
                debug!(
                    "  context in '{}' located at line {} with fuzz {}",
                    path, match_index, fuzz
                );
            }
            self.fuzz += fuzz;

            for mut chunk in section.chunks {
                chunk.orig_index += match_index;
                action.chunks.push(chunk);
            }
            cursor = match_index + section.context.len();
            self.index = section.end_index;
        }
        Ok(action)
    }

    /// Seeks an `@@` anchor line in the original file, advancing past it on
    /// success. An anchor that cannot be found is ignored — the section's
    /// context alone must then locate the chunk.
    fn seek_anchor(
        &mut self,
        orig_lines: &[String],
        anchor: &str,
        cursor: usize,
        path: &str,
    ) -> usize {
        for (i, line) in orig_lines.iter().enumerate().skip(cursor) {
            if line.as_str() == anchor {
                return i + 1;
            }
        }
        for (i, line) in orig_lines.iter().enumerate().skip(cursor) {
            if line.trim() == anchor.trim() {
                self.fuzz += TRAILING_WHITESPACE_FUZZ;
                return i + 1;
            }
        }
        debug!(
            "  anchor '{}' not found in '{}'; relying on context alone",
            anchor, path
        );
        cursor
    }
}

/// One chunk section as collected by the peeker: the expected slice of the
/// original file, the edits relative to it, and where the section ends in
/// the patch.
struct Section {
    context: Vec<String>,
    chunks: Vec<Chunk>,
    end_index: usize,
    eof: bool,
}

/// Scans forward from `start` collecting one section of chunk lines.
///
/// Keep and delete lines build up `context` (the expected original slice);
/// a new [`Chunk`] is emitted each time the mode returns to keep after a
/// run of additions or deletions, with `orig_index` relative to the start
/// of the section. Lines with no recognised prefix are tolerated as
/// context — models routinely drop the leading space.
fn peek_next_section(lines: &[String], start: usize) -> Result<Section, DiffError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Keep,
        Add,
        Delete,
    }

    let mut index = start;
    let mut context: Vec<String> = Vec::new();
    let mut del_lines: Vec<String> = Vec::new();
    let mut ins_lines: Vec<String> = Vec::new();
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut mode = Mode::Keep;

    while index < lines.len() {
        let line = lines[index].as_str();
        if line.starts_with("@@") || UPDATE_TERMINATORS.iter().any(|p| line.starts_with(p)) {
            break;
        }
        if line == "***" {
            break;
        }
        if line.starts_with("***") {
            return Err(DiffError::InvalidHunkLine(line.to_string()));
        }
        index += 1;

        let last_mode = mode;
        let (next_mode, content) = match line.chars().next() {
            Some('+') => (Mode::Add, &line[1..]),
            Some('-') => (Mode::Delete, &line[1..]),
            Some(' ') => (Mode::Keep, &line[1..]),
            None => (Mode::Keep, ""),
            Some(_) => {
                debug!("  treating unprefixed line as context: '{}'", line);
                (Mode::Keep, line)
            }
        };
        mode = next_mode;

        if mode == Mode::Keep && last_mode != Mode::Keep {
            chunks.push(Chunk {
                orig_index: context.len() - del_lines.len(),
                del_lines: std::mem::take(&mut del_lines),
                ins_lines: std::mem::take(&mut ins_lines),
            });
        }
        match mode {
            Mode::Add => ins_lines.push(content.to_string()),
            Mode::Delete => {
                del_lines.push(content.to_string());
                context.push(content.to_string());
            }
            Mode::Keep => context.push(content.to_string()),
        }
    }

    if !del_lines.is_empty() || !ins_lines.is_empty() {
        chunks.push(Chunk {
            orig_index: context.len() - del_lines.len(),
            del_lines,
            ins_lines,
        });
    }

    let mut eof = false;
    if lines.get(index).map(String::as_str) == Some(EOF_MARKER) {
        index += 1;
        eof = true;
    }

    if index == start {
        let stopped_at = lines.get(index).cloned().unwrap_or_default();
        return Err(DiffError::EmptyHunk(stopped_at));
    }

    Ok(Section {
        context,
        chunks,
        end_index: index,
        eof,
    })
}

// --- Context Matching ---

/// Locates `context` inside `lines`, scanning from `start`.
///
/// When `eof` is set the terminal anchor is tried first; if the context
/// only matches elsewhere, the successful rung's penalty is raised to
/// record that the end-of-file hint was ignored.
///
/// Returns the match index and the fuzz penalty of the rung that matched,
/// or `(None, 0)` when every tolerance is exhausted.
fn find_context(
    lines: &[String],
    context: &[String],
    start: usize,
    eof: bool,
) -> (Option<usize>, u64) {
    if eof {
        let tail = lines.len().saturating_sub(context.len());
        trace!(
            "    end-of-file hunk: trying terminal anchor at line {}",
            tail
        );
        let (found, fuzz) = find_context_core(lines, context, tail);
        if found.is_some() {
            return (found, fuzz);
        }
        let (found, fuzz) = find_context_full(lines, context, start);
        if found.is_some() {
            return (found, fuzz + EOF_ANCHOR_IGNORED_FUZZ);
        }
        return (None, 0);
    }
    find_context_full(lines, context, start)
}

/// The full ladder: the equality rungs, then the nearby sliding window.
fn find_context_full(lines: &[String], context: &[String], start: usize) -> (Option<usize>, u64) {
    let (found, fuzz) = find_context_core(lines, context, start);
    if found.is_some() {
        return (found, fuzz);
    }
    match seek_nearby(lines, context, start) {
        Some(index) => (Some(index), NEARBY_WINDOW_FUZZ),
        None => (None, 0),
    }
}

/// The equality rungs. The first rung that succeeds wins and contributes
/// its penalty: byte-exact (0), trailing whitespace ignored (1),
/// surrounding whitespace ignored (100), Unicode canonicalisation (1000).
fn find_context_core(lines: &[String], context: &[String], start: usize) -> (Option<usize>, u64) {
    if context.is_empty() {
        return (Some(start), 0);
    }
    if context.len() > lines.len() {
        return (None, 0);
    }
    let last = lines.len() - context.len();

    for i in start..=last {
        if lines[i..i + context.len()] == context[..] {
            return (Some(i), 0);
        }
    }

    for i in start..=last {
        let hit = context
            .iter()
            .enumerate()
            .all(|(j, c)| lines[i + j].trim_end() == c.trim_end());
        if hit {
            return (Some(i), TRAILING_WHITESPACE_FUZZ);
        }
    }

    for i in start..=last {
        let hit = context
            .iter()
            .enumerate()
            .all(|(j, c)| lines[i + j].trim() == c.trim());
        if hit {
            return (Some(i), SURROUNDING_WHITESPACE_FUZZ);
        }
    }

    let canon_context: Vec<String> = context.iter().map(|c| canonical_line(c)).collect();
    let canon_lines: Vec<String> = lines.iter().map(|l| canonical_line(l)).collect();
    for i in start..=last {
        let hit = canon_context
            .iter()
            .enumerate()
            .all(|(j, c)| canon_lines[i + j] == *c);
        if hit {
            trace!("    matched at line {} after Unicode canonicalisation", i);
            return (Some(i), UNICODE_FOLD_FUZZ);
        }
    }

    (None, 0)
}

/// Last-resort rung: a ±2-line window around the expected position,
/// accepted when at least 80% of the context lines agree byte-for-byte.
/// Candidates are tried in order of distance from `start`.
fn seek_nearby(lines: &[String], context: &[String], start: usize) -> Option<usize> {
    let needed = (4 * context.len() + 4) / 5;
    for delta in [0i64, -1, 1, -2, 2] {
        let candidate = start as i64 + delta;
        if candidate < 0 {
            continue;
        }
        let candidate = candidate as usize;
        if candidate + context.len() > lines.len() {
            continue;
        }
        let hits = context
            .iter()
            .enumerate()
            .filter(|&(j, c)| lines[candidate + j].as_str() == c.as_str())
            .count();
        if hits >= needed {
            debug!(
                "    sliding-window match at line {} ({}/{} context lines agree)",
                candidate,
                hits,
                context.len()
            );
            return Some(candidate);
        }
    }
    None
}

/// Canonical form used by the most tolerant equality rung: surrounding
/// whitespace removed, NFC-normalised, and Unicode look-alikes for dashes,
/// quotes, and spaces folded to ASCII.
///
/// The fold table is deliberately narrow. Alphabetic look-alikes (Cyrillic
/// `а` vs Latin `a`) are not folded — that would create false matches in
/// identifiers — and invisible characters such as U+200B are left in
/// place, so they must agree on both sides.
fn canonical_line(line: &str) -> String {
    line.trim().nfc().map(fold_punctuation).collect()
}

fn fold_punctuation(c: char) -> char {
    match c {
        '\u{2010}'..='\u{2015}' | '\u{2212}' => '-',
        '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{00AB}' | '\u{00BB}' => '"',
        '\u{2018}'..='\u{201B}' => '\'',
        '\u{00A0}' | '\u{2002}'..='\u{200A}' | '\u{202F}' | '\u{205F}' | '\u{3000}' => ' ',
        other => other,
    }
}

// --- Commit Building ---

/// Converts a parsed [`Patch`] plus the original file contents into a
/// [`Commit`] — the final state of every touched file.
///
/// Updates are replayed chunk by chunk against the original snapshot.
/// Files whose content comes out unchanged (and which are not being moved)
/// are omitted from the commit.
///
/// # Errors
///
/// [`DiffError::MissingFile`] if an update or delete target is absent from
/// `originals`; [`DiffError::ChunkOutOfRange`] and
/// [`DiffError::ChunkOrderViolation`] if the chunk list is inconsistent
/// with the file.
pub fn patch_to_commit(
    patch: &Patch,
    originals: &HashMap<String, String>,
) -> Result<Commit, DiffError> {
    let mut commit = Commit::default();
    for (path, action) in &patch.actions {
        match action.kind {
            ActionKind::Delete => {
                let old = originals
                    .get(path)
                    .ok_or_else(|| DiffError::MissingFile(path.clone()))?;
                commit.changes.insert(
                    path.clone(),
                    FileChange::Delete {
                        old_content: old.clone(),
                    },
                );
            }
            ActionKind::Add => {
                commit.changes.insert(
                    path.clone(),
                    FileChange::Add {
                        new_content: action.new_file.clone().unwrap_or_default(),
                    },
                );
            }
            ActionKind::Update => {
                let old = originals
                    .get(path)
                    .ok_or_else(|| DiffError::MissingFile(path.clone()))?;
                let new_content = updated_file_content(path, action, old)?;
                if new_content == *old && action.move_path.is_none() {
                    debug!("'{}' is unchanged; omitting from the commit", path);
                    continue;
                }
                commit.changes.insert(
                    path.clone(),
                    FileChange::Update {
                        old_content: old.clone(),
                        new_content,
                        move_path: action.move_path.clone(),
                    },
                );
            }
        }
    }
    Ok(commit)
}

/// Replays an update action's chunks against the original content.
fn updated_file_content(path: &str, action: &PatchAction, old: &str) -> Result<String, DiffError> {
    let orig_lines: Vec<&str> = old.split('\n').collect();
    let mut dest_lines: Vec<&str> = Vec::new();
    let mut cursor = 0usize;

    for chunk in &action.chunks {
        if chunk.orig_index > orig_lines.len()
            || chunk.orig_index + chunk.del_lines.len() > orig_lines.len()
        {
            return Err(DiffError::ChunkOutOfRange {
                path: path.to_string(),
                index: chunk.orig_index,
                len: orig_lines.len(),
            });
        }
        if cursor > chunk.orig_index {
            return Err(DiffError::ChunkOrderViolation {
                path: path.to_string(),
                index: chunk.orig_index,
            });
        }
        dest_lines.extend_from_slice(&orig_lines[cursor..chunk.orig_index]);
        dest_lines.extend(chunk.ins_lines.iter().map(String::as_str));
        cursor = chunk.orig_index + chunk.del_lines.len();
    }
    dest_lines.extend_from_slice(&orig_lines[cursor..]);
    Ok(dest_lines.join("\n"))
}

// --- Commit Application ---

/// Effects a [`Commit`] through the injected `write` and `remove`
/// callbacks.
///
/// Absolute target paths are refused with [`DiffError::AbsolutePath`].
/// Iteration over the commit is deterministic but not atomic: if a
/// callback fails partway through, the changes applied so far stand.
/// Callers needing atomicity must layer their own transaction.
pub fn apply_commit<W, R>(commit: &Commit, mut write: W, mut remove: R) -> Result<(), DiffError>
where
    W: FnMut(&str, &str) -> std::io::Result<()>,
    R: FnMut(&str) -> std::io::Result<()>,
{
    for (path, change) in &commit.changes {
        reject_absolute(path)?;
        match change {
            FileChange::Delete { .. } => {
                info!("Deleting '{}'", path);
                remove(path).map_err(|source| DiffError::Filesystem {
                    path: path.clone(),
                    source,
                })?;
            }
            FileChange::Add { new_content } => {
                info!("Adding '{}'", path);
                write(path, new_content).map_err(|source| DiffError::Filesystem {
                    path: path.clone(),
                    source,
                })?;
            }
            FileChange::Update {
                new_content,
                move_path,
                ..
            } => match move_path {
                Some(dest) => {
                    reject_absolute(dest)?;
                    info!("Updating '{}' (moving to '{}')", path, dest);
                    write(dest, new_content).map_err(|source| DiffError::Filesystem {
                        path: dest.clone(),
                        source,
                    })?;
                    remove(path).map_err(|source| DiffError::Filesystem {
                        path: path.clone(),
                        source,
                    })?;
                }
                None => {
                    info!("Updating '{}'", path);
                    write(path, new_content).map_err(|source| DiffError::Filesystem {
                        path: path.clone(),
                        source,
                    })?;
                }
            },
        }
    }
    Ok(())
}

fn reject_absolute(path: &str) -> Result<(), DiffError> {
    if std::path::Path::new(path).is_absolute() {
        return Err(DiffError::AbsolutePath(path.to_string()));
    }
    Ok(())
}

// --- Pipeline ---

/// Parses and applies a whole patch, block by block, through injected
/// filesystem callbacks. Returns `"Done!"` on success.
///
/// For each block the needed originals are loaded through `read` (a
/// failure is [`DiffError::FileNotFound`]); added paths are probed as
/// well, so an `Add File` naming an existing file fails with
/// [`DiffError::FileAlreadyExists`] instead of overwriting it.
///
/// # Example
///
/// ```
/// use std::cell::RefCell;
/// use std::collections::HashMap;
/// use std::io;
///
/// let files = RefCell::new(HashMap::from([(
///     "greet.txt".to_string(),
///     "hello\n".to_string(),
/// )]));
///
/// let patch = "*** Begin Patch\n*** Update File: greet.txt\n@@\n-hello\n+goodbye\n*** End Patch";
/// let done = vpatch::process_patch(
///     patch,
///     |p| {
///         files
///             .borrow()
///             .get(p)
///             .cloned()
///             .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, p.to_string()))
///     },
///     |p, c| {
///         files.borrow_mut().insert(p.to_string(), c.to_string());
///         Ok(())
///     },
///     |p| {
///         files.borrow_mut().remove(p);
///         Ok(())
///     },
/// )
/// .unwrap();
/// assert_eq!(done, "Done!");
/// assert_eq!(files.borrow()["greet.txt"], "goodbye\n");
/// ```
pub fn process_patch<F, W, R>(
    text: &str,
    mut read: F,
    mut write: W,
    mut remove: R,
) -> Result<String, DiffError>
where
    F: FnMut(&str) -> std::io::Result<String>,
    W: FnMut(&str, &str) -> std::io::Result<()>,
    R: FnMut(&str) -> std::io::Result<()>,
{
    let blocks = split_patch_text(text)?;
    if blocks.is_empty() {
        return Err(DiffError::InvalidPatchEnvelope);
    }
    info!("Processing {} patch block(s).", blocks.len());

    for (i, block) in blocks.iter().enumerate() {
        debug!("Applying block {}/{}", i + 1, blocks.len());
        let mut originals: HashMap<String, String> = HashMap::new();
        for path in identify_files_needed(block) {
            let content = read(&path).map_err(|_| DiffError::FileNotFound(path.clone()))?;
            originals.insert(path, content);
        }
        // Probe added paths too: adding a file that can already be read is
        // a parse error, not an overwrite.
        for path in identify_files_added(block) {
            if let Ok(content) = read(&path) {
                originals.insert(path, content);
            }
        }

        let (patch, fuzz) = text_to_patch(block, &originals)?;
        if fuzz > 0 {
            warn!("block {} matched with fuzz {}", i + 1, fuzz);
        }
        let commit = patch_to_commit(&patch, &originals)?;
        apply_commit(&commit, &mut write, &mut remove)?;
    }

    Ok("Done!".to_string())
}
