//! Raw scoreboard state: the flat dot-separated key/value dump, parsed key
//! paths, format-version detection, and the accumulator for live deltas.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// The one key whose value names the CRG release that wrote the dump.
pub const VERSION_KEY: &str = "ScoreBoard.Version(release)";

/// Live clock ticks arrive constantly; they never warrant a re-extraction.
const CLOCK_KEY_PREFIX: &str = "ScoreBoard.CurrentGame.Clock";

pub type ExtractResult<T> = Result<T, ExtractError>;

#[derive(Debug)]
pub enum ExtractError {
    Io(std::io::Error),
    Json(serde_json::Error),
    /// Top-level JSON object has no `state` member.
    MissingState,
    EmptyState,
    MissingVersion,
    MalformedVersion(String),
    UnsupportedVersion(u32),
    MalformedKey(String),
    /// A started jam is guaranteed a synthetic initial trip; its absence
    /// means the dump is structurally broken.
    MissingFirstTrip { prd_jam: String, team: u8 },
    Tsv(String),
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::Io(e) => write!(f, "I/O error: {e}"),
            ExtractError::Json(e) => write!(f, "JSON error: {e}"),
            ExtractError::MissingState => write!(f, "game JSON has no 'state' object"),
            ExtractError::EmptyState => write!(f, "game state is empty"),
            ExtractError::MissingVersion => {
                write!(f, "state has no {VERSION_KEY} key")
            }
            ExtractError::MalformedVersion(s) => {
                write!(f, "malformed scoreboard version string: {s:?}")
            }
            ExtractError::UnsupportedVersion(major) => {
                write!(f, "unsupported scoreboard major version: {major}")
            }
            ExtractError::MalformedKey(k) => write!(f, "malformed state key: {k:?}"),
            ExtractError::MissingFirstTrip { prd_jam, team } => write!(
                f,
                "jam {prd_jam} team {team} has no ScoringTrip(1).Duration"
            ),
            ExtractError::Tsv(msg) => write!(f, "TSV parse error: {msg}"),
        }
    }
}

impl std::error::Error for ExtractError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExtractError::Io(e) => Some(e),
            ExtractError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ExtractError {
    fn from(e: std::io::Error) -> Self {
        ExtractError::Io(e)
    }
}

impl From<serde_json::Error> for ExtractError {
    fn from(e: serde_json::Error) -> Self {
        ExtractError::Json(e)
    }
}

// ---------------------------------------------------------------------------
// Key paths
// ---------------------------------------------------------------------------

/// One dot-separated chunk of a state key: either a bare attribute name or an
/// entity reference of the form `Kind(id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Attribute(String),
    EntityRef { kind: String, id: String },
}

impl Segment {
    fn parse(chunk: &str) -> Segment {
        if let Some(open) = chunk.find('(')
            && chunk.ends_with(')')
            && open > 0
        {
            return Segment::EntityRef {
                kind: chunk[..open].to_string(),
                id: chunk[open + 1..chunk.len() - 1].to_string(),
            };
        }
        Segment::Attribute(chunk.to_string())
    }

    /// Attribute name, or entity kind for references.
    pub fn name(&self) -> &str {
        match self {
            Segment::Attribute(name) => name,
            Segment::EntityRef { kind, .. } => kind,
        }
    }

    /// The entity id, if this segment is a reference of the given kind.
    pub fn entity(&self, kind: &str) -> Option<&str> {
        match self {
            Segment::EntityRef { kind: k, id } if k == kind => Some(id),
            _ => None,
        }
    }
}

/// Parsed form of a state key. Holds both the raw chunk strings (occurrence
/// counting and prefix filters operate on these) and the classified segments.
#[derive(Debug, Clone)]
pub struct KeyPath {
    chunks: Vec<String>,
    segments: Vec<Segment>,
}

impl KeyPath {
    pub fn parse(key: &str) -> ExtractResult<KeyPath> {
        let chunks: Vec<String> = key.split('.').map(str::to_string).collect();
        if chunks.len() < 2 || chunks.iter().any(String::is_empty) {
            return Err(ExtractError::MalformedKey(key.to_string()));
        }
        let segments = chunks.iter().map(|c| Segment::parse(c)).collect();
        Ok(KeyPath { chunks, segments })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Raw chunk text at the given depth.
    pub fn chunk(&self, i: usize) -> Option<&str> {
        self.chunks.get(i).map(String::as_str)
    }

    pub fn segment(&self, i: usize) -> Option<&Segment> {
        self.segments.get(i)
    }

    /// Entity id at the given depth, if that segment is a `kind(...)` reference.
    pub fn entity(&self, i: usize, kind: &str) -> Option<&str> {
        self.segments.get(i).and_then(|s| s.entity(kind))
    }
}

// ---------------------------------------------------------------------------
// Format version
// ---------------------------------------------------------------------------

/// CRG dump format generation. v5 wraps keys in a `Game(<id>)` container and
/// numbers teams 1/2 in roster keys; v4 names teams by display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    V4,
    V5,
}

impl FormatVersion {
    pub fn from_major(major: u32) -> ExtractResult<FormatVersion> {
        match major {
            4 => Ok(FormatVersion::V4),
            m if m >= 5 => Ok(FormatVersion::V5),
            m => Err(ExtractError::UnsupportedVersion(m)),
        }
    }
}

/// Parse the `vMAJOR.MINOR.PATCH` release string out of the state map.
pub fn major_version(state: &BTreeMap<String, Value>) -> ExtractResult<u32> {
    let value = state.get(VERSION_KEY).ok_or(ExtractError::MissingVersion)?;
    let text = value
        .as_str()
        .ok_or_else(|| ExtractError::MalformedVersion(value.to_string()))?;
    let major_str = text.split('.').next().unwrap_or_default();
    let digits = major_str
        .strip_prefix('v')
        .ok_or_else(|| ExtractError::MalformedVersion(text.to_string()))?;
    digits
        .parse::<u32>()
        .map_err(|_| ExtractError::MalformedVersion(text.to_string()))
}

// ---------------------------------------------------------------------------
// Raw state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StateEntry {
    pub key: String,
    pub value: Value,
    pub path: KeyPath,
}

/// The full flattened dump, version-detected and (for v5) normalized, with
/// every key path parsed exactly once.
#[derive(Debug, Clone)]
pub struct RawState {
    entries: Vec<StateEntry>,
    by_key: BTreeMap<String, usize>,
    version: FormatVersion,
    version_string: String,
}

impl RawState {
    pub fn from_state_map(state: BTreeMap<String, Value>) -> ExtractResult<RawState> {
        if state.is_empty() {
            return Err(ExtractError::EmptyState);
        }
        let major = major_version(&state)?;
        let version = FormatVersion::from_major(major)?;
        let version_string = state
            .get(VERSION_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let state = match version {
            FormatVersion::V4 => state,
            FormatVersion::V5 => normalize_v5_keys(state),
        };

        let mut entries = Vec::with_capacity(state.len());
        let mut by_key = BTreeMap::new();
        for (key, value) in state {
            let path = KeyPath::parse(&key)?;
            by_key.insert(key.clone(), entries.len());
            entries.push(StateEntry { key, value, path });
        }
        Ok(RawState { entries, by_key, version, version_string })
    }

    pub fn entries(&self) -> &[StateEntry] {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.by_key.get(key).map(|&i| &self.entries[i].value)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn version(&self) -> FormatVersion {
        self.version
    }

    pub fn version_string(&self) -> &str {
        &self.version_string
    }
}

/// v5 pre-pass. A live feed carries both a `CurrentGame` view and one
/// `Game(<id>)` container per known game; an exported file carries only the
/// latter. Keep exactly one view, canonicalize it to `Game(dummy)`, then
/// strip the game container chunk from every key.
fn normalize_v5_keys(state: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    let in_progress = state.keys().any(|k| k.contains(".CurrentGame."));

    let state: BTreeMap<String, Value> = if in_progress {
        log::debug!("in-progress v5 game: dropping non-current Game(...) keys");
        state
            .into_iter()
            .filter(|(k, _)| {
                !k.split('.').nth(1).is_some_and(|c| c.starts_with("Game("))
            })
            .map(|(k, v)| (k.replace("CurrentGame", "Game(dummy)"), v))
            .collect()
    } else {
        state
    };

    state
        .into_iter()
        .map(|(k, v)| {
            let stripped: Vec<&str> = k
                .split('.')
                .filter(|chunk| !chunk.starts_with("Game("))
                .collect();
            (stripped.join("."), v)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Value coercion
// ---------------------------------------------------------------------------

// The live feed delivers real JSON types; the TSV path re-reads everything as
// strings. These accessors accept both.

pub(crate) fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim() {
            "true" | "True" => Some(true),
            "false" | "False" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// File loading
// ---------------------------------------------------------------------------

/// Read a scoreboard JSON export and return its flat `state` map.
///
/// CRG exports are UTF-8, but files that passed through Windows tooling show
/// up as Windows-1252; fall back rather than refusing the file.
pub fn read_game_file(path: &Path) -> ExtractResult<BTreeMap<String, Value>> {
    let bytes = std::fs::read(path)?;
    let text = match std::str::from_utf8(&bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            log::warn!("{}: not valid UTF-8, decoding as Windows-1252", path.display());
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(&bytes);
            decoded.into_owned()
        }
    };
    state_map_from_json_str(&text)
}

/// Pull the flat `state` map out of a full game JSON document.
pub fn state_map_from_json_str(text: &str) -> ExtractResult<BTreeMap<String, Value>> {
    let doc: Value = serde_json::from_str(text)?;
    let state = doc
        .get("state")
        .and_then(Value::as_object)
        .ok_or(ExtractError::MissingState)?;
    Ok(state.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

// ---------------------------------------------------------------------------
// Live accumulation
// ---------------------------------------------------------------------------

/// Accumulated raw state fed by scoreboard deltas.
///
/// A key present with `null` deletes the key and every descendant
/// (`key + "."` prefix). The dirty flag is the only coordination between the
/// feed worker and the consumer: the worker sets it on any meaningful change,
/// the consumer re-extracts from a [`StateCache::snapshot`] and clears it.
/// Deltas may omit the version key, so the last-seen version value is cached
/// and re-injected into every snapshot.
#[derive(Debug, Default)]
pub struct StateCache {
    state: BTreeMap<String, Value>,
    dirty: bool,
    messages_applied: u64,
    last_version: Option<Value>,
}

impl StateCache {
    pub fn new() -> StateCache {
        StateCache::default()
    }

    pub fn apply_delta(&mut self, delta: &serde_json::Map<String, Value>) {
        self.messages_applied += 1;
        for (key, value) in delta {
            if value.is_null() {
                self.state.remove(key);
                let child_prefix = format!("{key}.");
                self.state.retain(|k, _| !k.starts_with(&child_prefix));
            } else {
                if key == VERSION_KEY {
                    self.last_version = Some(value.clone());
                }
                self.state.insert(key.clone(), value.clone());
            }
            if !key.starts_with(CLOCK_KEY_PREFIX) {
                self.dirty = true;
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn messages_applied(&self) -> u64 {
        self.messages_applied
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Immutable copy of the accumulated state, with the cached version key
    /// re-injected if the deltas so far have dropped it.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let mut state = self.state.clone();
        if !state.contains_key(VERSION_KEY)
            && let Some(version) = &self.last_version
        {
            state.insert(VERSION_KEY.to_string(), version.clone());
        }
        state
    }
}
