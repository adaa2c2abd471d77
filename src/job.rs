//! Download jobs and piece state
//!
//! A [`DownloadJob`] describes one artifact: where it lands on disk, how it
//! is split into pieces, which mirrors serve it, and which digests prove it
//! arrived intact.

use crate::digest::Digest;
use crate::mirror::Mirror;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Artifact category, routed to a subdirectory of the writepath
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Engine builds (`engine`, `engine_linux64`, `engine_windows`, ...)
    Engine,
    Map,
    Game,
}

impl Category {
    /// Parse a metadata category string; `None` for unrecognized categories
    pub fn parse(s: &str) -> Option<Self> {
        if s.starts_with("engine") {
            Some(Self::Engine)
        } else if s == "map" {
            Some(Self::Map)
        } else if s == "game" {
            Some(Self::Game)
        } else {
            None
        }
    }

    /// Subdirectory under the writepath where this category lands
    pub fn subdir(self) -> &'static str {
        match self {
            Self::Engine => "engine",
            Self::Map => "maps",
            Self::Game => "games",
        }
    }

    /// Value used in search-service queries
    pub fn query_name(self) -> &'static str {
        match self {
            Self::Engine => "engine",
            Self::Map => "map",
            Self::Game => "game",
        }
    }
}

/// Per-piece download state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PieceState {
    /// Not downloaded yet
    Pending,
    /// Claimed by an in-flight transfer
    Downloading,
    /// On disk and verified
    Finished,
}

/// One fixed-size span of the artifact, independently verifiable
#[derive(Debug, Clone)]
pub struct Piece {
    /// Expected SHA-1 of this piece's bytes, when known
    pub sha1: Option<Digest>,
    pub state: PieceState,
}

impl Piece {
    pub fn new(sha1: Option<Digest>) -> Self {
        Self {
            sha1,
            state: PieceState::Pending,
        }
    }
}

/// Overall job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Finished,
    Failed,
}

/// One artifact to fetch
#[derive(Debug, Clone)]
pub struct DownloadJob {
    /// Display name (the metadata service's artifact name)
    pub name: String,
    /// Destination path
    pub path: PathBuf,
    pub category: Option<Category>,
    /// Total byte size; 0 when unknown
    pub size: u64,
    /// Piece size in bytes; 0 for single-shot transfers
    pub piece_size: u64,
    pub pieces: Vec<Piece>,
    /// Expected whole-file MD5, when known
    pub digest: Option<Digest>,
    pub mirrors: Vec<Mirror>,
    /// Concurrent transfers for this job, clamped by the engine
    pub parallelism: u32,
    pub state: JobState,
    /// Names of artifacts this one depends on
    pub depends: Vec<String>,
    pub version: Option<String>,
    /// Verify the server certificate on TLS mirrors
    pub validate_tls: bool,
}

impl DownloadJob {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            category: None,
            size: 0,
            piece_size: 0,
            pieces: Vec::new(),
            digest: None,
            mirrors: Vec::new(),
            parallelism: 1,
            state: JobState::Running,
            depends: Vec::new(),
            version: None,
            validate_tls: true,
        }
    }

    pub fn add_mirror(&mut self, url: impl Into<String>) {
        self.mirrors.push(Mirror::new(url));
    }

    /// Attach piece metadata. `sha1s[i]` is the expected digest of piece `i`.
    pub fn set_pieces(&mut self, piece_size: u64, sha1s: Vec<Option<Digest>>) {
        self.piece_size = piece_size;
        self.pieces = sha1s.into_iter().map(Piece::new).collect();
    }

    pub fn usable_mirror_count(&self) -> usize {
        self.mirrors.iter().filter(|m| m.is_usable()).count()
    }

    pub fn is_finished(&self) -> bool {
        self.state == JobState::Finished
    }

    pub fn finished_piece_count(&self) -> usize {
        self.pieces
            .iter()
            .filter(|p| p.state == PieceState::Finished)
            .count()
    }

    /// Bytes known to be done, for progress reporting
    pub fn finished_bytes(&self) -> u64 {
        if self.pieces.is_empty() {
            return if self.is_finished() { self.size } else { 0 };
        }
        let full = self.finished_piece_count() as u64 * self.piece_size;
        full.min(self.size)
    }
}

/// Sanitize a filename from metadata before joining it to the writepath.
///
/// Path separators, traversal components and control characters never make
/// it into the final name; everything questionable becomes an underscore.
pub fn escape_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => out.push('_'),
            c if c.is_control() => out.push('_'),
            c => out.push(c),
        }
    }
    // A name of only dots would climb out of the target directory
    if out.chars().all(|c| c == '.') {
        out = out.replace('.', "_");
    }
    out
}

/// Destination path for a metadata result: `<writepath>/<subdir>/<escaped>`
pub fn artifact_path(writepath: &Path, category: Category, filename: &str) -> PathBuf {
    writepath.join(category.subdir()).join(escape_filename(filename))
}
