//! # armory-dl
//!
//! A multi-mirror, piece-verified download engine for game artifacts.
//!
//! ## Features
//!
//! - **Piece-wise transfers**: files are split into fixed-size pieces and
//!   fetched concurrently over HTTP byte ranges
//! - **Mirror pools**: every artifact can be served by several mirrors;
//!   broken ones are benched, fast ones are preferred
//! - **Verified**: each piece is checked against its SHA-1, whole files
//!   against their MD5; valid bytes already on disk are never re-fetched
//! - **Graceful degradation**: servers that refuse range requests fall
//!   back to a single linear transfer without restarting the job
//! - **Metadata search**: artifacts are located by name and category
//!   through an HTTP search service
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use armory_dl::{Category, DownloadSession, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::default().writepath("./downloads");
//!     let mut session = DownloadSession::new(config)?;
//!
//!     let found = session.search(Some(Category::Map), "Small Divide").await?;
//!     for index in 0..found {
//!         session.queue(index);
//!     }
//!
//!     let exit_code = session.start().await?;
//!     std::process::exit(exit_code);
//! }
//! ```

// Modules
pub mod config;
pub mod digest;
pub mod engine;
pub mod error;
pub mod job;
pub mod mirror;
pub mod piece_file;
pub mod search;
pub mod session;
mod slot;

// Re-exports for convenience
pub use config::{EngineConfig, HttpConfig};
pub use digest::{Digest, DigestAlgorithm};
pub use engine::{DownloadEngine, ProgressListener};
pub use error::{
    DownloadError, NetworkErrorKind, ProtocolErrorKind, Result, StorageErrorKind,
};
pub use job::{artifact_path, escape_filename, Category, DownloadJob, JobState, Piece, PieceState};
pub use mirror::{fastest_mirror, Mirror, MirrorStatus};
pub use piece_file::PieceFile;
pub use session::{
    DownloadSession, EXIT_NOTHING_TO_DO, EXIT_NO_DISK_SPACE, EXIT_OK, EXIT_UNFINISHED,
};
