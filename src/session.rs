//! Driver workflow around the engine
//!
//! A session holds search results, the set of queued downloads, and the
//! engine. `start` expands dependencies, gates on free disk space, runs the
//! engine, and folds the per-job outcomes into a process exit code.

use crate::config::EngineConfig;
use crate::engine::DownloadEngine;
use crate::error::Result;
use crate::job::{artifact_path, escape_filename, Category, DownloadJob};
use crate::search;

use std::path::Path;

/// Everything requested finished
pub const EXIT_OK: i32 = 0;
/// No downloads were queued
pub const EXIT_NOTHING_TO_DO: i32 = 1;
/// Some downloads did not finish
pub const EXIT_UNFINISHED: i32 = 2;
/// Not enough free disk space to start
pub const EXIT_NO_DISK_SPACE: i32 = 5;

/// Free-space floor in MiB kept on top of the artifact sizes; heavily
/// fragmented near-full disks make piece writes crawl.
const DISK_SPACE_HEADROOM_MIB: u64 = 1024;

/// Search results, queued downloads, and the engine driving them
pub struct DownloadSession {
    config: EngineConfig,
    engine: DownloadEngine,
    results: Vec<DownloadJob>,
    queued: Vec<usize>,
}

impl DownloadSession {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let engine = DownloadEngine::new(config.clone())?;
        Ok(Self {
            config,
            engine,
            results: Vec::new(),
            queued: Vec::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine(&self) -> &DownloadEngine {
        &self.engine
    }

    /// Cancel the running engine
    pub fn abort(&self) {
        self.engine.abort();
    }

    /// Query the search service; results are appended to the session pool.
    /// Returns how many results were added.
    pub async fn search(&mut self, category: Option<Category>, name: &str) -> Result<usize> {
        let found = search::search(self.engine.http_client(), &self.config, category, name).await?;
        let count = found.len();
        self.results.extend(found);
        Ok(count)
    }

    pub fn results(&self) -> &[DownloadJob] {
        &self.results
    }

    /// Add a direct-URL job to the pool, bypassing search.
    /// Returns its index.
    pub fn add_by_url(&mut self, category: Option<Category>, filename: &str, url: &str) -> usize {
        let path = match category {
            Some(cat) => artifact_path(&self.config.writepath, cat, filename),
            None => self.config.writepath.join(escape_filename(filename)),
        };
        let mut job = DownloadJob::new(path, filename);
        job.category = category;
        job.validate_tls = self.config.validate_tls;
        job.add_mirror(url);
        self.results.push(job);
        self.results.len() - 1
    }

    /// Mark a search result for download. False for out-of-range indices.
    pub fn queue(&mut self, index: usize) -> bool {
        if index >= self.results.len() {
            tracing::error!(index, "invalid download index");
            return false;
        }
        if !self.queued.contains(&index) {
            self.queued.push(index);
        }
        true
    }

    /// Run all queued downloads and return a process exit code.
    pub async fn start(&mut self) -> Result<i32> {
        let mut jobs: Vec<DownloadJob> = self
            .queued
            .iter()
            .map(|&i| self.results[i].clone())
            .collect();

        if self.config.fetch_depends {
            self.expand_depends(&mut jobs).await;
        }
        if jobs.is_empty() {
            tracing::debug!("nothing to do, no downloads queued");
            return Ok(EXIT_NOTHING_TO_DO);
        }

        let total_bytes: u64 = jobs.iter().map(|j| j.size).sum();
        let needed_mib = total_bytes / (1024 * 1024) + DISK_SPACE_HEADROOM_MIB;
        if let Some(free_mib) = free_disk_mib(&self.config.writepath) {
            tracing::info!(free_mib, "free disk space");
            if free_mib < needed_mib {
                tracing::error!(
                    free_mib,
                    needed_mib,
                    writepath = %self.config.writepath.display(),
                    "insufficient free disk space"
                );
                return Ok(EXIT_NO_DISK_SPACE);
            }
        }

        let ok = self.engine.download(&mut jobs).await?;

        // Reflect final states back into the session pool: queued entries
        // in place, dependency jobs appended.
        for (slot, job) in self.queued.iter().zip(jobs.iter()) {
            self.results[*slot] = job.clone();
        }
        for job in jobs.drain(self.queued.len()..) {
            self.results.push(job);
        }
        self.queued.clear();

        Ok(if ok { EXIT_OK } else { EXIT_UNFINISHED })
    }

    /// Search for each job's dependencies and append any that are not
    /// already present, recursively.
    async fn expand_depends(&self, jobs: &mut Vec<DownloadJob>) {
        let mut index = 0;
        while index < jobs.len() {
            let depends = jobs[index].depends.clone();
            for depend in depends {
                if jobs.iter().any(|j| j.name == depend) {
                    continue;
                }
                tracing::info!(depend = %depend, "adding dependency");
                match search::search(self.engine.http_client(), &self.config, None, &depend).await {
                    Ok(found) => {
                        for job in found {
                            if !jobs.iter().any(|j| j.name == job.name) {
                                jobs.push(job);
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(depend = %depend, error = %err, "dependency search failed");
                    }
                }
            }
            index += 1;
        }
    }
}

/// Available MiB on the filesystem holding `path`; `None` when the mount
/// cannot be identified.
fn free_disk_mib(path: &Path) -> Option<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    disks
        .list()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space() / (1024 * 1024))
}
