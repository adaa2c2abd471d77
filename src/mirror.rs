//! Mirror health and ranking
//!
//! Every job carries its own mirror pool. A mirror that fails a transfer,
//! breaks protocol, or serves corrupt bytes is marked broken and stays
//! excluded for the rest of the job.

use serde::{Deserialize, Serialize};

/// Score assigned to mirrors that have not been measured yet, so fresh
/// mirrors rank above zero and get a chance to be tried.
const UNTRIED_SCORE: f64 = 1.0;

/// Health state of a single mirror within a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorStatus {
    /// Never used during this job
    Unknown,
    /// At least one successful transfer
    Ok,
    /// Failed; excluded from selection for the rest of the job
    Broken,
}

/// One of several URLs serving the same artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mirror {
    pub url: String,
    pub status: MirrorStatus,
    /// Last observed download speed in bytes/sec
    pub speed: f64,
}

impl Mirror {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: MirrorStatus::Unknown,
            speed: 0.0,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.status != MirrorStatus::Broken
    }

    /// Replace the observed speed with the latest sample
    pub fn update_speed(&mut self, bytes_per_sec: f64) {
        self.speed = bytes_per_sec;
    }

    fn rank(&self) -> f64 {
        match self.status {
            MirrorStatus::Broken => f64::NEG_INFINITY,
            MirrorStatus::Unknown => UNTRIED_SCORE,
            MirrorStatus::Ok => self.speed,
        }
    }
}

/// Index of the fastest usable mirror, or `None` when every mirror is
/// broken. Earlier mirrors win ties, so the primary stays preferred until
/// another mirror actually measures faster.
pub fn fastest_mirror(mirrors: &[Mirror]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, mirror) in mirrors.iter().enumerate() {
        if !mirror.is_usable() {
            continue;
        }
        let rank = mirror.rank();
        match best {
            Some((_, best_rank)) if rank <= best_rank => {}
            _ => best = Some((index, rank)),
        }
    }
    best.map(|(i, _)| i)
}
