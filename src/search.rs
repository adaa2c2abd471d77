//! Metadata search client
//!
//! Artifacts are located through an HTTP search service that answers with a
//! JSON array of results. Each result names the artifact, its category, the
//! mirrors serving it, and optionally its size, MD5, version, and
//! dependency list. Results are turned directly into [`DownloadJob`]s
//! rooted under the configured writepath.

use crate::config::EngineConfig;
use crate::digest::{Digest, DigestAlgorithm};
use crate::error::{DownloadError, NetworkErrorKind, Result};
use crate::job::{artifact_path, Category, DownloadJob};

use reqwest::Client;
use serde::Deserialize;

/// One row of a search response
#[derive(Debug, Deserialize)]
struct SearchEntry {
    category: String,
    springname: String,
    filename: String,
    mirrors: Vec<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    depends: Vec<String>,
}

/// Build the search request URL
pub fn request_url(base: &str, category: Option<Category>, name: &str) -> String {
    let mut url = format!("{base}?");
    if let Some(cat) = category {
        url.push_str("category=");
        url.push_str(cat.query_name());
        url.push('&');
    }
    url.push_str("springname=");
    url.push_str(&urlencoding::encode(name));
    url
}

/// Query the search service and build jobs from the response
pub async fn search(
    client: &Client,
    config: &EngineConfig,
    category: Option<Category>,
    name: &str,
) -> Result<Vec<DownloadJob>> {
    let url = request_url(&config.search_url, category, name);
    tracing::debug!(%url, "searching");

    let response = client
        .get(&url)
        .header("User-Agent", &config.http.user_agent)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::network(
            NetworkErrorKind::HttpStatus(status.as_u16()),
            format!("search returned: {status}"),
        ));
    }
    let body = response.text().await?;
    parse_results(&body, config)
}

/// Parse a search response into download jobs.
///
/// A malformed document is an error; an entry with an unrecognized category
/// is logged and dropped.
pub fn parse_results(json: &str, config: &EngineConfig) -> Result<Vec<DownloadJob>> {
    let entries: Vec<SearchEntry> = serde_json::from_str(json)?;

    let mut jobs = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(category) = Category::parse(&entry.category) else {
            tracing::warn!(category = %entry.category, name = %entry.springname, "unknown category, dropping");
            continue;
        };

        let path = artifact_path(&config.writepath, category, &entry.filename);
        let mut job = DownloadJob::new(path, entry.springname);
        job.category = Some(category);
        job.validate_tls = config.validate_tls;
        job.version = entry.version;
        job.depends = entry.depends;
        if let Some(size) = entry.size {
            job.size = size;
        }
        if let Some(md5) = &entry.md5 {
            match Digest::from_hex(DigestAlgorithm::Md5, md5) {
                Ok(digest) => job.digest = Some(digest),
                Err(err) => {
                    tracing::warn!(name = %job.name, error = %err, "ignoring bad md5 in metadata");
                }
            }
        }
        for mirror in entry.mirrors {
            if let Err(err) = url::Url::parse(&mirror) {
                tracing::warn!(name = %job.name, mirror = %mirror, error = %err, "skipping bad mirror url");
                continue;
            }
            job.add_mirror(mirror);
        }
        jobs.push(job);
    }
    tracing::debug!(count = jobs.len(), "parsed search results");
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config() -> EngineConfig {
        EngineConfig::new().writepath("/data")
    }

    #[test]
    fn request_url_shapes() {
        assert_eq!(
            request_url("https://svc/json.php", Some(Category::Map), "Small Divide"),
            "https://svc/json.php?category=map&springname=Small%20Divide"
        );
        assert_eq!(
            request_url("https://svc/json.php", None, "tag"),
            "https://svc/json.php?springname=tag"
        );
    }

    #[test]
    fn parses_full_entry() {
        let json = r#"[{
            "category": "map",
            "springname": "Small Divide",
            "filename": "small_divide.sd7",
            "mirrors": ["http://a/small.sd7", "http://b/small.sd7"],
            "version": "1",
            "md5": "65a8e27d8879283831b664bd8b7f0ad4",
            "size": 1048576,
            "depends": ["Map Blobs 0.6"]
        }]"#;

        let jobs = parse_results(json, &test_config()).unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.name, "Small Divide");
        assert_eq!(job.path, PathBuf::from("/data/maps/small_divide.sd7"));
        assert_eq!(job.mirrors.len(), 2);
        assert_eq!(job.size, 1_048_576);
        assert_eq!(job.depends, vec!["Map Blobs 0.6".to_string()]);
        assert!(job.digest.is_some());
        assert_eq!(job.version.as_deref(), Some("1"));
    }

    #[test]
    fn engine_variants_route_to_engine_dir() {
        let json = r#"[{
            "category": "engine_linux64",
            "springname": "engine 105.0",
            "filename": "spring_105.0.tar.gz",
            "mirrors": ["http://a/engine.tar.gz"]
        }]"#;

        let jobs = parse_results(json, &test_config()).unwrap();
        assert_eq!(jobs[0].category, Some(Category::Engine));
        assert_eq!(
            jobs[0].path,
            PathBuf::from("/data/engine/spring_105.0.tar.gz")
        );
    }

    #[test]
    fn unknown_category_is_dropped() {
        let json = r#"[
            {"category": "lobby", "springname": "x", "filename": "x.zip", "mirrors": ["http://a/x"]},
            {"category": "game", "springname": "y", "filename": "y.sdz", "mirrors": ["http://a/y"]}
        ]"#;

        let jobs = parse_results(json, &test_config()).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "y");
    }

    #[test]
    fn missing_mirrors_is_an_error() {
        let json = r#"[{"category": "map", "springname": "x", "filename": "x.sd7"}]"#;
        assert!(parse_results(json, &test_config()).is_err());
    }

    #[test]
    fn bad_md5_is_ignored() {
        let json = r#"[{
            "category": "map", "springname": "x", "filename": "x.sd7",
            "mirrors": ["http://a/x"], "md5": "not-hex"
        }]"#;
        let jobs = parse_results(json, &test_config()).unwrap();
        assert!(jobs[0].digest.is_none());
    }

    #[test]
    fn unparseable_mirror_urls_are_skipped() {
        let json = r#"[{
            "category": "map", "springname": "x", "filename": "x.sd7",
            "mirrors": ["not a url", "http://a/x.sd7"]
        }]"#;
        let jobs = parse_results(json, &test_config()).unwrap();
        assert_eq!(jobs[0].mirrors.len(), 1);
        assert_eq!(jobs[0].mirrors[0].url, "http://a/x.sd7");
    }

    #[test]
    fn traversal_filenames_are_escaped() {
        let json = r#"[{
            "category": "map", "springname": "evil", "filename": "../../escape.sd7",
            "mirrors": ["http://a/e"]
        }]"#;
        let jobs = parse_results(json, &test_config()).unwrap();
        assert_eq!(jobs[0].path, PathBuf::from("/data/maps/.._.._escape.sd7"));
    }
}
