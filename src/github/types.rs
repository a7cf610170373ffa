//! Response models for the endpoints the pipeline consumes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Repository payload from `/repositories/{id}` or `/repos/{owner}/{repo}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiRepo {
    pub id: i64,
    pub full_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub stargazers_count: i64,
    #[serde(default)]
    pub forks_count: i64,
    #[serde(default)]
    pub open_issues_count: i64,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub pushed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Actor payload from `/user/{id}` or `/users/{login}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiUser {
    pub id: i64,
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub blog: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub followers: i64,
    #[serde(default)]
    pub following: i64,
    #[serde(default)]
    pub public_repos: i64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// File payload from the contents endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiContents {
    pub name: String,
    pub path: String,
    pub sha: String,
    #[serde(default)]
    pub size: i64,
}

/// One gist from the listing endpoint; only filenames matter here.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiGist {
    pub id: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub files: HashMap<String, ApiGistFile>,
}

/// A file inside a gist.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiGistFile {
    pub filename: String,
}

impl ApiGist {
    /// Whether this public gist carries a file with the given name.
    pub fn has_file(&self, filename: &str) -> bool {
        self.public && self.files.values().any(|f| f.filename == filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn repo_decodes_with_sparse_fields() {
        let repo: ApiRepo = serde_json::from_value(json!({
            "id": 42,
            "full_name": "octo/repo"
        }))
        .unwrap();
        assert_eq!(repo.id, 42);
        assert_eq!(repo.stargazers_count, 0);
        assert!(repo.default_branch.is_none());
    }

    #[test]
    fn gist_file_lookup_requires_public() {
        let gist: ApiGist = serde_json::from_value(json!({
            "id": "g1",
            "public": true,
            "files": {"abc.txt": {"filename": "abc.txt"}}
        }))
        .unwrap();
        assert!(gist.has_file("abc.txt"));
        assert!(!gist.has_file("zzz.txt"));

        let private: ApiGist = serde_json::from_value(json!({
            "id": "g2",
            "public": false,
            "files": {"abc.txt": {"filename": "abc.txt"}}
        }))
        .unwrap();
        assert!(!private.has_file("abc.txt"));
    }
}
