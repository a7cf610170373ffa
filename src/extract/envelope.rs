//! Event envelope parsing, including very old archive shapes.
//!
//! Modern events carry `actor {id, login}` and `repo {id, name}` objects.
//! Pre-2015 events spread the same identity across `actor` (a bare string),
//! `actor_attributes`, and a `repository` object whose `owner` may itself be
//! an object or a string. The fallback chain here mirrors those shapes in
//! order: `actor_attributes` → `actor` string → `repository.owner`/`name`
//! (object or string) → trailing segments of `repository.url`.
//!
//! Subjects that resolve to a name but not a numeric id get a synthetic
//! negative id so downstream joins stay keyed on something stable.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::hid::{synthetic_actor_id, synthetic_repo_id};

/// One archive event with its payload left opaque.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: String,
    pub event_type: String,
    pub actor_id: i64,
    pub actor_login: String,
    pub repo_id: i64,
    pub repo_name: String,
    pub public: bool,
    pub created_at: DateTime<Utc>,
    pub payload: Value,
}

/// Builds an envelope from one parsed archive line. Returns `None` when the
/// line has no recognizable event shape.
pub fn parse_envelope(value: &Value) -> Option<Envelope> {
    let event_type = value.get("type").and_then(Value::as_str)?.to_string();
    let created_at = value
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(parse_event_time)?;

    let (actor_id, actor_login) = resolve_actor(value);
    let (repo_id, repo_name) = resolve_repo(value);
    if actor_login.is_empty() && repo_name.is_empty() && actor_id == 0 && repo_id == 0 {
        return None;
    }

    let id = match value.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        // Very old events have no id; derive a stable one from the identity.
        _ => legacy_event_id(&event_type, &repo_name, &actor_login, created_at),
    };

    let payload = value.get("payload").cloned().unwrap_or(Value::Null);
    let public = value.get("public").and_then(Value::as_bool).unwrap_or(true);

    Some(Envelope {
        id,
        event_type,
        actor_id,
        actor_login,
        repo_id,
        repo_name,
        public,
        created_at,
        payload,
    })
}

fn resolve_actor(value: &Value) -> (i64, String) {
    // Modern object form.
    if let Some(actor) = value.get("actor").filter(|a| a.is_object()) {
        let login = actor
            .get("login")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(id) = actor.get("id").and_then(Value::as_i64) {
            return (id, login);
        }
        if !login.is_empty() {
            return (synthetic_actor_id(&login), login);
        }
    }

    // Legacy: actor_attributes first, then the bare actor string.
    let attrs = value.get("actor_attributes");
    let login = attrs
        .and_then(|a| a.get("login"))
        .and_then(Value::as_str)
        .or_else(|| value.get("actor").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();
    let id = attrs
        .and_then(|a| a.get("id"))
        .and_then(Value::as_i64)
        .unwrap_or_else(|| {
            if login.is_empty() {
                0
            } else {
                synthetic_actor_id(&login)
            }
        });
    (id, login)
}

fn resolve_repo(value: &Value) -> (i64, String) {
    // Modern object form: repo.name is already "owner/name".
    if let Some(repo) = value.get("repo").filter(|r| r.is_object()) {
        let name = repo
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(id) = repo.get("id").and_then(Value::as_i64) {
            return (id, name);
        }
        if !name.is_empty() {
            return (synthetic_repo_id(&name), name);
        }
    }

    let repository = value.get("repository");
    let name = repository
        .and_then(legacy_repo_name)
        .or_else(|| {
            repository
                .and_then(|r| r.get("url"))
                .and_then(Value::as_str)
                .and_then(repo_name_from_url)
        })
        .unwrap_or_default();
    let id = repository
        .and_then(|r| r.get("id"))
        .and_then(Value::as_i64)
        .unwrap_or_else(|| {
            if name.is_empty() {
                0
            } else {
                synthetic_repo_id(&name)
            }
        });
    (id, name)
}

/// `repository.owner` is an object in some vintages and a string in others.
fn legacy_repo_name(repository: &Value) -> Option<String> {
    let name = repository.get("name").and_then(Value::as_str)?;
    if name.contains('/') {
        return Some(name.to_string());
    }
    let owner = match repository.get("owner")? {
        Value::String(s) => s.as_str(),
        Value::Object(o) => o.get("login").and_then(Value::as_str)?,
        _ => return None,
    };
    if owner.is_empty() {
        return None;
    }
    Some(format!("{}/{}", owner, name))
}

/// Last two path segments of a repository URL.
fn repo_name_from_url(url: &str) -> Option<String> {
    let trimmed = url.trim_end_matches('/');
    let mut segments = trimmed.rsplit('/');
    let name = segments.next()?;
    let owner = segments.next()?;
    if owner.is_empty() || name.is_empty() {
        return None;
    }
    Some(format!("{}/{}", owner, name))
}

/// Archive timestamps come as RFC 3339 in modern files and as
/// `2011/04/01 12:00:00 -0700` in the oldest ones.
fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y/%m/%d %H:%M:%S %z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn legacy_event_id(
    event_type: &str,
    repo_name: &str,
    actor_login: &str,
    created_at: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(repo_name.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(actor_login.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(created_at.timestamp_millis().to_be_bytes());
    format!("legacy:{}", hex::encode(&hasher.finalize()[..12]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_modern_envelope() {
        let value = json!({
            "id": "2489651045",
            "type": "PushEvent",
            "actor": {"id": 583231, "login": "octocat"},
            "repo": {"id": 1296269, "name": "octocat/hello-world"},
            "payload": {"commits": []},
            "public": true,
            "created_at": "2015-01-02T03:04:05Z"
        });
        let env = parse_envelope(&value).unwrap();
        assert_eq!(env.id, "2489651045");
        assert_eq!(env.event_type, "PushEvent");
        assert_eq!(env.actor_id, 583231);
        assert_eq!(env.actor_login, "octocat");
        assert_eq!(env.repo_id, 1296269);
        assert_eq!(env.repo_name, "octocat/hello-world");
        assert!(env.public);
    }

    #[test]
    fn legacy_actor_attributes_win_over_actor_string() {
        let value = json!({
            "type": "PushEvent",
            "actor": "fallback-login",
            "actor_attributes": {"login": "real-login", "id": 99},
            "repository": {"owner": "octo", "name": "repo", "id": 5},
            "created_at": "2011/04/01 12:00:00 -0700",
            "payload": {}
        });
        let env = parse_envelope(&value).unwrap();
        assert_eq!(env.actor_login, "real-login");
        assert_eq!(env.actor_id, 99);
        assert_eq!(env.repo_name, "octo/repo");
        assert_eq!(env.repo_id, 5);
        // -0700 converts to UTC.
        assert_eq!(env.created_at.to_rfc3339(), "2011-04-01T19:00:00+00:00");
    }

    #[test]
    fn legacy_actor_string_fallback_gets_synthetic_id() {
        let value = json!({
            "type": "WatchEvent",
            "actor": "someone",
            "repository": {"owner": {"login": "octo"}, "name": "repo"},
            "created_at": "2012-03-04T05:06:07Z",
            "payload": {}
        });
        let env = parse_envelope(&value).unwrap();
        assert_eq!(env.actor_login, "someone");
        assert_eq!(env.actor_id, synthetic_actor_id("someone"));
        assert!(env.actor_id < 0);
        assert_eq!(env.repo_id, synthetic_repo_id("octo/repo"));
    }

    #[test]
    fn repo_name_falls_back_to_url_tail() {
        let value = json!({
            "type": "WatchEvent",
            "actor": "someone",
            "repository": {"url": "https://github.com/deep/tail/"},
            "created_at": "2012-03-04T05:06:07Z",
            "payload": {}
        });
        let env = parse_envelope(&value).unwrap();
        assert_eq!(env.repo_name, "deep/tail");
    }

    #[test]
    fn missing_event_id_is_synthesized_stably() {
        let value = json!({
            "type": "PushEvent",
            "actor": "someone",
            "repository": {"owner": "octo", "name": "repo"},
            "created_at": "2012-03-04T05:06:07Z",
            "payload": {}
        });
        let a = parse_envelope(&value).unwrap();
        let b = parse_envelope(&value).unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("legacy:"));
    }

    #[test]
    fn numeric_event_id_is_stringified() {
        let value = json!({
            "id": 123456,
            "type": "PushEvent",
            "actor": {"id": 1, "login": "x"},
            "repo": {"id": 2, "name": "x/y"},
            "created_at": "2015-01-02T03:04:05Z",
            "payload": {}
        });
        assert_eq!(parse_envelope(&value).unwrap().id, "123456");
    }

    #[test]
    fn rejects_shapeless_lines() {
        assert!(parse_envelope(&json!({"hello": "world"})).is_none());
        assert!(parse_envelope(&json!({
            "type": "PushEvent",
            "created_at": "not a time"
        }))
        .is_none());
    }
}
