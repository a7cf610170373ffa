//! Turns event envelopes into zero or more user-authored utterances.

pub mod envelope;

use chrono::{DateTime, Utc};
use serde_json::Value;

pub use envelope::{parse_envelope, Envelope};

/// Where an utterance came from within its event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Source {
    Commit,
    Issue,
    Pr,
    Comment,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Commit => "commit",
            Source::Issue => "issue",
            Source::Pr => "pr",
            Source::Comment => "comment",
        }
    }

    /// Small integer form used by the columnar enum columns.
    pub fn as_enum(self) -> i8 {
        match self {
            Source::Commit => 1,
            Source::Issue => 2,
            Source::Pr => 3,
            Source::Comment => 4,
        }
    }
}

/// One extracted utterance, before normalization and consent gating.
#[derive(Debug, Clone)]
pub struct RawUtterance {
    pub event_id: String,
    pub event_type: String,
    pub repo_id: i64,
    pub repo_name: String,
    pub actor_id: i64,
    pub actor_login: String,
    pub created_at: DateTime<Utc>,
    pub source: Source,
    pub source_detail: String,
    /// Dense per `(event_id, source)`, starting at 0, in payload order.
    pub ordinal: i32,
    pub text: String,
}

/// Extracts every utterance an envelope carries.
pub fn extract(env: &Envelope) -> Vec<RawUtterance> {
    let mut out = Extractor::new(env);
    match env.event_type.as_str() {
        "PushEvent" => out.push_commits(),
        "IssuesEvent" => out.push_issue_like("issue", Source::Issue),
        "PullRequestEvent" => out.push_issue_like("pull_request", Source::Pr),
        "IssueCommentEvent" => out.push_comment("issue_comment"),
        "PullRequestReviewCommentEvent" => out.push_comment("pr_review_comment"),
        "CommitCommentEvent" => out.push_comment("commit_comment"),
        _ => {}
    }
    out.utterances
}

struct Extractor<'a> {
    env: &'a Envelope,
    utterances: Vec<RawUtterance>,
    /// Ordinal counters are per source, indexed by `Source::as_enum() - 1`.
    next_ordinal: [i32; 4],
}

impl<'a> Extractor<'a> {
    fn new(env: &'a Envelope) -> Self {
        Self {
            env,
            utterances: Vec::new(),
            next_ordinal: [0; 4],
        }
    }

    fn emit(&mut self, source: Source, detail: String, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let slot = (source.as_enum() - 1) as usize;
        let env = self.env;
        self.utterances.push(RawUtterance {
            event_id: env.id.clone(),
            event_type: env.event_type.clone(),
            repo_id: env.repo_id,
            repo_name: env.repo_name.clone(),
            actor_id: env.actor_id,
            actor_login: env.actor_login.clone(),
            created_at: env.created_at,
            source,
            source_detail: detail,
            ordinal: self.next_ordinal[slot],
            text: text.to_string(),
        });
        self.next_ordinal[slot] += 1;
    }

    /// One utterance per commit message. Modern payloads use `commits`;
    /// the oldest ones pack `[sha, email, message, name]` rows into `shas`.
    fn push_commits(&mut self) {
        let payload = &self.env.payload;
        if let Some(commits) = payload.get("commits").and_then(Value::as_array) {
            for commit in commits {
                let message = commit.get("message").and_then(Value::as_str).unwrap_or("");
                let sha = commit.get("sha").and_then(Value::as_str).unwrap_or("");
                self.emit(Source::Commit, format!("push:{}", short_sha(sha)), message);
            }
            return;
        }
        if let Some(shas) = payload.get("shas").and_then(Value::as_array) {
            for row in shas {
                let Some(row) = row.as_array() else { continue };
                let sha = row.first().and_then(Value::as_str).unwrap_or("");
                let message = row.get(2).and_then(Value::as_str).unwrap_or("");
                self.emit(Source::Commit, format!("push:{}", short_sha(sha)), message);
            }
        }
    }

    /// Title then body, when present.
    fn push_issue_like(&mut self, payload_key: &str, source: Source) {
        let Some(item) = self.env.payload.get(payload_key) else {
            return;
        };
        let label = source.as_str();
        if let Some(title) = item.get("title").and_then(Value::as_str) {
            self.emit(source, format!("{}_title", label), title);
        }
        if let Some(body) = item.get("body").and_then(Value::as_str) {
            self.emit(source, format!("{}_body", label), body);
        }
    }

    fn push_comment(&mut self, detail: &str) {
        let body = self
            .env
            .payload
            .get("comment")
            .and_then(|c| c.get("body"))
            .and_then(Value::as_str)
            .unwrap_or("");
        self.emit(Source::Comment, detail.to_string(), body);
    }
}

fn short_sha(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event_type: &str, payload: Value) -> Envelope {
        parse_envelope(&json!({
            "id": "100",
            "type": event_type,
            "actor": {"id": 7, "login": "octocat"},
            "repo": {"id": 42, "name": "octo/repo"},
            "payload": payload,
            "public": true,
            "created_at": "2015-01-02T03:04:05Z"
        }))
        .unwrap()
    }

    #[test]
    fn push_event_yields_one_utterance_per_commit() {
        let env = envelope(
            "PushEvent",
            json!({"commits": [
                {"sha": "aaaaaaaaaaaaaaaa", "message": "first fix"},
                {"sha": "bbbbbbbbbbbbbbbb", "message": "second fix"}
            ]}),
        );
        let utterances = extract(&env);
        assert_eq!(utterances.len(), 2);
        assert_eq!(utterances[0].source, Source::Commit);
        assert_eq!(utterances[0].source_detail, "push:aaaaaaaaaaaa");
        assert_eq!(utterances[0].ordinal, 0);
        assert_eq!(utterances[1].ordinal, 1);
        assert_eq!(utterances[1].text, "second fix");
    }

    #[test]
    fn legacy_shas_rows_are_commits() {
        let env = envelope(
            "PushEvent",
            json!({"shas": [["abc123", "a@b.c", "old style message", "Author"]]}),
        );
        let utterances = extract(&env);
        assert_eq!(utterances.len(), 1);
        assert_eq!(utterances[0].text, "old style message");
        assert_eq!(utterances[0].source_detail, "push:abc123");
    }

    #[test]
    fn issue_yields_title_and_body_in_order() {
        let env = envelope(
            "IssuesEvent",
            json!({"issue": {"title": "It broke", "body": "Details here"}}),
        );
        let utterances = extract(&env);
        assert_eq!(utterances.len(), 2);
        assert_eq!(utterances[0].source, Source::Issue);
        assert_eq!(utterances[0].source_detail, "issue_title");
        assert_eq!(utterances[0].ordinal, 0);
        assert_eq!(utterances[1].source_detail, "issue_body");
        assert_eq!(utterances[1].ordinal, 1);
    }

    #[test]
    fn blank_bodies_do_not_consume_ordinals() {
        let env = envelope(
            "IssuesEvent",
            json!({"issue": {"title": "Only title", "body": "  \n "}}),
        );
        let utterances = extract(&env);
        assert_eq!(utterances.len(), 1);
        assert_eq!(utterances[0].ordinal, 0);
    }

    #[test]
    fn pr_and_comment_sources() {
        let pr = envelope(
            "PullRequestEvent",
            json!({"pull_request": {"title": "Add thing", "body": "why not"}}),
        );
        assert_eq!(extract(&pr)[0].source, Source::Pr);
        assert_eq!(extract(&pr)[0].source_detail, "pr_title");

        let review = envelope(
            "PullRequestReviewCommentEvent",
            json!({"comment": {"body": "nit: rename"}}),
        );
        let utterances = extract(&review);
        assert_eq!(utterances.len(), 1);
        assert_eq!(utterances[0].source, Source::Comment);
        assert_eq!(utterances[0].source_detail, "pr_review_comment");

        let commit_comment = envelope(
            "CommitCommentEvent",
            json!({"comment": {"body": "why this line"}}),
        );
        assert_eq!(extract(&commit_comment)[0].source_detail, "commit_comment");
    }

    #[test]
    fn unhandled_event_types_yield_nothing() {
        let env = envelope("WatchEvent", json!({"action": "started"}));
        assert!(extract(&env).is_empty());
    }

    #[test]
    fn ordinals_are_dense_per_event_and_source() {
        let env = envelope(
            "PushEvent",
            json!({"commits": [
                {"sha": "a", "message": "one"},
                {"sha": "b", "message": "  "},
                {"sha": "c", "message": "three"},
                {"sha": "d", "message": "four"}
            ]}),
        );
        let ordinals: Vec<i32> = extract(&env).iter().map(|u| u.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }
}
