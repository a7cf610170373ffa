//! End-to-end fixtures over the non-networked pipeline stages: archive
//! bytes through the reader, extractor, normalizer, consent gate and
//! detector.

use std::io::Write;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;

use saltmine::archive::EventReader;
use saltmine::consent::{ConsentIndex, ConsentState};
use saltmine::detect::{Detector, DetectorSource, Rulepack, TargetType};
use saltmine::extract::{extract, Source};
use saltmine::hid::{actor_hid, repo_hid};
use saltmine::normalize::normalize;

fn gz_lines(lines: &[String]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
    for line in lines {
        enc.write_all(line.as_bytes()).unwrap();
        enc.write_all(b"\n").unwrap();
    }
    enc.finish().unwrap()
}

/// The happy-path hour: one push with two commits, one issue with title and
/// body, one PR review comment.
fn happy_hour_fixture() -> Vec<u8> {
    let push = json!({
        "id": "1001",
        "type": "PushEvent",
        "actor": {"id": 7, "login": "octocat"},
        "repo": {"id": 42, "name": "octo/repo"},
        "payload": {"commits": [
            {"sha": "aaaa111", "message": "fix the build"},
            {"sha": "bbbb222", "message": "this is garbage, @dependabot"}
        ]},
        "public": true,
        "created_at": "2015-01-02T03:10:00Z"
    });
    let issue = json!({
        "id": "1002",
        "type": "IssuesEvent",
        "actor": {"id": 8, "login": "reporter"},
        "repo": {"id": 42, "name": "octo/repo"},
        "payload": {"issue": {"title": "Crash on startup", "body": "It just dies. WTF."}},
        "public": true,
        "created_at": "2015-01-02T03:20:00Z"
    });
    let review = json!({
        "id": "1003",
        "type": "PullRequestReviewCommentEvent",
        "actor": {"id": 9, "login": "reviewer"},
        "repo": {"id": 42, "name": "octo/repo"},
        "payload": {"comment": {"body": "nit: rename this variable"}},
        "public": true,
        "created_at": "2015-01-02T03:30:00Z"
    });
    gz_lines(&[push.to_string(), issue.to_string(), review.to_string()])
}

#[test]
fn happy_path_hour_yields_five_utterances_in_order() {
    let bytes = happy_hour_fixture();
    let mut reader = EventReader::new(bytes.as_slice());

    let mut utterances = Vec::new();
    let mut events = 0;
    for envelope in reader.by_ref() {
        events += 1;
        utterances.extend(extract(&envelope.unwrap()));
    }

    assert_eq!(events, 3);
    assert_eq!(utterances.len(), 5);
    let shape: Vec<(Source, i32)> = utterances.iter().map(|u| (u.source, u.ordinal)).collect();
    assert_eq!(
        shape,
        vec![
            (Source::Commit, 0),
            (Source::Commit, 1),
            (Source::Issue, 0),
            (Source::Issue, 1),
            (Source::Comment, 0),
        ]
    );
    assert_eq!(reader.stats().malformed, 0);
}

#[test]
fn ordinals_are_dense_per_event_and_source() {
    let bytes = happy_hour_fixture();
    let reader = EventReader::new(bytes.as_slice());

    let mut per_key: std::collections::HashMap<(String, Source), Vec<i32>> = Default::default();
    for envelope in reader {
        for u in extract(&envelope.unwrap()) {
            per_key
                .entry((u.event_id.clone(), u.source))
                .or_default()
                .push(u.ordinal);
        }
    }
    for ((event_id, source), ordinals) in per_key {
        let expected: Vec<i32> = (0..ordinals.len() as i32).collect();
        assert_eq!(
            ordinals, expected,
            "ordinals not dense for {} {:?}",
            event_id, source
        );
    }
}

#[test]
fn denied_actor_inserts_no_utterances_but_counts_the_event() {
    let bytes = happy_hour_fixture();
    let reader = EventReader::new(bytes.as_slice());

    // The push author opted out; the gate must drop both commit utterances.
    let mut index = ConsentIndex::empty();
    index.insert(actor_hid(7, "octocat"), ConsentState::Deny, None);

    let mut events = 0;
    let mut written = 0;
    for envelope in reader {
        let envelope = envelope.unwrap();
        events += 1;
        for u in extract(&envelope) {
            let repo = repo_hid(u.repo_id, &u.repo_name);
            let actor = actor_hid(u.actor_id, &u.actor_login);
            if index.allows_fact(&repo, &actor) {
                written += 1;
            }
        }
    }
    assert_eq!(events, 3);
    // The three non-push utterances survive.
    assert_eq!(written, 3);

    // A repo-wide deny blocks everything in the fixture.
    let mut repo_deny = ConsentIndex::empty();
    repo_deny.insert(repo_hid(42, "octo/repo"), ConsentState::Deny, None);
    let bytes = happy_hour_fixture();
    let reader = EventReader::new(bytes.as_slice());
    let mut written = 0;
    for envelope in reader {
        for u in extract(&envelope.unwrap()) {
            let repo = repo_hid(u.repo_id, &u.repo_name);
            let actor = actor_hid(u.actor_id, &u.actor_login);
            if repo_deny.allows_fact(&repo, &actor) {
                written += 1;
            }
        }
    }
    assert_eq!(written, 0);
}

#[test]
fn detector_stamps_template_hit_with_bot_target() {
    let detector = Detector::new(Arc::new(Rulepack::bundled().unwrap()), 3);
    let text = normalize("this is garbage, @dependabot");
    let matches = detector.scan(&text);

    assert_eq!(matches.len(), 1);
    let m = &matches[0];
    assert_eq!(m.term, "garbage");
    assert_eq!(m.source, DetectorSource::Template);
    assert_eq!(detector.version(), 3);
    let target = m.target.as_ref().expect("target expected");
    assert_eq!(target.ttype, TargetType::Bot);
    assert_eq!(target.id, "dependabot");
    assert!(m.span.1 > m.span.0);
}

#[test]
fn extracted_text_normalization_is_idempotent() {
    let bytes = happy_hour_fixture();
    let reader = EventReader::new(bytes.as_slice());
    for envelope in reader {
        for u in extract(&envelope.unwrap()) {
            let once = normalize(&u.text);
            assert_eq!(once, normalize(&once));
        }
    }
}

#[test]
fn detector_finds_hits_in_normalized_fixture_text() {
    let detector = Detector::new(Arc::new(Rulepack::bundled().unwrap()), 1);
    let bytes = happy_hour_fixture();
    let reader = EventReader::new(bytes.as_slice());

    let mut hits = 0;
    for envelope in reader {
        for u in extract(&envelope.unwrap()) {
            hits += detector.scan(&normalize(&u.text)).len();
        }
    }
    // "garbage" in the second commit and "wtf" in the issue body.
    assert!(hits >= 2, "expected at least two hits, got {}", hits);
}
