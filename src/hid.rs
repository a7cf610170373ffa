//! One-way 32-byte identifiers for repositories and actors.
//!
//! HIDs allow joins and aggregation over facts without storing who a repo or
//! actor is. Derivation is deterministic: subjects with a known upstream
//! numeric id hash the id, legacy subjects hash the name. Distinct prefixes
//! keep the repo and actor namespaces disjoint.
//!
//! Very old archive events carry no numeric ids at all; those subjects get a
//! synthetic negative id derived from the name hash, so downstream code can
//! tell real ids (positive) from placeholders (negative).

use sha2::{Digest, Sha256};

/// Raw HID width in bytes.
pub const HID_LEN: usize = 32;

/// Version stamp for the current derivation scheme, recorded on every fact.
pub const HID_KEY_VERSION: i16 = 1;

/// A 32-byte one-way subject identifier.
pub type Hid = [u8; HID_LEN];

fn sha256(prefix: &str, value: &str) -> Hid {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(value.as_bytes());
    hasher.finalize().into()
}

/// HID for a repository with a known upstream numeric id.
pub fn repo_hid_from_id(id: i64) -> Hid {
    sha256("repo_id:", &id.to_string())
}

/// HID for a legacy repository known only by `owner/name`.
pub fn repo_hid_from_name(full_name: &str) -> Hid {
    sha256("repo:", full_name)
}

/// HID for an actor with a known upstream numeric id.
pub fn actor_hid_from_id(id: i64) -> Hid {
    sha256("actor_id:", &id.to_string())
}

/// HID for a legacy actor known only by login. Logins are case-insensitive
/// upstream, so the login is lowercased first.
pub fn actor_hid_from_login(login: &str) -> Hid {
    sha256("actor:", &login.to_lowercase())
}

/// Picks the derivation for a repository: positive ids hash the id, synthetic
/// (negative) or missing ids fall back to the name.
pub fn repo_hid(id: i64, full_name: &str) -> Hid {
    if id > 0 {
        repo_hid_from_id(id)
    } else {
        repo_hid_from_name(full_name)
    }
}

/// Picks the derivation for an actor, mirroring [`repo_hid`].
pub fn actor_hid(id: i64, login: &str) -> Hid {
    if id > 0 {
        actor_hid_from_id(id)
    } else {
        actor_hid_from_login(login)
    }
}

/// Stable synthetic negative id for a legacy repository.
pub fn synthetic_repo_id(full_name: &str) -> i64 {
    synthetic_negative(&repo_hid_from_name(full_name))
}

/// Stable synthetic negative id for a legacy actor.
pub fn synthetic_actor_id(login: &str) -> i64 {
    synthetic_negative(&actor_hid_from_login(login))
}

/// First eight hash bytes, masked positive, then negated. Zero maps to -1 so
/// a synthetic id is never mistaken for "absent".
fn synthetic_negative(hid: &Hid) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hid[..8]);
    let magnitude = (i64::from_be_bytes(bytes)).unsigned_abs() >> 1;
    if magnitude == 0 {
        -1
    } else {
        -(magnitude as i64)
    }
}

/// Hex form used on the columnar wire and in logs.
pub fn hid_hex(hid: &Hid) -> String {
    hex::encode(hid)
}
