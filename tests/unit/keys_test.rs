//! Key rendering through the public API

use lighter_permission_cache::keys::{CacheKey, KeySpace, ParsedKey, Scope, hash_slot};

const AWKWARD_IDS: &[&str] = &[
    "plain",
    "with:colon",
    "{braced}",
    "half{open",
    "close}half",
    "spaces and ünïcode",
    "%41lready-encoded",
];

fn scopes(id: &str) -> Vec<Scope> {
    vec![Scope::Global, Scope::server(id), Scope::channel(id)]
}

#[test]
fn test_every_subject_key_lands_on_one_slot() {
    let keys = KeySpace::new("pc");

    for subject in AWKWARD_IDS {
        let index = keys.subject_index(subject);
        let slot = hash_slot(&index);

        for scope in scopes("s{1}:x") {
            let key = CacheKey::new(*subject, scope);
            assert_eq!(hash_slot(&keys.entry(&key)), slot, "entry of {:?}", subject);
            assert_eq!(hash_slot(&keys.entry_lock(&key)), slot, "lock of {:?}", subject);
        }
    }
}

#[test]
fn test_rendered_keys_parse_back() {
    let keys = KeySpace::new("tenant-a");

    for subject in AWKWARD_IDS {
        for scope in scopes("c:{9}") {
            let key = CacheKey::new(*subject, scope);
            let rendered = keys.entry(&key);
            assert_eq!(rendered.matches('{').count(), 1, "{}", rendered);
            assert_eq!(keys.parse(&rendered).unwrap(), ParsedKey::Entry(key));
        }
        assert_eq!(
            keys.parse(&keys.subject_index(subject)).unwrap(),
            ParsedKey::SubjectIndex(subject.to_string())
        );
    }
}

#[test]
fn test_namespaces_do_not_overlap() {
    let a = KeySpace::new("a");
    let b = KeySpace::new("b");
    let key = CacheKey::new("u1", Scope::Global);

    assert_ne!(a.entry(&key), b.entry(&key));
    assert!(b.parse(&a.entry(&key)).is_err());
}

#[test]
fn test_resilience_keys_are_grouped_per_instance() {
    let keys = KeySpace::new("pc");
    let name = "payments";

    let combined = keys.rate(name, "all", None);
    for key in [
        keys.rate(name, "user", Some("u:1")),
        keys.rate(name, "server", Some("{s}")),
        keys.rate(name, "ip", Some("::1")),
    ] {
        assert_eq!(hash_slot(&key), hash_slot(&combined));
    }

    assert!(keys.breaker_state(name).contains("{payments}"));
    assert!(keys.bulkhead(name).contains("{payments}"));
}
