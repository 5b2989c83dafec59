use std::fs;
use std::io::Write;
use std::path::PathBuf;

use outpost::session::SessionRegistry;

fn test_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("outpost_sessions_{}_{}", std::process::id(), name))
}

#[test]
fn test_resolve_reuses_known_session() {
    let registry = SessionRegistry::new();
    registry.insert("abc");

    let (id, is_new) = registry.resolve_or_create(Some("sessionId=abc; lang=en"));
    assert_eq!(id, "abc");
    assert!(!is_new);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_resolve_unknown_id_creates_fresh_session() {
    let registry = SessionRegistry::new();

    let (id, is_new) = registry.resolve_or_create(Some("sessionId=abc; lang=en"));
    assert_ne!(id, "abc");
    assert!(is_new);
    assert!(registry.contains(&id));
}

#[test]
fn test_resolve_without_cookie_creates() {
    let registry = SessionRegistry::new();

    let (id, is_new) = registry.resolve_or_create(None);
    assert!(is_new);
    assert!(registry.contains(&id));

    let (other, is_new) = registry.resolve_or_create(Some("lang=en"));
    assert!(is_new);
    assert_ne!(id, other);
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_session_id_format() {
    let registry = SessionRegistry::new();
    let (id, _) = registry.resolve_or_create(None);

    assert_eq!(id.len(), 16);
    assert!(id
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
}

#[test]
fn test_cookie_value_ends_at_semicolon() {
    let registry = SessionRegistry::new();
    registry.insert("deadbeef00000000");

    let (id, is_new) =
        registry.resolve_or_create(Some("theme=dark; sessionId=deadbeef00000000; lang=en"));
    assert_eq!(id, "deadbeef00000000");
    assert!(!is_new);
}

#[test]
fn test_file_ownership_counting() {
    let registry = SessionRegistry::new();
    registry.insert("s1");

    assert!(!registry.owns_file("s1", "a.txt"));

    registry.add_uploaded_file("s1", "a.txt");
    registry.add_uploaded_file("s1", "a.txt");
    assert!(registry.owns_file("s1", "a.txt"));

    assert!(registry.remove_file("s1", "a.txt"));
    assert!(registry.owns_file("s1", "a.txt"), "one add still outstanding");

    assert!(registry.remove_file("s1", "a.txt"));
    assert!(!registry.owns_file("s1", "a.txt"));

    assert!(!registry.remove_file("s1", "a.txt"));
    assert!(!registry.remove_file("nope", "a.txt"));
}

#[test]
fn test_ownership_is_per_session() {
    let registry = SessionRegistry::new();
    registry.insert("s1");
    registry.insert("s2");
    registry.add_uploaded_file("s1", "a.txt");

    assert!(registry.owns_file("s1", "a.txt"));
    assert!(!registry.owns_file("s2", "a.txt"));
    assert!(!registry.remove_file("s2", "a.txt"));
    assert!(registry.owns_file("s1", "a.txt"));
}

#[test]
fn test_serialize_deserialize_round_trip() {
    let path = test_file("roundtrip");

    let original = SessionRegistry::new();
    original.insert("aaaa000011112222");
    original.add_uploaded_file("aaaa000011112222", "one.txt");
    original.add_uploaded_file("aaaa000011112222", "two.txt");
    original.insert("bbbb333344445555");

    original.serialize(&path).unwrap();

    let restored = SessionRegistry::new();
    restored.deserialize(&path).unwrap();

    assert_eq!(restored.len(), 2);
    assert!(restored.owns_file("aaaa000011112222", "one.txt"));
    assert!(restored.owns_file("aaaa000011112222", "two.txt"));
    assert!(!restored.owns_file("bbbb333344445555", "one.txt"));
    assert!(restored.contains("bbbb333344445555"));

    fs::remove_file(&path).unwrap();
}

#[test]
fn test_round_trip_produces_byte_equal_dumps() {
    let first = test_file("dump_a");
    let second = test_file("dump_b");

    let original = SessionRegistry::new();
    original.insert("cccc000011112222");
    original.add_uploaded_file("cccc000011112222", "x.bin");
    original.insert("dddd333344445555");
    original.serialize(&first).unwrap();

    let restored = SessionRegistry::new();
    restored.deserialize(&first).unwrap();
    restored.serialize(&second).unwrap();

    assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());

    fs::remove_file(&first).unwrap();
    fs::remove_file(&second).unwrap();
}

#[test]
fn test_deserialize_garbage_clears_registry() {
    let path = test_file("garbage");
    fs::write(&path, b"not a session dump at all").unwrap();

    let registry = SessionRegistry::new();
    registry.insert("pre-existing");

    assert!(registry.deserialize(&path).is_err());
    assert!(registry.is_empty());

    fs::remove_file(&path).unwrap();
}

#[test]
fn test_deserialize_truncated_file_clears_registry() {
    let path = test_file("truncated");

    let original = SessionRegistry::new();
    original.insert("aaaa000011112222");
    original.add_uploaded_file("aaaa000011112222", "one.txt");
    original.serialize(&path).unwrap();

    let full = fs::read(&path).unwrap();
    fs::write(&path, &full[..full.len() / 2]).unwrap();

    let registry = SessionRegistry::new();
    assert!(registry.deserialize(&path).is_err());
    assert!(registry.is_empty());

    fs::remove_file(&path).unwrap();
}

#[test]
fn test_deserialize_rejects_insane_lengths() {
    let path = test_file("insane");

    // Valid prefix, then an id length far past the sanity limit.
    let mut file = fs::File::create(&path).unwrap();
    file.write_all(b"SBSS").unwrap();
    file.write_all(&1u32.to_le_bytes()).unwrap();
    file.write_all(&1u64.to_le_bytes()).unwrap();
    file.write_all(&(1u64 << 32).to_le_bytes()).unwrap();
    drop(file);

    let registry = SessionRegistry::new();
    assert!(registry.deserialize(&path).is_err());
    assert!(registry.is_empty());

    fs::remove_file(&path).unwrap();
}

#[test]
fn test_deserialize_rejects_wrong_magic() {
    let path = test_file("magic");
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"XXXX");
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&0u64.to_le_bytes());
    fs::write(&path, &bytes).unwrap();

    let registry = SessionRegistry::new();
    assert!(registry.deserialize(&path).is_err());

    fs::remove_file(&path).unwrap();
}

#[test]
fn test_serialize_empty_registry() {
    let path = test_file("empty");

    let registry = SessionRegistry::new();
    registry.serialize(&path).unwrap();

    let restored = SessionRegistry::new();
    restored.deserialize(&path).unwrap();
    assert!(restored.is_empty());

    fs::remove_file(&path).unwrap();
}
