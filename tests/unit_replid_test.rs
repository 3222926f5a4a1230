use kunzitedb::core::replication::replid::{REPL_ID_LEN, ReplicationIdentity, random_repl_id};

#[test]
fn test_random_ids_are_forty_hex_chars() {
    let id = random_repl_id();
    assert_eq!(id.len(), REPL_ID_LEN);
    assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
    assert_ne!(random_repl_id(), random_repl_id());
}

#[test]
fn test_new_identity_has_cleared_secondary() {
    let identity = ReplicationIdentity::new();
    assert_eq!(identity.primary_id.len(), REPL_ID_LEN);
    assert_eq!(identity.secondary_id, "0".repeat(REPL_ID_LEN));
    assert_eq!(identity.secondary_valid_until_offset, -1);
}

#[test]
fn test_promotion_shift_keeps_old_primary_answerable() {
    let mut identity = ReplicationIdentity::new();
    let old_primary = identity.primary_id.clone();
    let master_repl_offset = 5000u64;

    identity.promote_to_leader(master_repl_offset);

    // The old lineage is now the secondary, valid one byte past the offset
    // at the moment of the shift (the next byte a follower will ask for).
    assert_eq!(identity.secondary_id, old_primary);
    assert_eq!(
        identity.secondary_valid_until_offset,
        master_repl_offset as i64 + 1
    );
    assert!(identity.secondary_valid_until_offset > master_repl_offset as i64);
    assert_ne!(identity.primary_id, old_primary);
}

#[test]
fn test_merge_is_involutive() {
    let mut identity = ReplicationIdentity::new();
    let original = identity.primary_id.clone();
    let other = random_repl_id();

    identity.merge_primary(&other);
    assert_ne!(identity.primary_id, original);
    identity.merge_primary(&other);
    // Merging the same ID twice is the identity operation.
    assert_eq!(identity.primary_id, original);
}

#[test]
fn test_merge_is_commutative_across_peers() {
    let a = random_repl_id();
    let b = random_repl_id();

    let mut peer_a = ReplicationIdentity::new();
    peer_a.replace_primary(&a);
    peer_a.merge_primary(&b);

    let mut peer_b = ReplicationIdentity::new();
    peer_b.replace_primary(&b);
    peer_b.merge_primary(&a);

    // Two active peers that merge each other's IDs converge.
    assert_eq!(peer_a.primary_id, peer_b.primary_id);
}

#[test]
fn test_merge_handles_uppercase_hex() {
    let mut identity = ReplicationIdentity::new();
    identity.replace_primary(&"a".repeat(REPL_ID_LEN));
    identity.merge_primary(&"A".repeat(REPL_ID_LEN));
    // a ^ a == 0 nibble-wise, regardless of case.
    assert_eq!(identity.primary_id, "0".repeat(REPL_ID_LEN));
}

#[test]
fn test_clear_secondary_resets_to_sentinel() {
    let mut identity = ReplicationIdentity::new();
    identity.promote_to_leader(42);
    identity.clear_secondary();
    assert_eq!(identity.secondary_id, "0".repeat(REPL_ID_LEN));
    assert_eq!(identity.secondary_valid_until_offset, -1);
}
