//! Reply-address generation.
//!
//! Reply addresses are random (version 4) UUIDs in the canonical
//! hyphenated form, e.g. `3f2b8c1e-9d4a-4c7e-b1a2-5e6f7a8b9c0d`. They only
//! need to be unique for the lifetime of a client session; nothing relies
//! on them being unguessable.

use uuid::Uuid;

/// Generate a fresh reply address.
pub fn reply_address() -> String {
    Uuid::new_v4().hyphenated().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_layout_is_canonical() {
        let id = reply_address();
        assert_eq!(id.len(), 36);
        for (idx, ch) in id.char_indices() {
            if [8, 13, 18, 23].contains(&idx) {
                assert_eq!(ch, '-', "hyphen expected at {idx} in {id}");
            } else {
                assert!(ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase(), "{id}");
            }
        }
    }

    #[test]
    fn test_version_and_variant_nibbles() {
        let id = reply_address();
        assert_eq!(&id[14..15], "4");
        assert!("89ab".contains(&id[19..20]), "variant nibble in {id}");
    }

    #[test]
    fn test_no_collisions_across_many_pending_requests() {
        let ids: HashSet<String> = (0..10_000).map(|_| reply_address()).collect();
        assert_eq!(ids.len(), 10_000);
    }
}
