//! Integration tests for recoverable ECDSA signing.

use pofcore_crypto::ecdsa::{recover, recover_public_hash, PrivateKey};
use pofcore_types::Hash256;

#[test]
fn distinct_keys_produce_distinct_identities() {
    let a = PrivateKey::random();
    let b = PrivateKey::random();
    assert_ne!(a.public_key().public_hash(), b.public_key().public_hash());
    assert_ne!(a.public_key().to_address(), b.public_key().to_address());
}

#[test]
fn recovery_identifies_the_signer_among_many() {
    let keys: Vec<PrivateKey> = (0..4).map(|_| PrivateKey::random()).collect();
    let digest = Hash256::keccak256(b"challenge");

    for key in &keys {
        let sig = key.sign(&digest).unwrap();
        let recovered = recover_public_hash(&digest, &sig).unwrap();
        assert_eq!(recovered, key.public_key().public_hash());
    }
}

#[test]
fn signature_is_bound_to_digest() {
    let key = PrivateKey::random();
    let sig_one = key.sign(&Hash256::keccak256(b"one")).unwrap();
    let sig_two = key.sign(&Hash256::keccak256(b"two")).unwrap();
    assert_ne!(sig_one, sig_two);

    let recovered = recover(&Hash256::keccak256(b"one"), &sig_one).unwrap();
    assert_eq!(recovered, key.public_key());
}
