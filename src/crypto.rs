//! The Ed25519 primitive is injected, not owned: BEP-44 mutable puts need
//! signature verification, but the core never picks a concrete crypto
//! crate for its public API (SPEC_FULL §9 "Cryptography").

/// Verifies Ed25519 signatures. The node holds a `dyn Verifier` (or a
/// generic type parameter) and never constructs signatures itself — only
/// external collaborators (the `put_mutable` wrapper, outside this crate's
/// scope) sign.
pub trait Verifier: Send + Sync {
    fn verify(&self, pubkey: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> bool;
}

/// Signs with a caller-held secret key. Exists for symmetry with
/// `Verifier` and for tests that need to produce valid mutable puts; the
/// node itself never calls it in its own write path (callers bring already
/// -signed items, per §1's "consumed as a trait" framing).
pub trait Signer: Send + Sync {
    fn sign(&self, secret: &[u8], msg: &[u8]) -> [u8; 64];
}

pub mod test_support {
    use super::{Signer, Verifier};
    use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};

    /// A real Ed25519 implementation built on `ed25519-dalek`. The name
    /// predates its second life: tests use it to produce valid mutable
    /// puts, and the binary (`main.rs`) wires the very same type in as its
    /// production `Verifier` — the core itself still only knows the trait.
    #[derive(Default)]
    pub struct DalekCrypto;

    impl Verifier for DalekCrypto {
        fn verify(&self, pubkey: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> bool {
            let Ok(vk) = VerifyingKey::from_bytes(pubkey) else {
                return false;
            };
            let sig = Signature::from_bytes(sig);
            vk.verify(msg, &sig).is_ok()
        }
    }

    impl Signer for DalekCrypto {
        fn sign(&self, secret: &[u8], msg: &[u8]) -> [u8; 64] {
            let secret: [u8; 32] = secret.try_into().expect("32-byte seed");
            let sk = SigningKey::from_bytes(&secret);
            sk.sign(msg).to_bytes()
        }
    }

    pub fn keypair(seed: u8) -> ([u8; 32], [u8; 32]) {
        let secret = [seed; 32];
        let sk = SigningKey::from_bytes(&secret);
        (secret, sk.verifying_key().to_bytes())
    }
}
