//! The per-peer handshake state machine and the crypto capability
//! implementation it binds into message contexts once authorized.

use std::collections::VecDeque;
use std::sync::Arc;

use codec::Error as CodecError;
use codec::header::DestinationType;
use codec::identifier::Identifier;
use codec::parcel::{PlatformType, SecurityCapabilities, build_platform, unpack};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

const SIGNATURE_SIZE: usize = 20;
const ENCRYPTION_OVERHEAD: usize = 4;
const REPLAY_WINDOW_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediatorState {
    Unauthorized,
    Flagged,
    Authorized,
}

#[derive(Debug)]
pub enum HandshakeError {
    BadNonce,
    InvalidKeyMaterial,
    OutOfOrder,
    Timeout,
    Replay,
}

/// The symmetric key material bound into every endpoint registration's
/// message context once a session reaches `Authorized`.
pub struct SessionKeys {
    key: [u8; 32],
}

impl SessionKeys {
    fn keystream_xor(&self, nonce: u64, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(bytes.len());
        let mut counter: u32 = 0;

        for chunk in bytes.chunks(SIGNATURE_SIZE) {
            let mut mac = HmacSha1::new_from_slice(&self.key).expect("hmac accepts any key length");
            mac.update(&nonce.to_be_bytes());
            mac.update(&counter.to_be_bytes());
            let block = mac.finalize().into_bytes();

            for (b, k) in chunk.iter().zip(block.iter()) {
                out.push(b ^ k);
            }

            counter += 1;
        }

        out
    }

    fn tag(&self, nonce: u64, bytes: &[u8]) -> [u8; ENCRYPTION_OVERHEAD] {
        let mut mac = HmacSha1::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(&nonce.to_be_bytes());
        mac.update(bytes);
        let digest = mac.finalize().into_bytes();

        let mut out = [0u8; ENCRYPTION_OVERHEAD];
        out.copy_from_slice(&digest[..ENCRYPTION_OVERHEAD]);
        out
    }
}

impl SecurityCapabilities for SessionKeys {
    fn encrypt(&self, plaintext: &[u8], nonce: u64) -> Result<Vec<u8>, CodecError> {
        let mut out = self.keystream_xor(nonce, plaintext);
        out.extend_from_slice(&self.tag(nonce, &out));
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], nonce: u64) -> Result<Vec<u8>, CodecError> {
        if ciphertext.len() < ENCRYPTION_OVERHEAD {
            return Err(CodecError::Malformed);
        }

        let (body, tag) = ciphertext.split_at(ciphertext.len() - ENCRYPTION_OVERHEAD);
        if self.tag(nonce, body) != tag {
            return Err(CodecError::Unauthorized);
        }

        Ok(self.keystream_xor(nonce, body))
    }

    fn sign(&self, buffer: &mut Vec<u8>) {
        let mut mac = HmacSha1::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(buffer);
        buffer.extend_from_slice(&mac.finalize().into_bytes()[..SIGNATURE_SIZE]);
    }

    fn verify(&self, buffer: &[u8]) -> bool {
        if buffer.len() < SIGNATURE_SIZE {
            return false;
        }

        let (content, signature) = buffer.split_at(buffer.len() - SIGNATURE_SIZE);

        let mut mac = HmacSha1::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(content);

        mac.verify_slice(signature).is_ok()
    }

    fn signature_size(&self) -> usize {
        SIGNATURE_SIZE
    }
}

/// Drives the per-peer handshake and owns the session's crypto state. Holds
/// a bounded seen-window of `(source, timestamp)` pairs once authorized,
/// rejecting exact repeats as replays.
pub struct SecurityMediator {
    state: RwLock<MediatorState>,
    keys: RwLock<Option<Arc<SessionKeys>>>,
    seen: RwLock<VecDeque<(Identifier, u64)>>,
    replay_window: usize,
    local_identifier: Identifier,
}

impl SecurityMediator {
    pub fn new_initiator(local_identifier: Identifier) -> Self {
        Self::with_replay_window(local_identifier, REPLAY_WINDOW_SIZE)
    }

    pub fn new_acceptor(local_identifier: Identifier) -> Self {
        Self::new_initiator(local_identifier)
    }

    /// Same as `new_initiator`, but with the replay window sized from the
    /// running node's configuration rather than the built-in default.
    pub fn with_replay_window(local_identifier: Identifier, replay_window: usize) -> Self {
        Self {
            state: RwLock::new(MediatorState::Unauthorized),
            keys: RwLock::new(None),
            seen: RwLock::new(VecDeque::with_capacity(replay_window)),
            replay_window,
            local_identifier,
        }
    }

    pub fn state(&self) -> MediatorState {
        *self.state.read()
    }

    pub fn is_authorized(&self) -> bool {
        self.state() == MediatorState::Authorized
    }

    /// Produce the first handshake frame to send, as the session initiator.
    pub fn setup_initiator(&self, destination: Identifier) -> Result<String, CodecError> {
        if self.state() != MediatorState::Unauthorized {
            return Err(CodecError::InvalidArgument);
        }

        let mut salt = [0u8; 32];
        rand::rng().fill_bytes(&mut salt);

        let parcel = build_platform(
            self.local_identifier,
            DestinationType::Node,
            Some(destination),
            PlatformType::Handshake,
            salt.to_vec(),
        )?;

        codec::parcel::pack(&parcel.into(), None)
    }

    /// Prepare to receive a handshake as the session acceptor. A no-op
    /// beyond asserting the starting state; the receiver swap to the
    /// handshake handler is the caller's (Peer Proxy's) responsibility.
    pub fn setup_acceptor(&self) -> Result<(), CodecError> {
        if self.state() != MediatorState::Unauthorized {
            return Err(CodecError::InvalidArgument);
        }

        Ok(())
    }

    /// Advance the handshake state machine with an inbound platform
    /// handshake frame. Returns the derived session keys once authorized.
    pub fn on_handshake_bytes(&self, text: &str) -> Result<Option<Arc<SessionKeys>>, HandshakeError> {
        if self.state() == MediatorState::Authorized {
            // A handshake frame delivered in Authorized state is dropped,
            // not downgraded.
            return Ok(None);
        }

        if self.state() == MediatorState::Flagged {
            return Err(HandshakeError::OutOfOrder);
        }

        let parcel = unpack(text, None).map_err(|_| HandshakeError::BadNonce)?;
        let salt = match parcel {
            codec::parcel::Parcel::Platform(p) if p.platform_type == PlatformType::Handshake => {
                p.payload
            }
            _ => {
                self.flag();
                return Err(HandshakeError::OutOfOrder);
            }
        };

        if salt.len() < 16 {
            self.flag();
            return Err(HandshakeError::InvalidKeyMaterial);
        }

        let mut key = [0u8; 32];
        let mut mac = HmacSha1::new_from_slice(&salt).map_err(|_| HandshakeError::InvalidKeyMaterial)?;
        mac.update(b"brypt-session-key");
        let derived = mac.finalize().into_bytes();
        key[..SIGNATURE_SIZE].copy_from_slice(&derived);
        key[SIGNATURE_SIZE..].copy_from_slice(&derived[..32 - SIGNATURE_SIZE]);

        let keys = Arc::new(SessionKeys { key });
        *self.keys.write() = Some(keys.clone());
        *self.state.write() = MediatorState::Authorized;

        Ok(Some(keys))
    }

    pub fn keys(&self) -> Option<Arc<SessionKeys>> {
        self.keys.read().clone()
    }

    pub fn flag(&self) {
        *self.state.write() = MediatorState::Flagged;
    }

    /// Reject an exact `(source, timestamp)` repeat; records the pair
    /// otherwise. Bounded to `REPLAY_WINDOW_SIZE` most-recent entries.
    pub fn check_replay(&self, source: Identifier, timestamp_ms: u64) -> Result<(), HandshakeError> {
        let mut seen = self.seen.write();
        if seen.iter().any(|&(id, ts)| id == source && ts == timestamp_ms) {
            return Err(HandshakeError::Replay);
        }

        if seen.len() == self.replay_window {
            seen.pop_front();
        }
        seen.push_back((source, timestamp_ms));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_keys_round_trip_encrypt_decrypt() {
        let keys = SessionKeys { key: [3u8; 32] };
        let ciphertext = keys.encrypt(b"hello world", 42).unwrap();
        let plaintext = keys.decrypt(&ciphertext, 42).unwrap();
        assert_eq!(plaintext, b"hello world");
    }

    #[test]
    fn tampered_ciphertext_fails_decrypt() {
        let keys = SessionKeys { key: [3u8; 32] };
        let mut ciphertext = keys.encrypt(b"hello world", 42).unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(keys.decrypt(&ciphertext, 42).is_err());
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let keys = SessionKeys { key: [9u8; 32] };
        let mut buffer = b"a parcel".to_vec();
        keys.sign(&mut buffer);
        assert!(keys.verify(&buffer));
    }

    #[test]
    fn flipped_signature_bit_fails_verify() {
        let keys = SessionKeys { key: [9u8; 32] };
        let mut buffer = b"a parcel".to_vec();
        keys.sign(&mut buffer);
        let last = buffer.len() - 1;
        buffer[last] ^= 0x01;
        assert!(!keys.verify(&buffer));
    }

    #[test]
    fn handshake_initiator_then_acceptor_both_authorize() {
        let initiator = SecurityMediator::new_initiator(Identifier::generate());
        let acceptor = SecurityMediator::new_acceptor(Identifier::generate());
        acceptor.setup_acceptor().unwrap();

        let frame = initiator.setup_initiator(Identifier::generate()).unwrap();
        let keys = acceptor.on_handshake_bytes(&frame).unwrap();

        assert!(keys.is_some());
        assert!(acceptor.is_authorized());
    }

    #[test]
    fn handshake_in_authorized_state_is_dropped_not_downgraded() {
        let acceptor = SecurityMediator::new_acceptor(Identifier::generate());
        let initiator = SecurityMediator::new_initiator(Identifier::generate());
        let frame = initiator.setup_initiator(Identifier::generate()).unwrap();

        acceptor.on_handshake_bytes(&frame).unwrap();
        assert!(acceptor.is_authorized());

        // A second handshake frame arriving after authorization is dropped,
        // not downgraded back to Unauthorized or Flagged.
        let result = acceptor.on_handshake_bytes(&frame).unwrap();
        assert!(result.is_none());
        assert!(acceptor.is_authorized());
    }

    #[test]
    fn replay_window_rejects_exact_repeat() {
        let mediator = SecurityMediator::new_acceptor(Identifier::generate());
        let source = Identifier::generate();

        assert!(mediator.check_replay(source, 1000).is_ok());
        assert!(mediator.check_replay(source, 1000).is_err());
        assert!(mediator.check_replay(source, 1001).is_ok());
    }
}
