//! Cryptographic primitives for NTLMv2.
//!
//! Implements the key schedule of [MS-NLMP] 3.3.2 and 3.4.5: NT hash,
//! NTOWFv2, the NTLMv2 response, session keys and the per-direction signing and
//! sealing keys. Every constant here must match the peer byte for byte.

use chrono::{DateTime, Utc};
use md4::{Digest, Md4};

// HMAC Constants
const IPAD: u8 = 0x36;
const OPAD: u8 = 0x5C;
const MD5_BLOCK_SIZE: usize = 64;

const RESPONDER_VERSION: u8 = 1;
const HI_RESPONDER_VERSION: u8 = 1;

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_EPOCH_OFFSET: i64 = 11_644_473_600;

const CLIENT_SIGNING: &[u8] = b"session key to client-to-server signing key magic constant\0";
const SERVER_SIGNING: &[u8] = b"session key to server-to-client signing key magic constant\0";
const CLIENT_SEALING: &[u8] = b"session key to client-to-server sealing key magic constant\0";
const SERVER_SEALING: &[u8] = b"session key to server-to-client sealing key magic constant\0";

pub fn utf16le(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

pub fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut context = md5::Context::new();
    for part in parts {
        context.consume(part);
    }
    context.compute().0
}

/// HMAC-MD5 over md5 0.7.0 ([RFC 2104]).
pub fn hmac_md5(key: &[u8], message: &[u8]) -> [u8; 16] {
    // The key needs to be exactly MD5_BLOCK_SIZE bytes
    let mut key_bytes = if key.len() > MD5_BLOCK_SIZE {
        md5(&[key]).to_vec()
    } else {
        key.to_vec()
    };
    key_bytes.resize(MD5_BLOCK_SIZE, 0);

    let ikey: Vec<u8> = key_bytes.iter().map(|b| b ^ IPAD).collect();
    let okey: Vec<u8> = key_bytes.iter().map(|b| b ^ OPAD).collect();

    // Inner hash: H(K_ipad || message)
    let inner_hash = md5(&[&ikey, message]);
    // Outer hash: H(K_opad || inner_hash)
    md5(&[&okey, &inner_hash])
}

/// NT hash: MD4 of the UTF-16LE password.
pub fn nt_hash(password: &str) -> [u8; 16] {
    let mut hasher = Md4::new();
    hasher.update(utf16le(password));
    hasher.finalize().into()
}

/// NTOWFv2 = HMAC-MD5(NT hash, UTF-16LE(Uppercase(user) ‖ domain)).
///
/// The domain is used as given; only the user name is upper-cased.
pub fn ntowfv2(nt_hash: &[u8; 16], user: &str, domain: &str) -> [u8; 16] {
    let identity = format!("{}{}", user.to_uppercase(), domain);
    hmac_md5(nt_hash, &utf16le(&identity))
}

/// The NTLMv2 client blob ("temp" in [MS-NLMP] 3.3.2).
pub fn ntlmv2_blob(timestamp: u64, client_challenge: &[u8; 8], target_info: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.push(RESPONDER_VERSION);
    blob.push(HI_RESPONDER_VERSION);
    blob.extend_from_slice(&[0u8; 6]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0u8; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0u8; 4]);
    blob
}

/// NTProofStr = HMAC-MD5(NTOWFv2, server challenge ‖ blob).
pub fn nt_proof(response_key: &[u8; 16], server_challenge: &[u8; 8], blob: &[u8]) -> [u8; 16] {
    let mut message = Vec::with_capacity(8 + blob.len());
    message.extend_from_slice(server_challenge);
    message.extend_from_slice(blob);
    hmac_md5(response_key, &message)
}

/// LMv2 response: HMAC-MD5(NTOWFv2, server ‖ client challenge) ‖ client challenge.
pub fn lmv2_response(response_key: &[u8; 16], server_challenge: &[u8; 8], client_challenge: &[u8; 8]) -> Vec<u8> {
    let mut message = [0u8; 16];
    message[..8].copy_from_slice(server_challenge);
    message[8..].copy_from_slice(client_challenge);
    let mut response = hmac_md5(response_key, &message).to_vec();
    response.extend_from_slice(client_challenge);
    response
}

/// Session base key, which is also the key-exchange key for NTLMv2.
pub fn session_base_key(response_key: &[u8; 16], nt_proof: &[u8; 16]) -> [u8; 16] {
    hmac_md5(response_key, nt_proof)
}

/// Current time as a Windows FILETIME.
pub fn filetime(now: DateTime<Utc>) -> u64 {
    let secs = now.timestamp() + FILETIME_EPOCH_OFFSET;
    (secs as u64) * 10_000_000 + u64::from(now.timestamp_subsec_nanos()) / 100
}

/// MD5 of a GSS channel-binding structure carrying only application data.
pub fn channel_bindings_hash(application_data: &[u8]) -> [u8; 16] {
    let mut structure = Vec::with_capacity(20 + application_data.len());
    // initiator addrtype/address, acceptor addrtype/address: all empty.
    structure.extend_from_slice(&[0u8; 16]);
    structure.extend_from_slice(&(application_data.len() as u32).to_le_bytes());
    structure.extend_from_slice(application_data);
    md5(&[&structure])
}

/// RC4 keystream state.
#[derive(Clone)]
pub struct Rc4 {
    i: u8,
    j: u8,
    state: [u8; 256],
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (idx, slot) in state.iter_mut().enumerate() {
            *slot = idx as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }
        Self { i: 0, j: 0, state }
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let k = self.state[self.state[self.i as usize].wrapping_add(self.state[self.j as usize]) as usize];
            *byte ^= k;
        }
    }

    pub fn process(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply(&mut out);
        out
    }
}

pub fn rc4(key: &[u8], data: &[u8]) -> Vec<u8> {
    Rc4::new(key).process(data)
}

/// Which end of the exchange derived keys belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// SIGNKEY for extended session security.
pub fn sign_key(exported_session_key: &[u8; 16], direction: Direction) -> [u8; 16] {
    let magic = match direction {
        Direction::ClientToServer => CLIENT_SIGNING,
        Direction::ServerToClient => SERVER_SIGNING,
    };
    md5(&[exported_session_key, magic])
}

/// SEALKEY for extended session security, weakened per negotiated key length.
pub fn seal_key(exported_session_key: &[u8; 16], direction: Direction, bits128: bool, bits56: bool) -> [u8; 16] {
    let magic = match direction {
        Direction::ClientToServer => CLIENT_SEALING,
        Direction::ServerToClient => SERVER_SEALING,
    };
    let key_len = if bits128 {
        16
    } else if bits56 {
        7
    } else {
        5
    };
    md5(&[&exported_session_key[..key_len], magic])
}

include!("crypto_test.rs");
