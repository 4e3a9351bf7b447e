//! NTLM message protection with extended session security ([MS-NLMP] 3.4).
//!
//! Each message carries a 16-byte signature: version 1, an 8-byte checksum
//! and the sender's sequence number. The RC4 stream is re-keyed for every
//! message from MD5(seal key ‖ sequence number), so messages are independent
//! of each other and only the counters tie them into order.

use std::sync::atomic::{compiler_fence, Ordering};

use subtle::ConstantTimeEq;

use super::crypto::{hmac_md5, md5, seal_key, sign_key, Direction, Rc4};
use super::messages::NegotiateFlags;
use crate::error::{Error, Result};
use crate::mech::{IovBuffer, IovKind};

/// Length of an NTLM message signature.
pub const SIGNATURE_LEN: usize = 16;
const SIGNATURE_VERSION: u32 = 1;

/// Keys and sequence counters of one established NTLM context.
pub struct SessionKeys {
    flags: NegotiateFlags,
    send_sign: [u8; 16],
    send_seal: [u8; 16],
    recv_sign: [u8; 16],
    recv_seal: [u8; 16],
    send_seq: u32,
    recv_seq: u32,
}

impl SessionKeys {
    /// Derives both directions from the exported session key.
    pub fn new(exported_session_key: &[u8; 16], flags: NegotiateFlags, initiator: bool) -> Self {
        let (send, recv) = if initiator {
            (Direction::ClientToServer, Direction::ServerToClient)
        } else {
            (Direction::ServerToClient, Direction::ClientToServer)
        };
        let bits128 = flags.contains(NegotiateFlags::NEGOTIATE_128);
        let bits56 = flags.contains(NegotiateFlags::NEGOTIATE_56);
        Self {
            flags,
            send_sign: sign_key(exported_session_key, send),
            send_seal: seal_key(exported_session_key, send, bits128, bits56),
            recv_sign: sign_key(exported_session_key, recv),
            recv_seal: seal_key(exported_session_key, recv, bits128, bits56),
            send_seq: 0,
            recv_seq: 0,
        }
    }

    pub fn flags(&self) -> NegotiateFlags {
        self.flags
    }

    pub fn can_seal(&self) -> bool {
        self.flags.contains(NegotiateFlags::NEGOTIATE_SEAL)
    }

    pub fn can_sign(&self) -> bool {
        self.flags.intersects(NegotiateFlags::NEGOTIATE_SIGN | NegotiateFlags::NEGOTIATE_SEAL)
    }

    /// Sequence number the next outgoing message will carry.
    pub fn send_sequence(&self) -> u32 {
        self.send_seq
    }

    /// Sequence number the next incoming message must carry.
    pub fn recv_sequence(&self) -> u32 {
        self.recv_seq
    }

    /// Produces `signature ‖ body`, with the body sealed when `confidential`.
    /// Returns whether the body was sealed.
    pub fn wrap(&mut self, data: &[u8], confidential: bool) -> Result<(Vec<u8>, bool)> {
        if confidential && !self.can_seal() {
            return Err(Error::UnsupportedQop("confidentiality was not negotiated".into()));
        }
        if !self.can_sign() {
            return Err(Error::UnsupportedQop("neither signing nor sealing was negotiated".into()));
        }
        let seq = self.next_send()?;

        // Sealing runs the body through the stream before the checksum.
        let mut rc4 = Rc4::new(&message_key(&self.send_seal, seq));
        let body = if confidential { rc4.process(data) } else { data.to_vec() };

        let mut out = Vec::with_capacity(SIGNATURE_LEN + body.len());
        out.extend_from_slice(&self.signature(&self.send_sign, &mut rc4, seq, data));
        out.extend_from_slice(&body);
        Ok((out, confidential))
    }

    /// Verifies and opens a message produced by the peer's [`SessionKeys::wrap`].
    pub fn unwrap(&mut self, message: &[u8]) -> Result<(Vec<u8>, bool)> {
        if message.len() < SIGNATURE_LEN {
            return Err(Error::malformed("wrapped message shorter than its signature"));
        }
        let (signature, body) = message.split_at(SIGNATURE_LEN);
        let seq = self.check_sequence(signature)?;

        if self.can_seal() {
            let mut rc4 = Rc4::new(&message_key(&self.recv_seal, seq));
            let plaintext = rc4.process(body);
            let expected = self.signature(&self.recv_sign, &mut rc4, seq, &plaintext);
            if bool::from(expected[..].ct_eq(signature)) {
                self.recv_seq += 1;
                return Ok((plaintext, true));
            }
        }
        let mut rc4 = Rc4::new(&message_key(&self.recv_seal, seq));
        let expected = self.signature(&self.recv_sign, &mut rc4, seq, body);
        if bool::from(expected[..].ct_eq(signature)) {
            self.recv_seq += 1;
            return Ok((body.to_vec(), false));
        }
        Err(Error::IntegrityCheckFailed(format!("message signature mismatch at sequence {seq}")))
    }

    /// [`SessionKeys::wrap`] over scattered buffers. The signature covers the
    /// data and sign-only buffers in order and lands in the single header
    /// buffer; only data buffers are encrypted. Padding buffers are emptied.
    pub fn wrap_iov(&mut self, buffers: &mut [IovBuffer], confidential: bool) -> Result<bool> {
        if confidential && !self.can_seal() {
            return Err(Error::UnsupportedQop("confidentiality was not negotiated".into()));
        }
        if !self.can_sign() {
            return Err(Error::UnsupportedQop("neither signing nor sealing was negotiated".into()));
        }
        if buffers.iter().any(|buffer| buffer.kind == IovKind::Stream) {
            return Err(Error::malformed("stream buffers are only valid when unwrapping"));
        }
        let header = header_index(buffers)?;
        let seq = self.next_send()?;

        let plaintext = covered(buffers);
        let mut rc4 = Rc4::new(&message_key(&self.send_seal, seq));
        if confidential {
            for buffer in buffers.iter_mut().filter(|buffer| buffer.kind == IovKind::Data) {
                rc4.apply(&mut buffer.data);
            }
        }
        let signature = self.signature(&self.send_sign, &mut rc4, seq, &plaintext);
        buffers[header].data = signature.to_vec();
        for buffer in buffers.iter_mut().filter(|buffer| buffer.kind == IovKind::Padding) {
            buffer.data.clear();
        }
        Ok(confidential)
    }

    /// Opens buffers from [`SessionKeys::wrap_iov`] in place. A stream buffer
    /// holding a whole wrapped message is opened into the first data buffer.
    pub fn unwrap_iov(&mut self, buffers: &mut [IovBuffer]) -> Result<bool> {
        if let Some(stream) = buffers.iter().position(|buffer| buffer.kind == IovKind::Stream) {
            let output = buffers
                .iter()
                .position(|buffer| buffer.kind == IovKind::Data)
                .ok_or_else(|| Error::malformed("unwrapping a stream needs a data buffer for the output"))?;
            let (plaintext, sealed) = self.unwrap(&buffers[stream].data)?;
            buffers[output].data = plaintext;
            return Ok(sealed);
        }

        let header = header_index(buffers)?;
        let signature: [u8; SIGNATURE_LEN] = buffers[header]
            .data
            .as_slice()
            .try_into()
            .map_err(|_| Error::malformed(format!("header buffer must hold a {SIGNATURE_LEN}-byte signature")))?;
        let seq = self.check_sequence(&signature)?;

        if self.can_seal() {
            let mut rc4 = Rc4::new(&message_key(&self.recv_seal, seq));
            let mut opened = buffers.to_vec();
            for buffer in opened.iter_mut().filter(|buffer| buffer.kind == IovKind::Data) {
                rc4.apply(&mut buffer.data);
            }
            let expected = self.signature(&self.recv_sign, &mut rc4, seq, &covered(&opened));
            if bool::from(expected[..].ct_eq(&signature[..])) {
                self.recv_seq += 1;
                buffers.clone_from_slice(&opened);
                return Ok(true);
            }
        }
        let mut rc4 = Rc4::new(&message_key(&self.recv_seal, seq));
        let expected = self.signature(&self.recv_sign, &mut rc4, seq, &covered(buffers));
        if bool::from(expected[..].ct_eq(&signature[..])) {
            self.recv_seq += 1;
            return Ok(false);
        }
        Err(Error::IntegrityCheckFailed(format!("message signature mismatch at sequence {seq}")))
    }

    /// Detached signature over `data`, consuming one outgoing sequence number.
    pub fn sign(&mut self, data: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
        if !self.can_sign() {
            return Err(Error::UnsupportedQop("signing was not negotiated".into()));
        }
        let seq = self.next_send()?;
        let mut rc4 = Rc4::new(&message_key(&self.send_seal, seq));
        Ok(self.signature(&self.send_sign, &mut rc4, seq, data))
    }

    /// Checks a detached signature from the peer's [`SessionKeys::sign`].
    pub fn verify(&mut self, data: &[u8], signature: &[u8]) -> Result<()> {
        if signature.len() != SIGNATURE_LEN {
            return Err(Error::malformed(format!("signature must be {SIGNATURE_LEN} bytes")));
        }
        let seq = self.check_sequence(signature)?;
        let mut rc4 = Rc4::new(&message_key(&self.recv_seal, seq));
        let expected = self.signature(&self.recv_sign, &mut rc4, seq, data);
        if !bool::from(expected[..].ct_eq(signature)) {
            return Err(Error::IntegrityCheckFailed(format!("signature mismatch at sequence {seq}")));
        }
        self.recv_seq += 1;
        Ok(())
    }

    /// mechListMIC for SPNEGO. Always computed at sequence 0 and leaves the
    /// counters alone, matching Windows, which resets them after the MIC.
    pub(crate) fn negotiation_mic(&self, data: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut rc4 = Rc4::new(&message_key(&self.send_seal, 0));
        self.signature(&self.send_sign, &mut rc4, 0, data)
    }

    pub(crate) fn verify_negotiation_mic(&self, data: &[u8], mic: &[u8]) -> Result<()> {
        let mut rc4 = Rc4::new(&message_key(&self.recv_seal, 0));
        let expected = self.signature(&self.recv_sign, &mut rc4, 0, data);
        if bool::from(expected[..].ct_eq(mic)) {
            Ok(())
        } else {
            Err(Error::IntegrityCheckFailed("mechListMIC mismatch".into()))
        }
    }

    fn signature(&self, sign_key: &[u8; 16], rc4: &mut Rc4, seq: u32, data: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut input = Vec::with_capacity(4 + data.len());
        input.extend_from_slice(&seq.to_le_bytes());
        input.extend_from_slice(data);
        let mac = hmac_md5(sign_key, &input);

        let mut checksum = [0u8; 8];
        checksum.copy_from_slice(&mac[..8]);
        if self.flags.contains(NegotiateFlags::NEGOTIATE_KEY_EXCH) {
            rc4.apply(&mut checksum);
        }

        let mut signature = [0u8; SIGNATURE_LEN];
        signature[..4].copy_from_slice(&SIGNATURE_VERSION.to_le_bytes());
        signature[4..12].copy_from_slice(&checksum);
        signature[12..].copy_from_slice(&seq.to_le_bytes());
        signature
    }

    fn next_send(&mut self) -> Result<u32> {
        let seq = self.send_seq;
        self.send_seq = seq.checked_add(1).ok_or(Error::ContextExpired)?;
        Ok(seq)
    }

    /// Returns the sequence number the signature must verify against. The
    /// version field is left to the signature comparison.
    fn check_sequence(&self, signature: &[u8]) -> Result<u32> {
        if self.recv_seq == u32::MAX {
            return Err(Error::ContextExpired);
        }
        let received = u32::from_le_bytes([signature[12], signature[13], signature[14], signature[15]]);
        if received < self.recv_seq {
            return Err(Error::ReplayDetected { expected: self.recv_seq, received });
        }
        Ok(self.recv_seq)
    }
}

fn header_index(buffers: &[IovBuffer]) -> Result<usize> {
    let mut headers = buffers.iter().enumerate().filter(|(_, buffer)| buffer.kind == IovKind::Header);
    match (headers.next(), headers.next()) {
        (Some((index, _)), None) => Ok(index),
        _ => Err(Error::malformed("exactly one header buffer is required")),
    }
}

/// Bytes the signature covers, in buffer order.
fn covered(buffers: &[IovBuffer]) -> Vec<u8> {
    buffers
        .iter()
        .filter(|buffer| matches!(buffer.kind, IovKind::Data | IovKind::SignOnly))
        .flat_map(|buffer| buffer.data.iter().copied())
        .collect()
}

fn message_key(seal_key: &[u8; 16], seq: u32) -> [u8; 16] {
    md5(&[seal_key, &seq.to_le_bytes()])
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        for key in [&mut self.send_sign, &mut self.send_seal, &mut self.recv_sign, &mut self.recv_seal] {
            key.fill(0);
        }
        compiler_fence(Ordering::SeqCst);
    }
}

include!("session_test.rs");
