use std::fmt;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;
use zeroize::Zeroizing;

use crate::ChannelError;

pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// PKCS#7 pad-to boundary for the inner plaintext.
pub const PAD_BLOCK: usize = 16;
/// Framing overhead around the padded plaintext: IV prefix plus GCM tag.
pub const FRAME_OVERHEAD: usize = IV_LEN + TAG_LEN;

/// A simplex security association between an initiator and a responder.
///
/// Carries the shared AES-128-GCM key and one sequence counter per direction.
/// The counters start at zero when the session is established and advance by
/// exactly one per sealed/opened frame; the current counter value travels as
/// AAD, so a desynchronized peer fails tag verification on the next frame.
pub struct SecAssociation {
    initiator: String,
    responder: String,
    cipher: Arc<Aes128Gcm>,
    send_seq: u32,
    recv_seq: u32,
}

impl fmt::Debug for SecAssociation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecAssociation")
            .field("initiator", &self.initiator)
            .field("responder", &self.responder)
            .field("send_seq", &self.send_seq)
            .field("recv_seq", &self.recv_seq)
            .finish_non_exhaustive()
    }
}

impl SecAssociation {
    pub fn new(
        initiator: impl Into<String>,
        responder: impl Into<String>,
        key: &[u8],
    ) -> Result<Self, ChannelError> {
        let bytes: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| ChannelError::Crypto("key length"))?;
        let bytes = Zeroizing::new(bytes);
        let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&*bytes));

        let sa = Self {
            initiator: initiator.into(),
            responder: responder.into(),
            cipher: Arc::new(cipher),
            send_seq: 0,
            recv_seq: 0,
        };
        debug!(
            initiator = %sa.initiator,
            responder = %sa.responder,
            "created security association"
        );
        Ok(sa)
    }

    /// Construct from the base64 key encoding used in configuration files.
    pub fn from_base64_key(
        initiator: impl Into<String>,
        responder: impl Into<String>,
        key_b64: &str,
    ) -> Result<Self, ChannelError> {
        let raw = Zeroizing::new(
            BASE64
                .decode(key_b64.trim())
                .map_err(|_| ChannelError::Crypto("key encoding"))?,
        );
        Self::new(initiator, responder, &raw)
    }

    pub fn initiator(&self) -> &str {
        &self.initiator
    }

    pub fn responder(&self) -> &str {
        &self.responder
    }

    /// Pad, encrypt and authenticate one message, advancing the send counter.
    /// Output layout: `iv || ciphertext || tag`.
    pub fn seal(&mut self, msg: &[u8]) -> Result<Vec<u8>, ChannelError> {
        seal_frame(&self.cipher, &mut self.send_seq, msg)
    }

    /// Decrypt, verify and unpad one received frame, advancing the receive
    /// counter only on success.
    pub fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>, ChannelError> {
        open_frame(&self.cipher, &mut self.recv_seq, frame)
    }

    /// Split into per-direction halves so send and receive can proceed under
    /// independent locks.
    pub(crate) fn split(self) -> (SealHalf, OpenHalf) {
        (
            SealHalf {
                cipher: self.cipher.clone(),
                seq: self.send_seq,
            },
            OpenHalf {
                cipher: self.cipher,
                seq: self.recv_seq,
            },
        )
    }
}

pub(crate) struct SealHalf {
    cipher: Arc<Aes128Gcm>,
    seq: u32,
}

impl SealHalf {
    pub fn seal(&mut self, msg: &[u8]) -> Result<Vec<u8>, ChannelError> {
        seal_frame(&self.cipher, &mut self.seq, msg)
    }
}

pub(crate) struct OpenHalf {
    cipher: Arc<Aes128Gcm>,
    seq: u32,
}

impl OpenHalf {
    pub fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>, ChannelError> {
        open_frame(&self.cipher, &mut self.seq, frame)
    }
}

fn seal_frame(
    cipher: &Aes128Gcm,
    seq: &mut u32,
    msg: &[u8],
) -> Result<Vec<u8>, ChannelError> {
    let aad = seq.to_le_bytes();

    let mut pt = Vec::with_capacity(msg.len() + PAD_BLOCK);
    pt.extend_from_slice(msg);
    let pad = PAD_BLOCK - (pt.len() % PAD_BLOCK);
    pt.resize(pt.len() + pad, pad as u8);

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ct = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: &pt,
                aad: &aad,
            },
        )
        .map_err(|_| ChannelError::Crypto("encrypt"))?;

    *seq = seq
        .checked_add(1)
        .ok_or(ChannelError::Sequence(*seq))?;

    let mut frame = Vec::with_capacity(IV_LEN + ct.len());
    frame.extend_from_slice(&iv);
    frame.extend_from_slice(&ct);
    Ok(frame)
}

fn open_frame(
    cipher: &Aes128Gcm,
    seq: &mut u32,
    frame: &[u8],
) -> Result<Vec<u8>, ChannelError> {
    if frame.len() < FRAME_OVERHEAD + PAD_BLOCK {
        return Err(ChannelError::Protocol("short frame"));
    }
    let (iv, ct) = frame.split_at(IV_LEN);
    let aad = seq.to_le_bytes();

    let mut pt = cipher
        .decrypt(Nonce::from_slice(iv), Payload { msg: ct, aad: &aad })
        .map_err(|_| ChannelError::Crypto("decrypt"))?;

    let pad = *pt.last().ok_or(ChannelError::Crypto("padding"))? as usize;
    if pad == 0 || pad > PAD_BLOCK || pad > pt.len() {
        return Err(ChannelError::Crypto("padding"));
    }
    if pt[pt.len() - pad..].iter().any(|&b| b != pad as u8) {
        return Err(ChannelError::Crypto("padding"));
    }
    pt.truncate(pt.len() - pad);

    *seq = seq
        .checked_add(1)
        .ok_or(ChannelError::Sequence(*seq))?;
    Ok(pt)
}
