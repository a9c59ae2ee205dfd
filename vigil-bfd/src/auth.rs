//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use bytes::{BufMut, BytesMut};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::config::AuthCfg;
use crate::packet::{AuthTlv, AuthenticationType};

pub const MD5_AUTH_LEN: u8 = 24;
pub const MD5_DIGEST_SIZE: usize = 16;
pub const SHA1_AUTH_LEN: u8 = 28;
pub const SHA1_DIGEST_SIZE: usize = 20;

// Authentication failures (RFC 5880, section 6.7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum AuthError {
    MissingAuthentication,
    UnexpectedAuthentication,
    TypeMismatch,
    KeyIdMismatch,
    PasswordMismatch,
    DigestMismatch,
    SequenceRegression,
}

// ===== impl AuthenticationType =====

impl AuthenticationType {
    // The meticulous variants require the sequence number to increment on
    // every transmitted packet, and to strictly increase on receive.
    pub fn is_meticulous(&self) -> bool {
        matches!(
            self,
            AuthenticationType::MeticulousKeyedMd5
                | AuthenticationType::MeticulousKeyedSha1
        )
    }

    fn digest_size(&self) -> Option<usize> {
        match self {
            AuthenticationType::SimplePassword => None,
            AuthenticationType::KeyedMd5
            | AuthenticationType::MeticulousKeyedMd5 => Some(MD5_DIGEST_SIZE),
            AuthenticationType::KeyedSha1
            | AuthenticationType::MeticulousKeyedSha1 => {
                Some(SHA1_DIGEST_SIZE)
            }
        }
    }
}

// ===== impl AuthError =====

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingAuthentication => {
                write!(f, "packet lacks required authentication section")
            }
            AuthError::UnexpectedAuthentication => {
                write!(f, "unexpected authentication section")
            }
            AuthError::TypeMismatch => {
                write!(f, "authentication type mismatch")
            }
            AuthError::KeyIdMismatch => {
                write!(f, "authentication key ID mismatch")
            }
            AuthError::PasswordMismatch => {
                write!(f, "password mismatch")
            }
            AuthError::DigestMismatch => {
                write!(f, "digest mismatch")
            }
            AuthError::SequenceRegression => {
                write!(f, "sequence number regression")
            }
        }
    }
}

impl std::error::Error for AuthError {}

// ===== global functions =====

// Appends the Authentication Section header to a partially encoded packet.
//
// For the keyed types the digest field is seeded with the zero-padded key;
// `finalize_auth` replaces it with the actual digest once the length field
// is known.
pub(crate) fn encode_auth(buf: &mut BytesMut, auth: &AuthTlv, key: &[u8]) {
    buf.put_u8(auth.auth_type as u8);
    match auth.auth_type {
        AuthenticationType::SimplePassword => {
            buf.put_u8(3 + key.len() as u8);
            buf.put_u8(auth.key_id);
            buf.put_slice(key);
        }
        AuthenticationType::KeyedMd5
        | AuthenticationType::MeticulousKeyedMd5 => {
            buf.put_u8(MD5_AUTH_LEN);
            buf.put_u8(auth.key_id);
            buf.put_u8(0);
            buf.put_u32(auth.seq.unwrap_or(0));
            buf.put_slice(&padded_key(key, MD5_DIGEST_SIZE));
        }
        AuthenticationType::KeyedSha1
        | AuthenticationType::MeticulousKeyedSha1 => {
            buf.put_u8(SHA1_AUTH_LEN);
            buf.put_u8(auth.key_id);
            buf.put_u8(0);
            buf.put_u32(auth.seq.unwrap_or(0));
            buf.put_slice(&padded_key(key, SHA1_DIGEST_SIZE));
        }
    }
}

// Overwrites the seeded digest field with the digest of the whole packet.
pub(crate) fn finalize_auth(buf: &mut BytesMut, auth_type: AuthenticationType) {
    if let Some(digest_size) = auth_type.digest_size() {
        let offset = buf.len() - digest_size;
        let digest = compute_digest(auth_type, buf);
        buf[offset..].copy_from_slice(&digest);
    }
}

// Validates the Authentication Section of a received packet against the
// session's configured key.
//
// `data` is the raw datagram as received and `last_seq` the highest sequence
// number accepted so far (None until the first authenticated packet).
// On success, returns the sequence number to record for the replay check.
pub fn verify_auth(
    data: &[u8],
    auth: &AuthTlv,
    cfg: &AuthCfg,
    last_seq: Option<u32>,
) -> Result<Option<u32>, AuthError> {
    if auth.auth_type != cfg.auth_type {
        return Err(AuthError::TypeMismatch);
    }
    if auth.key_id != cfg.key_id {
        return Err(AuthError::KeyIdMismatch);
    }

    match auth.auth_type {
        AuthenticationType::SimplePassword => {
            if *auth.data != *cfg.key {
                return Err(AuthError::PasswordMismatch);
            }
            Ok(None)
        }
        _ => {
            // The peer computed its digest with the key substituted into the
            // digest field; redo the computation and compare.
            let digest_size = auth.auth_type.digest_size().unwrap();
            let mut scratch = BytesMut::from(data);
            let offset = scratch.len() - digest_size;
            scratch[offset..]
                .copy_from_slice(&padded_key(&cfg.key, digest_size));
            let digest = compute_digest(auth.auth_type, &scratch);
            if *auth.data != digest[..] {
                return Err(AuthError::DigestMismatch);
            }

            // Replay check: strict monotonicity, with the meticulous types
            // requiring a strict increase on every packet.
            let seq = auth.seq.unwrap();
            if let Some(last_seq) = last_seq {
                let valid = if auth.auth_type.is_meticulous() {
                    seq > last_seq
                } else {
                    seq >= last_seq
                };
                if !valid {
                    return Err(AuthError::SequenceRegression);
                }
            }
            Ok(Some(seq))
        }
    }
}

fn compute_digest(auth_type: AuthenticationType, data: &[u8]) -> Vec<u8> {
    match auth_type {
        AuthenticationType::KeyedMd5
        | AuthenticationType::MeticulousKeyedMd5 => {
            let mut hasher = Md5::new();
            hasher.update(data);
            hasher.finalize().to_vec()
        }
        AuthenticationType::KeyedSha1
        | AuthenticationType::MeticulousKeyedSha1 => {
            let mut hasher = Sha1::new();
            hasher.update(data);
            hasher.finalize().to_vec()
        }
        AuthenticationType::SimplePassword => unreachable!(),
    }
}

fn padded_key(key: &[u8], size: usize) -> Vec<u8> {
    let mut padded = key.to_vec();
    padded.truncate(size);
    padded.resize(size, 0);
    padded
}
