// Packet/stream framing: label header, CRC envelope, gzip compression
// envelope, AES-GCM encryption envelope, and the compound multiplexer (spec
// §4.2). Hand-rolled byte layout — this is the one place in the crate where
// going through `serde` would be the wrong tool, exactly as the teacher's
// `networking/protocol/codec.rs` hand-rolls its frame header rather than
// reaching for `bincode`.

use std::io::{Read, Write};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes192Gcm, Aes256Gcm, Nonce};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::codec::message::MessageType;
use crate::error::{Error, Result};
use crate::keyring::Keyring;

pub const LABEL_TAG: u8 = 0xf4;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encryption envelope version. `V0` additionally PKCS#7-pads the plaintext
/// to a 16-byte block before sealing (kept only so legacy peers can still be
/// decoded); `V1` is written by this implementation and needs no padding
/// since AES-GCM is not a block cipher mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptVersion {
    V0 = 0,
    V1 = 1,
}

impl EncryptVersion {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(EncryptVersion::V0),
            1 => Ok(EncryptVersion::V1),
            other => Err(Error::Decode(format!("unknown encrypt version {other}"))),
        }
    }
}

/// Prefixes `payload` with a label header, if `label` is non-empty.
pub fn prepend_label(label: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    if label.is_empty() {
        return Ok(payload.to_vec());
    }
    if label.len() > 255 {
        return Err(Error::Encode("label exceeds 255 bytes".into()));
    }
    let mut out = Vec::with_capacity(payload.len() + label.len() + 2);
    out.push(LABEL_TAG);
    out.push(label.len() as u8);
    out.extend_from_slice(label);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Strips a label header if present, returning `(label, rest)`. A packet
/// whose label does not equal `expected` should be dropped by the caller
/// (spec §4.2 invariant).
pub fn strip_label<'a>(buf: &'a [u8]) -> Result<(&'a [u8], &'a [u8])> {
    if buf.first() == Some(&LABEL_TAG) {
        let len = *buf
            .get(1)
            .ok_or_else(|| Error::Decode("truncated label header".into()))? as usize;
        let start = 2;
        let end = start + len;
        if buf.len() < end {
            return Err(Error::Decode("truncated label body".into()));
        }
        Ok((&buf[start..end], &buf[end..]))
    } else {
        Ok((&[], buf))
    }
}

fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Wraps `plaintext` in a `HasCRC` envelope.
pub fn wrap_crc(plaintext: &[u8]) -> Vec<u8> {
    let crc = crc32(plaintext);
    let mut out = Vec::with_capacity(plaintext.len() + 5);
    out.push(MessageType::HasCRC.to_byte());
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(plaintext);
    out
}

fn unwrap_crc(rest: &[u8]) -> Result<Vec<u8>> {
    if rest.len() < 4 {
        return Err(Error::Decode("truncated CRC envelope".into()));
    }
    let want = u32::from_be_bytes(rest[0..4].try_into().unwrap());
    let body = &rest[4..];
    let got = crc32(body);
    if got != want {
        return Err(Error::Decode(format!(
            "CRC mismatch: expected {want:#x}, got {got:#x}"
        )));
    }
    Ok(body.to_vec())
}

/// Wraps `plaintext` in a `Compress` envelope (gzip).
pub fn wrap_compress(plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(plaintext)?;
    let compressed = enc.finish()?;
    let mut out = Vec::with_capacity(compressed.len() + 1);
    out.push(MessageType::Compress.to_byte());
    out.extend_from_slice(&compressed);
    Ok(out)
}

fn unwrap_compress(rest: &[u8]) -> Result<Vec<u8>> {
    let mut dec = GzDecoder::new(rest);
    let mut out = Vec::new();
    dec.read_to_end(&mut out)?;
    Ok(out)
}

fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let block = 16;
    let pad_len = block - (data.len() % block);
    let mut out = Vec::with_capacity(data.len() + pad_len);
    out.extend_from_slice(data);
    out.extend(std::iter::repeat(pad_len as u8).take(pad_len));
    out
}

fn pkcs7_unpad(data: &[u8]) -> Result<&[u8]> {
    let pad_len = *data
        .last()
        .ok_or_else(|| Error::Decode("empty padded plaintext".into()))? as usize;
    if pad_len == 0 || pad_len > data.len() || pad_len > 16 {
        return Err(Error::Decode("invalid PKCS#7 padding".into()));
    }
    Ok(&data[..data.len() - pad_len])
}

enum AnyCipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl AnyCipher {
    fn new(key: &[u8]) -> Result<Self> {
        Ok(match key.len() {
            16 => AnyCipher::Aes128(
                Aes128Gcm::new_from_slice(key).map_err(|e| Error::Encryption(e.to_string()))?,
            ),
            24 => AnyCipher::Aes192(
                Aes192Gcm::new_from_slice(key).map_err(|e| Error::Encryption(e.to_string()))?,
            ),
            32 => AnyCipher::Aes256(
                Aes256Gcm::new_from_slice(key).map_err(|e| Error::Encryption(e.to_string()))?,
            ),
            other => return Err(Error::Encryption(format!("invalid key length {other}"))),
        })
    }

    fn encrypt(&self, nonce: &[u8], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        match self {
            AnyCipher::Aes128(c) => c.encrypt(Nonce::from_slice(nonce), payload),
            AnyCipher::Aes192(c) => c.encrypt(Nonce::from_slice(nonce), payload),
            AnyCipher::Aes256(c) => c.encrypt(Nonce::from_slice(nonce), payload),
        }
        .map_err(Into::into)
    }

    fn decrypt(&self, nonce: &[u8], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        match self {
            AnyCipher::Aes128(c) => c.decrypt(Nonce::from_slice(nonce), payload),
            AnyCipher::Aes192(c) => c.decrypt(Nonce::from_slice(nonce), payload),
            AnyCipher::Aes256(c) => c.decrypt(Nonce::from_slice(nonce), payload),
        }
        .map_err(Into::into)
    }
}

/// Seals `plaintext` with `key`, binding `label` as AEAD associated data.
/// Always writes `EncryptVersion::V1` (no padding).
pub fn wrap_encrypt(key: &[u8], label: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = AnyCipher::new(key)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::RngCore::fill_bytes(&mut rand::rng(), &mut nonce);
    let sealed = cipher.encrypt(&nonce, plaintext, label)?;

    let mut out = Vec::with_capacity(1 + 1 + NONCE_LEN + sealed.len());
    out.push(MessageType::Encrypt.to_byte());
    out.push(EncryptVersion::V1 as u8);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Tries each key in `keyring` in order, returning the first one that
/// decrypts successfully.
fn unwrap_encrypt(keyring: &Keyring, label: &[u8], rest: &[u8]) -> Result<Vec<u8>> {
    if rest.len() < 1 + NONCE_LEN + TAG_LEN {
        return Err(Error::Decode("truncated encrypt envelope".into()));
    }
    let version = EncryptVersion::from_byte(rest[0])?;
    let nonce = &rest[1..1 + NONCE_LEN];
    let ciphertext = &rest[1 + NONCE_LEN..];

    let mut last_err = Error::Encryption("no keys installed".into());
    for key in keyring.keys() {
        let cipher = match AnyCipher::new(&key) {
            Ok(c) => c,
            Err(e) => {
                last_err = e;
                continue;
            }
        };
        match cipher.decrypt(nonce, ciphertext, label) {
            Ok(plaintext) => {
                return Ok(match version {
                    EncryptVersion::V0 => pkcs7_unpad(&plaintext)?.to_vec(),
                    EncryptVersion::V1 => plaintext,
                });
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Packs up to 255 inner messages into one `Compound` message.
pub fn encode_compound(parts: &[Vec<u8>]) -> Result<Vec<u8>> {
    if parts.len() > 255 {
        return Err(Error::Encode("compound cannot exceed 255 messages".into()));
    }
    let mut out = vec![MessageType::Compound.to_byte(), parts.len() as u8];
    for p in parts {
        let len = u16::try_from(p.len())
            .map_err(|_| Error::Encode("compound message exceeds 64KiB".into()))?;
        out.extend_from_slice(&len.to_be_bytes());
    }
    for p in parts {
        out.extend_from_slice(p);
    }
    Ok(out)
}

pub struct DecodedCompound {
    pub parts: Vec<Vec<u8>>,
    pub truncated: usize,
}

/// Decodes a `Compound` body (the bytes *after* the `Compound` type byte).
/// Per spec §4.2, truncation of individual sub-messages is reported via
/// `truncated`, never by discarding the whole batch.
pub fn decode_compound(rest: &[u8]) -> Result<DecodedCompound> {
    if rest.is_empty() {
        return Err(Error::Decode("empty compound".into()));
    }
    let count = rest[0] as usize;
    let mut offset = 1;
    let mut lens = Vec::with_capacity(count);
    for _ in 0..count {
        if offset + 2 > rest.len() {
            return Ok(DecodedCompound {
                parts: Vec::new(),
                truncated: count,
            });
        }
        lens.push(u16::from_be_bytes(rest[offset..offset + 2].try_into().unwrap()) as usize);
        offset += 2;
    }
    let mut parts = Vec::with_capacity(count);
    let mut truncated = 0;
    for len in lens {
        if offset + len > rest.len() {
            truncated += 1;
            continue;
        }
        parts.push(rest[offset..offset + len].to_vec());
        offset += len;
    }
    Ok(DecodedCompound { parts, truncated })
}

/// Options controlling how `encode_packet` layers the envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeOptions {
    pub crc: bool,
    pub compress: bool,
}

/// Full outbound pipeline: label, then (compress, crc — innermost first),
/// then encryption if `key` is set. `msg` must already begin with its
/// message-type byte (see [`crate::codec::message::encode_message`]).
pub fn encode_packet(
    msg: &[u8],
    label: &[u8],
    key: Option<&[u8]>,
    opts: EncodeOptions,
) -> Result<Vec<u8>> {
    let mut body = msg.to_vec();
    if opts.crc {
        body = wrap_crc(&body);
    }
    if opts.compress {
        body = wrap_compress(&body)?;
    }
    if let Some(key) = key {
        body = wrap_encrypt(key, label, &body)?;
    }
    prepend_label(label, &body)
}

/// Fully peels label, encryption, compression, and CRC layers, returning the
/// innermost message bytes (type byte + payload). `keyring` is consulted only
/// if an `Encrypt` layer is present; pass an empty keyring when encryption is
/// never used.
pub fn decode_packet(buf: &[u8], expected_label: &[u8], keyring: &Keyring) -> Result<Vec<u8>> {
    let (label, mut rest) = strip_label(buf)?;
    if label != expected_label {
        return Err(Error::Decode("label mismatch".into()));
    }

    let mut owned;
    loop {
        let ty = MessageType::from_byte(
            *rest
                .first()
                .ok_or_else(|| Error::Decode("empty packet".into()))?,
        )?;
        match ty {
            MessageType::Encrypt => {
                owned = unwrap_encrypt(keyring, label, &rest[1..])?;
                rest = &owned;
            }
            MessageType::Compress => {
                owned = unwrap_compress(&rest[1..])?;
                rest = &owned;
            }
            MessageType::HasCRC => {
                owned = unwrap_crc(&rest[1..])?;
                rest = &owned;
            }
            _ => return Ok(rest.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_round_trips() {
        let payload = b"hello".to_vec();
        let framed = prepend_label(b"dc1", &payload).unwrap();
        let (label, rest) = strip_label(&framed).unwrap();
        assert_eq!(label, b"dc1");
        assert_eq!(rest, &payload[..]);
    }

    #[test]
    fn no_label_passthrough() {
        let payload = b"hello".to_vec();
        let framed = prepend_label(b"", &payload).unwrap();
        assert_eq!(framed, payload);
        let (label, rest) = strip_label(&framed).unwrap();
        assert!(label.is_empty());
        assert_eq!(rest, &payload[..]);
    }

    #[test]
    fn crc_round_trips_and_detects_corruption() {
        let msg = vec![MessageType::Ping.to_byte(), 1, 2, 3];
        let wrapped = wrap_crc(&msg);
        let unwrapped = unwrap_crc(&wrapped[1..]).unwrap();
        assert_eq!(unwrapped, msg);

        let mut corrupted = wrapped.clone();
        *corrupted.last_mut().unwrap() ^= 0xff;
        assert!(unwrap_crc(&corrupted[1..]).is_err());
    }

    #[test]
    fn compress_round_trips() {
        let msg = vec![MessageType::Ping.to_byte(); 200];
        let wrapped = wrap_compress(&msg).unwrap();
        let unwrapped = unwrap_compress(&wrapped[1..]).unwrap();
        assert_eq!(unwrapped, msg);
    }

    #[test]
    fn encrypt_round_trips_with_label_as_aad() {
        let key = vec![7u8; 32];
        let msg = vec![MessageType::Ping.to_byte(), 9, 9];
        let sealed = wrap_encrypt(&key, b"dc1", &msg).unwrap();
        let kr = Keyring::new(vec![key]).unwrap();
        let opened = unwrap_encrypt(&kr, b"dc1", &sealed[1..]).unwrap();
        assert_eq!(opened, msg);
    }

    #[test]
    fn encrypt_fails_with_wrong_label_aad() {
        let key = vec![7u8; 32];
        let msg = vec![MessageType::Ping.to_byte(), 9, 9];
        let sealed = wrap_encrypt(&key, b"dc1", &msg).unwrap();
        let kr = Keyring::new(vec![key]).unwrap();
        assert!(unwrap_encrypt(&kr, b"dc2", &sealed[1..]).is_err());
    }

    #[test]
    fn full_packet_round_trip_all_layers() {
        let key = vec![1u8; 32];
        let kr = Keyring::new(vec![key.clone()]).unwrap();
        let msg = vec![MessageType::Ping.to_byte(), 1, 2, 3, 4, 5];
        let packet = encode_packet(
            &msg,
            b"lbl",
            Some(&key),
            EncodeOptions {
                crc: true,
                compress: true,
            },
        )
        .unwrap();
        let decoded = decode_packet(&packet, b"lbl", &kr).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn compound_round_trips() {
        let parts: Vec<Vec<u8>> = (0..5).map(|i| vec![i; (i as usize) + 1]).collect();
        let encoded = encode_compound(&parts).unwrap();
        let decoded = decode_compound(&encoded[2..]).unwrap();
        assert_eq!(decoded.parts, parts);
        assert_eq!(decoded.truncated, 0);
    }

    #[test]
    fn compound_reports_truncation_without_discarding() {
        let parts: Vec<Vec<u8>> = (0..3).map(|i| vec![i; 10]).collect();
        let mut encoded = encode_compound(&parts).unwrap();
        encoded.truncate(encoded.len() - 5);
        let decoded = decode_compound(&encoded[2..]).unwrap();
        assert!(decoded.truncated > 0);
        assert!(decoded.parts.len() < parts.len());
    }
}
