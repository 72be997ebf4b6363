//! Deezer stream key derivation and stripe decryption.
//!
//! Streams are served as 2048-byte blocks where every third whole block
//! (index 0, 3, 6, ...) is Blowfish-CBC encrypted with a per-track key and a
//! fixed IV; the rest is plain MP3 data.

use aes::Aes128;
use anyhow::{anyhow, Result};
use blowfish::cipher::generic_array::GenericArray;
use blowfish::cipher::{BlockDecryptMut, BlockEncrypt, InnerIvInit, KeyInit};
use blowfish::Blowfish;

pub const STRIPE_BLOCK_SIZE: usize = 2048;

const TRACK_KEY_SECRET: &[u8; 16] = b"g4el58wc0zvf9na1";
const URL_KEY_SECRET: &[u8; 16] = b"jo6aey6haid2Teih";
const STRIPE_IV: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];
const URL_KEY_SEPARATOR: u8 = 0xA4;

type BlowfishCbcDec = cbc::Decryptor<Blowfish>;

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Per-track Blowfish key: both halves of the track id's md5 hex digest
/// XORed with the fixed secret.
pub fn track_key(track_id: &str) -> [u8; 16] {
    let digest = md5_hex(track_id.as_bytes());
    let digest = digest.as_bytes();
    let mut key = [0u8; 16];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = digest[i] ^ digest[i + 16] ^ TRACK_KEY_SECRET[i];
    }
    key
}

/// Hex-encoded, AES-128-ECB encrypted path component of the stream URL.
pub fn stream_url_key(md5_origin: &str, format: u8, track_id: &str, media_version: &str) -> String {
    let format = format.to_string();
    let parts: [&[u8]; 4] = [
        md5_origin.as_bytes(),
        format.as_bytes(),
        track_id.as_bytes(),
        media_version.as_bytes(),
    ];
    let concat = parts.join(&URL_KEY_SEPARATOR);

    let mut data = md5_hex(&concat).into_bytes();
    data.push(URL_KEY_SEPARATOR);
    data.extend_from_slice(&concat);
    data.push(URL_KEY_SEPARATOR);
    let rem = data.len() % 16;
    if rem != 0 {
        data.resize(data.len() + 16 - rem, 0);
    }

    let cipher = Aes128::new(GenericArray::from_slice(URL_KEY_SECRET));
    for block in data.chunks_exact_mut(16) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    to_hex(&data)
}

pub fn stream_url(md5_origin: &str, url_key: &str) -> Result<String> {
    let shard = md5_origin
        .chars()
        .next()
        .ok_or_else(|| anyhow!("empty MD5_ORIGIN"))?;
    Ok(format!(
        "https://e-cdns-proxy-{}.dzcdn.net/mobile/1/{}",
        shard, url_key
    ))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Incremental stripe decryptor. Feed network chunks of any size; output is
/// emitted per 2048-byte block and the trailing partial block on `finish`.
pub struct StripeDecryptor {
    cipher: Blowfish,
    pending: Vec<u8>,
    block_index: usize,
}

impl StripeDecryptor {
    pub fn new(track_key: &[u8; 16]) -> Result<Self> {
        let cipher: Blowfish = Blowfish::new_from_slice(track_key)
            .map_err(|_| anyhow!("invalid Blowfish key length"))?;
        Ok(Self {
            cipher,
            pending: Vec::with_capacity(STRIPE_BLOCK_SIZE),
            block_index: 0,
        })
    }

    pub fn update(&mut self, mut chunk: &[u8], out: &mut Vec<u8>) {
        while !chunk.is_empty() {
            let take = (STRIPE_BLOCK_SIZE - self.pending.len()).min(chunk.len());
            self.pending.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
            if self.pending.len() == STRIPE_BLOCK_SIZE {
                self.flush_block(out);
            }
        }
    }

    /// A short trailing block is never encrypted and passes through.
    pub fn finish(mut self, out: &mut Vec<u8>) {
        out.append(&mut self.pending);
    }

    fn flush_block(&mut self, out: &mut Vec<u8>) {
        if self.block_index % 3 == 0 {
            let mut decryptor = BlowfishCbcDec::inner_iv_init(
                self.cipher.clone(),
                GenericArray::from_slice(&STRIPE_IV),
            );
            for block in self.pending.chunks_exact_mut(8) {
                decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        }
        out.append(&mut self.pending);
        self.block_index += 1;
    }
}

/// Decrypt a fully buffered stream.
pub fn decrypt_stripes(track_key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    let mut decryptor = StripeDecryptor::new(track_key)?;
    let mut out = Vec::with_capacity(data.len());
    decryptor.update(data, &mut out);
    decryptor.finish(&mut out);
    Ok(out)
}
