//! Shadowsocks wire codec: key derivation, AEAD/stream ciphers, connection framing.
//!
//! Grounded on the twelve methods and literal EVP_BytesToKey/nonce-reuse behavior this
//! gateway's own protocol specifies (see DESIGN.md, Open Question #1): the same
//! nonce/IV is reused for every sealed chunk of a connection rather than the
//! RFC-style incrementing counter. This is intentionally NOT compatible with stock
//! shadowsocks clients; it matches this gateway's own wire format and test vectors.

use crate::common::Address;
use crate::{Error, Result};
use aead::{Aead, KeyInit, Payload};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::generic_array::{typenum::U16, GenericArray};
use aes_gcm::AesGcm;
use chacha20poly1305::{ChaCha20Poly1305, Nonce as ChaChaNonce};
use cipher::{AsyncStreamCipher, KeyIvInit, StreamCipher};
use md5::{Digest, Md5};
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

type Aes128Gcm16 = AesGcm<Aes128, U16>;
type Aes192Gcm16 = AesGcm<Aes192, U16>;
type Aes256Gcm16 = AesGcm<Aes256, U16>;

type Aes128CfbEnc = cfb_mode::Encryptor<Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<Aes128>;
type Aes192CfbEnc = cfb_mode::Encryptor<Aes192>;
type Aes192CfbDec = cfb_mode::Decryptor<Aes192>;
type Aes256CfbEnc = cfb_mode::Encryptor<Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<Aes256>;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// One of the twelve Shadowsocks cipher methods (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    ChaCha20IetfPoly1305,
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
}

impl CipherKind {
    pub fn key_size(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm | CipherKind::Aes128Cfb | CipherKind::Aes128Ctr => 16,
            CipherKind::Aes192Gcm | CipherKind::Aes192Cfb | CipherKind::Aes192Ctr => 24,
            CipherKind::Aes256Gcm
            | CipherKind::Aes256Cfb
            | CipherKind::Aes256Ctr
            | CipherKind::ChaCha20IetfPoly1305 => 32,
        }
    }

    /// Length of the per-connection IV/salt the client sends first.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherKind::ChaCha20IetfPoly1305 => 32,
            _ => 16,
        }
    }

    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherKind::Aes128Gcm
                | CipherKind::Aes192Gcm
                | CipherKind::Aes256Gcm
                | CipherKind::ChaCha20IetfPoly1305
        )
    }

    /// AEAD authentication tag length, 0 for stream ciphers.
    pub fn tag_size(&self) -> usize {
        if self.is_aead() {
            16
        } else {
            0
        }
    }
}

impl TryFrom<&str> for CipherKind {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-192-gcm" => Ok(CipherKind::Aes192Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20IetfPoly1305),
            "aes-128-cfb" => Ok(CipherKind::Aes128Cfb),
            "aes-192-cfb" => Ok(CipherKind::Aes192Cfb),
            "aes-256-cfb" => Ok(CipherKind::Aes256Cfb),
            "aes-128-ctr" => Ok(CipherKind::Aes128Ctr),
            "aes-192-ctr" => Ok(CipherKind::Aes192Ctr),
            "aes-256-ctr" => Ok(CipherKind::Aes256Ctr),
            other => Err(Error::unsupported(format!("unknown shadowsocks method: {}", other))),
        }
    }
}

/// EVP_BytesToKey: iterated MD5, deterministic, password-seeded only.
/// Retained verbatim for wire compatibility — this is a compatibility contract,
/// not a security decision (§4.2).
pub fn derive_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

fn chacha_nonce(salt: &[u8]) -> ChaChaNonce {
    let mut nonce = [0u8; 12];
    let n = salt.len().min(12);
    nonce[..n].copy_from_slice(&salt[..n]);
    ChaChaNonce::from(nonce)
}

/// Seal `plaintext` with `key`/`iv` under `kind`, reusing the same nonce every call
/// (§9 Open Question #1 — literal source behavior, not RFC framing).
pub fn encrypt(kind: CipherKind, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if kind.is_aead() {
        aead_seal(kind, key, iv, plaintext)
    } else {
        let mut buf = plaintext.to_vec();
        stream_apply(kind, key, iv, &mut buf, true)?;
        Ok(buf)
    }
}

/// Open a chunk sealed by [`encrypt`].
pub fn decrypt(kind: CipherKind, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if kind.is_aead() {
        aead_open(kind, key, iv, ciphertext)
    } else {
        let mut buf = ciphertext.to_vec();
        stream_apply(kind, key, iv, &mut buf, false)?;
        Ok(buf)
    }
}

fn aead_seal(kind: CipherKind, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let payload = Payload { msg: plaintext, aad: &[] };
    match kind {
        CipherKind::Aes128Gcm => {
            let cipher = Aes128Gcm16::new(GenericArray::from_slice(key));
            cipher
                .encrypt(GenericArray::from_slice(iv), payload)
                .map_err(|e| Error::crypto(e.to_string()))
        }
        CipherKind::Aes192Gcm => {
            let cipher = Aes192Gcm16::new(GenericArray::from_slice(key));
            cipher
                .encrypt(GenericArray::from_slice(iv), payload)
                .map_err(|e| Error::crypto(e.to_string()))
        }
        CipherKind::Aes256Gcm => {
            let cipher = Aes256Gcm16::new(GenericArray::from_slice(key));
            cipher
                .encrypt(GenericArray::from_slice(iv), payload)
                .map_err(|e| Error::crypto(e.to_string()))
        }
        CipherKind::ChaCha20IetfPoly1305 => {
            let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(key));
            cipher
                .encrypt(&chacha_nonce(iv), payload)
                .map_err(|e| Error::crypto(e.to_string()))
        }
        _ => unreachable!("not an AEAD method"),
    }
}

fn aead_open(kind: CipherKind, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let payload = Payload { msg: ciphertext, aad: &[] };
    let result = match kind {
        CipherKind::Aes128Gcm => {
            let cipher = Aes128Gcm16::new(GenericArray::from_slice(key));
            cipher.decrypt(GenericArray::from_slice(iv), payload)
        }
        CipherKind::Aes192Gcm => {
            let cipher = Aes192Gcm16::new(GenericArray::from_slice(key));
            cipher.decrypt(GenericArray::from_slice(iv), payload)
        }
        CipherKind::Aes256Gcm => {
            let cipher = Aes256Gcm16::new(GenericArray::from_slice(key));
            cipher.decrypt(GenericArray::from_slice(iv), payload)
        }
        CipherKind::ChaCha20IetfPoly1305 => {
            let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(key));
            cipher.decrypt(&chacha_nonce(iv), payload)
        }
        _ => unreachable!("not an AEAD method"),
    };
    result.map_err(|_| Error::decrypt_fail("AEAD authentication failed"))
}

/// Stream ciphers are re-keyed fresh from `(key, iv)` on every call, matching the
/// source's behavior of constructing a new cipher object per encrypt/decrypt
/// invocation rather than chaining state across chunks.
fn stream_apply(kind: CipherKind, key: &[u8], iv: &[u8], buf: &mut [u8], encrypt: bool) -> Result<()> {
    macro_rules! cfb {
        ($enc:ty, $dec:ty) => {
            if encrypt {
                let c = <$enc>::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
                c.encrypt(buf);
            } else {
                let c = <$dec>::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
                c.decrypt(buf);
            }
        };
    }
    match kind {
        CipherKind::Aes128Cfb => cfb!(Aes128CfbEnc, Aes128CfbDec),
        CipherKind::Aes192Cfb => cfb!(Aes192CfbEnc, Aes192CfbDec),
        CipherKind::Aes256Cfb => cfb!(Aes256CfbEnc, Aes256CfbDec),
        CipherKind::Aes128Ctr => {
            let mut c = Aes128Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
            c.apply_keystream(buf);
        }
        CipherKind::Aes192Ctr => {
            let mut c = Aes192Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
            c.apply_keystream(buf);
        }
        CipherKind::Aes256Ctr => {
            let mut c = Aes256Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
            c.apply_keystream(buf);
        }
        _ => unreachable!("not a stream method"),
    }
    Ok(())
}

const MAX_ADDR_READ: usize = 1024;
const MAX_CHUNK_READ: usize = 8 * 1024;

/// A Shadowsocks-encrypted TCP connection, framed per §4.2.
pub struct ShadowsocksConnection {
    inner: TcpStream,
    kind: CipherKind,
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl ShadowsocksConnection {
    /// Read the client IV and the address+payload blob, returning the connection
    /// handle plus the decoded target address and any payload bytes that
    /// followed it in the same blob.
    pub async fn accept(
        mut inner: TcpStream,
        kind: CipherKind,
        key: Vec<u8>,
    ) -> Result<(Self, Address, u16, Vec<u8>)> {
        let mut iv = vec![0u8; kind.iv_size()];
        inner
            .read_exact(&mut iv)
            .await
            .map_err(|e| Error::bad_iv(e.to_string()))?;

        let mut buf = vec![0u8; MAX_ADDR_READ];
        let n = inner.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::bad_iv("connection closed before address"));
        }
        buf.truncate(n);

        let plain = decrypt(kind, &key, &iv, &buf)?;
        let (address, port, consumed) = Address::decode(&plain)?;
        let payload = plain[consumed..].to_vec();

        Ok((Self { inner, kind, key, iv }, address, port, payload))
    }

    /// Read one ciphertext chunk from the client, decrypting with the connection's
    /// fixed IV. Returns `(plaintext, ciphertext_len)`; `ciphertext_len` is what
    /// traffic accounting bills (§4.3).
    pub async fn read_chunk(&mut self) -> Result<Option<(Vec<u8>, usize)>> {
        let mut buf = vec![0u8; MAX_CHUNK_READ];
        let n = self.inner.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        let plain = decrypt(self.kind, &self.key, &self.iv, &buf)?;
        Ok(Some((plain, n)))
    }

    /// Encrypt and write one chunk to the client. Returns the ciphertext length
    /// billed to traffic accounting.
    pub async fn write_chunk(&mut self, plaintext: &[u8]) -> Result<usize> {
        let sealed = encrypt(self.kind, &self.key, &self.iv, plaintext)?;
        self.inner.write_all(&sealed).await?;
        Ok(sealed.len())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> TcpStream {
        self.inner
    }

    /// Split into independent read/write halves sharing the same cipher
    /// parameters, so upload and download can run as two concurrent tasks
    /// without a lock (§5: direction copies run concurrently).
    pub fn into_split(self) -> (ShadowsocksReadHalf, ShadowsocksWriteHalf) {
        let (read, write) = self.inner.into_split();
        (
            ShadowsocksReadHalf { inner: read, kind: self.kind, key: self.key.clone(), iv: self.iv.clone() },
            ShadowsocksWriteHalf { inner: write, kind: self.kind, key: self.key, iv: self.iv },
        )
    }
}

pub struct ShadowsocksReadHalf {
    inner: tokio::net::tcp::OwnedReadHalf,
    kind: CipherKind,
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl ShadowsocksReadHalf {
    /// Read one ciphertext chunk, returning `(plaintext, ciphertext_len)`.
    pub async fn read_chunk(&mut self) -> Result<Option<(Vec<u8>, usize)>> {
        let mut buf = vec![0u8; MAX_CHUNK_READ];
        let n = self.inner.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        let plain = decrypt(self.kind, &self.key, &self.iv, &buf)?;
        Ok(Some((plain, n)))
    }
}

pub struct ShadowsocksWriteHalf {
    inner: tokio::net::tcp::OwnedWriteHalf,
    kind: CipherKind,
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl ShadowsocksWriteHalf {
    pub async fn write_chunk(&mut self, plaintext: &[u8]) -> Result<usize> {
        let sealed = encrypt(self.kind, &self.key, &self.iv, plaintext)?;
        self.inner.write_all(&sealed).await?;
        Ok(sealed.len())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Encode a target address + port + optional payload as a single Shadowsocks
/// request blob (used by client-side test harnesses).
pub fn encode_request(address: &Address, port: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = address.encode(port);
    buf.extend_from_slice(payload);
    buf
}

pub fn unspecified_address() -> Address {
    Address::Ipv4(Ipv4Addr::UNSPECIFIED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_kind_parsing() {
        assert_eq!(CipherKind::try_from("aes-256-gcm").unwrap(), CipherKind::Aes256Gcm);
        assert_eq!(
            CipherKind::try_from("chacha20-ietf-poly1305").unwrap(),
            CipherKind::ChaCha20IetfPoly1305
        );
        assert_eq!(CipherKind::try_from("aes-128-ctr").unwrap(), CipherKind::Aes128Ctr);
        assert!(CipherKind::try_from("rc4-md5").is_err());
    }

    #[test]
    fn test_cipher_kind_sizes() {
        assert_eq!(CipherKind::Aes128Gcm.key_size(), 16);
        assert_eq!(CipherKind::Aes192Gcm.key_size(), 24);
        assert_eq!(CipherKind::Aes256Gcm.key_size(), 32);
        assert_eq!(CipherKind::ChaCha20IetfPoly1305.key_size(), 32);
        assert_eq!(CipherKind::ChaCha20IetfPoly1305.iv_size(), 32);
        assert_eq!(CipherKind::Aes256Cfb.iv_size(), 16);
        assert_eq!(CipherKind::Aes256Ctr.tag_size(), 0);
        assert_eq!(CipherKind::Aes256Gcm.tag_size(), 16);
    }

    #[test]
    fn test_derive_key_deterministic_and_reference_vector() {
        let k1 = derive_key(b"foo", 32);
        let k2 = derive_key(b"foo", 32);
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 32);
        // First 16 bytes are MD5("foo"); this is the EVP_BytesToKey first round.
        let expected_first_round = Md5::digest(b"foo");
        assert_eq!(&k1[..16], expected_first_round.as_slice());
    }

    #[test]
    fn test_aead_roundtrip_all_methods() {
        for kind in [
            CipherKind::Aes128Gcm,
            CipherKind::Aes192Gcm,
            CipherKind::Aes256Gcm,
            CipherKind::ChaCha20IetfPoly1305,
        ] {
            let key = derive_key(b"test-password", kind.key_size());
            let iv = vec![7u8; kind.iv_size()];
            let plaintext = b"hello, shadowsocks";
            let ciphertext = encrypt(kind, &key, &iv, plaintext).unwrap();
            let decrypted = decrypt(kind, &key, &iv, &ciphertext).unwrap();
            assert_eq!(decrypted, plaintext, "{:?} roundtrip failed", kind);
        }
    }

    #[test]
    fn test_stream_roundtrip_all_methods() {
        for kind in [
            CipherKind::Aes128Cfb,
            CipherKind::Aes192Cfb,
            CipherKind::Aes256Cfb,
            CipherKind::Aes128Ctr,
            CipherKind::Aes192Ctr,
            CipherKind::Aes256Ctr,
        ] {
            let key = derive_key(b"test-password", kind.key_size());
            let iv = vec![3u8; kind.iv_size()];
            let plaintext = b"hello, shadowsocks";
            let ciphertext = encrypt(kind, &key, &iv, plaintext).unwrap();
            let decrypted = decrypt(kind, &key, &iv, &ciphertext).unwrap();
            assert_eq!(decrypted, plaintext, "{:?} roundtrip failed", kind);
        }
    }

    #[test]
    fn test_same_nonce_reused_produces_same_ciphertext() {
        // Pinning Open Question #1: encrypting the same plaintext twice with the
        // same (key, iv) yields identical ciphertext, because the nonce is reused
        // rather than incremented between calls.
        let key = derive_key(b"test-password", 32);
        let iv = vec![9u8; 16];
        let a = encrypt(CipherKind::Aes256Gcm, &key, &iv, b"same").unwrap();
        let b = encrypt(CipherKind::Aes256Gcm, &key, &iv, b"same").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_decrypt_fail_on_tampered_ciphertext() {
        let key = derive_key(b"test-password", 32);
        let iv = vec![1u8; 16];
        let mut ciphertext = encrypt(CipherKind::Aes256Gcm, &key, &iv, b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(matches!(
            decrypt(CipherKind::Aes256Gcm, &key, &iv, &ciphertext),
            Err(Error::DecryptFail(_))
        ));
    }
}
