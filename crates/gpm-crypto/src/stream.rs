//! Authenticated stream cipher over chunked byte streams.
//!
//! Encryption yields the 25-byte header, then one ciphertext chunk per input
//! chunk, then the 32-byte tag. Decryption is lazy as well and never emits the
//! trailing 32 bytes it has seen so far, since those may turn out to be the tag.
//!
//! The stream decoder hands plaintext out before the tag is checked; a final
//! `Err(InvalidToken)` item means everything already yielded must be discarded.
//! `decrypt` and `decrypt_file` only release output after verification.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher as _};
use ctr::Ctr128BE;
use gpm_core::{GpmError, GpmResult};
use hmac::{Hmac, Mac};
use rand::RngCore;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::keys::KeyMaterial;
use crate::staging;
use crate::{HEADER_SIZE, MAGIC, MAX_CLOCK_SKEW, NONCE_SIZE, TAG_SIZE};

type Aes128Ctr = Ctr128BE<Aes128>;
type HmacSha256 = Hmac<sha2::Sha256>;

/// The authenticated stream cipher, keyed by one 256-bit key.
#[derive(Debug, Clone)]
pub struct StreamCipher {
    key: KeyMaterial,
}

impl StreamCipher {
    pub fn new(key: KeyMaterial) -> Self {
        Self { key }
    }

    /// Key from raw bytes; anything but 32 bytes is `InvalidKey`.
    pub fn from_slice(key: &[u8]) -> GpmResult<Self> {
        Ok(Self::new(KeyMaterial::from_slice(key)?))
    }

    /// Encrypt a stream of plaintext chunks, stamped with the current time.
    pub fn encrypt_stream<I>(&self, chunks: I) -> GpmResult<EncryptStream<I::IntoIter>>
    where
        I: IntoIterator<Item = std::io::Result<Vec<u8>>>,
    {
        self.encrypt_stream_at(chunks, unix_now())
    }

    /// Encrypt with an explicit capture timestamp.
    pub fn encrypt_stream_at<I>(
        &self,
        chunks: I,
        timestamp: u64,
    ) -> GpmResult<EncryptStream<I::IntoIter>>
    where
        I: IntoIterator<Item = std::io::Result<Vec<u8>>>,
    {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.push(MAGIC);
        header.extend_from_slice(&timestamp.to_be_bytes());
        header.extend_from_slice(&nonce);

        let mut mac = new_mac(&self.key)?;
        mac.update(&header);

        Ok(EncryptStream {
            inner: chunks.into_iter(),
            header: Some(header),
            cipher: new_ctr(&self.key, &nonce)?,
            mac: Some(mac),
        })
    }

    /// Decrypt a stream of ciphertext chunks.
    ///
    /// With `ttl` set, tokens older than `ttl` seconds, or stamped more than
    /// `MAX_CLOCK_SKEW` seconds in the future, are rejected.
    pub fn decrypt_stream<I>(&self, chunks: I, ttl: Option<u64>) -> DecryptStream<I::IntoIter>
    where
        I: IntoIterator<Item = std::io::Result<Vec<u8>>>,
    {
        self.decrypt_stream_at(chunks, ttl, unix_now())
    }

    /// Decrypt, judging freshness against an explicit `now`.
    pub fn decrypt_stream_at<I>(
        &self,
        chunks: I,
        ttl: Option<u64>,
        now: u64,
    ) -> DecryptStream<I::IntoIter>
    where
        I: IntoIterator<Item = std::io::Result<Vec<u8>>>,
    {
        DecryptStream {
            inner: chunks.into_iter(),
            key: self.key.clone(),
            ttl,
            now,
            pending: Vec::new(),
            opened: None,
            done: false,
        }
    }

    /// Encrypt an in-memory buffer into a single token.
    pub fn encrypt(&self, plaintext: &[u8]) -> GpmResult<Vec<u8>> {
        let parts = self
            .encrypt_stream(std::iter::once(Ok(plaintext.to_vec())))?
            .collect::<GpmResult<Vec<_>>>()?;
        Ok(parts.concat())
    }

    /// Decrypt a whole token; nothing is returned unless the tag verifies.
    pub fn decrypt(&self, token: &[u8], ttl: Option<u64>) -> GpmResult<Vec<u8>> {
        let parts = self
            .decrypt_stream(std::iter::once(Ok(token.to_vec())), ttl)
            .collect::<GpmResult<Vec<_>>>()?;
        Ok(parts.concat())
    }

    /// Encrypt `src` into `dst` block by block.
    ///
    /// `dst` is replaced only once the whole token has been written.
    pub fn encrypt_file(&self, src: &Path, dst: &Path, block_size: usize) -> GpmResult<()> {
        let input = File::open(src)?;
        let blocks = self.encrypt_stream(read_blocks(input, block_size))?;
        write_staged(dst, blocks)
    }

    /// Decrypt `src` into `dst` block by block.
    ///
    /// `dst` is replaced only after the tag has verified; a failed check
    /// leaves any previous `dst` untouched.
    pub fn decrypt_file(
        &self,
        src: &Path,
        dst: &Path,
        block_size: usize,
        ttl: Option<u64>,
    ) -> GpmResult<()> {
        let input = File::open(src)?;
        let blocks = self.decrypt_stream(read_blocks(input, block_size), ttl);
        write_staged(dst, blocks)
    }
}

/// Lazy encryptor returned by [`StreamCipher::encrypt_stream`].
pub struct EncryptStream<I> {
    inner: I,
    header: Option<Vec<u8>>,
    cipher: Aes128Ctr,
    mac: Option<HmacSha256>,
}

impl<I> Iterator for EncryptStream<I>
where
    I: Iterator<Item = std::io::Result<Vec<u8>>>,
{
    type Item = GpmResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(header) = self.header.take() {
            return Some(Ok(header));
        }
        let mac = self.mac.as_mut()?;
        match self.inner.next() {
            Some(Ok(mut block)) => {
                self.cipher.apply_keystream(&mut block);
                mac.update(&block);
                Some(Ok(block))
            }
            Some(Err(e)) => {
                self.mac = None;
                Some(Err(e.into()))
            }
            None => {
                let mac = self.mac.take()?;
                Some(Ok(mac.finalize().into_bytes().to_vec()))
            }
        }
    }
}

struct Opened {
    cipher: Aes128Ctr,
    mac: HmacSha256,
}

/// Lazy decryptor returned by [`StreamCipher::decrypt_stream`].
pub struct DecryptStream<I> {
    inner: I,
    key: KeyMaterial,
    ttl: Option<u64>,
    now: u64,
    /// Header bytes until opened, then the held-back tail (never more than
    /// `TAG_SIZE` bytes between calls).
    pending: Vec<u8>,
    opened: Option<Opened>,
    done: bool,
}

impl<I> DecryptStream<I> {
    fn open_header(&mut self) -> GpmResult<()> {
        let header: Vec<u8> = self.pending.drain(..HEADER_SIZE).collect();
        if header[0] != MAGIC {
            return Err(GpmError::invalid_token("bad magic byte"));
        }

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&header[1..9]);
        let timestamp = u64::from_be_bytes(ts);
        if let Some(ttl) = self.ttl {
            if timestamp.saturating_add(ttl) < self.now {
                return Err(GpmError::invalid_token("token expired"));
            }
            if self.now.saturating_add(MAX_CLOCK_SKEW) < timestamp {
                return Err(GpmError::invalid_token("token timestamp is in the future"));
            }
        }

        let mut mac = new_mac(&self.key)?;
        mac.update(&header);
        let cipher = new_ctr(&self.key, &header[9..HEADER_SIZE])?;
        self.opened = Some(Opened { cipher, mac });
        Ok(())
    }

    fn finish(&mut self) -> GpmResult<()> {
        let opened = self
            .opened
            .take()
            .ok_or_else(|| GpmError::invalid_token("token shorter than header"))?;
        if self.pending.len() < TAG_SIZE {
            return Err(GpmError::invalid_token("token truncated: tag missing"));
        }
        opened
            .mac
            .verify_slice(&self.pending)
            .map_err(|_| GpmError::invalid_token("signature mismatch"))
    }

    fn fail(&mut self, err: GpmError) -> Option<GpmResult<Vec<u8>>> {
        self.done = true;
        self.opened = None;
        Some(Err(err))
    }
}

impl<I> Iterator for DecryptStream<I>
where
    I: Iterator<Item = std::io::Result<Vec<u8>>>,
{
    type Item = GpmResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(opened) = self.opened.as_mut() {
                if self.pending.len() > TAG_SIZE {
                    let tail = self.pending.split_off(self.pending.len() - TAG_SIZE);
                    let mut block = std::mem::replace(&mut self.pending, tail);
                    opened.mac.update(&block);
                    opened.cipher.apply_keystream(&mut block);
                    return Some(Ok(block));
                }
            }

            match self.inner.next() {
                Some(Ok(block)) => {
                    self.pending.extend_from_slice(&block);
                    if self.opened.is_none() && self.pending.len() >= HEADER_SIZE {
                        if let Err(e) = self.open_header() {
                            return self.fail(e);
                        }
                    }
                }
                Some(Err(e)) => return self.fail(e.into()),
                None => {
                    self.done = true;
                    return self.finish().err().map(Err);
                }
            }
        }
    }
}

/// Iterator over fixed-size blocks of a reader (the last one may be short).
pub struct BlockReader<R> {
    reader: R,
    block_size: usize,
    done: bool,
}

pub fn read_blocks<R: Read>(reader: R, block_size: usize) -> BlockReader<R> {
    BlockReader {
        reader,
        block_size,
        done: false,
    }
}

impl<R: Read> Iterator for BlockReader<R> {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = vec![0u8; self.block_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.done = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        if filled == 0 {
            self.done = true;
            return None;
        }
        buf.truncate(filled);
        Some(Ok(buf))
    }
}

fn write_staged<I>(dst: &Path, blocks: I) -> GpmResult<()>
where
    I: Iterator<Item = GpmResult<Vec<u8>>>,
{
    let staged = staging::staging_path(dst);
    let written = (|| -> GpmResult<()> {
        let mut out = BufWriter::new(File::create(&staged)?);
        for block in blocks {
            out.write_all(&block?)?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(())
    })();

    match written {
        Ok(()) => {
            staging::commit(&staged, dst)?;
            Ok(())
        }
        Err(e) => {
            staging::discard(&staged);
            Err(e)
        }
    }
}

fn new_mac(key: &KeyMaterial) -> GpmResult<HmacSha256> {
    HmacSha256::new_from_slice(key.signing_key())
        .map_err(|e| GpmError::InvalidKey(format!("signing key: {e}")))
}

fn new_ctr(key: &KeyMaterial, nonce: &[u8]) -> GpmResult<Aes128Ctr> {
    Aes128Ctr::new_from_slices(key.encryption_key(), nonce)
        .map_err(|e| GpmError::InvalidKey(format!("encryption key: {e}")))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
