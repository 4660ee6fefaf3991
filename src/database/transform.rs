//! Compression and encryption passes applied to artifacts
//!
//! Forward transforms (`compress_file`, `encrypt_file`) replace the input
//! with a new file carrying an extra extension and remove the input only once
//! the output is complete. Reverse transforms write into uniquely named
//! temporary files that are deleted when the returned [`TempPath`] is closed
//! or dropped.
//!
//! Encrypted files use AES-256-GCM over 64 KiB chunks:
//!
//! ```text
//! magic (6) | nonce prefix (7) | { len: u32 BE | ciphertext+tag }*
//! ```
//!
//! Each chunk nonce is `prefix || counter (u32 BE) || last flag`, so chunks
//! cannot be reordered, dropped, or truncated without failing authentication.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::debug;

use crate::database::backup_naming::{COMPRESSED_EXTENSION, ENCRYPTED_EXTENSION, transformed_path};
use crate::database::{DatabaseError, Result};

type HmacSha256 = Hmac<Sha256>;

const MAGIC: &[u8; 6] = b"LBENC\x01";
const NONCE_PREFIX_LEN: usize = 7;
const CHUNK_SIZE: usize = 64 * 1024;
const TAG_LEN: usize = 16;
const KEY_CONTEXT: &[u8] = b"lifeboat/backup-encryption/aes-256-gcm/v1";

/// Symmetric key derived from a file-resident secret
#[derive(Clone)]
pub struct EncryptionKey {
    key: [u8; 32],
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

impl EncryptionKey {
    /// Derive a key from secret material using HMAC-SHA256 with a fixed context
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(DatabaseError::Encryption("encryption secret is empty".to_string()));
        }
        let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
            .map_err(|e| DatabaseError::Encryption(e.to_string()))?;
        mac.update(KEY_CONTEXT);
        Ok(Self {
            key: mac.finalize().into_bytes().into(),
        })
    }

    /// Read the secret from `path`; surrounding whitespace is ignored
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| {
            DatabaseError::Encryption(format!("cannot read key file {}: {}", path.display(), e))
        })?;
        let secret = String::from_utf8_lossy(&raw);
        Self::from_secret(secret.trim().as_bytes())
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| DatabaseError::Encryption(e.to_string()))
    }
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..11].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = last as u8;
    nonce
}

/// Fill `buf` from `reader` until it is full or the reader is exhausted
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_chunk<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let n = read_full(reader, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

fn read_frame_len<R: Read>(reader: &mut R) -> Result<Option<usize>> {
    let mut buf = [0u8; 4];
    match read_full(reader, &mut buf)? {
        0 => Ok(None),
        4 => {
            let len = u32::from_be_bytes(buf) as usize;
            if len < TAG_LEN || len > CHUNK_SIZE + TAG_LEN {
                return Err(DatabaseError::Integrity(format!("invalid encrypted chunk length {}", len)));
            }
            Ok(Some(len))
        }
        _ => Err(DatabaseError::Integrity("encrypted stream is truncated".to_string())),
    }
}

/// Encrypt everything from `reader` into `writer`
pub fn encrypt_stream<R: Read, W: Write>(key: &EncryptionKey, reader: &mut R, writer: &mut W) -> Result<()> {
    let cipher = key.cipher()?;
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    rand::thread_rng().fill_bytes(&mut prefix);

    writer.write_all(MAGIC)?;
    writer.write_all(&prefix)?;

    let mut counter: u32 = 0;
    let mut current = read_chunk(reader)?;
    loop {
        let next = if current.len() == CHUNK_SIZE {
            read_chunk(reader)?
        } else {
            Vec::new()
        };
        let last = next.is_empty();

        let nonce = chunk_nonce(&prefix, counter, last);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), current.as_slice())
            .map_err(|_| DatabaseError::Encryption("chunk encryption failed".to_string()))?;
        writer.write_all(&(sealed.len() as u32).to_be_bytes())?;
        writer.write_all(&sealed)?;

        if last {
            break;
        }
        current = next;
        counter = counter
            .checked_add(1)
            .ok_or_else(|| DatabaseError::Encryption("input too large".to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Decrypt a stream produced by [`encrypt_stream`]
pub fn decrypt_stream<R: Read, W: Write>(key: &EncryptionKey, reader: &mut R, writer: &mut W) -> Result<()> {
    let cipher = key.cipher()?;

    let mut header = [0u8; MAGIC.len() + NONCE_PREFIX_LEN];
    if read_full(reader, &mut header)? != header.len() || &header[..MAGIC.len()] != MAGIC {
        return Err(DatabaseError::Integrity("not an encrypted backup".to_string()));
    }
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    prefix.copy_from_slice(&header[MAGIC.len()..]);

    let mut len = read_frame_len(reader)?
        .ok_or_else(|| DatabaseError::Integrity("encrypted stream has no data".to_string()))?;
    let mut counter: u32 = 0;
    loop {
        let mut sealed = vec![0u8; len];
        if read_full(reader, &mut sealed)? != len {
            return Err(DatabaseError::Integrity("encrypted stream is truncated".to_string()));
        }
        let next = read_frame_len(reader)?;
        let nonce = chunk_nonce(&prefix, counter, next.is_none());
        let plain = cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
            .map_err(|_| {
                DatabaseError::Encryption("decryption failed: wrong key or corrupted data".to_string())
            })?;
        writer.write_all(&plain)?;

        match next {
            Some(n) => {
                len = n;
                counter = counter
                    .checked_add(1)
                    .ok_or_else(|| DatabaseError::Integrity("too many chunks".to_string()))?;
            }
            None => break,
        }
    }
    writer.flush()?;
    Ok(())
}

/// Run `write` into `output`, removing the partial output if it fails
fn write_output<F>(output: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let result = File::create(output)
        .map_err(DatabaseError::from)
        .and_then(|file| {
            let mut writer = BufWriter::new(file);
            write(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            Ok(())
        });
    if result.is_err() {
        let _ = std::fs::remove_file(output);
    }
    result
}

fn compress_file_blocking(input: &Path, level: u32) -> Result<PathBuf> {
    let output = transformed_path(input, COMPRESSED_EXTENSION);
    write_output(&output, |writer| {
        let mut reader = BufReader::new(File::open(input)?);
        let mut encoder = GzEncoder::new(writer, Compression::new(level.min(9)));
        io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?;
        Ok(())
    })?;
    std::fs::remove_file(input)?;
    Ok(output)
}

fn encrypt_file_blocking(input: &Path, key: &EncryptionKey) -> Result<PathBuf> {
    let output = transformed_path(input, ENCRYPTED_EXTENSION);
    write_output(&output, |writer| {
        let mut reader = BufReader::new(File::open(input)?);
        encrypt_stream(key, &mut reader, writer)
    })?;
    std::fs::remove_file(input)?;
    Ok(output)
}

fn temp_in(dir: &Path, label: &str) -> Result<(File, TempPath)> {
    let file = tempfile::Builder::new()
        .prefix(&format!(".lifeboat-{}-", label))
        .tempfile_in(dir)?;
    let (file, path) = file.into_parts();
    Ok((file, path))
}

fn decrypt_to_temp_blocking(input: &Path, key: &EncryptionKey, dir: &Path) -> Result<TempPath> {
    let (file, path) = temp_in(dir, "decrypt")?;
    let mut reader = BufReader::new(File::open(input)?);
    let mut writer = BufWriter::new(file);
    decrypt_stream(key, &mut reader, &mut writer)?;
    writer.flush()?;
    Ok(path)
}

fn decompress_to_temp_blocking(input: &Path, dir: &Path) -> Result<TempPath> {
    let (file, path) = temp_in(dir, "decompress")?;
    let mut decoder = GzDecoder::new(BufReader::new(File::open(input)?));
    let mut writer = BufWriter::new(file);
    io::copy(&mut decoder, &mut writer)
        .map_err(|e| DatabaseError::Integrity(format!("decompression failed: {}", e)))?;
    writer.flush()?;
    Ok(path)
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DatabaseError::Io(io::Error::other(e)))?
}

/// Gzip `input` into `<input>.gz` and remove `input`
pub async fn compress_file(input: &Path, level: u32) -> Result<PathBuf> {
    let input = input.to_path_buf();
    debug!(file = %input.display(), level, "compressing");
    blocking(move || compress_file_blocking(&input, level)).await
}

/// Encrypt `input` into `<input>.enc` and remove `input`
pub async fn encrypt_file(input: &Path, key: &EncryptionKey) -> Result<PathBuf> {
    let input = input.to_path_buf();
    let key = key.clone();
    debug!(file = %input.display(), "encrypting");
    blocking(move || encrypt_file_blocking(&input, &key)).await
}

/// Decrypt `input` into a unique temporary file inside `dir`
pub async fn decrypt_to_temp(input: &Path, key: &EncryptionKey, dir: &Path) -> Result<TempPath> {
    let input = input.to_path_buf();
    let dir = dir.to_path_buf();
    let key = key.clone();
    blocking(move || decrypt_to_temp_blocking(&input, &key, &dir)).await
}

/// Gunzip `input` into a unique temporary file inside `dir`
pub async fn decompress_to_temp(input: &Path, dir: &Path) -> Result<TempPath> {
    let input = input.to_path_buf();
    let dir = dir.to_path_buf();
    blocking(move || decompress_to_temp_blocking(&input, &dir)).await
}
