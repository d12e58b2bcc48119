//! Incremental decryption over a reassembled byte stream

use super::{ContainerFormat, DecryptionContext, SNIFF_LEN};
use crate::error::{Error, Result};
use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, KeyIvInit, StreamCipher};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const BLOCK: usize = 16;

enum Mode {
    Clear,
    Ctr(Box<Aes128Ctr>),
    Cbc {
        cipher: Box<Aes128CbcDec>,
        // Ciphertext not yet decrypted; always holds the latest full block
        // because it may carry the padding
        pending: Vec<u8>,
    },
}

/// Decrypts one item's ciphertext fed in stream order
///
/// The cipher is initialised once; feeding the stream in any chunking yields
/// the same plaintext. The first plaintext bytes are checked against the
/// expected container, and a mismatch is reported as
/// [`Error::IntegrityFailure`].
pub struct StreamDecryptor {
    mode: Mode,
    expected: ContainerFormat,
    header: Vec<u8>,
    header_checked: bool,
    bytes_in: u64,
    bytes_out: u64,
}

impl StreamDecryptor {
    /// Create a decryptor for `context`, expecting `expected` plaintext
    pub fn new(context: &DecryptionContext, expected: ContainerFormat) -> Result<Self> {
        let mode = match context {
            DecryptionContext::Clear => Mode::Clear,
            DecryptionContext::Ctr { key, nonce } => {
                let mut iv = [0u8; BLOCK];
                iv[..8].copy_from_slice(nonce);
                let cipher = Aes128Ctr::new_from_slices(key, &iv)
                    .map_err(|e| Error::InvalidManifest(format!("CTR cipher: {e}")))?;
                Mode::Ctr(Box::new(cipher))
            }
            DecryptionContext::Cbc { key, iv } => {
                let cipher = Aes128CbcDec::new_from_slices(key, iv)
                    .map_err(|e| Error::InvalidManifest(format!("CBC cipher: {e}")))?;
                Mode::Cbc {
                    cipher: Box::new(cipher),
                    pending: Vec::new(),
                }
            }
        };

        Ok(Self {
            mode,
            expected,
            header: Vec::with_capacity(SNIFF_LEN),
            header_checked: false,
            bytes_in: 0,
            bytes_out: 0,
        })
    }

    /// Ciphertext bytes consumed so far
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Plaintext bytes produced so far
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Feed the next ciphertext chunk, returning the plaintext it releases
    ///
    /// CBC holds back its last block until [`finish`](Self::finish), so the
    /// output may lag the input by up to 16 bytes plus a partial block.
    pub fn update(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        self.bytes_in += chunk.len() as u64;

        let plain = match &mut self.mode {
            Mode::Clear => chunk.to_vec(),
            Mode::Ctr(cipher) => {
                let mut buffer = chunk.to_vec();
                cipher.apply_keystream(&mut buffer);
                buffer
            }
            Mode::Cbc { cipher, pending } => {
                pending.extend_from_slice(chunk);
                let tail = match pending.len() % BLOCK {
                    0 => BLOCK.min(pending.len()),
                    partial => partial,
                };
                let ready = pending.len() - tail;
                let mut buffer: Vec<u8> = pending.drain(..ready).collect();
                decrypt_blocks(cipher, &mut buffer);
                buffer
            }
        };

        self.emit(plain)
    }

    /// Flush the cipher and run the final integrity checks
    pub fn finish(mut self) -> Result<Vec<u8>> {
        let plain = match &mut self.mode {
            Mode::Clear | Mode::Ctr(_) => Vec::new(),
            Mode::Cbc { cipher, pending } => {
                if pending.len() != BLOCK {
                    return Err(Error::IntegrityFailure(format!(
                        "CBC ciphertext of {} bytes is not block aligned",
                        self.bytes_in
                    )));
                }
                let mut buffer = std::mem::take(pending);
                decrypt_blocks(cipher, &mut buffer);
                strip_pkcs7(&mut buffer)?;
                buffer
            }
        };

        let plain = self.emit(plain)?;
        if !self.header_checked {
            self.check_header()?;
        }
        Ok(plain)
    }

    fn emit(&mut self, plain: Vec<u8>) -> Result<Vec<u8>> {
        if !self.header_checked && self.header.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - self.header.len()).min(plain.len());
            self.header.extend_from_slice(&plain[..take]);
            if self.header.len() == SNIFF_LEN {
                self.check_header()?;
            }
        }
        self.bytes_out += plain.len() as u64;
        Ok(plain)
    }

    fn check_header(&mut self) -> Result<()> {
        self.header_checked = true;
        if self.expected.matches_header(&self.header) {
            return Ok(());
        }
        Err(Error::IntegrityFailure(format!(
            "plaintext does not start like {} (got {:02x?})",
            self.expected, self.header
        )))
    }
}

fn decrypt_blocks(cipher: &mut Aes128CbcDec, buffer: &mut [u8]) {
    for block in buffer.chunks_exact_mut(BLOCK) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn strip_pkcs7(buffer: &mut Vec<u8>) -> Result<()> {
    let pad = buffer.last().copied().unwrap_or(0) as usize;
    let valid = (1..=BLOCK).contains(&pad)
        && pad <= buffer.len()
        && buffer[buffer.len() - pad..].iter().all(|b| *b as usize == pad);
    if !valid {
        return Err(Error::IntegrityFailure("invalid PKCS#7 padding".into()));
    }
    buffer.truncate(buffer.len() - pad);
    Ok(())
}

/// Decrypt a complete ciphertext in one call
pub fn decrypt_all(
    context: &DecryptionContext,
    expected: ContainerFormat,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let mut decryptor = StreamDecryptor::new(context, expected)?;
    let mut plain = decryptor.update(ciphertext)?;
    plain.extend(decryptor.finish()?);
    Ok(plain)
}
