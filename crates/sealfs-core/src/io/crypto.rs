//! Block-indexed AES-GCM random-access encryption.
//!
//! [`AesGcmRandomAccess`] turns any [`RandomAccess`] of ciphertext into a
//! virtual random-access plaintext stream. The underlying container is
//! divided into fixed physical blocks of `physical_block_size` bytes, each
//! laid out as `[12-byte IV ‖ ciphertext ‖ 16-byte MAC]`, so every physical
//! block carries a plaintext block of up to `physical_block_size - 28`
//! bytes.
//!
//! Two properties of the format matter to callers:
//!
//! - A physical block of all zero bytes decrypts to an all-zero plaintext
//!   block without any authentication check. Freshly drawn IVs are re-drawn
//!   while zero, so an all-zero block can only arise from hole-punching or
//!   zero-extension of the underlying container. This gives sparse files
//!   for free.
//! - The block's position is not bound into the MAC; authenticity is
//!   per-block, not positional.

use std::sync::Arc;

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};

use crate::error::{Error, Result};
use crate::io::RandomAccess;
use crate::rng::fill_random;

pub const IV_SIZE: u64 = 12;
pub const MAC_SIZE: u64 = 16;
pub const OVERHEAD: u64 = IV_SIZE + MAC_SIZE;

/// An encrypting, authenticating [`RandomAccess`] over another stream.
///
/// The 32-byte key is pinned for the lifetime of the stream. Instances carry
/// no internal lock; callers sharing one instance must serialize.
pub struct AesGcmRandomAccess<D: RandomAccess> {
    cipher: Aes256Gcm,
    delegate: Arc<D>,
    physical_block_size: u64,
    read_only: bool,
}

impl<D: RandomAccess> AesGcmRandomAccess<D> {
    pub fn new(
        delegate: Arc<D>,
        key: &[u8; 32],
        physical_block_size: u64,
        read_only: bool,
    ) -> Result<Self> {
        if physical_block_size <= OVERHEAD {
            return Err(Error::invalid(format!(
                "physical block size {physical_block_size} does not exceed the {OVERHEAD}-byte IV+MAC overhead"
            )));
        }
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            delegate,
            physical_block_size,
            read_only,
        })
    }

    /// Plaintext bytes per block.
    pub fn virtual_block_size(&self) -> u64 {
        self.physical_block_size - OVERHEAD
    }

    /// Ciphertext bytes per block, as stored in the underlying stream.
    pub fn underlying_block_size(&self) -> u64 {
        self.physical_block_size
    }

    /// Whether the stream was opened without write capability. Reporting
    /// only; enforcement belongs to the underlying stream.
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// The logical plaintext size corresponding to `underlying_size` bytes
    /// of ciphertext, without opening a stream.
    ///
    /// A trailing physical remainder of at most [`OVERHEAD`] bytes carries
    /// no plaintext.
    pub fn compute_virtual_size(underlying_size: u64, physical_block_size: u64) -> u64 {
        let blocks = underlying_size / physical_block_size;
        let residue = underlying_size % physical_block_size;
        blocks * (physical_block_size - OVERHEAD) + residue.saturating_sub(OVERHEAD)
    }

    /// Encrypt one plaintext block into `out = [IV ‖ ct ‖ MAC]`.
    fn encrypt_block(&self, plaintext: &[u8], out: &mut [u8]) -> Result<()> {
        if plaintext.len() + OVERHEAD as usize != out.len() {
            return Err(Error::internal(
                "ciphertext buffer does not match plaintext block",
            ));
        }
        let (iv, rest) = out.split_at_mut(IV_SIZE as usize);
        loop {
            fill_random(iv);
            // An all-zero IV would collide with the sparse-zero encoding.
            if iv.iter().any(|&b| b != 0) {
                break;
            }
        }
        let (body, mac) = rest.split_at_mut(plaintext.len());
        body.copy_from_slice(plaintext);
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(iv), b"", body)
            .map_err(|_| Error::internal("AES-GCM encryption failed"))?;
        mac.copy_from_slice(&tag);
        Ok(())
    }

    /// Decrypt one physical block; `out` receives exactly
    /// `ciphertext.len() - OVERHEAD` plaintext bytes.
    fn decrypt_block(&self, ciphertext: &[u8], out: &mut [u8]) -> std::result::Result<(), ()> {
        let iv = &ciphertext[..IV_SIZE as usize];
        let mac = &ciphertext[ciphertext.len() - MAC_SIZE as usize..];
        out.copy_from_slice(&ciphertext[IV_SIZE as usize..ciphertext.len() - MAC_SIZE as usize]);
        self.cipher
            .decrypt_in_place_detached(Nonce::from_slice(iv), b"", out, Tag::from_slice(mac))
            .map_err(|_| ())
    }
}

fn is_all_zeros(buffer: &[u8]) -> bool {
    buffer.iter().all(|&b| b == 0)
}

impl<D: RandomAccess> RandomAccess for AesGcmRandomAccess<D> {
    fn read(&self, offset: u64, output: &mut [u8]) -> Result<usize> {
        if output.is_empty() {
            return Ok(0);
        }
        // Zeroing up front makes "underlying was short" and "tail block is
        // sparse zero" indistinguishable from correctly decrypted zeros.
        output.fill(0);

        let v = self.virtual_block_size();
        let p = self.physical_block_size as usize;
        let start_block = offset / v;
        let start_residue = (offset % v) as usize;
        let end = offset + output.len() as u64;
        let end_block = end / v;
        let end_residue = end % v;
        let num_blocks = (end_block + u64::from(end_residue > 0) - start_block) as usize;

        let mut ciphertext = vec![0u8; num_blocks * p];
        let mut plaintext = vec![0u8; num_blocks * v as usize];

        let underlying_read = self
            .delegate
            .read(start_block * self.physical_block_size, &mut ciphertext)?;
        if underlying_read <= OVERHEAD as usize {
            return Ok(0);
        }
        let read_blocks = underlying_read / p;
        let read_residue = underlying_read % p;
        let plain_len =
            read_blocks * v as usize + read_residue.saturating_sub(OVERHEAD as usize);

        for i in 0..=read_blocks {
            let ct_start = i * p;
            if ct_start >= underlying_read {
                break;
            }
            let ct = &ciphertext[ct_start..underlying_read.min(ct_start + p)];
            if ct.len() <= OVERHEAD as usize || is_all_zeros(ct) {
                // Sparse-zero block: the plaintext region stays zero, and a
                // trailing remnant of at most OVERHEAD bytes holds nothing.
                continue;
            }
            let pt_start = i * v as usize;
            let pt_len = ct.len() - OVERHEAD as usize;
            let pt = &mut plaintext[pt_start..pt_start + pt_len];
            self.decrypt_block(ct, pt).map_err(|()| Error::IntegrityFailed {
                block_index: start_block + i as u64,
            })?;
        }

        if start_residue > plain_len {
            return Ok(0);
        }
        let n = (plain_len - start_residue).min(output.len());
        output[..n].copy_from_slice(&plaintext[start_residue..start_residue + n]);
        Ok(n)
    }

    fn write(&self, offset: u64, input: &[u8]) -> Result<()> {
        if input.is_empty() {
            return Ok(());
        }
        let v = self.virtual_block_size();
        let p = self.physical_block_size as usize;
        let start_block = offset / v;
        let start_residue = (offset % v) as usize;
        let end = offset + input.len() as u64;
        let end_block = end / v;
        let mut end_residue = (end % v) as usize;
        let num_blocks = (end_block + u64::from(end_residue > 0) - start_block) as usize;

        // A write landing wholly past the current trailing block leaves that
        // block untouched, but extending the underlying stream would make it
        // decode at full-block length. Pad it to a whole virtual block first,
        // exactly as a growing resize does; the gap blocks in between stay
        // zero and decode by the sparse rule.
        let current = self.size()?;
        let cur_q = current / v;
        let cur_r = current % v;
        if cur_r > 0 && cur_q < start_block {
            let mut tail_plain = vec![0u8; v as usize];
            if self.read(cur_q * v, &mut tail_plain)? as u64 != cur_r {
                return Err(Error::internal("underlying stream changed size concurrently"));
            }
            let mut tail_cipher = vec![0u8; p];
            self.encrypt_block(&tail_plain, &mut tail_cipher)?;
            self.delegate
                .write(cur_q * self.physical_block_size, &tail_cipher)?;
        }

        let mut plaintext = vec![0u8; num_blocks * v as usize];
        let mut ciphertext = vec![0u8; num_blocks * p];

        // Preserve the unwritten prefix of the first block.
        if start_residue > 0 && start_block < end_block {
            self.read(start_block * v, &mut plaintext[..v as usize])?;
        }
        // Preserve the tail of the last block, adopting whatever is on disk
        // if it is longer than the write: a partial write never shortens.
        if end_residue > 0 {
            let tail_start = plaintext.len() - v as usize;
            let existing = self.read(end_block * v, &mut plaintext[tail_start..])?;
            end_residue = end_residue.max(existing);
        }
        let (plain_len, cipher_len) = if end_residue > 0 {
            (
                plaintext.len() - v as usize + end_residue,
                ciphertext.len() - p + end_residue + OVERHEAD as usize,
            )
        } else {
            (plaintext.len(), ciphertext.len())
        };

        plaintext[start_residue..start_residue + input.len()].copy_from_slice(input);

        for i in 0..num_blocks {
            let pt_start = i * v as usize;
            if pt_start >= plain_len {
                break;
            }
            let pt_end = plain_len.min(pt_start + v as usize);
            let ct_start = i * p;
            let ct_end = ct_start + (pt_end - pt_start) + OVERHEAD as usize;
            self.encrypt_block(&plaintext[pt_start..pt_end], &mut ciphertext[ct_start..ct_end])?;
        }

        self.delegate
            .write(start_block * self.physical_block_size, &ciphertext[..cipher_len])
    }

    fn size(&self) -> Result<u64> {
        Ok(Self::compute_virtual_size(
            self.delegate.size()?,
            self.physical_block_size,
        ))
    }

    fn resize(&self, new_size: u64) -> Result<()> {
        let v = self.virtual_block_size();
        let p = self.physical_block_size;
        if new_size == 0 {
            return self.delegate.resize(0);
        }
        let current = self.size()?;
        if current == new_size {
            return Ok(());
        }
        let new_q = new_size / v;
        let new_r = new_size % v;
        let cur_q = current / v;
        let cur_r = current % v;

        if new_q == cur_q {
            if new_r == 0 {
                self.delegate.resize(new_q * p)
            } else {
                // Same block count: re-encrypt the shared trailing block at
                // the new residue length.
                let mut plaintext = vec![0u8; cur_r.max(new_r) as usize];
                if self.read(cur_q * v, &mut plaintext[..cur_r as usize])? as u64 != cur_r {
                    return Err(Error::internal("underlying stream changed size concurrently"));
                }
                let mut ciphertext = vec![0u8; (new_r + OVERHEAD) as usize];
                self.encrypt_block(&plaintext[..new_r as usize], &mut ciphertext)?;
                self.delegate.write(cur_q * p, &ciphertext)?;
                if new_r < cur_r {
                    self.delegate.resize(new_q * p + new_r + OVERHEAD)?;
                }
                Ok(())
            }
        } else if new_q < cur_q {
            if new_r == 0 {
                self.delegate.resize(new_q * p)
            } else {
                // Shrinking across blocks: block new_q is currently full.
                let mut plaintext = vec![0u8; v as usize];
                if self.read(new_q * v, &mut plaintext)? != plaintext.len() {
                    return Err(Error::internal("underlying stream changed size concurrently"));
                }
                let mut ciphertext = vec![0u8; (new_r + OVERHEAD) as usize];
                self.encrypt_block(&plaintext[..new_r as usize], &mut ciphertext)?;
                self.delegate.write(new_q * p, &ciphertext)?;
                self.delegate.resize(new_q * p + new_r + OVERHEAD)
            }
        } else {
            // Growing across blocks: pad the old trailing block to a full
            // virtual block, then extend with zero physical bytes, which the
            // sparse rule reads back as zero plaintext.
            if cur_r > 0 {
                let mut plaintext = vec![0u8; v as usize];
                if self.read(cur_q * v, &mut plaintext)? as u64 != cur_r {
                    return Err(Error::internal("underlying stream changed size concurrently"));
                }
                let mut ciphertext = vec![0u8; p as usize];
                self.encrypt_block(&plaintext, &mut ciphertext)?;
                self.delegate.write(cur_q * p, &ciphertext)?;
            }
            let tail = if new_r > 0 { new_r + OVERHEAD } else { 0 };
            self.delegate.resize(new_q * p + tail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIo;
    use rand::rngs::StdRng;
    use rand::{Rng, RngCore, SeedableRng};

    const P: u64 = 64;
    const V: u64 = P - OVERHEAD; // 36

    fn fresh(delegate: &Arc<MemoryIo>, key: &[u8; 32]) -> AesGcmRandomAccess<MemoryIo> {
        AesGcmRandomAccess::new(delegate.clone(), key, P, false).unwrap()
    }

    fn read_all(io: &dyn RandomAccess) -> Vec<u8> {
        let mut out = vec![0u8; io.size().unwrap() as usize];
        let n = io.read(0, &mut out).unwrap();
        assert_eq!(n, out.len());
        out
    }

    #[test]
    fn rejects_block_size_within_overhead() {
        let delegate = Arc::new(MemoryIo::new());
        for bad in [0, 1, OVERHEAD - 1, OVERHEAD] {
            assert!(matches!(
                AesGcmRandomAccess::new(delegate.clone(), &[0u8; 32], bad, false),
                Err(Error::InvalidParameter(_))
            ));
        }
        AesGcmRandomAccess::new(delegate, &[0u8; 32], OVERHEAD + 1, false).unwrap();
    }

    #[test]
    fn round_trip_through_reopen() {
        let mut key = [0u8; 32];
        fill_random(&mut key);
        let delegate = Arc::new(MemoryIo::new());

        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        fresh(&delegate, &key).write(0, &payload).unwrap();

        let reopened = fresh(&delegate, &key);
        assert_eq!(reopened.size().unwrap(), payload.len() as u64);
        assert_eq!(read_all(&reopened), payload);
    }

    #[test]
    fn random_io_matches_in_memory_reference() {
        let mut rng = StdRng::seed_from_u64(0x5ea1f5);
        let mut key = [0u8; 32];
        rng.fill_bytes(&mut key);

        let reference = MemoryIo::new();
        let delegate = Arc::new(MemoryIo::new());
        let encrypted = fresh(&delegate, &key);

        for _ in 0..1000 {
            match rng.random_range(0..4u32) {
                0 => {
                    assert_eq!(reference.size().unwrap(), encrypted.size().unwrap());
                }
                1 => {
                    let offset = rng.random_range(0..200u64);
                    let len = rng.random_range(0..200usize);
                    let mut a = vec![0u8; len];
                    let mut b = vec![0u8; len];
                    let na = reference.read(offset, &mut a).unwrap();
                    let nb = encrypted.read(offset, &mut b).unwrap();
                    assert_eq!(na, nb);
                    assert_eq!(a, b);
                }
                2 => {
                    let offset = rng.random_range(0..200u64);
                    let len = rng.random_range(0..200usize);
                    let mut data = vec![0u8; len];
                    rng.fill_bytes(&mut data);
                    reference.write(offset, &data).unwrap();
                    encrypted.write(offset, &data).unwrap();
                    assert_eq!(read_all(&reference), read_all(&encrypted));
                }
                3 => {
                    let new_size = rng.random_range(0..400u64);
                    reference.resize(new_size).unwrap();
                    encrypted.resize(new_size).unwrap();
                    assert_eq!(read_all(&reference), read_all(&encrypted));
                }
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn sparse_zero_block_reads_as_zeros_without_authentication() {
        let mut key = [0u8; 32];
        fill_random(&mut key);
        let delegate = Arc::new(MemoryIo::new());
        let encrypted = fresh(&delegate, &key);

        // One whole virtual block plus change, then replace the underlying
        // bytes with a single all-zero physical block. No key on earth
        // authenticates it, yet it must read back as plaintext zeros.
        encrypted.write(0, &[0u8; 48]).unwrap();
        delegate.resize(0).unwrap();
        delegate.resize(P).unwrap();

        let mut out = vec![0xFFu8; V as usize];
        assert_eq!(encrypted.read(0, &mut out).unwrap(), V as usize);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn corruption_is_detected_with_block_index() {
        let mut key = [0u8; 32];
        fill_random(&mut key);
        let delegate = Arc::new(MemoryIo::new());
        let encrypted = fresh(&delegate, &key);

        let payload: Vec<u8> = (0..100u32).map(|i| (i & 0xFF) as u8).collect();
        encrypted.write(0, &payload).unwrap();

        // Flip one bit inside the second physical block.
        let mut byte = [0u8];
        delegate.read(70, &mut byte).unwrap();
        delegate.write(70, &[byte[0] ^ 0x01]).unwrap();

        let mut out = vec![0u8; payload.len()];
        match encrypted.read(0, &mut out) {
            Err(Error::IntegrityFailed { block_index }) => assert_eq!(block_index, 1),
            other => panic!("expected integrity failure, got {other:?}"),
        }
    }

    #[test]
    fn virtual_size_formula_matches_stream_size() {
        let mut key = [0u8; 32];
        fill_random(&mut key);
        for payload_len in [0usize, 1, 35, 36, 37, 71, 72, 100, 1000] {
            let delegate = Arc::new(MemoryIo::new());
            let encrypted = fresh(&delegate, &key);
            encrypted.write(0, &vec![7u8; payload_len]).unwrap();
            let underlying = delegate.size().unwrap();
            assert_eq!(
                AesGcmRandomAccess::<MemoryIo>::compute_virtual_size(underlying, P),
                encrypted.size().unwrap(),
                "payload_len={payload_len}"
            );
            assert_eq!(encrypted.size().unwrap(), payload_len as u64);
        }
        // Degenerate underlying sizes that carry no plaintext.
        for tail in 0..=OVERHEAD {
            assert_eq!(
                AesGcmRandomAccess::<MemoryIo>::compute_virtual_size(tail, P),
                0
            );
        }
        assert_eq!(
            AesGcmRandomAccess::<MemoryIo>::compute_virtual_size(P + OVERHEAD + 5, P),
            V + 5
        );
    }

    #[test]
    fn partial_overwrite_preserves_both_ends() {
        let mut key = [0u8; 32];
        fill_random(&mut key);
        let delegate = Arc::new(MemoryIo::new());
        let encrypted = fresh(&delegate, &key);

        let base = vec![0xABu8; 200];
        encrypted.write(0, &base).unwrap();
        encrypted.write(50, &[0xCDu8; 20]).unwrap();

        let mut expected = base;
        expected[50..70].fill(0xCD);
        assert_eq!(read_all(&encrypted), expected);
    }

    #[test]
    fn write_far_past_a_partial_tail_keeps_it_readable() {
        let mut key = [0u8; 32];
        fill_random(&mut key);
        let delegate = Arc::new(MemoryIo::new());
        let encrypted = fresh(&delegate, &key);

        // 10 bytes leave block 0 partial; the next write skips to block 2.
        encrypted.write(0, &[5u8; 10]).unwrap();
        encrypted.write(100, &[6u8; 50]).unwrap();

        let contents = read_all(&encrypted);
        assert_eq!(contents.len(), 150);
        assert!(contents[..10].iter().all(|&b| b == 5));
        assert!(contents[10..100].iter().all(|&b| b == 0));
        assert!(contents[100..].iter().all(|&b| b == 6));
    }

    #[test]
    fn resize_shrink_and_regrow_zeroes_tail() {
        let mut key = [0u8; 32];
        fill_random(&mut key);
        let delegate = Arc::new(MemoryIo::new());
        let encrypted = fresh(&delegate, &key);

        encrypted.write(0, &vec![9u8; 150]).unwrap();
        encrypted.resize(40).unwrap();
        assert_eq!(encrypted.size().unwrap(), 40);
        encrypted.resize(150).unwrap();

        let contents = read_all(&encrypted);
        assert_eq!(contents.len(), 150);
        assert!(contents[..40].iter().all(|&b| b == 9));
        assert!(contents[40..].iter().all(|&b| b == 0));
    }
}
