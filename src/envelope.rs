use crate::bit_stream::BitStream;
use crate::cipher::SymmetricCipher;
use anyhow::bail;
use sha2::{Digest, Sha256};

/// Truncated SHA-256 signature appended to every encrypted packet.
pub const MESSAGE_SIGNATURE_BYTES: usize = 5;

/// Seals a fully written packet: appends the truncated signature of the whole
///  plaintext, then encrypts everything from `encrypt_start` (byte offset) to
///  the end in place. The caller must have seeded the cipher counter for this
///  packet already.
pub fn hash_and_encrypt(stream: &mut BitStream, encrypt_start: usize, cipher: &mut SymmetricCipher) {
    let digest_start = stream.next_byte_position();
    stream.set_byte_position(digest_start);

    let digest = Sha256::digest(stream.as_bytes());
    stream.write_bytes(&digest[..MESSAGE_SIGNATURE_BYTES]);

    let buf = stream.bytes_mut();
    cipher.encrypt(&mut buf[encrypt_start..]);
}

/// Reverses [`hash_and_encrypt`]: decrypts from `encrypt_start` to the end and
///  checks the trailing signature against a fresh digest of the plaintext. On
///  success the stream is truncated so parsing never sees the signature bytes.
///
/// A failure means tampering, a replay under the wrong counter, or stray
///  traffic; callers drop the datagram without observable effect.
pub fn decrypt_and_verify(
    stream: &mut BitStream,
    encrypt_start: usize,
    cipher: &mut SymmetricCipher,
) -> anyhow::Result<()> {
    let byte_length = stream.byte_length();
    if byte_length < encrypt_start + MESSAGE_SIGNATURE_BYTES {
        bail!("packet too short for signature: {} bytes", byte_length);
    }

    let buf = stream.bytes_mut();
    cipher.decrypt(&mut buf[encrypt_start..byte_length]);

    let signed_len = byte_length - MESSAGE_SIGNATURE_BYTES;
    let digest = Sha256::digest(&buf[..signed_len]);
    if digest[..MESSAGE_SIGNATURE_BYTES] != buf[signed_len..byte_length] {
        bail!("packet signature mismatch");
    }

    stream.truncate_bits(signed_len * 8);
    Ok(())
}
