use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 16;

/// Symmetric packet cipher: AES-128 driven in a cipher-feedback keystream mode.
///
/// The keystream for the first block is the encryption of a counter block
///  derived from the session init vector and the four counter values; each
///  following block's keystream is the encryption of the previous ciphertext
///  block. Seeding the counter from `(send_seq, highest_ack, packet_type, 0)`
///  binds every packet to its position in the window: a datagram replayed under
///  a different sequence decrypts to garbage and fails signature verification.
///
/// Only the block-encrypt primitive is ever used; decryption runs the same
///  keystream and XORs it back out.
pub struct SymmetricCipher {
    aes: Aes128,
    init_vector: [u8; BLOCK_SIZE],
    pad: [u8; BLOCK_SIZE],
    pad_len: usize,
}

impl SymmetricCipher {
    pub fn new(key: &[u8; KEY_SIZE], init_vector: &[u8; BLOCK_SIZE]) -> SymmetricCipher {
        let aes = Aes128::new(GenericArray::from_slice(key));
        let mut cipher = SymmetricCipher {
            aes,
            init_vector: *init_vector,
            pad: [0; BLOCK_SIZE],
            pad_len: 0,
        };
        cipher.setup_counter(0, 0, 0, 0);
        cipher
    }

    /// Re-seeds the keystream for one packet. Must be called before every
    ///  encrypt or decrypt; the four values must match on both ends.
    pub fn setup_counter(&mut self, value1: u32, value2: u32, value3: u32, value4: u32) {
        let mut counter = [0u8; BLOCK_SIZE];
        for (i, &value) in [value1, value2, value3, value4].iter().enumerate() {
            let word = u32::from_le_bytes(
                self.init_vector[i * 4..i * 4 + 4].try_into().expect("4-byte slice"),
            );
            counter[i * 4..i * 4 + 4].copy_from_slice(&word.wrapping_add(value).to_le_bytes());
        }

        self.pad = counter;
        self.encrypt_pad_block();
        self.pad_len = 0;
    }

    fn encrypt_pad_block(&mut self) {
        let block = GenericArray::from_mut_slice(&mut self.pad);
        self.aes.encrypt_block(block);
    }

    pub fn encrypt(&mut self, buf: &mut [u8]) {
        for b in buf {
            if self.pad_len == BLOCK_SIZE {
                self.encrypt_pad_block();
                self.pad_len = 0;
            }
            let encrypted = *b ^ self.pad[self.pad_len];
            self.pad[self.pad_len] = encrypted;
            self.pad_len += 1;
            *b = encrypted;
        }
    }

    pub fn decrypt(&mut self, buf: &mut [u8]) {
        for b in buf {
            if self.pad_len == BLOCK_SIZE {
                self.encrypt_pad_block();
                self.pad_len = 0;
            }
            let encrypted = *b;
            *b = encrypted ^ self.pad[self.pad_len];
            self.pad[self.pad_len] = encrypted;
            self.pad_len += 1;
        }
    }
}
