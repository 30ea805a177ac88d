use rand::{Rng, RngCore};

/// Randomness source injected into each connection: initial sequence numbers,
///  handshake nonces, and the simulated-loss coin flips all come from here, so
///  tests can pin them down.
#[cfg_attr(test, mockall::automock)]
pub trait NetRandom: Send {
    fn random_integer(&mut self) -> u32;
    /// uniform in `[0, 1)`
    fn random_unit_float(&mut self) -> f32;
    fn random_buffer(&mut self, out: &mut [u8]);
}

/// The production source, backed by the thread-local CSPRNG.
pub struct ThreadRngRandom;

impl NetRandom for ThreadRngRandom {
    fn random_integer(&mut self) -> u32 {
        rand::thread_rng().next_u32()
    }

    fn random_unit_float(&mut self) -> f32 {
        rand::thread_rng().gen::<f32>()
    }

    fn random_buffer(&mut self, out: &mut [u8]) {
        rand::thread_rng().fill_bytes(out);
    }
}
