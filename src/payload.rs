//! Quick creation of randomized message payloads.

use rand::Rng;

/// The 62-character alphanumeric alphabet payloads are drawn from.
pub(crate) const ALPHANUM: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Produce a string of exactly `length` bytes drawn uniformly, with
/// replacement, from [`ALPHANUM`].
///
/// No uniqueness or ordering guarantee holds across calls. Callers that need
/// reproducibility must pass a seeded `rng`.
pub fn alphanumeric<R>(rng: &mut R, length: usize) -> String
where
    R: Rng + ?Sized,
{
    let mut payload = String::with_capacity(length);
    for _ in 0..length {
        let idx = rng.random_range(0..ALPHANUM.len());
        payload.push(char::from(ALPHANUM[idx]));
    }
    payload
}
