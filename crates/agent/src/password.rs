//! Per-boot random password for the private RPC socket.

use rand::RngCore;

/// 32 random bytes, hex-encoded. Regenerated every time the watchdog
/// starts; never persisted, so only processes that received it at fork
/// time (or read it over a trusted channel) can authenticate.
pub fn generate() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_passwords_differ_and_have_expected_length() {
        let a = generate();
        let b = generate();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }
}
