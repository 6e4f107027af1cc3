//! LAN pairing: short-lived `(code, PIN)` pairs minted by an authenticated
//! device. The second device proves the PIN within 30 seconds; success is
//! one-shot and turns into a setup token for the WebAuthn registration.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use uuid::Uuid;

use crate::access::constant_time_eq;

pub const PAIRING_TTL: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct PairingCode {
    pin: String,
    expires_at: Instant,
    consumed: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    /// Unknown, expired, or already consumed code; also a wrong PIN. The
    /// client sees one undifferentiated failure.
    #[error("invalid pairing code or pin")]
    Invalid,
}

pub struct PairingState {
    codes: Mutex<HashMap<Uuid, PairingCode>>,
    ttl: Duration,
}

impl Default for PairingState {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingState {
    pub fn new() -> Self {
        Self::with_ttl(PAIRING_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self { codes: Mutex::new(HashMap::new()), ttl }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PairingCode>> {
        self.codes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mint a new code + 8-digit PIN. Returns (code, pin, ttl).
    pub fn start(&self) -> (Uuid, String, Duration) {
        let code = Uuid::new_v4();
        let pin = format!("{:08}", rand::thread_rng().gen_range(0..100_000_000u32));
        let mut codes = self.lock();
        let now = Instant::now();
        codes.retain(|_, c| c.expires_at > now);
        codes.insert(code, PairingCode {
            pin: pin.clone(),
            expires_at: now + self.ttl,
            consumed: false,
        });
        (code, pin, self.ttl)
    }

    /// Check the PIN for a live, unconsumed code; success consumes the code.
    /// The PIN comparison is constant-time.
    pub fn verify(&self, code: &Uuid, pin: &str) -> Result<(), PairingError> {
        let mut codes = self.lock();
        let entry = codes.get_mut(code).ok_or(PairingError::Invalid)?;
        if entry.consumed || entry.expires_at <= Instant::now() {
            return Err(PairingError::Invalid);
        }
        if !constant_time_eq(&entry.pin, pin) {
            return Err(PairingError::Invalid);
        }
        entry.consumed = true;
        Ok(())
    }

    /// Polling endpoint for the originating device: has the code been used?
    /// None for codes that never existed or already expired away.
    pub fn status(&self, code: &Uuid) -> Option<bool> {
        let codes = self.lock();
        codes.get(code).map(|c| c.consumed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verify_is_one_shot() {
        let pairing = PairingState::new();
        let (code, pin, _) = pairing.start();
        assert_eq!(pin.len(), 8);
        assert!(pin.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(pairing.status(&code), Some(false));

        pairing.verify(&code, &pin).unwrap();
        assert_eq!(pairing.status(&code), Some(true));
        // Consumed-once: the same code cannot authorize again.
        assert!(pairing.verify(&code, &pin).is_err());
    }

    #[test]
    fn wrong_pin_is_rejected_without_consuming() {
        let pairing = PairingState::new();
        let (code, pin, _) = pairing.start();
        let wrong = if pin == "00000000" { "00000001" } else { "00000000" };
        assert!(pairing.verify(&code, wrong).is_err());
        assert_eq!(pairing.status(&code), Some(false));
        pairing.verify(&code, &pin).unwrap();
    }

    #[test]
    fn codes_expire() {
        let pairing = PairingState::with_ttl(Duration::from_millis(10));
        let (code, pin, _) = pairing.start();
        std::thread::sleep(Duration::from_millis(20));
        assert!(pairing.verify(&code, &pin).is_err());
    }

    #[test]
    fn unknown_code_is_invalid() {
        let pairing = PairingState::new();
        assert!(pairing.verify(&Uuid::new_v4(), "12345678").is_err());
        assert_eq!(pairing.status(&Uuid::new_v4()), None);
    }
}
