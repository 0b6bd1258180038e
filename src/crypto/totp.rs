// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Time based one time passcodes (RFC 6238, HMAC-SHA1, 6 digits) guarding
//! privileged admin actions.
//!
//! The shared secret is the node's `AUTH_KEY` followed by its `SECRET_KEY`,
//! so only whoever holds the secrets file can produce a passcode.

use crate::crypto::CryptoErr;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha1::Sha1;

/// Seconds a passcode stays current.
pub const PASSCODE_STEP_SECS: u64 = 15;

/// Steps accepted on either side of the current one.
pub const PASSCODE_WINDOW_STEPS: u64 = 3;

const DIGITS: usize = 6;
const MODULUS: u32 = 1_000_000;

#[derive(Clone)]
pub struct PasscodeTotp {
    mac: Hmac<Sha1>,
    step: u64,
    window: u64,
}

impl std::fmt::Debug for PasscodeTotp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasscodeTotp")
            .field("step", &self.step)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl PasscodeTotp {
    /// Passcodes keyed by `secret` with the default step and window.
    pub fn new(secret: &[u8]) -> Result<Self, CryptoErr> {
        Self::with_step(secret, PASSCODE_STEP_SECS, PASSCODE_WINDOW_STEPS)
    }

    pub fn with_step(secret: &[u8], step: u64, window: u64) -> Result<Self, CryptoErr> {
        let mac = Hmac::<Sha1>::new_from_slice(secret).map_err(|_| CryptoErr::Encoding)?;

        Ok(Self {
            mac,
            step: step.max(1),
            window,
        })
    }

    /// The passcode current at `unix_secs`.
    #[must_use]
    pub fn code_at(&self, unix_secs: u64) -> String {
        self.code_for(unix_secs / self.step)
    }

    #[must_use]
    pub fn now(&self) -> String {
        self.code_at(unix_now())
    }

    /// Seconds until the current passcode rolls over.
    #[must_use]
    pub fn seconds_left(&self) -> u64 {
        self.step - unix_now() % self.step
    }

    /// Checks `code` against every step within the window around
    /// `unix_secs`. Every candidate is compared so the timing does not
    /// depend on which step matched.
    #[must_use]
    pub fn verify_at(&self, code: &str, unix_secs: u64) -> bool {
        if code.len() != DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }

        let current = unix_secs / self.step;
        let mut matched = false;

        for counter in current.saturating_sub(self.window)..=current.saturating_add(self.window) {
            matched |= constant_time_eq::constant_time_eq(
                self.code_for(counter).as_bytes(),
                code.as_bytes(),
            );
        }

        matched
    }

    #[must_use]
    pub fn verify(&self, code: &str) -> bool {
        self.verify_at(code, unix_now())
    }

    fn code_for(&self, counter: u64) -> String {
        let mut mac = self.mac.clone();
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        // Dynamic truncation
        let offset = usize::from(digest[digest.len() - 1] & 0x0f);
        let binary = u32::from_be_bytes([
            digest[offset] & 0x7f,
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ]);

        format!("{:0width$}", binary % MODULUS, width = DIGITS)
    }
}

fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC_SECRET: &[u8] = b"12345678901234567890";

    #[test]
    fn matches_reference_values() {
        // RFC 6238 appendix B, SHA-1, truncated to six digits
        let totp = PasscodeTotp::with_step(RFC_SECRET, 30, 1).unwrap();
        assert_eq!(totp.code_at(59), "287082");
        assert_eq!(totp.code_at(1_111_111_109), "081804");
        assert_eq!(totp.code_at(1_234_567_890), "005924");
        assert_eq!(totp.code_at(2_000_000_000), "279037");
    }

    #[test]
    fn window_boundaries() {
        let totp = PasscodeTotp::new(b"auth-keysecret-key").unwrap();
        let start = PASSCODE_STEP_SECS * 100_000_000;
        let code = totp.code_at(start);

        // Last second of the third step after
        let late = start + PASSCODE_WINDOW_STEPS * PASSCODE_STEP_SECS + PASSCODE_STEP_SECS - 1;
        assert!(totp.verify_at(&code, late));
        assert!(!totp.verify_at(&code, late + 1));

        // First second of the third step before
        let early = start - PASSCODE_WINDOW_STEPS * PASSCODE_STEP_SECS;
        assert!(totp.verify_at(&code, early));
        assert!(!totp.verify_at(&code, early - 1));
    }

    #[test]
    fn rejects_malformed_codes() {
        let totp = PasscodeTotp::new(b"auth-keysecret-key").unwrap();
        let code = totp.now();
        assert!(totp.verify(&code));
        assert!(!totp.verify(&code[..5]));
        assert!(!totp.verify(&format!("{code}0")));
        assert!(!totp.verify("12345a"));
        assert!(!totp.verify(""));
    }

    #[test]
    fn keyed_by_secret() {
        let totp = PasscodeTotp::new(b"auth-keysecret-key").unwrap();
        let other = PasscodeTotp::new(b"other-keysecret-key").unwrap();
        let start = PASSCODE_STEP_SECS * 100_000_000;

        assert_ne!(totp.code_at(start), other.code_at(start));
        assert_eq!(
            totp.code_at(start),
            PasscodeTotp::new(b"auth-keysecret-key").unwrap().code_at(start)
        );
    }
}
