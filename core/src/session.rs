//! The stateful half of the protocol: owns the client's 32-bit counter and
//! the unsynced/synced state machine. Counter mutation is exclusive to this
//! module and happens exactly once per successful outbound encryption.

use std::fmt;
use std::time::Duration;

use rand::RngCore;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::transport::Transport;

const SYNC_PATH: &str = "/sys/dev/sync";
const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// The 32-bit per-message nonce, always rendered as 8 uppercase hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCounter(u32);

impl ClientCounter {
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 8 {
            return Err(Error::HandshakeFailed(format!(
                "counter '{s}' is not exactly 8 hex characters"
            )));
        }
        u32::from_str_radix(s, 16)
            .map(ClientCounter)
            .map_err(|e| Error::HandshakeFailed(format!("counter '{s}' is not valid hex: {e}")))
    }

    /// Advances the counter by one, wrapping modulo 2^32, and returns the
    /// new value. This is the only mutation path; call exactly once per
    /// outbound encryption.
    #[must_use]
    pub fn next(self) -> Self {
        ClientCounter(self.0.wrapping_add(1))
    }
}

impl fmt::Display for ClientCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// Two-state session: no counter, or a counter seeded by a successful
/// handshake. There is no backward transition; a resync re-enters the
/// handshake and overwrites the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unsynced,
    Synced { counter: ClientCounter },
}

/// Owns [`SessionState`] plus the handshake logic. One `Session` per
/// `Client` for the client's entire lifetime.
pub struct Session {
    state: SessionState,
}

impl Session {
    pub fn new() -> Self {
        Session {
            state: SessionState::Unsynced,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        matches!(self.state, SessionState::Synced { .. })
    }

    /// Performs the handshake: sends a random 8-hex-char seed to
    /// `/sys/dev/sync`, and adopts the counter the device returns. The
    /// seed we send is not our counter — the device's reply is.
    pub async fn sync(&mut self, engine: &dyn Transport) -> Result<()> {
        let mut seed_bytes = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut seed_bytes);
        let seed = hex::encode_upper(seed_bytes);
        debug!(seed = %seed, "sending handshake seed");

        let response = engine
            .post(SYNC_PATH, seed.into_bytes(), SYNC_TIMEOUT)
            .await
            .map_err(|e| Error::HandshakeFailed(e.to_string()))?;

        let payload = String::from_utf8(response.payload)
            .map_err(|e| Error::HandshakeFailed(format!("non-UTF-8 handshake response: {e}")))?;
        let counter = ClientCounter::from_hex(payload.trim())?;

        debug!(counter = %counter, "session synced");
        self.state = SessionState::Synced { counter };
        Ok(())
    }

    /// Re-runs the handshake unconditionally, discarding the current
    /// counter in favor of whatever the device returns this time.
    pub async fn force_resync(&mut self, engine: &dyn Transport) -> Result<()> {
        warn!("forcing session resync");
        self.sync(engine).await
    }

    /// Advances the stored counter by one and returns the new value.
    /// Requires the session to already be `Synced`.
    pub fn next_counter(&mut self) -> Result<ClientCounter> {
        match self.state {
            SessionState::Unsynced => Err(Error::NotSynced),
            SessionState::Synced { counter } => {
                let next = counter.next();
                self.state = SessionState::Synced { counter: next };
                Ok(next)
            }
        }
    }

    /// Encrypts `plaintext`, consuming exactly one counter value, and
    /// returns the full wire frame (`counter ‖ ciphertext ‖ digest`).
    pub fn encrypt_frame(&mut self, plaintext: &str) -> Result<String> {
        let counter = self.next_counter()?;
        let counter_hex = counter.to_string();
        let ciphertext_hex = codec::encrypt(&counter_hex, plaintext);
        let digest_hex = codec::digest(&counter_hex, &ciphertext_hex);
        Ok(format!("{counter_hex}{ciphertext_hex}{digest_hex}"))
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_renders_as_eight_uppercase_hex_chars() {
        let c = ClientCounter::from_hex("00000001").unwrap();
        assert_eq!(c.to_string(), "00000001");
    }

    #[test]
    fn counter_increments_monotonically() {
        let mut c = ClientCounter::from_hex("00000001").unwrap();
        for expected in 2..=5u32 {
            c = c.next();
            assert_eq!(c.to_string(), format!("{expected:08X}"));
        }
    }

    #[test]
    fn counter_wraps_modulo_2_32() {
        let c = ClientCounter::from_hex("FFFFFFFF").unwrap();
        assert_eq!(c.next().to_string(), "00000000");
    }

    #[test]
    fn next_counter_requires_synced_session() {
        let mut session = Session::new();
        assert!(matches!(session.next_counter(), Err(Error::NotSynced)));
    }

    #[test]
    fn next_counter_advances_and_returns_new_value() {
        let mut session = Session::new();
        session.state = SessionState::Synced {
            counter: ClientCounter::from_hex("00000000").unwrap(),
        };
        let first = session.next_counter().unwrap();
        assert_eq!(first.to_string(), "00000001");
        let second = session.next_counter().unwrap();
        assert_eq!(second.to_string(), "00000002");
    }

    #[test]
    fn encrypt_frame_consumes_exactly_one_counter_per_call() {
        let mut session = Session::new();
        session.state = SessionState::Synced {
            counter: ClientCounter::from_hex("00000000").unwrap(),
        };
        let frame1 = session.encrypt_frame("a").unwrap();
        let frame2 = session.encrypt_frame("b").unwrap();
        assert!(frame1.starts_with("00000001"));
        assert!(frame2.starts_with("00000002"));
    }
}
