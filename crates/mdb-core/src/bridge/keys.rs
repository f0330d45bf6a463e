//! Keyboard events captured by the bridge.

use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::debug;

use super::BridgeError;
use super::client::Client;

const KEY_MASK_UP: u16 = 0x80;

pub const KEY_ACCEPT: u16 = 13;
pub const KEY_REJECT: u16 = 27;
pub const KEY_DOT: u16 = b'.' as u16;
/// The keyboard reports '.' as 'E'.
const KEY_DOT_INPUT: u16 = b'E' as u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: u16,
    pub up: bool,
}

impl KeyEvent {
    pub fn from_raw(v: u16) -> Self {
        let key = match v & !KEY_MASK_UP {
            KEY_DOT_INPUT => KEY_DOT,
            k => k,
        };
        Self {
            key,
            up: v & KEY_MASK_UP != 0,
        }
    }

    pub fn is_accept(&self) -> bool {
        self.key == KEY_ACCEPT
    }

    pub fn is_reject(&self) -> bool {
        self.key == KEY_REJECT
    }
}

/// Key-press source sharing the bridge link. Holds a client reference for
/// its lifetime.
pub struct KeyReader {
    client: Client,
    events: Receiver<u16>,
}

impl KeyReader {
    pub fn new(client: &Client) -> Self {
        let events = client.key_events();
        let stale = events.try_iter().count();
        if stale > 0 {
            debug!(stale, "key reader dropped stale events");
        }
        Self {
            client: client.clone(),
            events,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Block until the next key press. Releases are skipped.
    pub fn read(&self) -> Result<KeyEvent, BridgeError> {
        loop {
            let v = self.events.recv().map_err(|_| BridgeError::Closed)?;
            let e = KeyEvent::from_raw(v);
            if !e.up {
                return Ok(e);
            }
        }
    }

    /// Like [`KeyReader::read`] with a deadline. `Ok(None)` on timeout.
    pub fn read_timeout(&self, timeout: Duration) -> Result<Option<KeyEvent>, BridgeError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.events.recv_deadline(deadline) {
                Ok(v) => {
                    let e = KeyEvent::from_raw(v);
                    if !e.up {
                        return Ok(Some(e));
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(BridgeError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_event_from_raw() {
        assert_eq!(
            KeyEvent::from_raw(b'5' as u16),
            KeyEvent {
                key: b'5' as u16,
                up: false
            }
        );
        assert_eq!(
            KeyEvent::from_raw(b'5' as u16 | 0x80),
            KeyEvent {
                key: b'5' as u16,
                up: true
            }
        );
        assert_eq!(KeyEvent::from_raw(b'E' as u16).key, KEY_DOT);
        assert!(KeyEvent::from_raw(13).is_accept());
        assert!(KeyEvent::from_raw(27).is_reject());
    }
}
