//! Raw input event codec
//!
//! Typed view of the kernel's `struct input_event`. The byte layout must
//! match the host kernel exactly: 16 bytes of timestamp, then type, code,
//! value. All conversion between bytes and the typed form lives here.

/// Event type categories (linux/input-event-codes.h)
pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;

pub const SYN_REPORT: u16 = 0x00;

// Key codes used by the default configuration
pub const KEY_ESC: u16 = 1;
pub const KEY_A: u16 = 30;
pub const KEY_B: u16 = 48;

/// Key press/release/repeat values carried in `RawEvent::value`
pub const KEY_RELEASE: i32 = 0;
pub const KEY_PRESS: i32 = 1;

/// Raw input_event structure (matches the Linux kernel structure)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawEvent {
    pub tv_sec: i64,
    pub tv_usec: i64,
    pub type_: u16,
    pub code: u16,
    pub value: i32,
}

/// Size in bytes of one kernel event record
pub const EVENT_SIZE: usize = std::mem::size_of::<RawEvent>();

impl RawEvent {
    /// Build an event stamped with the current wall-clock time.
    pub fn new(type_: u16, code: u16, value: i32) -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            tv_sec: now.as_secs() as i64,
            tv_usec: now.subsec_micros() as i64,
            type_,
            code,
            value,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(EVENT_SIZE);
        bytes.extend_from_slice(&self.tv_sec.to_ne_bytes());
        bytes.extend_from_slice(&self.tv_usec.to_ne_bytes());
        bytes.extend_from_slice(&self.type_.to_ne_bytes());
        bytes.extend_from_slice(&self.code.to_ne_bytes());
        bytes.extend_from_slice(&self.value.to_ne_bytes());
        bytes
    }

    /// Decode one record. Returns `None` for anything shorter than a full
    /// record; a partial read is not a valid event.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < EVENT_SIZE {
            return None;
        }
        Some(Self {
            tv_sec: i64::from_ne_bytes(bytes[0..8].try_into().ok()?),
            tv_usec: i64::from_ne_bytes(bytes[8..16].try_into().ok()?),
            type_: u16::from_ne_bytes(bytes[16..18].try_into().ok()?),
            code: u16::from_ne_bytes(bytes[18..20].try_into().ok()?),
            value: i32::from_ne_bytes(bytes[20..24].try_into().ok()?),
        })
    }

    pub fn is_key(&self) -> bool {
        self.type_ == EV_KEY
    }

    /// Press or release, excluding autorepeat.
    pub fn is_key_edge(&self) -> bool {
        self.is_key() && (self.value == KEY_PRESS || self.value == KEY_RELEASE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_size_matches_kernel_layout() {
        // 2x i64 timestamp + u16 type + u16 code + i32 value
        assert_eq!(EVENT_SIZE, 24);
    }

    #[test]
    fn test_round_trip() {
        let ev = RawEvent {
            tv_sec: 1_700_000_000,
            tv_usec: 123_456,
            type_: EV_KEY,
            code: KEY_A,
            value: KEY_PRESS,
        };
        let bytes = ev.to_bytes();
        assert_eq!(bytes.len(), EVENT_SIZE);
        assert_eq!(RawEvent::from_bytes(&bytes), Some(ev));
    }

    #[test]
    fn test_negative_value_round_trip() {
        let ev = RawEvent::new(0x02, 0x00, -7);
        assert_eq!(RawEvent::from_bytes(&ev.to_bytes()), Some(ev));
    }

    #[test]
    fn test_short_buffer_is_not_an_event() {
        let ev = RawEvent::new(EV_KEY, KEY_A, KEY_PRESS);
        let bytes = ev.to_bytes();
        assert_eq!(RawEvent::from_bytes(&bytes[..EVENT_SIZE - 1]), None);
        assert_eq!(RawEvent::from_bytes(&[]), None);
    }

    #[test]
    fn test_key_edge_excludes_repeat() {
        assert!(RawEvent::new(EV_KEY, KEY_A, KEY_PRESS).is_key_edge());
        assert!(RawEvent::new(EV_KEY, KEY_A, KEY_RELEASE).is_key_edge());
        assert!(!RawEvent::new(EV_KEY, KEY_A, 2).is_key_edge());
        assert!(!RawEvent::new(EV_SYN, SYN_REPORT, 0).is_key_edge());
    }
}
