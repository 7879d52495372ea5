//! Listen port derivation
//!
//! Each OS user gets its own port so several users on one host can run
//! independent bridges. macOS hands out uids from 501 upwards.

use crate::config::BridgeConfig;

/// First uid assigned to regular macOS accounts
pub const FIRST_USER_UID: u32 = 501;

/// `clamp(base + (uid - 501), base, max)`
pub fn derive_port(uid: u32, base_port: u16, max_port: u16) -> u16 {
    let offset = i64::from(uid) - i64::from(FIRST_USER_UID);
    let candidate = i64::from(base_port) + offset;
    candidate.clamp(i64::from(base_port), i64::from(max_port.max(base_port))) as u16
}

/// Uid of the running process
pub fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and never fails
    unsafe { libc::getuid() }
}

/// Port for the current user under the given configuration.
///
/// A base port of `0` is passed through so the OS picks an ephemeral port.
pub fn listen_port(config: &BridgeConfig) -> u16 {
    if config.base_port == 0 {
        return 0;
    }
    derive_port(current_uid(), config.base_port, config.max_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_user_gets_base_port() {
        assert_eq!(derive_port(501, 45670, 65535), 45670);
    }

    #[test]
    fn test_offset_by_uid() {
        assert_eq!(derive_port(600, 45670, 65535), 45670 + 99);
    }

    #[test]
    fn test_clamped_to_max() {
        assert_eq!(derive_port(600, 65500, 65535), 65535);
        assert_eq!(derive_port(100_000, 45670, 65535), 65535);
    }

    #[test]
    fn test_system_uids_clamped_to_base() {
        assert_eq!(derive_port(0, 45670, 65535), 45670);
        assert_eq!(derive_port(500, 45670, 65535), 45670);
    }

    #[test]
    fn test_zero_base_passes_through() {
        let config = BridgeConfig {
            base_port: 0,
            ..BridgeConfig::default()
        };
        assert_eq!(listen_port(&config), 0);
    }
}
