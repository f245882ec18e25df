use rand::{rngs::OsRng, RngCore};
use uuid::Uuid;

/// Fresh bytes from the OS CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Identifier for one signaling conversation.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// `host:port` with brackets around IPv6 literals.
pub fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes_differ() {
        assert_ne!(random_bytes::<16>(), random_bytes::<16>());
    }

    #[test]
    fn test_session_ids_unique() {
        let a = new_session_id();
        assert_eq!(a.len(), 36);
        assert_ne!(a, new_session_id());
    }

    #[test]
    fn test_host_port() {
        assert_eq!(host_port("192.168.1.20", 8080), "192.168.1.20:8080");
        assert_eq!(host_port("fd7a::1", 8080), "[fd7a::1]:8080");
        assert_eq!(host_port("[fd7a::1]", 8080), "[fd7a::1]:8080");
        assert_eq!(host_port("daemon.local", 80), "daemon.local:80");
    }
}
