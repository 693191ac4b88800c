//! Loopback port handout for socket tests.
//!
//! Tests that bind real listeners take their ports from a shared atomic
//! cursor, so concurrently running test binaries in one process never
//! race for the same port. Every candidate is probed with an actual bind
//! before it is handed out; ports something else grabbed are skipped.

use std::net::{Ipv4Addr, TcpListener};
use std::sync::atomic::{AtomicU16, Ordering};

// Above the registered-port range most local dev services sit in.
const FIRST_TEST_PORT: u16 = 29_000;

static NEXT_PORT: AtomicU16 = AtomicU16::new(FIRST_TEST_PORT);

/// Hand out a currently-free loopback port.
pub fn allocate_port() -> u16 {
    loop {
        let candidate = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        // The cursor wrapped past u16::MAX into reserved space.
        assert!(candidate >= FIRST_TEST_PORT, "test port space exhausted");
        if bindable(candidate) {
            return candidate;
        }
    }
}

fn bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_distinct_and_bindable() {
        let first = allocate_port();
        let second = allocate_port();
        assert_ne!(first, second);
        assert!(bindable(first));
        assert!(bindable(second));
    }

    #[test]
    fn taken_ports_are_skipped() {
        let cursor = NEXT_PORT.load(Ordering::Relaxed);
        let _holder = TcpListener::bind((Ipv4Addr::LOCALHOST, cursor)).ok();
        let handed_out = allocate_port();
        assert!(bindable(handed_out));
    }
}
