//! Identifier generation for events and worker consumers.
//!
//! Event ids look like `evt_<base36 unix-millis>_<16 hex chars>`: sortable
//! by creation time at the prefix, 64 bits of entropy at the suffix.
//! Consumer ids look like `worker-<hostname>-<pid>-<6 hex chars>`; the
//! random suffix keeps two workers on the same host from ever sharing a
//! pending-entry-list identity.

use chrono::Utc;
use rand::Rng;

/// Prefix carried by every generated event id.
pub const EVENT_ID_PREFIX: &str = "evt_";

/// Generate a fresh event id: `evt_<base36 millis>_<hex random64>`.
pub fn generate_event_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let entropy: u64 = rand::random();
    format!("{EVENT_ID_PREFIX}{}_{entropy:016x}", base36(millis))
}

/// Generate a consumer identity for a worker process.
///
/// Format: `worker-<hostname>-<pid>-<6 hex chars>`. The hostname comes from
/// the `HOSTNAME` environment variable when set (the common case in
/// containers), falling back to `localhost`.
pub fn generate_consumer_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let pid = std::process::id();
    let suffix: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    format!("worker-{host}-{pid}-{suffix:06x}")
}

/// Lowercase base-36 encoding of an integer.
fn base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = [0u8; 13]; // u64::MAX is 13 base-36 digits
    let mut i = buf.len();
    while n > 0 {
        i -= 1;
        buf[i] = DIGITS[(n % 36) as usize];
        n /= 36;
    }
    String::from_utf8_lossy(&buf[i..]).into_owned()
}
