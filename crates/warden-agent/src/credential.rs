use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use rand::distributions::Alphanumeric;

const CREDENTIAL_LEN: usize = 48;

/// Local user name the proxy authenticates as against the worker.
const LOCAL_USER: &str = "warden";

/// High-entropy per-instance secret, shared only between the supervisor
/// (worker environment) and the proxy (forwarded Authorization header).
pub fn generate() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CREDENTIAL_LEN)
        .map(char::from)
        .collect()
}

/// `Authorization` header value for the worker's Basic-style local auth.
pub fn basic_auth_value(secret: &str) -> String {
    let raw = format!("{LOCAL_USER}:{secret}");
    format!("Basic {}", STANDARD.encode(raw))
}
