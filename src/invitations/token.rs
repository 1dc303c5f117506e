use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand_core::{OsRng, RngCore};

const TOKEN_BYTES: usize = 32;

/// Generate an opaque invitation token: 256 bits from the OS CSPRNG,
/// URL-safe base64 without padding so it survives query strings and
/// email links unescaped.
pub fn generate_invitation_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
