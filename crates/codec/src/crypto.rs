//! Channel identity and secret derivation.
//!
//! The broker never sees a plaintext channel password. Clients derive a
//! channel secret with PBKDF2 and hash the password under that secret;
//! only the hash travels and only the hash is stored. The same functions
//! live here so a Rust client and the broker stay interoperable, and so
//! tests can play both sides.

use std::num::NonZeroU32;

use aws_lc_rs::{constant_time, digest, hmac, pbkdf2};
use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};

use crate::message::ApiKeyScope;

/// PBKDF2 rounds for the channel secret. Fixed for interoperability with
/// non-Rust clients.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Fixed PBKDF2 salt; the derived secret is already scoped by the channel
/// name mixed into the input.
pub const SECRET_SALT: &[u8] = b"messaging-platform";

/// Prefix of the encoded channel secret.
pub const CHANNEL_SECRET_PREFIX: &str = "channel_";

/// Derive the client-side channel secret from the channel name and
/// password.
///
/// PBKDF2-HMAC-SHA256, 100 000 rounds, 256-bit output, URL-safe base64
/// with the `channel_` prefix. Clients seed their AES and HMAC keys from
/// it; the broker never holds it, only the password hash built on top of
/// it in [`hash_channel_password`].
///
/// # Test
///
/// ```
/// use courier_server_codec::crypto::derive_channel_secret;
///
/// let secret = derive_channel_secret("room", "hunter2");
///
/// assert!(secret.starts_with("channel_"));
/// // 256 bits, URL-safe base64 without padding.
/// assert_eq!(secret.len(), "channel_".len() + 43);
/// // Deterministic, and sensitive to both inputs.
/// assert_eq!(secret, derive_channel_secret("room", "hunter2"));
/// assert_ne!(secret, derive_channel_secret("room", "hunter3"));
/// assert_ne!(secret, derive_channel_secret("lobby", "hunter2"));
/// ```
pub fn derive_channel_secret(channel_name: &str, channel_password: &str) -> String {
    let mut key = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        const { NonZeroU32::new(PBKDF2_ITERATIONS).unwrap() },
        SECRET_SALT,
        [channel_name, channel_password].join(":").as_bytes(),
        &mut key,
    );

    format!("{}{}", CHANNEL_SECRET_PREFIX, BASE64_URL_SAFE_NO_PAD.encode(key))
}

/// The password hash a client presents on connect and the broker stores at
/// creation: HMAC-SHA256 over the password keyed with the channel secret.
///
/// # Test
///
/// ```
/// use courier_server_codec::crypto::hash_channel_password;
///
/// let hash = hash_channel_password("room", "hunter2");
///
/// assert_eq!(hash, hash_channel_password("room", "hunter2"));
/// assert_ne!(hash, hash_channel_password("room", "hunter3"));
/// ```
pub fn hash_channel_password(channel_name: &str, channel_password: &str) -> String {
    let secret = derive_channel_secret(channel_name, channel_password);
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, channel_password.as_bytes());

    BASE64_URL_SAFE_NO_PAD.encode(tag.as_ref())
}

/// Constant-time comparison of a stored password hash against a presented
/// one.
pub fn verify_password_hash(stored: &str, presented: &str) -> bool {
    constant_time::verify_slices_are_equal(stored.as_bytes(), presented.as_bytes()).is_ok()
}

/// Derive the stable channel identity.
///
/// Public scope hashes the channel name only, so any developer using the
/// same name reaches the same channel. Private scope additionally mixes
/// the developer key id, so tenants never collide. The password hash is
/// deliberately not part of the identity: it is stored next to the
/// channel and compared on every join, which is what lets a wrong
/// password be rejected instead of silently resolving elsewhere. The
/// identity is URL-safe and opaque; nothing can be recovered from it.
///
/// # Test
///
/// ```
/// use courier_server_codec::crypto::derive_channel_id;
/// use courier_server_codec::message::ApiKeyScope;
///
/// let public_a = derive_channel_id(ApiKeyScope::Public, "dev_a", "room");
/// let public_b = derive_channel_id(ApiKeyScope::Public, "dev_b", "room");
/// assert_eq!(public_a, public_b);
///
/// let private_a = derive_channel_id(ApiKeyScope::Private, "dev_a", "room");
/// let private_b = derive_channel_id(ApiKeyScope::Private, "dev_b", "room");
/// assert_ne!(private_a, private_b);
/// assert_ne!(private_a, public_a);
///
/// assert_ne!(
///     derive_channel_id(ApiKeyScope::Public, "dev_a", "room"),
///     derive_channel_id(ApiKeyScope::Public, "dev_a", "lobby"),
/// );
/// ```
pub fn derive_channel_id(scope: ApiKeyScope, dev_key_id: &str, channel_name: &str) -> String {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(b"courier.channel.v1\x00");

    if scope == ApiKeyScope::Private {
        ctx.update(dev_key_id.as_bytes());
        ctx.update(b"\x00");
    }

    ctx.update(channel_name.as_bytes());

    BASE64_URL_SAFE_NO_PAD.encode(ctx.finish().as_ref())
}
