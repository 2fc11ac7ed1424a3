//! Value encoding helpers.
//!
//! Item values are semantically opaque byte strings, but both backends
//! store them in a text column. The store accepts bytes or text and
//! canonicalizes to UTF-8; non-UTF-8 input is rejected at the boundary.

use std::str::Utf8Error;

/// Canonicalizes a value to UTF-8 text.
///
/// Returns the borrowed text when the bytes are valid UTF-8; the caller
/// maps the error to its query-error kind.
pub fn canonical_text(value: &[u8]) -> Result<&str, Utf8Error> {
    std::str::from_utf8(value)
}

/// A `\x`-prefixed value that could not be decoded back to text.
#[derive(Debug, thiserror::Error)]
pub enum HexDecodeError {
    /// The remainder after the `\x` prefix is not valid hex.
    #[error("invalid hex in \\x-prefixed value")]
    InvalidHex,
    /// The decoded bytes are not valid UTF-8.
    #[error("\\x-prefixed value does not decode to UTF-8")]
    InvalidUtf8,
}

/// Decodes a `\x…`-prefixed hex value produced by the server backend.
///
/// Returns `Ok(None)` for values without the prefix (true pass-through)
/// and `Ok(Some(decoded))` for a prefixed value whose remainder is valid
/// hex decoding to UTF-8. A prefixed value that fails either step is an
/// error: the caller surfaces it rather than returning undecoded data.
pub fn decode_hex_prefixed(value: &str) -> Result<Option<String>, HexDecodeError> {
    let Some(rest) = value.strip_prefix("\\x") else {
        return Ok(None);
    };
    let bytes = hex::decode(rest).map_err(|_| HexDecodeError::InvalidHex)?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| HexDecodeError::InvalidUtf8)
}
