//! Attribute value rules: values travel as Base64 text and must fit what
//! one ATT packet can carry.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use log::warn;

use crate::Result;
use crate::error::{BleErrorCode, Error};

/// Hard limit the ATT protocol puts on any attribute value.
pub(crate) const MAX_ATTRIBUTE_LENGTH: usize = 512;
const ATT_HEADER_LENGTH: usize = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SizePolicy {
    /// Oversized values fail the operation.
    Strict,
    /// Oversized values are logged and let through, to be trimmed.
    Lenient,
}

/// Largest value one characteristic packet carries at the given MTU.
pub(crate) fn mtu_ceiling(mtu: u16) -> usize {
    usize::from(mtu).saturating_sub(ATT_HEADER_LENGTH)
}

/// Decodes `value`, which must be canonical Base64 with padding.
pub(crate) fn decode(value: &str, code: BleErrorCode) -> Result<Vec<u8>> {
    if value.len() % 4 != 0 {
        return Err(Error::new(
            code,
            format!("Value of length {} is not valid Base64", value.len()),
        ));
    }
    STANDARD
        .decode(value)
        .map_err(|e| Error::new(code, format!("Value is not valid Base64: {e}")))
}

/// Checks a decoded length against `ceiling`.
///
/// Base64 moves bytes in groups of three, so the ceiling is widened to the
/// surrounding multiples of three: anything past the upper one is over the
/// limit, anything between the two only draws a warning.
pub(crate) fn check_size(
    length: usize,
    ceiling: usize,
    code: BleErrorCode,
    policy: SizePolicy,
) -> Result<()> {
    let lower = ceiling / 3 * 3;
    let upper = ceiling.div_ceil(3) * 3;
    if length > upper {
        let message = format!("Value of {length} bytes exceeds the limit of {ceiling} bytes");
        match policy {
            SizePolicy::Strict => return Err(Error::new(code, message)),
            SizePolicy::Lenient => warn!("{}, trimming", message),
        }
    } else if length > lower {
        warn!(
            "Value of {} bytes is close to the limit of {} bytes",
            length, ceiling
        );
    }
    Ok(())
}

/// Cuts `bytes` down to `ceiling` and re-encodes them.
pub(crate) fn trim(mut bytes: Vec<u8>, ceiling: usize) -> String {
    bytes.truncate(ceiling);
    STANDARD.encode(bytes)
}
