//! Address normalization and tag naming.
//!
//! Configured addresses may use the one-based numbering convention common in
//! device documentation (first register is 1). The protocol itself is
//! zero-based, so one-based addresses are shifted down before any request is
//! issued. Tag identifiers are derived from the effective (zero-based)
//! address so that reads, writes and polls all agree on the key.

use thiserror::Error;
use tracing::warn;

/// Errors rejecting a configured address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("starting address {0} is negative")]
    Negative(i32),
    #[error("starting address {0} does not fit the 16-bit address space")]
    TooLarge(i32),
    #[error("range [{start}, {start}+{count}) exceeds the 16-bit address space")]
    RangeOverflow { start: u16, count: u16 },
}

/// Convert a configured address into an effective zero-based device address.
///
/// - one-based and address > 0: shifted down by one
/// - one-based and address == 0: ambiguous legacy input; logged and left
///   unchanged rather than rejected, so existing configurations keep working
/// - negative: rejected
pub fn effective_address(address: i32, one_based: bool) -> Result<u16, AddressError> {
    if address < 0 {
        return Err(AddressError::Negative(address));
    }

    let effective = if one_based {
        if address == 0 {
            warn!("Cannot apply one-based mode with a starting address of 0");
            0
        } else {
            address - 1
        }
    } else {
        address
    };

    u16::try_from(effective).map_err(|_| AddressError::TooLarge(address))
}

/// Check that `[start, start+count)` stays inside the 16-bit address space.
pub fn check_range(start: u16, count: u16) -> Result<(), AddressError> {
    if u32::from(start) + u32::from(count) > u32::from(u16::MAX) + 1 {
        return Err(AddressError::RangeOverflow { start, count });
    }
    Ok(())
}

/// Tag identifier for one address under a range's root name.
///
/// Callers must keep root names unique per device and register kind;
/// identifiers are plain string concatenations and will collide otherwise.
pub fn tag_id(root: &str, address: u16) -> String {
    format!("{}{}", root, address)
}
