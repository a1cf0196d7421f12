/// Unified authorization-code classification
///
/// Guests type one code field; it may be a staff voucher or a
/// booking-derived identifier. Classification is only a routing hint: the
/// dispatcher still checks both paths, and a booking match wins over a
/// voucher match.
use crate::vouchers::{MAX_CODE_LENGTH, MIN_CODE_LENGTH};

/// Routing hint for a guest-entered code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    /// Matches the voucher alphabet and length
    VoucherCandidate,
    /// Anything else that could still name a booking
    BookingOnly,
    /// Unusable input
    Invalid,
}

/// Classify a trimmed code.
///
/// Voucher candidates are A-Z0-9 within the configured length band.
/// Purely numeric strings stay candidates for both paths (numeric slot
/// codes are common). Inputs with spaces or punctuation can only be
/// booking identifiers such as guest names.
pub fn classify(code: &str) -> CodeKind {
    let code = code.trim();
    if code.is_empty() || code.len() > 256 {
        return CodeKind::Invalid;
    }

    if code.len() >= MIN_CODE_LENGTH
        && code.len() <= MAX_CODE_LENGTH
        && code.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return CodeKind::VoucherCandidate;
    }

    CodeKind::BookingOnly
}
