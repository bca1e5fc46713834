//! 32-bit values stored across two consecutive holding registers.
//!
//! Every board keeps the low word at the lower address.

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("value {0} does not fit into two 16-bit registers")]
    Overflow(i64),
}

/// Split `value` into `(low, high)` register words.
///
/// Accepts anything representable as either `i32` or `u32`. Negative values are stored as two's
/// complement.
pub fn encode32(value: i64) -> Result<(u16, u16), Error> {
    let bits = if let Ok(v) = u32::try_from(value) {
        v
    } else if let Ok(v) = i32::try_from(value) {
        v as u32
    } else {
        return Err(Error::Overflow(value));
    };
    Ok(((bits & 0xFFFF) as u16, (bits >> 16) as u16))
}

pub fn decode32(low: u16, high: u16) -> u32 {
    u32::from(high) << 16 | u32::from(low)
}

pub fn decode32_signed(low: u16, high: u16) -> i32 {
    decode32(low, high) as i32
}

/// Join a register read-out of width 2 back together.
///
/// Returns `None` if `words` is not exactly two registers long.
pub fn from_words(words: &[u16]) -> Option<u32> {
    let [low, high] = words else { return None };
    Some(decode32(*low, *high))
}
