/// 128-bit encryption key size
pub(crate) const ENCRYPTION_KEY_SIZE_128_BITS: u8 = 128 / 8;
