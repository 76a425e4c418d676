use super::cbor::{MAJOR_ARRAY, MAJOR_UNSIGNED, read_argument};

/// Decode a wallet balance into lovelace.
///
/// Accepts a bare unsigned integer head, or a `[coin, multiasset]` pair in which
/// case only the coin is read. Anything else decodes to 0: a balance that cannot
/// be read must never block a wallet connection.
pub fn decode_balance(bytes: &[u8]) -> u64 {
    let Some(&initial) = bytes.first() else {
        return 0;
    };
    match initial >> 5 {
        MAJOR_UNSIGNED => read_argument(initial & 0x1f, &bytes[1..])
            .map(|(value, _)| value)
            .unwrap_or(0),
        MAJOR_ARRAY if initial & 0x1f == 2 => bytes
            .get(1)
            .copied()
            .filter(|b| b >> 5 == MAJOR_UNSIGNED)
            .and_then(|b| read_argument(b & 0x1f, &bytes[2..]))
            .map(|(value, _)| value)
            .unwrap_or(0),
        _ => 0,
    }
}

/// Decode a hex-encoded balance, as wallets return it over their text bridge.
pub fn decode_balance_hex(text: &str) -> u64 {
    hex::decode(text.trim())
        .map(|bytes| decode_balance(&bytes))
        .unwrap_or(0)
}
