//! Message flag bitmap codec.
//!
//! The registry is fixed process-wide: each known flag owns one power-of-two
//! bit, and a message's flag set is persisted as the sum of the bits that are
//! set. Flags outside the registry are dropped silently on the way in and are
//! never produced on the way out.

use std::collections::BTreeSet;

/// The flag registry. Bit values are part of the persisted format and must
/// never be reassigned.
pub const FLAG_REGISTRY: &[(u32, &str)] = &[
    (1, "SEEN"),
    (2, "DELETED"),
    (4, "ANSWERED"),
    (8, "FLAGGED"),
    (16, "DRAFT"),
    (32, "MDNSENT"),
    (64, "FORWARDED"),
    (128, "SUBMITPENDING"),
    (256, "SUBMITTED"),
    (512, "JUNK"),
    (1024, "NONJUNK"),
    (2048, "LABEL1"),
    (4096, "LABEL2"),
    (8192, "LABEL3"),
    (16384, "LABEL4"),
    (32768, "LABEL5"),
    (65536, "HASATTACHMENT"),
    (131072, "HASNOATTACHMENT"),
];

/// Look up the bit for a flag name. Case-insensitive; `None` for names
/// outside the registry.
pub fn flag_bit(name: &str) -> Option<u32> {
    let upper = name.to_ascii_uppercase();
    FLAG_REGISTRY
        .iter()
        .find(|(_, n)| *n == upper)
        .map(|(bit, _)| *bit)
}

/// Pack a set of flag names into a bitmap. Unknown names are ignored.
pub fn pack<I, S>(flags: I) -> u32
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut bits = 0u32;
    for flag in flags {
        if let Some(bit) = flag_bit(flag.as_ref()) {
            bits |= bit;
        }
    }
    bits
}

/// Unpack a bitmap into the set of registry names whose bit is set.
pub fn unpack(bits: u32) -> BTreeSet<String> {
    FLAG_REGISTRY
        .iter()
        .filter(|(bit, _)| bits & bit == *bit)
        .map(|(_, name)| (*name).to_string())
        .collect()
}
