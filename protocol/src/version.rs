//! Protocol version management.

/// Wire envelope version. Bump whenever the meaning of any envelope field
/// changes; receivers reject every other value.
pub const PROTOCOL_VERSION: u16 = 1;

/// Upper bound on an encoded (or decompressed) payload.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024; // 16 MiB
