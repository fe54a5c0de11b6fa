//! Global constants for keysign

/// Public key text encoding
pub mod pem {
    /// PEM header for a DER SubjectPublicKeyInfo
    pub const HEADER: &str = "-----BEGIN PUBLIC KEY-----";

    /// PEM footer for a DER SubjectPublicKeyInfo
    pub const FOOTER: &str = "-----END PUBLIC KEY-----";

    /// Base64 characters per PEM body line
    pub const LINE_LENGTH: usize = 64;
}

/// Key policy
pub mod keys {
    /// Default validity window of a freshly generated key pair (days)
    pub const DEFAULT_VALIDITY_DAYS: i64 = 365;

    /// Longest validity window a configuration may ask for (days)
    pub const MAX_VALIDITY_DAYS: i64 = 36_500;

    /// Bytes of the SHA-256 digest kept in a key fingerprint
    pub const FINGERPRINT_BYTES: usize = 8;

    /// DER prefix of a P-256 SubjectPublicKeyInfo (id-ecPublicKey, prime256v1),
    /// followed by the 65-byte uncompressed point.
    pub const P256_SPKI_PREFIX: [u8; 26] = [
        0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08,
        0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
    ];

    /// Length of an uncompressed P-256 point (0x04 || X || Y)
    pub const P256_POINT_LEN: usize = 65;
}

/// Canonical encoding
pub mod canonical {
    /// Domain tag opening every canonical byte sequence (scheme version 1)
    pub const DOMAIN_TAG: &[u8; 4] = b"KSG1";

    /// Field type tags
    pub const TAG_STRING: u8 = b's';
    pub const TAG_INTEGER: u8 = b'i';
    pub const TAG_BOOLEAN: u8 = b'b';
    pub const TAG_BYTES: u8 = b'x';
}

/// Bridge command names, as invoked by the mobile layer
pub mod actions {
    pub const SIGN: &str = "sign";
    pub const VERIFY: &str = "verify";
    pub const GEN_KEY_PAIR_IF_NECESSARY: &str = "genKeyPairIfNecessary";
    pub const GET_PUBLIC_KEY: &str = "getPublicKey";
}
