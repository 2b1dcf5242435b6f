// Protocol constants for the device cloud protocol

/// Size of the handshake nonce the server sends on connect (40 bytes)
pub const NONCE_SIZE: usize = 40;

/// Size of the hardware device ID (12 bytes)
pub const DEVICE_ID_SIZE: usize = 12;

/// Size of one RSA-2048 block read from the device during the handshake
pub const HANDSHAKE_CIPHERTEXT_SIZE: usize = 256;

/// Minimum decrypted handshake plaintext: echoed nonce + device ID
pub const MIN_HANDSHAKE_PLAINTEXT: usize = NONCE_SIZE + DEVICE_ID_SIZE;

/// Session key material: 16-byte AES key, 16-byte IV, 8-byte salt
pub const SESSION_KEY_SIZE: usize = 40;

/// AES-128 key length
pub const AES_KEY_SIZE: usize = 16;

/// AES block size, also the IV length
pub const AES_BLOCK_SIZE: usize = 16;

/// Suffix under which an unknown device's offered key is stored for review
pub const PENDING_KEY_SUFFIX: &str = "_handshake";

/// Length prefix of a ciphertext frame on the wire (big-endian u16)
pub const CHUNK_HEADER_SIZE: usize = 2;

/// Largest frame the 16-bit length prefix can describe
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Message counters wrap at this modulus
pub const COUNTER_MAX: u32 = 65536;

/// Tokens wrap at this modulus
pub const TOKEN_MAX: u16 = 256;

/// CoAP code: 4.00 Bad Request. Response codes below this are successes.
pub const CODE_BAD_REQUEST: u8 = 0x80;

/// CoAP code: 2.04 Changed
pub const CODE_CHANGED: u8 = 0x44;

/// CoAP code: 2.05 Content
pub const CODE_CONTENT: u8 = 0x45;

/// CoAP request codes
pub const CODE_GET: u8 = 0x01;
pub const CODE_POST: u8 = 0x02;
pub const CODE_PUT: u8 = 0x03;

/// Highest code in the request range (class 0, detail 1..=31)
pub const MAX_REQUEST_CODE: u8 = 0x1F;

/// Default chunk size for firmware transfer
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Largest chunk the device firmware accepts
pub const MAX_CHUNK_SIZE: usize = 594;

/// Largest binary accepted for an OTA transfer
pub const MAX_BINARY_SIZE: usize = 108_000;

/// Extra missed-chunk reports tolerated beyond one per chunk
pub const MAX_MISSED_CHUNKS: i64 = 10;

/// UpdateBegin capability flag: fast (batch) OTA offered
pub const FLAG_FAST_OTA: u8 = 0x01;

/// Default event time-to-live in seconds
pub const DEFAULT_EVENT_TTL: u32 = 60;

/// Length of the device Hello payload carrying product/platform metadata
pub const HELLO_PAYLOAD_SIZE: usize = 8;
