//! Comma-separated ASCII config blobs and the CRC32-keyed global block.
//!
//! Every driver serializes its own block as unsigned integers in a fixed
//! positional order; parsing is all-or-nothing behind a token-count check.
//! The cross-driver global block additionally carries a `crc=XXXXXXXX`
//! keyed field over the preceding bytes.

use core::fmt::Write;

use heapless::String;

/// Largest driver block is the AD7147's 96 stage words.
pub const BLOB_MAX: usize = 640;

pub struct ValueWriter<const N: usize> {
    out: String<N>,
    wrote_any: bool,
}

impl<const N: usize> ValueWriter<N> {
    pub fn new() -> Self {
        Self {
            out: String::new(),
            wrote_any: false,
        }
    }

    pub fn push(&mut self, value: u32) -> bool {
        let sep = if self.wrote_any { "," } else { "" };
        self.wrote_any = true;
        write!(self.out, "{sep}{value}").is_ok()
    }

    pub fn finish(self) -> String<N> {
        self.out
    }
}

impl<const N: usize> Default for ValueWriter<N> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ValueReader<'a> {
    rest: Option<&'a str>,
}

impl<'a> ValueReader<'a> {
    pub fn new(blob: &'a str) -> Self {
        Self {
            rest: if blob.is_empty() { None } else { Some(blob) },
        }
    }

    /// Next token as u32; `None` on exhaustion or a malformed token.
    pub fn next_u32(&mut self) -> Option<u32> {
        let rest = self.rest?;
        let (token, remainder) = match rest.find(',') {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };
        self.rest = remainder;
        if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        token.parse::<u32>().ok()
    }
}

pub fn token_count(blob: &str) -> usize {
    if blob.is_empty() {
        0
    } else {
        blob.matches(',').count() + 1
    }
}

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut bit = 0;
        while bit < 8 {
            c = if c & 1 != 0 {
                0xEDB8_8320 ^ (c >> 1)
            } else {
                c >> 1
            };
            bit += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = build_crc32_table();

pub fn crc32(bytes: &[u8]) -> u32 {
    let mut c = 0xFFFF_FFFFu32;
    for &b in bytes {
        c = CRC32_TABLE[((c ^ b as u32) & 0xFF) as usize] ^ (c >> 8);
    }
    c ^ 0xFFFF_FFFF
}

/// Appends the keyed CRC field to a finished global block.
pub fn append_crc<const N: usize>(blob: &mut String<N>) -> bool {
    let crc = crc32(blob.as_bytes());
    write!(blob, ",crc={crc:08X}").is_ok()
}

/// Strips and verifies the keyed CRC field; returns the payload on match.
pub fn verify_crc(blob: &str) -> Option<&str> {
    let idx = blob.rfind(",crc=")?;
    let (payload, tail) = blob.split_at(idx);
    let hex = &tail[",crc=".len()..];
    if hex.len() != 8 {
        return None;
    }
    let stored = u32::from_str_radix(hex, 16).ok()?;
    (crc32(payload.as_bytes()) == stored).then_some(payload)
}

/// Cross-driver settings carried in the global block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GlobalConfig {
    /// Stabilizer hysteresis width in parts per thousand of baseline.
    pub x_permille: u16,
    /// Published-state delay in frames, 0 disables the queue.
    pub delay_frames: u8,
    /// Index into the serial baud table.
    pub baud_select: u8,
}

pub const DELAY_FRAMES_MAX: u8 = 16;
pub const BAUD_SELECT_MAX: u8 = 6;

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            x_permille: 70,
            delay_frames: 0,
            baud_select: 1,
        }
    }
}

impl GlobalConfig {
    pub fn encode<const N: usize>(&self) -> Option<String<N>> {
        let mut writer = ValueWriter::<N>::new();
        let ok = writer.push(self.x_permille as u32)
            && writer.push(self.delay_frames as u32)
            && writer.push(self.baud_select as u32);
        if !ok {
            return None;
        }
        let mut blob = writer.finish();
        append_crc(&mut blob).then_some(blob)
    }

    /// Decodes and validates; any corruption yields `None` so the caller
    /// can fall back to defaults.
    pub fn decode(blob: &str) -> Option<Self> {
        let payload = verify_crc(blob)?;
        if token_count(payload) != 3 {
            return None;
        }
        let mut reader = ValueReader::new(payload);
        let x_permille = reader.next_u32()?;
        let delay_frames = reader.next_u32()?;
        let baud_select = reader.next_u32()?;
        if x_permille > 1000
            || delay_frames > DELAY_FRAMES_MAX as u32
            || baud_select > BAUD_SELECT_MAX as u32
        {
            return None;
        }
        Some(Self {
            x_permille: x_permille as u16,
            delay_frames: delay_frames as u8,
            baud_select: baud_select as u8,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_reader_round_trip() {
        let mut writer = ValueWriter::<64>::new();
        for value in [0u32, 4095, 65535, 7] {
            assert!(writer.push(value));
        }
        let blob = writer.finish();
        assert_eq!(blob.as_str(), "0,4095,65535,7");
        assert_eq!(token_count(&blob), 4);

        let mut reader = ValueReader::new(&blob);
        assert_eq!(reader.next_u32(), Some(0));
        assert_eq!(reader.next_u32(), Some(4095));
        assert_eq!(reader.next_u32(), Some(65535));
        assert_eq!(reader.next_u32(), Some(7));
        assert_eq!(reader.next_u32(), None);
    }

    #[test]
    fn reader_rejects_malformed_tokens() {
        let mut reader = ValueReader::new("12,x3,4");
        assert_eq!(reader.next_u32(), Some(12));
        assert_eq!(reader.next_u32(), None);
    }

    #[test]
    fn empty_blob_has_no_tokens() {
        assert_eq!(token_count(""), 0);
        assert_eq!(ValueReader::new("").next_u32(), None);
    }

    #[test]
    fn crc32_matches_reference_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn keyed_crc_round_trip() {
        let mut blob: String<64> = String::new();
        blob.push_str("70,0,1").unwrap();
        assert!(append_crc(&mut blob));
        assert_eq!(verify_crc(&blob), Some("70,0,1"));
    }

    #[test]
    fn single_character_corruption_fails_crc() {
        let mut blob: String<64> = String::new();
        blob.push_str("70,0,1").unwrap();
        assert!(append_crc(&mut blob));
        let mut corrupted: String<64> = String::new();
        for (idx, byte) in blob.as_bytes().iter().enumerate() {
            let byte = if idx == 1 { b'9' } else { *byte };
            corrupted.push(byte as char).unwrap();
        }
        assert_ne!(blob, corrupted);
        assert_eq!(verify_crc(&corrupted), None);
    }

    #[test]
    fn global_config_round_trip_and_reject() {
        let config = GlobalConfig {
            x_permille: 70,
            delay_frames: 3,
            baud_select: 2,
        };
        let blob = config.encode::<64>().unwrap();
        assert_eq!(GlobalConfig::decode(&blob), Some(config));

        // Out-of-range fields count as corruption even with a valid CRC.
        let mut bad: String<64> = String::new();
        bad.push_str("70,99,1").unwrap();
        assert!(append_crc(&mut bad));
        assert_eq!(GlobalConfig::decode(&bad), None);
    }
}
