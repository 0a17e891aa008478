use embedded_storage::{ReadStorage, Storage};
use esp_storage::FlashStorage;
use maitouch::{
    config::{GlobalConfig, BLOB_MAX},
    touch::manager::TouchManager,
};

// Record in the last flash sector:
//   [0..4)  magic, LE
//   [4]     version
//   [5..7)  payload length, LE
//   payload: global-block length u16 LE + ASCII global block,
//            entry count u8, then per-module (mask u8, len u16 LE, bytes)
//   [..]    checksum8 over everything before it
const SETTINGS_MAGIC: u32 = 0x5449_414D;
const SETTINGS_VERSION: u8 = 1;
const HEADER_LEN: usize = 7;
const RECORD_MAX: usize = FlashStorage::SECTOR_SIZE as usize;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SettingsLoad {
    Loaded,
    Blank,
    Corrupt,
}

pub(crate) struct SettingsStore<'d> {
    flash: FlashStorage<'d>,
    offset: u32,
    record: [u8; RECORD_MAX],
    payload_len: usize,
}

impl<'d> SettingsStore<'d> {
    pub(crate) fn new(flash_peripheral: esp_hal::peripherals::FLASH<'d>) -> Self {
        let flash = FlashStorage::new(flash_peripheral).multicore_auto_park();
        let capacity = flash.capacity() as u32;
        let offset = capacity.saturating_sub(FlashStorage::SECTOR_SIZE);
        Self {
            flash,
            offset,
            record: [0xFF; RECORD_MAX],
            payload_len: 0,
        }
    }

    /// Reads and validates the record; the buffered copy backs the
    /// accessors until the next load or save.
    pub(crate) fn load(&mut self) -> SettingsLoad {
        self.payload_len = 0;
        if self.flash.read(self.offset, &mut self.record).is_err() {
            return SettingsLoad::Corrupt;
        }
        if self.record[..HEADER_LEN + 1].iter().all(|&byte| byte == 0xFF) {
            return SettingsLoad::Blank;
        }
        let magic = u32::from_le_bytes([
            self.record[0],
            self.record[1],
            self.record[2],
            self.record[3],
        ]);
        if magic != SETTINGS_MAGIC || self.record[4] != SETTINGS_VERSION {
            return SettingsLoad::Corrupt;
        }
        let payload_len = u16::from_le_bytes([self.record[5], self.record[6]]) as usize;
        if HEADER_LEN + payload_len + 1 > RECORD_MAX {
            return SettingsLoad::Corrupt;
        }
        let body = HEADER_LEN + payload_len;
        if checksum8(&self.record[..body]) != self.record[body] {
            return SettingsLoad::Corrupt;
        }
        if parse_payload(&self.record[HEADER_LEN..body]).is_none() {
            return SettingsLoad::Corrupt;
        }
        self.payload_len = payload_len;
        SettingsLoad::Loaded
    }

    /// Valid after a `Loaded` outcome.
    pub(crate) fn global(&self) -> Option<GlobalConfig> {
        let payload = &self.record[HEADER_LEN..HEADER_LEN + self.payload_len];
        let (global, _) = parse_payload(payload)?;
        GlobalConfig::decode(global)
    }

    pub(crate) fn module_blobs(&self) -> BlobIter<'_> {
        let payload = &self.record[HEADER_LEN..HEADER_LEN + self.payload_len];
        match parse_payload(payload) {
            Some((_, entries)) => BlobIter { bytes: entries },
            None => BlobIter { bytes: &[] },
        }
    }

    /// Serializes the global block plus one blob per registered module
    /// and writes the record. Modules whose blob would overflow the
    /// sector are dropped from the record.
    pub(crate) fn save(&mut self, global: &GlobalConfig, manager: &TouchManager) -> bool {
        let Some(global_blob) = global.encode::<64>() else {
            return false;
        };

        self.record.fill(0xFF);
        let mut cursor = HEADER_LEN;
        self.record[0..4].copy_from_slice(&SETTINGS_MAGIC.to_le_bytes());
        self.record[4] = SETTINGS_VERSION;

        let global_bytes = global_blob.as_bytes();
        self.record[cursor..cursor + 2].copy_from_slice(&(global_bytes.len() as u16).to_le_bytes());
        cursor += 2;
        self.record[cursor..cursor + global_bytes.len()].copy_from_slice(global_bytes);
        cursor += global_bytes.len();

        let count_at = cursor;
        cursor += 1;
        let mut count = 0u8;
        for info in manager.modules() {
            let Some(blob) = manager.save_module_config(info.module_mask) else {
                continue;
            };
            let bytes = blob.as_bytes();
            if cursor + 3 + bytes.len() + 1 > RECORD_MAX {
                break;
            }
            self.record[cursor] = info.module_mask;
            self.record[cursor + 1..cursor + 3]
                .copy_from_slice(&(bytes.len() as u16).to_le_bytes());
            cursor += 3;
            self.record[cursor..cursor + bytes.len()].copy_from_slice(bytes);
            cursor += bytes.len();
            count += 1;
        }
        self.record[count_at] = count;

        let payload_len = cursor - HEADER_LEN;
        self.record[5..7].copy_from_slice(&(payload_len as u16).to_le_bytes());
        self.record[cursor] = checksum8(&self.record[..cursor]);
        self.payload_len = payload_len;

        self.flash
            .write(self.offset, &self.record[..cursor + 1])
            .is_ok()
    }
}

/// Splits a payload into the global block and the raw entry bytes,
/// checking every length field along the way.
fn parse_payload(payload: &[u8]) -> Option<(&str, &[u8])> {
    if payload.len() < 3 {
        return None;
    }
    let global_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let entries_at = 2 + global_len;
    if entries_at + 1 > payload.len() {
        return None;
    }
    let global = core::str::from_utf8(&payload[2..entries_at]).ok()?;
    let count = payload[entries_at];
    let entries = &payload[entries_at + 1..];

    let mut rest = entries;
    for _ in 0..count {
        if rest.len() < 3 {
            return None;
        }
        let len = u16::from_le_bytes([rest[1], rest[2]]) as usize;
        if len > BLOB_MAX || 3 + len > rest.len() {
            return None;
        }
        core::str::from_utf8(&rest[3..3 + len]).ok()?;
        rest = &rest[3 + len..];
    }
    Some((global, &entries[..entries.len() - rest.len()]))
}

pub(crate) struct BlobIter<'a> {
    bytes: &'a [u8],
}

impl<'a> Iterator for BlobIter<'a> {
    type Item = (u8, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.len() < 3 {
            return None;
        }
        let mask = self.bytes[0];
        let len = u16::from_le_bytes([self.bytes[1], self.bytes[2]]) as usize;
        // Lengths were validated when the record loaded.
        let blob = core::str::from_utf8(&self.bytes[3..3 + len]).ok()?;
        self.bytes = &self.bytes[3 + len..];
        Some((mask, blob))
    }
}

fn checksum8(bytes: &[u8]) -> u8 {
    let mut acc = 0x5Au8;
    for &byte in bytes {
        acc ^= byte.rotate_left(1);
    }
    acc
}
