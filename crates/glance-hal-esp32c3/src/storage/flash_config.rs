//! Device configuration persisted in raw SPI flash.
//!
//! The record lives in the last sector of the first writable data
//! partition (NVS as fallback), found through the bootloader partition
//! table. One checksummed record holds every field; load and save each
//! open and close the flash session so nothing stays mounted between
//! operations.

use embedded_storage::{ReadStorage, Storage};
use esp_bootloader_esp_idf::partitions::{
    DataPartitionSubType, PARTITION_TABLE_MAX_LEN, PartitionType, read_partition_table,
};
use esp_rom_sys::rom::spiflash::{
    ESP_ROM_SPIFLASH_RESULT_OK, esp_rom_spiflash_erase_sector, esp_rom_spiflash_read,
    esp_rom_spiflash_unlock, esp_rom_spiflash_write,
};
use heapless::String;
use log::debug;

use glance_core::config::{
    CONTENT_DOC_MAX, ConfigStore, DeviceConfig, PASS_MAX, SERVER_MAX, SSID_MAX, TOKEN_MAX,
    clamp_sleep_minutes,
};

const FLASH_SECTOR_SIZE: u32 = 4096;
const DEFAULT_FLASH_CAPACITY_BYTES: usize = 4 * 1024 * 1024;

const RECORD_MAGIC: u32 = 0x3143_4C47; // "GLC1"
const RECORD_VERSION: u8 = 1;

// magic + version + sleep + retry, then the length-prefixed strings,
// then the checksum.
const FIXED_HEAD_LEN: usize = 4 + 1 + 2 + 1;
const RECORD_MAX_LEN: usize = FIXED_HEAD_LEN
    + (1 + SSID_MAX)
    + (1 + PASS_MAX)
    + (1 + SERVER_MAX)
    + (1 + TOKEN_MAX)
    + (2 + CONTENT_DOC_MAX)
    + 4;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FlashConfigError {
    PartitionTable,
    PartitionMissing,
    PartitionTooSmall,
    FlashOpFailed(i32),
    Corrupted,
    Unsupported,
}

#[derive(Debug)]
struct RawFlash;

impl RawFlash {
    fn open() -> Result<Self, FlashConfigError> {
        let rc = unsafe { esp_rom_spiflash_unlock() };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(FlashConfigError::FlashOpFailed(rc));
        }
        Ok(Self)
    }

    fn erase_sector(&mut self, sector_addr: u32) -> Result<(), FlashConfigError> {
        if !sector_addr.is_multiple_of(FLASH_SECTOR_SIZE) {
            return Err(FlashConfigError::Unsupported);
        }

        let rc = unsafe { esp_rom_spiflash_erase_sector(sector_addr / FLASH_SECTOR_SIZE) };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(FlashConfigError::FlashOpFailed(rc));
        }
        Ok(())
    }

    fn read_word(&mut self, addr: u32) -> Result<u32, FlashConfigError> {
        if !addr.is_multiple_of(4) {
            return Err(FlashConfigError::Unsupported);
        }

        let mut word = 0u32;
        let rc = unsafe { esp_rom_spiflash_read(addr, &mut word as *mut u32 as *const u32, 4) };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(FlashConfigError::FlashOpFailed(rc));
        }
        Ok(word)
    }

    fn write_word(&mut self, addr: u32, word: u32) -> Result<(), FlashConfigError> {
        if !addr.is_multiple_of(4) {
            return Err(FlashConfigError::Unsupported);
        }

        let rc = unsafe { esp_rom_spiflash_write(addr, &word as *const u32, 4) };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(FlashConfigError::FlashOpFailed(rc));
        }
        Ok(())
    }

    fn read_bytes(&mut self, addr: u32, out: &mut [u8]) -> Result<(), FlashConfigError> {
        let start = addr & !0b11;
        let end = (addr + out.len() as u32 + 3) & !0b11;

        for word_addr in (start..end).step_by(4) {
            let bytes = self.read_word(word_addr)?.to_le_bytes();
            let base = word_addr as i64 - addr as i64;
            for (i, b) in bytes.iter().enumerate() {
                let dst = base + i as i64;
                if dst < 0 {
                    continue;
                }
                let dst = dst as usize;
                if dst >= out.len() {
                    break;
                }
                out[dst] = *b;
            }
        }

        Ok(())
    }

    /// Writes into freshly erased flash, padding partial words with 0xFF.
    fn write_erased_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashConfigError> {
        if data.is_empty() {
            return Ok(());
        }

        let start = addr & !0b11;
        let end = (addr + data.len() as u32 + 3) & !0b11;

        for word_addr in (start..end).step_by(4) {
            let mut bytes = [0xFFu8; 4];
            let base = word_addr as i64 - addr as i64;
            for (i, slot) in bytes.iter_mut().enumerate() {
                let src = base + i as i64;
                if src < 0 {
                    continue;
                }
                let src = src as usize;
                if src >= data.len() {
                    break;
                }
                *slot = data[src];
            }
            self.write_word(word_addr, u32::from_le_bytes(bytes))?;
        }

        Ok(())
    }
}

impl ReadStorage for RawFlash {
    type Error = FlashConfigError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.read_bytes(offset, bytes)
    }

    fn capacity(&self) -> usize {
        DEFAULT_FLASH_CAPACITY_BYTES
    }
}

impl Storage for RawFlash {
    fn write(&mut self, _offset: u32, _bytes: &[u8]) -> Result<(), Self::Error> {
        Err(FlashConfigError::Unsupported)
    }
}

/// Locates the config sector once; flash itself is opened per operation.
#[derive(Debug)]
pub struct FlashConfigStore {
    sector_addr: u32,
}

impl FlashConfigStore {
    pub fn new() -> Result<Self, FlashConfigError> {
        let mut flash = RawFlash::open()?;

        let mut table_buf = [0u8; PARTITION_TABLE_MAX_LEN];
        let table = read_partition_table(&mut flash, &mut table_buf)
            .map_err(|_| FlashConfigError::PartitionTable)?;

        let mut data_undefined: Option<(u32, u32)> = None;
        let mut nvs_fallback: Option<(u32, u32)> = None;

        for entry in table.iter() {
            if entry.is_read_only() || entry.len() < FLASH_SECTOR_SIZE {
                continue;
            }

            match entry.partition_type() {
                PartitionType::Data(DataPartitionSubType::Undefined) => {
                    data_undefined = Some((entry.offset(), entry.len()));
                    break;
                }
                PartitionType::Data(DataPartitionSubType::Nvs) => {
                    if nvs_fallback.is_none() {
                        nvs_fallback = Some((entry.offset(), entry.len()));
                    }
                }
                _ => {}
            }
        }

        let (offset, len) = data_undefined
            .or(nvs_fallback)
            .ok_or(FlashConfigError::PartitionMissing)?;
        if len < FLASH_SECTOR_SIZE {
            return Err(FlashConfigError::PartitionTooSmall);
        }

        Ok(Self {
            sector_addr: offset + len - FLASH_SECTOR_SIZE,
        })
    }
}

impl ConfigStore for FlashConfigStore {
    type Error = FlashConfigError;

    fn load(&mut self) -> Result<Option<DeviceConfig>, Self::Error> {
        let mut flash = RawFlash::open()?;
        let mut buf = [0u8; RECORD_MAX_LEN];
        flash.read_bytes(self.sector_addr, &mut buf)?;

        // Never-written sector reads back erased.
        if buf[..FIXED_HEAD_LEN].iter().all(|b| *b == 0xFF) {
            return Ok(None);
        }

        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != RECORD_MAGIC || buf[4] != RECORD_VERSION {
            return Ok(None);
        }

        let mut config = DeviceConfig::new();
        config.sleep_minutes = clamp_sleep_minutes(u16::from_le_bytes([buf[5], buf[6]]) as u32);
        config.retry_count = buf[7];

        let mut at = FIXED_HEAD_LEN;
        config.ssid = read_string::<SSID_MAX>(&buf, &mut at)?;
        config.pass = read_string::<PASS_MAX>(&buf, &mut at)?;
        config.server = read_string::<SERVER_MAX>(&buf, &mut at)?;
        config.token = read_string::<TOKEN_MAX>(&buf, &mut at)?;
        config.content_doc = read_wide_string::<CONTENT_DOC_MAX>(&buf, &mut at)?;

        let stored = u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        if stored != checksum32(&buf[..at]) {
            return Err(FlashConfigError::Corrupted);
        }

        debug!("flash-config: loaded record ({} bytes)", at + 4);
        Ok(Some(config))
    }

    fn save(&mut self, config: &DeviceConfig) -> Result<(), Self::Error> {
        let mut buf = [0xFFu8; RECORD_MAX_LEN];
        buf[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf[4] = RECORD_VERSION;
        buf[5..7].copy_from_slice(&config.sleep_minutes.to_le_bytes());
        buf[7] = config.retry_count;

        let mut at = FIXED_HEAD_LEN;
        write_string(&mut buf, &mut at, &config.ssid);
        write_string(&mut buf, &mut at, &config.pass);
        write_string(&mut buf, &mut at, &config.server);
        write_string(&mut buf, &mut at, &config.token);
        write_wide_string(&mut buf, &mut at, &config.content_doc);

        let checksum = checksum32(&buf[..at]);
        buf[at..at + 4].copy_from_slice(&checksum.to_le_bytes());

        let mut flash = RawFlash::open()?;
        flash.erase_sector(self.sector_addr)?;
        flash.write_erased_bytes(self.sector_addr, &buf[..at + 4])
    }
}

fn read_string<const N: usize>(
    buf: &[u8],
    at: &mut usize,
) -> Result<String<N>, FlashConfigError> {
    let len = *buf.get(*at).ok_or(FlashConfigError::Corrupted)? as usize;
    *at += 1;
    take_str(buf, at, len)
}

fn read_wide_string<const N: usize>(
    buf: &[u8],
    at: &mut usize,
) -> Result<String<N>, FlashConfigError> {
    let bytes = buf
        .get(*at..*at + 2)
        .ok_or(FlashConfigError::Corrupted)?;
    let len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
    *at += 2;
    take_str(buf, at, len)
}

fn take_str<const N: usize>(
    buf: &[u8],
    at: &mut usize,
    len: usize,
) -> Result<String<N>, FlashConfigError> {
    if len > N {
        return Err(FlashConfigError::Corrupted);
    }
    let raw = buf
        .get(*at..*at + len)
        .ok_or(FlashConfigError::Corrupted)?;
    *at += len;
    let text = core::str::from_utf8(raw).map_err(|_| FlashConfigError::Corrupted)?;
    String::try_from(text).map_err(|_| FlashConfigError::Corrupted)
}

fn write_string<const N: usize>(buf: &mut [u8], at: &mut usize, value: &String<N>) {
    buf[*at] = value.len() as u8;
    *at += 1;
    buf[*at..*at + value.len()].copy_from_slice(value.as_bytes());
    *at += value.len();
}

fn write_wide_string<const N: usize>(buf: &mut [u8], at: &mut usize, value: &String<N>) {
    buf[*at..*at + 2].copy_from_slice(&(value.len() as u16).to_le_bytes());
    *at += 2;
    buf[*at..*at + value.len()].copy_from_slice(value.as_bytes());
    *at += value.len();
}

fn checksum32(bytes: &[u8]) -> u32 {
    let mut hash = 0x811C_9DC5u32;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}
