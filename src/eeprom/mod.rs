//! Identity EEPROM: reading, validation and encoding.
//!
//! Each board carries a small I2C EEPROM, programmed at the factory, holding
//! the production date, a unique id, the hostname, the device-specific
//! password hash and the Ethernet controller configuration.
//!
//! # Read Flow
//!
//! ```text
//! 1. Open the bus, select slave 0x50, reset the read cursor
//! 2. Read the 11-byte header, check the magic number
//! 3. Stream data_length payload bytes, one per transaction, into the CRC;
//!    keep the first DATA_V1_LENGTH of them
//! 4. Check CRC, data_version >= 1, data_length, string termination
//! ```
//!
//! Any failure yields "no record". There is no partially trusted record.

mod bus;
pub mod format;

pub use bus::{ByteBus, I2cBus, SliceBus};

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use log::{error, info};
use thiserror::Error;

use crate::config::BootConfig;
use format::{
    Field, Header, DATA_V1_LENGTH, ENCRYPTED_PASSWORD, ETHERNET_CONFIG, ETHERNET_CONFIG_LENGTH,
    HEADER_LENGTH, HOSTNAME, IMAGE_CAPACITY, MAGIC, PRODUCTION_DATE, STRING_FIELDS, UID,
};

/// Why no record could be produced.
#[derive(Debug, Error)]
pub enum EepromError {
    #[error("could not open {}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("could not set EEPROM slave address to 0x{address:02X}: {source}")]
    SlaveAddress { address: u16, source: io::Error },

    #[error("could not set EEPROM read address to zero: {0}")]
    ResetCursor(io::Error),

    #[error("could not read EEPROM header at address {address}: {source}")]
    ReadHeader { address: usize, source: io::Error },

    #[error("could not read EEPROM data at address {address}: {source}")]
    ReadData { address: usize, source: io::Error },

    #[error("EEPROM header has wrong magic number: {actual:08X} (actual) != {expected:08X} (expected)")]
    Magic { actual: u32, expected: u32 },

    #[error("EEPROM header/data has wrong checksum: {actual:08X} (actual) != {expected:08X} (expected)")]
    Checksum { actual: u32, expected: u32 },

    #[error("EEPROM header has invalid data-version: {0} (actual) < 1 (expected)")]
    Version(u8),

    #[error("EEPROM header has invalid data-length: {actual} (actual) < {expected} (expected)")]
    Length { actual: u16, expected: usize },

    #[error("EEPROM data {0} is not null-terminated")]
    Unterminated(&'static str),

    #[error("EEPROM data {field} is too long: {actual} > {max}")]
    TooLong {
        field: &'static str,
        actual: usize,
        max: usize,
    },
}

/// BCD production date, `0x20200827` for 2020-08-27.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductionDate(pub u32);

impl ProductionDate {
    pub fn year(&self) -> u32 {
        self.0 >> 16
    }

    pub fn month(&self) -> u32 {
        (self.0 >> 8) & 0xFF
    }

    pub fn day(&self) -> u32 {
        self.0 & 0xFF
    }
}

impl fmt::Display for ProductionDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}-{:02X}-{:02X}", self.year(), self.month(), self.day())
    }
}

impl FromStr for ProductionDate {
    type Err = String;

    /// Parse `YYYY-MM-DD`, keeping the digits as BCD.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        let [year, month, day] = parts.as_slice() else {
            return Err(format!("invalid date {:?}, expected YYYY-MM-DD", s));
        };

        let mut value = 0u32;
        for (part, width) in [(year, 4), (month, 2), (day, 2)] {
            if part.len() != width || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(format!("invalid date {:?}, expected YYYY-MM-DD", s));
            }
            let digits = u32::from_str_radix(part, 16).map_err(|e| e.to_string())?;
            value = (value << (width * 4)) | digits;
        }

        Ok(ProductionDate(value))
    }
}

/// Validated identity record.
///
/// Strings are stored without their NUL terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EepromRecord {
    /// Data version, always >= 1
    pub version: u8,
    pub production_date: ProductionDate,
    pub uid: Vec<u8>,
    pub hostname: Vec<u8>,
    pub encrypted_password: Vec<u8>,
    pub ethernet_config: [u8; ETHERNET_CONFIG_LENGTH],
}

impl EepromRecord {
    /// Decode a full EEPROM image held in memory.
    pub fn decode(image: &[u8]) -> Result<Self, EepromError> {
        read_record(&mut SliceBus::new(image))
    }

    /// Encode as a version 1 image.
    pub fn encode(&self) -> Result<Vec<u8>, EepromError> {
        let mut payload = vec![0u8; DATA_V1_LENGTH];

        PRODUCTION_DATE
            .slice_mut(&mut payload)
            .copy_from_slice(&self.production_date.0.to_le_bytes());

        for (field, value) in [
            (UID, &self.uid),
            (HOSTNAME, &self.hostname),
            (ENCRYPTED_PASSWORD, &self.encrypted_password),
        ] {
            // Room for the terminator; an embedded NUL would silently truncate
            let max = field.length - 1;
            if value.len() > max || value.contains(&0) {
                return Err(EepromError::TooLong {
                    field: field.name,
                    actual: value.len(),
                    max,
                });
            }
            field.slice_mut(&mut payload)[..value.len()].copy_from_slice(value);
        }

        ETHERNET_CONFIG
            .slice_mut(&mut payload)
            .copy_from_slice(&self.ethernet_config);

        let mut header = Header {
            magic: MAGIC,
            checksum: 0,
            data_length: DATA_V1_LENGTH as u16,
            data_version: 1,
        };
        header.checksum = header.compute_checksum(&payload);

        let mut image = header.to_bytes().to_vec();
        image.extend_from_slice(&payload);
        Ok(image)
    }

    pub fn uid_str(&self) -> String {
        String::from_utf8_lossy(&self.uid).into_owned()
    }

    pub fn hostname_str(&self) -> String {
        String::from_utf8_lossy(&self.hostname).into_owned()
    }
}

/// Bytes of a NUL-terminated field up to the first NUL.
fn c_str(field: Field, payload: &[u8]) -> Vec<u8> {
    let bytes = field.slice(payload);
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    bytes[..end].to_vec()
}

/// Read and validate a record from `bus`.
pub fn read_record<B: ByteBus>(bus: &mut B) -> Result<EepromRecord, EepromError> {
    bus.reset_cursor().map_err(EepromError::ResetCursor)?;

    info!("reading EEPROM header");

    let mut header_bytes = [0u8; HEADER_LENGTH];
    for (address, byte) in header_bytes.iter_mut().enumerate() {
        *byte = bus
            .read8()
            .map_err(|source| EepromError::ReadHeader { address, source })?;
    }

    let header = Header::parse(&header_bytes);
    if header.magic != MAGIC {
        return Err(EepromError::Magic {
            actual: header.magic,
            expected: MAGIC,
        });
    }

    info!("reading EEPROM data");

    let mut payload = [0u8; DATA_V1_LENGTH];
    let mut hasher = header.checksum_seed();
    let end = HEADER_LENGTH + usize::from(header.data_length);

    for address in HEADER_LENGTH..end {
        let byte = bus
            .read8()
            .map_err(|source| EepromError::ReadData { address, source })?;

        // Bytes past what we understand still count for the checksum
        if address < IMAGE_CAPACITY {
            payload[address - HEADER_LENGTH] = byte;
        }
        hasher.update(&[byte]);
    }

    validate(&header, hasher.finalize(), &payload)
}

fn validate(header: &Header, checksum: u32, payload: &[u8]) -> Result<EepromRecord, EepromError> {
    if header.checksum != checksum {
        return Err(EepromError::Checksum {
            actual: checksum,
            expected: header.checksum,
        });
    }

    if header.data_version < 1 {
        return Err(EepromError::Version(header.data_version));
    }

    // Every later version still starts with the version 1 fields
    if usize::from(header.data_length) < DATA_V1_LENGTH {
        return Err(EepromError::Length {
            actual: header.data_length,
            expected: DATA_V1_LENGTH,
        });
    }

    for field in STRING_FIELDS {
        if field.slice(payload)[field.length - 1] != 0 {
            return Err(EepromError::Unterminated(field.name));
        }
    }

    let mut date = [0u8; 4];
    date.copy_from_slice(PRODUCTION_DATE.slice(payload));
    let mut ethernet_config = [0u8; ETHERNET_CONFIG_LENGTH];
    ethernet_config.copy_from_slice(ETHERNET_CONFIG.slice(payload));

    Ok(EepromRecord {
        version: header.data_version,
        production_date: ProductionDate(u32::from_le_bytes(date)),
        uid: c_str(UID, payload),
        hostname: c_str(HOSTNAME, payload),
        encrypted_password: c_str(ENCRYPTED_PASSWORD, payload),
        ethernet_config,
    })
}

fn read_from_bus(config: &BootConfig) -> Result<EepromRecord, EepromError> {
    let path = &config.eeprom_bus;

    info!("opening {}", path.display());

    let mut bus = I2cBus::open(path).map_err(|source| EepromError::Open {
        path: path.clone(),
        source,
    })?;

    let result = bus
        .set_slave_address(config.eeprom_address)
        .map_err(|source| EepromError::SlaveAddress {
            address: config.eeprom_address,
            source,
        })
        .and_then(|()| read_record(&mut bus));

    info!("closing {}", path.display());
    result
}

/// Read the board's EEPROM. Failures are logged and yield `None`.
pub fn read_eeprom(config: &BootConfig) -> Option<EepromRecord> {
    match read_from_bus(config) {
        Ok(record) => {
            info!(
                "EEPROM data version {}: uid {}, hostname {}",
                record.version,
                record.uid_str(),
                record.hostname_str()
            );
            Some(record)
        }
        Err(e) => {
            error!("{}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EepromRecord {
        let mut ethernet_config = [0u8; ETHERNET_CONFIG_LENGTH];
        for (i, byte) in ethernet_config.iter_mut().enumerate() {
            *byte = (i * 7) as u8;
        }
        ethernet_config[0] = 0xA5;

        EepromRecord {
            version: 1,
            production_date: ProductionDate(0x2020_0827),
            uid: b"Xy9Za".to_vec(),
            hostname: b"tng-base-Xy9Za".to_vec(),
            encrypted_password: concat!(
                "$6$Lp1sV3tX$Yq8Wc0zT5kM2bN7rE4fH1jG6dS9aP3oL0iU8yT5rE2wQ1z",
                "X4cV7bN0mK3jH6gF9dS2aP5oI8uY1tR4eW7qZ0x"
            )
            .as_bytes()
            .to_vec(),
            ethernet_config,
        }
    }

    /// Rewrite the header checksum after tampering with an image.
    fn reseal(image: &mut [u8]) {
        let mut header_bytes = [0u8; HEADER_LENGTH];
        header_bytes.copy_from_slice(&image[..HEADER_LENGTH]);
        let header = Header::parse(&header_bytes);
        let end = HEADER_LENGTH + usize::from(header.data_length);
        let checksum = header.compute_checksum(&image[HEADER_LENGTH..end]);
        image[4..8].copy_from_slice(&checksum.to_le_bytes());
    }

    #[test]
    fn test_round_trip() {
        let record = sample();
        let image = record.encode().unwrap();

        assert_eq!(image.len(), IMAGE_CAPACITY);
        assert_eq!(EepromRecord::decode(&image).unwrap(), record);
    }

    #[test]
    fn test_reads_exactly_declared_length() {
        let image = sample().encode().unwrap();
        let mut padded = image.clone();
        padded.extend_from_slice(&[0xFF; 32]);

        let mut bus = SliceBus::new(&padded);
        read_record(&mut bus).unwrap();
        assert_eq!(bus.cursor(), image.len());
    }

    #[test]
    fn test_every_single_byte_corruption_is_rejected() {
        let image = sample().encode().unwrap();

        for index in 0..image.len() {
            let mut corrupt = image.clone();
            corrupt[index] ^= 0x01;
            assert!(
                EepromRecord::decode(&corrupt).is_err(),
                "corruption at byte {} was not detected",
                index
            );
        }
    }

    #[test]
    fn test_wrong_magic() {
        let mut image = sample().encode().unwrap();
        image[0] = b'X';
        assert!(matches!(
            EepromRecord::decode(&image),
            Err(EepromError::Magic { expected: MAGIC, .. })
        ));
    }

    #[test]
    fn test_wrong_checksum() {
        let mut image = sample().encode().unwrap();
        image[HEADER_LENGTH + 20] ^= 0xFF;
        assert!(matches!(
            EepromRecord::decode(&image),
            Err(EepromError::Checksum { .. })
        ));
    }

    #[test]
    fn test_version_zero_rejected() {
        let mut image = sample().encode().unwrap();
        image[10] = 0;
        reseal(&mut image);
        assert!(matches!(EepromRecord::decode(&image), Err(EepromError::Version(0))));
    }

    #[test]
    fn test_short_payload_rejected() {
        let image = sample().encode().unwrap();
        let mut short = image[..HEADER_LENGTH + 100].to_vec();
        short[8..10].copy_from_slice(&100u16.to_le_bytes());
        reseal(&mut short);

        assert!(matches!(
            EepromRecord::decode(&short),
            Err(EepromError::Length { actual: 100, expected: DATA_V1_LENGTH })
        ));
    }

    #[test]
    fn test_truncated_stream_is_a_read_error() {
        let image = sample().encode().unwrap();
        assert!(matches!(
            EepromRecord::decode(&image[..200]),
            Err(EepromError::ReadData { address: 200, .. })
        ));
        assert!(matches!(
            EepromRecord::decode(&image[..5]),
            Err(EepromError::ReadHeader { address: 5, .. })
        ));
    }

    #[test]
    fn test_unterminated_strings_rejected() {
        for field in STRING_FIELDS {
            let mut image = sample().encode().unwrap();
            image[HEADER_LENGTH + field.end() - 1] = b'!';
            reseal(&mut image);

            match EepromRecord::decode(&image) {
                Err(EepromError::Unterminated(name)) => assert_eq!(name, field.name),
                other => panic!("expected unterminated {}, got {:?}", field.name, other),
            }
        }
    }

    #[test]
    fn test_longer_payload_from_newer_version() {
        let record = sample();
        let image = record.encode().unwrap();

        // Version 2 appends fields this program does not know about
        let mut newer = image.clone();
        newer[10] = 2;
        newer.extend_from_slice(&[0x5A; 40]);
        let length = (DATA_V1_LENGTH + 40) as u16;
        newer[8..10].copy_from_slice(&length.to_le_bytes());
        reseal(&mut newer);

        let decoded = EepromRecord::decode(&newer).unwrap();
        assert_eq!(decoded.version, 2);
        assert_eq!(decoded.hostname, record.hostname);
        assert_eq!(decoded.ethernet_config, record.ethernet_config);
    }

    #[test]
    fn test_encode_rejects_long_hostname() {
        let mut record = sample();
        record.hostname = vec![b'a'; HOSTNAME.length];
        assert!(matches!(
            record.encode(),
            Err(EepromError::TooLong { field: "hostname", actual: 65, max: 64 })
        ));
    }

    #[test]
    fn test_production_date() {
        let date = ProductionDate(0x2020_0827);
        assert_eq!(date.to_string(), "2020-08-27");
        assert_eq!("2020-08-27".parse::<ProductionDate>(), Ok(date));
        assert!("2020-8-27".parse::<ProductionDate>().is_err());
        assert!("2020-0A-27".parse::<ProductionDate>().is_err());
    }

    #[test]
    fn test_error_messages() {
        let err = EepromError::Magic {
            actual: 0xFFFF_FFFF,
            expected: MAGIC,
        };
        assert_eq!(
            err.to_string(),
            "EEPROM header has wrong magic number: FFFFFFFF (actual) != 21474E54 (expected)"
        );
        assert_eq!(
            EepromError::Unterminated("UID").to_string(),
            "EEPROM data UID is not null-terminated"
        );
    }
}
