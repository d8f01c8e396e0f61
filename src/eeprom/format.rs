//! EEPROM wire layout.
//!
//! ```text
//! offset  size  field
//! ------  ----  -----------------------------------------------
//!      0     4  magic 0x21474E54 ("TNG!")
//!      4     4  CRC-32 over data_length, data_version and payload
//!      8     2  data_length (payload bytes)
//!     10     1  data_version
//! ------  ----  version 1 payload ------------------------------
//!     11     4  production date, BCD (0x20200827 = 2020-08-27)
//!     15     7  unique id, NUL-terminated
//!     22    65  hostname, NUL-terminated
//!     87   107  encrypted password, NUL-terminated
//!    194   256  Ethernet controller configuration
//! ```
//!
//! Integers are little-endian, the byte order of the board.

use crc32fast::Hasher;

pub const MAGIC: u32 = 0x2147_4E54;

pub const HEADER_LENGTH: usize = 11;

pub const PRODUCTION_DATE_LENGTH: usize = 4;
pub const UID_LENGTH: usize = 7;
pub const HOSTNAME_LENGTH: usize = 65;
pub const ENCRYPTED_PASSWORD_LENGTH: usize = 107;
pub const ETHERNET_CONFIG_LENGTH: usize = 256;

pub const DATA_V1_LENGTH: usize = PRODUCTION_DATE_LENGTH
    + UID_LENGTH
    + HOSTNAME_LENGTH
    + ENCRYPTED_PASSWORD_LENGTH
    + ETHERNET_CONFIG_LENGTH;

/// Bytes kept in memory; payload beyond this is read and checksummed only.
pub const IMAGE_CAPACITY: usize = HEADER_LENGTH + DATA_V1_LENGTH;

/// A fixed-width field inside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub length: usize,
}

impl Field {
    pub const fn end(&self) -> usize {
        self.offset + self.length
    }

    pub fn slice<'a>(&self, payload: &'a [u8]) -> &'a [u8] {
        &payload[self.offset..self.end()]
    }

    pub fn slice_mut<'a>(&self, payload: &'a mut [u8]) -> &'a mut [u8] {
        &mut payload[self.offset..self.end()]
    }
}

pub const PRODUCTION_DATE: Field = Field {
    name: "production-date",
    offset: 0,
    length: PRODUCTION_DATE_LENGTH,
};

pub const UID: Field = Field {
    name: "UID",
    offset: PRODUCTION_DATE.end(),
    length: UID_LENGTH,
};

pub const HOSTNAME: Field = Field {
    name: "hostname",
    offset: UID.end(),
    length: HOSTNAME_LENGTH,
};

pub const ENCRYPTED_PASSWORD: Field = Field {
    name: "encrypted-password",
    offset: HOSTNAME.end(),
    length: ENCRYPTED_PASSWORD_LENGTH,
};

pub const ETHERNET_CONFIG: Field = Field {
    name: "Ethernet config",
    offset: ENCRYPTED_PASSWORD.end(),
    length: ETHERNET_CONFIG_LENGTH,
};

/// String fields, in validation order.
pub const STRING_FIELDS: [Field; 3] = [UID, HOSTNAME, ENCRYPTED_PASSWORD];

/// Decoded header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub checksum: u32,
    pub data_length: u16,
    pub data_version: u8,
}

impl Header {
    pub fn parse(bytes: &[u8; HEADER_LENGTH]) -> Self {
        Self {
            magic: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            data_length: u16::from_le_bytes([bytes[8], bytes[9]]),
            data_version: bytes[10],
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let mut bytes = [0u8; HEADER_LENGTH];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.data_length.to_le_bytes());
        bytes[10] = self.data_version;
        bytes
    }

    /// CRC state after the header fields the checksum covers.
    pub fn checksum_seed(&self) -> Hasher {
        let mut hasher = Hasher::new();
        hasher.update(&self.data_length.to_le_bytes());
        hasher.update(&[self.data_version]);
        hasher
    }

    /// Checksum the header should carry for `payload`.
    pub fn compute_checksum(&self, payload: &[u8]) -> u32 {
        let mut hasher = self.checksum_seed();
        hasher.update(payload);
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(DATA_V1_LENGTH, 439);
        assert_eq!(IMAGE_CAPACITY, 450);
        assert_eq!(UID.offset, 4);
        assert_eq!(HOSTNAME.offset, 11);
        assert_eq!(ENCRYPTED_PASSWORD.offset, 76);
        assert_eq!(ETHERNET_CONFIG.offset, 183);
        assert_eq!(ETHERNET_CONFIG.end(), DATA_V1_LENGTH);
    }

    #[test]
    fn test_header_bytes() {
        let header = Header {
            magic: MAGIC,
            checksum: 0xDEAD_BEEF,
            data_length: 439,
            data_version: 1,
        };
        let bytes = header.to_bytes();

        assert_eq!(&bytes[0..4], b"TNG!");
        assert_eq!(&bytes[4..8], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(&bytes[8..10], &[0xB7, 0x01]);
        assert_eq!(bytes[10], 1);
        assert_eq!(Header::parse(&bytes), header);
    }

    #[test]
    fn test_checksum_covers_length_and_version() {
        let header = Header {
            magic: MAGIC,
            checksum: 0,
            data_length: 3,
            data_version: 1,
        };
        // CRC-32 of 03 00 01 'a' 'b' 'c'
        assert_eq!(
            header.compute_checksum(b"abc"),
            crc32fast::hash(&[0x03, 0x00, 0x01, b'a', b'b', b'c'])
        );
    }
}
