//! Byte-wise access to the EEPROM.
//!
//! The EEPROM sits behind the BCM2835 I2C controller and is driven with
//! SMBus transactions of one byte each: a two-byte write to position the
//! read cursor, then single-byte reads that advance it.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// One-byte-per-transaction bus.
pub trait ByteBus {
    /// Write two bytes in one transaction (the 16-bit cursor address).
    fn write16(&mut self, byte0: u8, byte1: u8) -> io::Result<()>;

    /// Read the byte at the cursor and advance it.
    fn read8(&mut self) -> io::Result<u8>;

    /// Move the read cursor back to offset 0.
    fn reset_cursor(&mut self) -> io::Result<()> {
        self.write16(0, 0)
    }
}

/// EEPROM image held in memory, addressed like the real part.
#[derive(Debug, Clone)]
pub struct SliceBus<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> SliceBus<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, cursor: 0 }
    }

    /// Bytes handed out so far.
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

impl ByteBus for SliceBus<'_> {
    fn write16(&mut self, byte0: u8, byte1: u8) -> io::Result<()> {
        self.cursor = usize::from(u16::from_be_bytes([byte0, byte1]));
        Ok(())
    }

    fn read8(&mut self) -> io::Result<u8> {
        let byte = *self
            .bytes
            .get(self.cursor)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        self.cursor += 1;
        Ok(byte)
    }
}

const I2C_SLAVE: libc::c_ulong = 0x0703;
const I2C_SMBUS: libc::c_ulong = 0x0720;

const I2C_SMBUS_WRITE: u8 = 0;
const I2C_SMBUS_READ: u8 = 1;

const I2C_SMBUS_BYTE: u32 = 1;
const I2C_SMBUS_BYTE_DATA: u32 = 2;

/// `union i2c_smbus_data`
#[repr(C)]
#[allow(dead_code)]
union SmbusData {
    byte: u8,
    word: u16,
    block: [u8; 34],
}

/// `struct i2c_smbus_ioctl_data`
#[repr(C)]
struct SmbusIoctlData {
    read_write: u8,
    command: u8,
    size: u32,
    data: *mut SmbusData,
}

/// i2c-dev character device bound to one slave address.
pub struct I2cBus {
    file: File,
}

impl I2cBus {
    /// Open the bus device read-write.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    pub fn set_slave_address(&mut self, address: u16) -> io::Result<()> {
        // SAFETY: I2C_SLAVE takes the address by value.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                I2C_SLAVE as _,
                libc::c_ulong::from(address),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn smbus(
        &mut self,
        read_write: u8,
        command: u8,
        size: u32,
        data: &mut SmbusData,
    ) -> io::Result<()> {
        let mut args = SmbusIoctlData {
            read_write,
            command,
            size,
            data: data as *mut SmbusData,
        };

        // SAFETY: args and the data it points to outlive the call.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                I2C_SMBUS as _,
                &mut args as *mut SmbusIoctlData,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl ByteBus for I2cBus {
    fn write16(&mut self, byte0: u8, byte1: u8) -> io::Result<()> {
        let mut data = SmbusData { byte: byte1 };
        self.smbus(I2C_SMBUS_WRITE, byte0, I2C_SMBUS_BYTE_DATA, &mut data)
    }

    fn read8(&mut self) -> io::Result<u8> {
        let mut data = SmbusData { block: [0; 34] };
        self.smbus(I2C_SMBUS_READ, 0, I2C_SMBUS_BYTE, &mut data)?;

        // SAFETY: every bit pattern is a valid u8.
        Ok(unsafe { data.byte })
    }
}
