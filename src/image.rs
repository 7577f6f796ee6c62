//! Binary image files: parsing and loading into the machine.
//!
//! An image is a header followed by named sections, little-endian,
//! with no padding anywhere:
//!
//! ```txt
//! +--------------------------------------------+
//! |                  Header                    |
//! |--------------------------------------------|
//! |  magic             | 4 bytes  45 70 FA DE  |
//! |  version           | 4 bytes  00 00 00 01  |
//! |  required memory   | 8 bytes               |
//! |  initial ip        | 8 bytes               |
//! |  initial sp (= fp) | 8 bytes               |
//! |  section count N   | 2 bytes               |
//! +--------------------------------------------+
//! |                N sections                  |
//! |--------------------------------------------|
//! |  name   | NUL-terminated, at most 32 bytes |
//! |  addr   | 8 bytes                          |
//! |  size   | 8 bytes                          |
//! |  data   | size bytes, copied to addr       |
//! +--------------------------------------------+
//! ```

use std::fmt::{Display, Formatter};
use std::io::{Cursor, Read};

use crate::error::{ErrorCode, State};
use crate::machine::Vm;

pub const IMAGE_MAGIC: [u8; 4] = [0x45, 0x70, 0xFA, 0xDE];
pub const IMAGE_VERSION: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Section names longer than this are kept as a bare 32-byte prefix;
/// the remaining name bytes are not consumed.
const SECTION_NAME_MAX: usize = 32;

#[derive(Debug)]
pub enum ImageError {
    UnexpectedEof,
    InvalidMagic,
    InvalidVersion,
    MemoryTooSmall { required: u64, available: u64 },
    EntryOutOfMemory { ip: u64 },
    StackOutOfMemory { sp: u64 },
    SectionOutOfMemory { name: String, addr: u64, size: u64 },
}

impl Display for ImageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageError::UnexpectedEof => write!(f, "Unexpected end of image"),
            ImageError::InvalidMagic => write!(f, "Invalid magic number"),
            ImageError::InvalidVersion => write!(f, "Invalid version number"),
            ImageError::MemoryTooSmall {
                required,
                available,
            } => write!(
                f,
                "The image needs {} bytes of memory but only {} are configured",
                required, available
            ),
            ImageError::EntryOutOfMemory { ip } => {
                write!(f, "The instruction pointer {:#X} is out of memory", ip)
            }
            ImageError::StackOutOfMemory { sp } => {
                write!(f, "The stack pointer {:#X} is out of memory", sp)
            }
            ImageError::SectionOutOfMemory { name, addr, size } => write!(
                f,
                "Section `{}` ({} bytes at {:#X}) is out of memory",
                name, size, addr
            ),
        }
    }
}

impl std::error::Error for ImageError {}

#[derive(Debug)]
pub struct Section {
    pub name: String,
    pub addr: u64,
    pub data: Vec<u8>,
}

/// A parsed image, not yet bound to any machine. Validation against a
/// concrete memory size happens in [`Vm::load_image`].
#[derive(Debug)]
pub struct Image {
    /// Memory the image expects, an upper bound checked at load time.
    pub mem_size: u64,
    pub ip: u64,
    pub sp: u64,
    pub sections: Vec<Section>,
}

fn read_array<const N: usize>(reader: &mut Cursor<Vec<u8>>) -> Result<[u8; N], ImageError> {
    let mut buf = [0u8; N];
    reader
        .read_exact(&mut buf)
        .map_err(|_| ImageError::UnexpectedEof)?;
    Ok(buf)
}

fn read_u64(reader: &mut Cursor<Vec<u8>>) -> Result<u64, ImageError> {
    Ok(u64::from_le_bytes(read_array::<8>(reader)?))
}

/// Section name: up to 32 bytes, stopping early at a NUL. A name that
/// fills all 32 bytes without one is truncated there and parsing
/// continues with the next byte.
fn read_name(reader: &mut Cursor<Vec<u8>>) -> Result<String, ImageError> {
    let mut name = Vec::new();
    while name.len() < SECTION_NAME_MAX {
        let byte = read_array::<1>(reader)?[0];
        if byte == 0 {
            break;
        }
        name.push(byte);
    }
    Ok(String::from_utf8_lossy(&name).into_owned())
}

impl Image {
    /// Parse an image from its raw bytes. Only the file structure is
    /// checked here; address validation needs a machine.
    pub fn parse(source: Vec<u8>) -> Result<Image, ImageError> {
        let source_len = source.len() as u64;
        let mut reader = Cursor::new(source);

        if read_array::<4>(&mut reader)? != IMAGE_MAGIC {
            return Err(ImageError::InvalidMagic);
        }
        if read_array::<4>(&mut reader)? != IMAGE_VERSION {
            return Err(ImageError::InvalidVersion);
        }

        let mem_size = read_u64(&mut reader)?;
        let ip = read_u64(&mut reader)?;
        let sp = read_u64(&mut reader)?;
        let count = u16::from_le_bytes(read_array::<2>(&mut reader)?);

        let mut sections = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = read_name(&mut reader)?;
            let addr = read_u64(&mut reader)?;
            let size = read_u64(&mut reader)?;

            // a payload cannot be larger than what is left of the file
            if size > source_len.saturating_sub(reader.position()) {
                return Err(ImageError::UnexpectedEof);
            }

            let mut data = vec![0u8; size as usize];
            reader
                .read_exact(&mut data)
                .map_err(|_| ImageError::UnexpectedEof)?;

            sections.push(Section { name, addr, data });
        }

        Ok(Image {
            mem_size,
            ip,
            sp,
            sections,
        })
    }
}

impl Display for Image {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "--------- Image Dump ----------")?;
        writeln!(f, " - Required Memory: {}", self.mem_size)?;
        writeln!(f, " - Initial `ip`: {:#014X}", self.ip)?;
        writeln!(f, " - Initial `sp`: {:#014X}", self.sp)?;
        writeln!(f, " - Sections: {}", self.sections.len())?;
        for section in &self.sections {
            writeln!(
                f,
                "   - `{}`: {} bytes at {:#014X}",
                section.name,
                section.data.len(),
                section.addr
            )?;
        }
        write!(f, "-------------------------------")
    }
}

impl Vm {
    /// Bind a parsed image: validate it against this machine's memory,
    /// copy the sections in and point the registers at the entry
    /// state. On success the machine is ready and its error register
    /// clean; on failure it stays halted.
    pub fn load_image(&mut self, image: &Image) -> Result<(), ImageError> {
        let mem_size = self.memory.size();

        if mem_size < image.mem_size {
            return Err(ImageError::MemoryTooSmall {
                required: image.mem_size,
                available: mem_size,
            });
        }
        if image.ip >= mem_size {
            return Err(ImageError::EntryOutOfMemory { ip: image.ip });
        }
        if image.sp >= mem_size {
            return Err(ImageError::StackOutOfMemory { sp: image.sp });
        }

        self.ip = image.ip;
        self.sp = image.sp;
        self.fp = image.sp;

        if self.verbose {
            eprintln!("--- `ip` at {:#014X}", self.ip);
            eprintln!("--- `fp` at {:#014X}", self.fp);
            eprintln!("--- `sp` at {:#014X}", self.sp);
            eprintln!("--- {} sections", image.sections.len());
        }

        for section in &image.sections {
            if self.verbose {
                eprintln!("--- Reading section `{}`...", section.name);
            }

            let size = section.data.len() as u64;
            let out_of_memory = ImageError::SectionOutOfMemory {
                name: section.name.clone(),
                addr: section.addr,
                size,
            };
            if size > mem_size || section.addr > mem_size - size {
                return Err(out_of_memory);
            }
            self.memory
                .write(section.addr, &section.data)
                .map_err(|_: ErrorCode| out_of_memory)?;
        }

        self.state_set(State::Ready);
        self.error_set(ErrorCode::Success);

        Ok(())
    }
}
