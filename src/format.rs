//! Firmware file formats
use std::path::Path;
use std::str;

use anyhow::Result;
use ihex::Record;

/// Erased flash reads back as this.
const FILL_BYTE: u8 = 0xff;
const RECORD_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    IntelHex,
    Binary,
}

pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?),
        FirmwareFormat::Binary => Ok(raw),
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihx", "hex", "eep"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }

    if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| c.is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else {
        FirmwareFormat::Binary
    }
}

/// Materializes an Intel HEX file as an image starting at address 0.
/// Gaps are filled with erased-flash bytes.
pub fn read_ihex(data: &str) -> Result<Vec<u8>> {
    let mut base_address = 0;

    let mut image: Vec<u8> = vec![];
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let start = (base_address + offset as u32) as usize;
                let end = start + value.len();
                if image.len() < end {
                    image.resize(end, FILL_BYTE);
                }
                image[start..end].copy_from_slice(&value);
            }
            EndOfFile => break,
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartSegmentAddress { .. } | StartLinearAddress(_) => (),
        };
    }
    anyhow::ensure!(!image.is_empty(), "no data records in Intel HEX file");
    Ok(image)
}

/// Renders `data`, based at address 0, as Intel HEX.
pub fn write_ihex(data: &[u8]) -> Result<String> {
    let mut records = vec![];
    let mut segment = None;
    for (index, chunk) in data.chunks(RECORD_SIZE).enumerate() {
        let address = index * RECORD_SIZE;
        let upper = (address >> 16) as u16;
        if segment != Some(upper) {
            // the first 64KiB need no extended address record
            if upper != 0 || segment.is_some() {
                records.push(Record::ExtendedLinearAddress(upper));
            }
            segment = Some(upper);
        }
        records.push(Record::Data {
            offset: address as u16,
            value: chunk.to_vec(),
        });
    }
    records.push(Record::EndOfFile);
    Ok(ihex::create_object_file_representation(&records)?)
}

pub fn write_ihex_to_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<()> {
    let p = path.as_ref();
    std::fs::write(p, write_ihex(data)?)?;
    log::info!("Wrote {} bytes to {}", data.len(), p.display());
    Ok(())
}
