//! Capture sink: a minimal legacy-pcap writer.
//!
//! Records are raw IP datagrams (LINKTYPE_RAW), one record per pipeline
//! write. Mangled packets are written twice by the pipeline, once pristine
//! and once rewritten, so downstream tooling can see both sides of a rewrite.

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::Local;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Raw IP link type (no link-layer header)
pub const LINKTYPE_RAW: u32 = 101;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const SNAPLEN: u32 = 65535;

pub struct PcapWriter {
    file: BufWriter<File>,
}

impl PcapWriter {
    /// Create the capture file and emit the global header
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut file = BufWriter::new(File::create(path)?);
        file.write_u32::<LittleEndian>(PCAP_MAGIC)?;
        file.write_u16::<LittleEndian>(2)?;
        file.write_u16::<LittleEndian>(4)?;
        file.write_u32::<LittleEndian>(0)?;
        file.write_u32::<LittleEndian>(0)?;
        file.write_u32::<LittleEndian>(SNAPLEN)?;
        file.write_u32::<LittleEndian>(LINKTYPE_RAW)?;
        file.flush()?;
        Ok(Self { file })
    }

    /// Append one record containing the given datagram octets
    pub fn write_packet(&mut self, octets: &[u8]) -> io::Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.file.write_u32::<LittleEndian>(now.as_secs() as u32)?;
        self.file.write_u32::<LittleEndian>(now.subsec_micros())?;
        self.file.write_u32::<LittleEndian>(octets.len() as u32)?;
        self.file.write_u32::<LittleEndian>(octets.len() as u32)?;
        self.file.write_all(octets)?;
        self.file.flush()
    }
}

/// Capture file name for a run started now: `{prefix}_{YYYYMMDD_HHMMSS}.pcap`
pub fn capture_filename(prefix: &str) -> String {
    format!("{}_{}.pcap", prefix, Local::now().format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use std::fs;
    use std::io::Cursor;

    #[test]
    fn writes_header_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pcap");
        let mut writer = PcapWriter::create(&path).unwrap();
        writer.write_packet(&[0u8; 40]).unwrap();
        writer.write_packet(&[1u8; 28]).unwrap();
        drop(writer);

        let data = fs::read(&path).unwrap();
        assert_eq!(data.len(), 24 + (16 + 40) + (16 + 28));
        let mut cursor = Cursor::new(&data);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), PCAP_MAGIC);
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 2);
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 4);
        cursor.set_position(20);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), LINKTYPE_RAW);
        // First record header: lengths at offsets 32/36
        cursor.set_position(32);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 40);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 40);
    }

    #[test]
    fn filename_carries_prefix_and_timestamp() {
        let name = capture_filename("packets");
        assert!(name.starts_with("packets_"));
        assert!(name.ends_with(".pcap"));
        // packets_YYYYMMDD_HHMMSS.pcap
        assert_eq!(name.len(), "packets_".len() + 15 + ".pcap".len());
    }
}
