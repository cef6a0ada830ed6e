use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use log::info;

use crate::buf::{put_bytes, put_utf, ByteReader};
use crate::error::{DecodeError, StorageError};
use crate::types::{RecordId, RecordSnapshot};
use crate::version::RecordVersion;

/// Binary WAL format constants
const WAL_MAGIC: &[u8; 4] = b"QWAL";
const WAL_VERSION: u8 = 1;

/// Operation types
const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// magic(4) + version(1) + op(1) + body_len(4)
const HEADER_SIZE: usize = 10;
/// CRC32 size
const CRC_SIZE: usize = 4;

/// WAL entry representing a single record mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalEntry {
    Put {
        rid: RecordId,
        version: RecordVersion,
        content: Vec<u8>,
    },
    /// Physical delete, written only once a deferred delete is finalized.
    Delete {
        rid: RecordId,
    },
}

impl WalEntry {
    /// Encode entry to binary format
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        let op = match self {
            WalEntry::Put { rid, version, content } => {
                put_utf(&mut body, &rid.to_string());
                version.encode(&mut body);
                put_bytes(&mut body, content);
                OP_PUT
            }
            WalEntry::Delete { rid } => {
                put_utf(&mut body, &rid.to_string());
                OP_DELETE
            }
        };

        let mut buf = Vec::with_capacity(HEADER_SIZE + body.len() + CRC_SIZE);
        buf.extend_from_slice(WAL_MAGIC);
        buf.push(WAL_VERSION);
        buf.push(op);
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decode one entry from the front of `data`, returning it with the bytes consumed.
    fn decode(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        let mut header = ByteReader::new(data);
        if header.read_slice(4)? != WAL_MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let version = header.read_u8()?;
        if version != WAL_VERSION {
            return Err(DecodeError::UnknownTag { what: "wal version", tag: version });
        }
        let op = header.read_u8()?;
        let body_len = header.read_u32()? as usize;

        let total_len = HEADER_SIZE + body_len + CRC_SIZE;
        if data.len() < total_len {
            return Err(DecodeError::Truncated {
                needed: total_len,
                remaining: data.len(),
            });
        }

        let crc_bytes = [
            data[total_len - 4],
            data[total_len - 3],
            data[total_len - 2],
            data[total_len - 1],
        ];
        let stored = u32::from_be_bytes(crc_bytes);
        let calculated = crc32fast::hash(&data[..total_len - CRC_SIZE]);
        if stored != calculated {
            return Err(DecodeError::ChecksumMismatch { stored, calculated });
        }

        let mut body = ByteReader::new(&data[HEADER_SIZE..HEADER_SIZE + body_len]);
        let rid = body.read_utf("record id")?.parse::<RecordId>()?;
        let entry = match op {
            OP_PUT => {
                let version = RecordVersion::decode(&mut body)?;
                let content = body.read_bytes()?;
                WalEntry::Put { rid, version, content }
            }
            OP_DELETE => WalEntry::Delete { rid },
            _ => return Err(DecodeError::UnknownTag { what: "wal op", tag: op }),
        };
        body.finish()?;

        Ok((entry, total_len))
    }
}

/// Write-Ahead Log for durability (binary format)
pub struct Wal {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    enabled: bool,
}

impl Wal {
    /// Create a new WAL at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        info!("WAL initialized at {:?} (binary format v{})", path, WAL_VERSION);

        Ok(Wal {
            path,
            writer: Some(BufWriter::new(file)),
            enabled: true,
        })
    }

    /// Create a disabled WAL (in-memory only mode)
    pub fn disabled() -> Self {
        Wal {
            path: PathBuf::new(),
            writer: None,
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn log_put(&mut self, rid: RecordId, snapshot: &RecordSnapshot) -> Result<(), StorageError> {
        if !self.enabled {
            return Ok(());
        }
        self.append(&WalEntry::Put {
            rid,
            version: snapshot.version,
            content: snapshot.content.clone(),
        })
    }

    pub fn log_delete(&mut self, rid: RecordId) -> Result<(), StorageError> {
        if !self.enabled {
            return Ok(());
        }
        self.append(&WalEntry::Delete { rid })
    }

    fn append(&mut self, entry: &WalEntry) -> Result<(), StorageError> {
        if let Some(ref mut writer) = self.writer {
            writer.write_all(&entry.encode())?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Read all entries from the WAL file.
    ///
    /// A corrupt entry is skipped by scanning forward to the next magic.
    pub fn read_entries(&self) -> Result<Vec<WalEntry>, StorageError> {
        if !self.enabled || !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut data = Vec::new();
        File::open(&self.path)?.read_to_end(&mut data)?;

        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match WalEntry::decode(&data[offset..]) {
                Ok((entry, consumed)) => {
                    entries.push(entry);
                    offset += consumed;
                }
                Err(e) => {
                    info!("Skipping corrupted WAL entry at offset {}: {}", offset, e);
                    offset += 1;
                    while offset + 4 <= data.len() {
                        if &data[offset..offset + 4] == WAL_MAGIC {
                            break;
                        }
                        offset += 1;
                    }
                    if offset + 4 > data.len() {
                        break;
                    }
                }
            }
        }

        Ok(entries)
    }
}
