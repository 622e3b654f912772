//! Packed example wire format and shard file framing
//!
//! A shard is a sequence of frames, each a little-endian `u64` payload length
//! followed by the payload. A payload is a list of tagged fields:
//!
//! ```text
//! tag 1  file id        i64
//! tag 2  sample rate    i64
//! tag 3  sample index   i64
//! tag 4  num samples    i64
//! tag 5  channels       i64
//! tag 6  num sources    i64
//! tag 7  source names   u32 length + UTF-8
//! tag 8  labels         u32 count + i64 * count
//! tag 9  encoded buffer u32 count + f32 * count
//! ```
//!
//! Absent scalar fields fall back to corpus defaults at decode time.

use crate::data::error::DataError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

const TAG_FILE_ID: u8 = 1;
const TAG_SAMPLE_RATE: u8 = 2;
const TAG_SAMPLE_IDX: u8 = 3;
const TAG_NUM_SAMPLES: u8 = 4;
const TAG_CHANNELS: u8 = 5;
const TAG_NUM_SOURCES: u8 = 6;
const TAG_SOURCE_NAMES: u8 = 7;
const TAG_LABELS: u8 = 8;
const TAG_ENCODED: u8 = 9;

/// Frames larger than this are treated as corruption rather than allocated.
const MAX_FRAME_BYTES: u64 = 1 << 30;

/// One example as stored on disk; every field may be absent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PackedExample {
    pub file_id: Option<i64>,
    pub sample_rate: Option<i64>,
    pub sample_idx: Option<i64>,
    pub num_samples: Option<i64>,
    pub channels: Option<i64>,
    pub num_sources: Option<i64>,
    pub source_names: Option<String>,
    pub labels: Option<Vec<i64>>,
    pub encoded: Option<Vec<f32>>,
}

impl PackedExample {
    /// Serialize to a frame payload. Fails only if a list is too long for
    /// its `u32` count.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DataError> {
        let encoded_len = self.encoded.as_ref().map_or(0, |v| v.len() * 4);
        let mut out = Vec::with_capacity(encoded_len + 128);
        self.write_fields(&mut out)
            .map_err(|e| DataError::malformed(format!("cannot encode example: {}", e)))?;
        Ok(out)
    }

    fn write_fields(&self, out: &mut Vec<u8>) -> io::Result<()> {
        let scalars = [
            (TAG_FILE_ID, self.file_id),
            (TAG_SAMPLE_RATE, self.sample_rate),
            (TAG_SAMPLE_IDX, self.sample_idx),
            (TAG_NUM_SAMPLES, self.num_samples),
            (TAG_CHANNELS, self.channels),
            (TAG_NUM_SOURCES, self.num_sources),
        ];
        for (tag, value) in scalars {
            if let Some(v) = value {
                out.write_u8(tag)?;
                out.write_i64::<LittleEndian>(v)?;
            }
        }

        if let Some(names) = &self.source_names {
            out.write_u8(TAG_SOURCE_NAMES)?;
            out.write_u32::<LittleEndian>(wire_count(names.len())?)?;
            out.write_all(names.as_bytes())?;
        }

        if let Some(labels) = &self.labels {
            out.write_u8(TAG_LABELS)?;
            out.write_u32::<LittleEndian>(wire_count(labels.len())?)?;
            for &label in labels {
                out.write_i64::<LittleEndian>(label)?;
            }
        }

        if let Some(encoded) = &self.encoded {
            out.write_u8(TAG_ENCODED)?;
            out.write_u32::<LittleEndian>(wire_count(encoded.len())?)?;
            for &sample in encoded {
                out.write_f32::<LittleEndian>(sample)?;
            }
        }
        Ok(())
    }

    /// Parse a frame payload. Unknown tags and truncated fields are errors;
    /// a repeated tag overwrites the earlier value.
    pub fn parse(payload: &[u8]) -> Result<Self, DataError> {
        let mut cursor = Cursor::new(payload);
        let mut example = PackedExample::default();

        while (cursor.position() as usize) < payload.len() {
            let tag = cursor
                .read_u8()
                .map_err(|_| DataError::malformed("truncated field tag"))?;
            match tag {
                TAG_FILE_ID => example.file_id = Some(read_i64(&mut cursor, "file id")?),
                TAG_SAMPLE_RATE => {
                    example.sample_rate = Some(read_i64(&mut cursor, "sample rate")?)
                }
                TAG_SAMPLE_IDX => {
                    example.sample_idx = Some(read_i64(&mut cursor, "sample index")?)
                }
                TAG_NUM_SAMPLES => {
                    example.num_samples = Some(read_i64(&mut cursor, "num samples")?)
                }
                TAG_CHANNELS => example.channels = Some(read_i64(&mut cursor, "channels")?),
                TAG_NUM_SOURCES => {
                    example.num_sources = Some(read_i64(&mut cursor, "num sources")?)
                }
                TAG_SOURCE_NAMES => {
                    let len = read_count(&mut cursor, 1, payload.len(), "source names")?;
                    let mut bytes = vec![0u8; len];
                    cursor
                        .read_exact(&mut bytes)
                        .map_err(|_| DataError::malformed("truncated source names"))?;
                    let names = String::from_utf8(bytes)
                        .map_err(|_| DataError::malformed("source names are not UTF-8"))?;
                    example.source_names = Some(names);
                }
                TAG_LABELS => {
                    let count = read_count(&mut cursor, 8, payload.len(), "labels")?;
                    let mut labels = vec![0i64; count];
                    cursor
                        .read_i64_into::<LittleEndian>(&mut labels)
                        .map_err(|_| DataError::malformed("truncated labels"))?;
                    example.labels = Some(labels);
                }
                TAG_ENCODED => {
                    let count = read_count(&mut cursor, 4, payload.len(), "encoded buffer")?;
                    let mut samples = vec![0f32; count];
                    cursor
                        .read_f32_into::<LittleEndian>(&mut samples)
                        .map_err(|_| DataError::malformed("truncated encoded buffer"))?;
                    example.encoded = Some(samples);
                }
                other => {
                    return Err(DataError::malformed(format!("unknown field tag {}", other)));
                }
            }
        }

        Ok(example)
    }
}

fn wire_count(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} elements do not fit a u32 count", len),
        )
    })
}

fn read_i64(cursor: &mut Cursor<&[u8]>, field: &str) -> Result<i64, DataError> {
    cursor
        .read_i64::<LittleEndian>()
        .map_err(|_| DataError::malformed(format!("truncated {}", field)))
}

/// Read an element count and reject it early if it cannot fit in the payload.
fn read_count(
    cursor: &mut Cursor<&[u8]>,
    elem_size: usize,
    payload_len: usize,
    field: &str,
) -> Result<usize, DataError> {
    let count = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| DataError::malformed(format!("truncated {} length", field)))?
        as usize;
    let remaining = payload_len.saturating_sub(cursor.position() as usize);
    if count.saturating_mul(elem_size) > remaining {
        return Err(DataError::malformed(format!(
            "{} declares {} elements but only {} bytes remain",
            field, count, remaining
        )));
    }
    Ok(count)
}

/// Appends framed records to a shard file.
pub struct ShardWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    records: usize,
}

impl ShardWriter {
    pub fn create(path: &Path) -> Result<Self, DataError> {
        let file = File::create(path).map_err(|source| DataError::ShardIo {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            records: 0,
        })
    }

    pub fn write_example(&mut self, example: &PackedExample) -> Result<(), DataError> {
        let payload = example.to_bytes()?;
        self.write_payload(&payload)
    }

    /// Write an arbitrary payload as one frame.
    pub fn write_payload(&mut self, payload: &[u8]) -> Result<(), DataError> {
        let result = self
            .writer
            .write_u64::<LittleEndian>(payload.len() as u64)
            .and_then(|_| self.writer.write_all(payload));
        result.map_err(|source| DataError::ShardIo {
            path: self.path.clone(),
            source,
        })?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn finish(mut self) -> Result<usize, DataError> {
        self.writer.flush().map_err(|source| DataError::ShardIo {
            path: self.path.clone(),
            source,
        })?;
        Ok(self.records)
    }
}

/// Sequential frame reader over one shard file.
pub struct ShardReader {
    path: PathBuf,
    reader: BufReader<File>,
}

impl ShardReader {
    pub fn open(path: &Path, buffer_bytes: usize) -> Result<Self, DataError> {
        let file = File::open(path).map_err(|source| DataError::ShardIo {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::with_capacity(buffer_bytes.max(4096), file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next frame payload, `None` at a clean end of file.
    pub fn next_payload(&mut self) -> Result<Option<Vec<u8>>, DataError> {
        let filled = self.reader.fill_buf().map(|buf| buf.is_empty());
        let at_eof = filled.map_err(|source| self.io_error(source))?;
        if at_eof {
            return Ok(None);
        }

        let len = match self.reader.read_u64::<LittleEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(DataError::TruncatedShard {
                    path: self.path.clone(),
                })
            }
            Err(source) => return Err(self.io_error(source)),
        };
        if len > MAX_FRAME_BYTES {
            return Err(self.io_error(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {} exceeds {} bytes", len, MAX_FRAME_BYTES),
            )));
        }

        let mut payload = vec![0u8; len as usize];
        match self.reader.read_exact(&mut payload) {
            Ok(()) => Ok(Some(payload)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(DataError::TruncatedShard {
                path: self.path.clone(),
            }),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn io_error(&self, source: io::Error) -> DataError {
        DataError::ShardIo {
            path: self.path.clone(),
            source,
        }
    }
}
