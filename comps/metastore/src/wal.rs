// SPDX-License-Identifier: MPL-2.0

//! Log record framing shared by the write-ahead log and the snapshot file.

use std::io::{self, Read, Write};

/// One logged mutation.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) enum Record {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Record kind tags. Values are arbitrary but fixed forever.
#[derive(PartialEq, Eq, Debug)]
#[repr(u8)]
enum RecordFlag {
    Put = 17,
    Delete = 29,
}

impl TryFrom<u8> for RecordFlag {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            17 => Ok(RecordFlag::Put),
            29 => Ok(RecordFlag::Delete),
            _ => Err(()),
        }
    }
}

/// Upper bound for a single key or value; a longer length field means the
/// log is corrupt (or we are reading a torn record).
const MAX_FIELD_LEN: u32 = 64 * 1024 * 1024;

impl Record {
    /// Appends the framed record to `out`.
    ///
    /// Layout: `flag u8 ∥ key_len u32-le ∥ value_len u32-le ∥ key ∥ value`.
    pub(crate) fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        match self {
            Record::Put { key, value } => {
                out.write_all(&[RecordFlag::Put as u8])?;
                out.write_all(&(key.len() as u32).to_le_bytes())?;
                out.write_all(&(value.len() as u32).to_le_bytes())?;
                out.write_all(key)?;
                out.write_all(value)?;
            }
            Record::Delete { key } => {
                out.write_all(&[RecordFlag::Delete as u8])?;
                out.write_all(&(key.len() as u32).to_le_bytes())?;
                out.write_all(&0u32.to_le_bytes())?;
                out.write_all(key)?;
            }
        }
        Ok(())
    }

    /// Reads the next record, or `None` at a clean end of log.
    ///
    /// A record that ends mid-way (torn tail after a crash) also yields
    /// `None`; replay simply stops there.
    pub(crate) fn read_from(input: &mut impl Read) -> io::Result<Option<Record>> {
        let mut flag = [0u8; 1];
        match input.read_exact(&mut flag) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }
        let Ok(flag) = RecordFlag::try_from(flag[0]) else {
            return Ok(None);
        };

        let mut lens = [0u8; 8];
        if read_or_torn(input, &mut lens)?.is_none() {
            return Ok(None);
        }
        let key_len = u32::from_le_bytes(lens[0..4].try_into().unwrap());
        let value_len = u32::from_le_bytes(lens[4..8].try_into().unwrap());
        if key_len > MAX_FIELD_LEN || value_len > MAX_FIELD_LEN {
            return Ok(None);
        }

        let mut key = vec![0u8; key_len as usize];
        if read_or_torn(input, &mut key)?.is_none() {
            return Ok(None);
        }
        match flag {
            RecordFlag::Put => {
                let mut value = vec![0u8; value_len as usize];
                if read_or_torn(input, &mut value)?.is_none() {
                    return Ok(None);
                }
                Ok(Some(Record::Put { key, value }))
            }
            RecordFlag::Delete => Ok(Some(Record::Delete { key })),
        }
    }
}

fn read_or_torn(input: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<()>> {
    match input.read_exact(buf) {
        Ok(()) => Ok(Some(())),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err),
    }
}
