//! Checkpoint file for blocked and blacklisted IPs.
//!
//! # Format
//! ```text
//! record*  0xFF
//! record = [u8 address length: 4 or 16][address bytes][u8 standing][u64 BE ms]
//! ```
//!
//! Only non-OK standings are written. Bytes after the end marker are ignored.

use std::fs::{self, File};
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::standing::IpStanding;

pub const CHECKPOINT_FILE_NAME: &str = "ip_request_monitor.dat";

const END_MARKER: u8 = 0xFF;
const TIMESTAMP_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("checkpoint ends before its end marker")]
    Truncated,
    #[error("invalid address length {0} in checkpoint")]
    InvalidAddressLength(u8),
    #[error("invalid standing code {0} in checkpoint")]
    InvalidStanding(u8),
}

/// One persisted IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub ip: IpAddr,
    pub standing: IpStanding,
    pub standing_updated_at: u64,
}

pub fn checkpoint_path(dir: &Path) -> PathBuf {
    dir.join(CHECKPOINT_FILE_NAME)
}

pub fn encode(records: &[CheckpointRecord]) -> Bytes {
    let mut buf = BytesMut::with_capacity(records.len() * (2 + 16 + TIMESTAMP_LEN) + 1);
    for record in records {
        match record.ip {
            IpAddr::V4(ip) => {
                buf.put_u8(4);
                buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(16);
                buf.put_slice(&ip.octets());
            }
        }
        buf.put_u8(record.standing.code());
        buf.put_u64(record.standing_updated_at);
    }
    buf.put_u8(END_MARKER);
    buf.freeze()
}

pub fn decode(mut data: &[u8]) -> Result<Vec<CheckpointRecord>, CheckpointError> {
    let mut records = Vec::new();
    loop {
        if !data.has_remaining() {
            return Err(CheckpointError::Truncated);
        }
        let ip = match data.get_u8() {
            END_MARKER => return Ok(records),
            4 => {
                let mut octets = [0u8; 4];
                take(&mut data, &mut octets)?;
                IpAddr::from(octets)
            }
            16 => {
                let mut octets = [0u8; 16];
                take(&mut data, &mut octets)?;
                IpAddr::from(octets)
            }
            other => return Err(CheckpointError::InvalidAddressLength(other)),
        };

        if data.remaining() < 1 + TIMESTAMP_LEN {
            return Err(CheckpointError::Truncated);
        }
        let code = data.get_u8();
        let standing = IpStanding::try_from(code).map_err(CheckpointError::InvalidStanding)?;
        let standing_updated_at = data.get_u64();

        records.push(CheckpointRecord {
            ip,
            standing,
            standing_updated_at,
        });
    }
}

fn take(data: &mut &[u8], out: &mut [u8]) -> Result<(), CheckpointError> {
    if data.remaining() < out.len() {
        return Err(CheckpointError::Truncated);
    }
    data.copy_to_slice(out);
    Ok(())
}

/// Write the checkpoint into `dir`, replacing any previous one atomically.
pub fn write_file(dir: &Path, records: &[CheckpointRecord]) -> Result<PathBuf, CheckpointError> {
    let path = checkpoint_path(dir);
    let tmp_path = path.with_extension("dat.tmp");

    let mut file = File::create(&tmp_path)?;
    file.write_all(&encode(records))?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, &path)?;

    Ok(path)
}

pub fn read_file(dir: &Path) -> Result<Vec<CheckpointRecord>, CheckpointError> {
    let data = fs::read(checkpoint_path(dir))?;
    decode(&data)
}
