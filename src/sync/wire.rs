//! # Sync Wire Format
//!
//! One master→replica response stream per sync request:
//!
//! ```text
//! Header:  i64 last_refresh_time, i64 page_size_bytes, i32 page_count_estimate
//! Body:    repeated blocks
//!            i32 pages_in_block            // 0 terminates the stream
//!            per page:
//!              i32 master_page_index
//!              i64 page_version
//!              [page_size_bytes] raw page content
//!              [slots/8] used-slot bitset  // one bit per slot, LSB first
//! ```
//!
//! Page payloads are raw host-order record bytes, so the protocol is
//! inherently same-endianness between master and replica; the framing
//! integers follow host order for the same reason. The header is read and
//! written as a `zerocopy` transmutation straight from the byte stream.
//!
//! Decode failures surface as `eyre` errors with stream context; the
//! uplink treats them as transient, per-type sync failures.

use std::io::{Read, Write};

use eyre::{Result, WrapErr};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct SyncHeader {
    pub last_refresh_time: i64,
    pub page_size_bytes: i64,
    pub page_count_estimate: i32,
}

pub fn write_header(out: &mut dyn Write, header: &SyncHeader) -> Result<()> {
    out.write_all(header.as_bytes())
        .wrap_err("failed to write sync stream header")
}

pub fn read_header(reader: &mut dyn Read) -> Result<SyncHeader> {
    let mut buf = [0u8; std::mem::size_of::<SyncHeader>()];
    reader
        .read_exact(&mut buf)
        .wrap_err("sync stream ended before the header")?;
    SyncHeader::read_from_bytes(&buf)
        .map_err(|_| eyre::eyre!("sync stream header failed to decode"))
}

pub fn write_i32(out: &mut dyn Write, value: i32) -> Result<()> {
    out.write_all(&value.to_ne_bytes())
        .wrap_err("failed to write i32 to sync stream")
}

pub fn read_i32(reader: &mut dyn Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .wrap_err("sync stream ended inside an i32")?;
    Ok(i32::from_ne_bytes(buf))
}

pub fn write_i64(out: &mut dyn Write, value: i64) -> Result<()> {
    out.write_all(&value.to_ne_bytes())
        .wrap_err("failed to write i64 to sync stream")
}

pub fn read_i64(reader: &mut dyn Read) -> Result<i64> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .wrap_err("sync stream ended inside an i64")?;
    Ok(i64::from_ne_bytes(buf))
}
