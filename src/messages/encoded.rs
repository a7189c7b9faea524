// SPDX-License-Identifier: Apache-2.0 OR MIT
//! RFC 4601-style encoded address blocks, IPv4 native encoding only.

use std::net::Ipv4Addr;

use bytes::BufMut;

use crate::DecodeError;

use super::Cursor;

/// Address family number for IPv4
pub const FAMILY_IPV4: u8 = 1;

/// Native encoding type
pub const ENCODING_NATIVE: u8 = 0;

/// Encoded-Unicast block length
pub const UNICAST_SIZE: usize = 6;

/// Encoded-Group block length
pub const GROUP_SIZE: usize = 8;

/// Encoded-Source block length
pub const SOURCE_SIZE: usize = 8;

fn check_family(family: u8, encoding: u8) -> Result<(), DecodeError> {
    if family != FAMILY_IPV4 || encoding != ENCODING_NATIVE {
        return Err(DecodeError::UnsupportedEncoding { family, encoding });
    }
    Ok(())
}

/// Append an Encoded-Unicast block: family, encoding, 4-byte address
pub fn put_unicast(buf: &mut Vec<u8>, address: Ipv4Addr) {
    buf.put_u8(FAMILY_IPV4);
    buf.put_u8(ENCODING_NATIVE);
    buf.put_slice(&address.octets());
}

/// Read an Encoded-Unicast block
pub fn read_unicast(cursor: &mut Cursor<'_>) -> Result<Ipv4Addr, DecodeError> {
    let family = cursor.read_u8()?;
    let encoding = cursor.read_u8()?;
    check_family(family, encoding)?;
    cursor.read_ipv4()
}

/// Append an Encoded-Group block: family, encoding, reserved, mask length,
/// 4-byte address
pub fn put_group(buf: &mut Vec<u8>, address: Ipv4Addr, mask_len: u8) {
    buf.put_u8(FAMILY_IPV4);
    buf.put_u8(ENCODING_NATIVE);
    buf.put_u8(0); // B bit and reserved
    buf.put_u8(mask_len);
    buf.put_slice(&address.octets());
}

/// Read an Encoded-Group block, returning the address and mask length
pub fn read_group(cursor: &mut Cursor<'_>) -> Result<(Ipv4Addr, u8), DecodeError> {
    let family = cursor.read_u8()?;
    let encoding = cursor.read_u8()?;
    check_family(family, encoding)?;
    cursor.read_u8()?; // B bit and reserved
    let mask_len = cursor.read_u8()?;
    let address = cursor.read_ipv4()?;
    Ok((address, mask_len))
}

/// Append an Encoded-Source block: family, encoding, flags, mask length,
/// 4-byte address. Dense mode never sets the S/W/R flags.
pub fn put_source(buf: &mut Vec<u8>, address: Ipv4Addr, mask_len: u8) {
    buf.put_u8(FAMILY_IPV4);
    buf.put_u8(ENCODING_NATIVE);
    buf.put_u8(0); // S/W/R flags
    buf.put_u8(mask_len);
    buf.put_slice(&address.octets());
}

/// Read an Encoded-Source block, returning the address and mask length.
/// The S/W/R flags are sparse-mode only and are ignored.
pub fn read_source(cursor: &mut Cursor<'_>) -> Result<(Ipv4Addr, u8), DecodeError> {
    let family = cursor.read_u8()?;
    let encoding = cursor.read_u8()?;
    check_family(family, encoding)?;
    cursor.read_u8()?; // S/W/R flags
    let mask_len = cursor.read_u8()?;
    let address = cursor.read_ipv4()?;
    Ok((address, mask_len))
}
