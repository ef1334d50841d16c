//! LZNT1 decompression.
//!
//! NTFS compresses streams one compression unit at a time with LZNT1
//! (MS-XCA 2.5). A unit is a sequence of blocks; each block is either a
//! literal copy or LZ77-style phrases whose offset/length split depends on
//! how much of the block has been produced so far.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{NtfsError, Result};

const COMPRESSED_MASK: u16 = 1 << 15;
const SIZE_MASK: u16 = (1 << 12) - 1;

/// Hard cap on a single unit's decompressed size. A compression unit is at
/// most 16 clusters (64 KiB on common volumes), so anything approaching
/// this is corrupt input.
const MAX_DECOMPRESSED_SIZE: usize = 16 * 1024 * 1024;

/// Number of extra offset bits claimed by the phrase encoding for the
/// current output position.
fn displacement(mut offset: u16) -> u32 {
    let mut result = 0;
    while offset >= 0x10 {
        offset >>= 1;
        result += 1;
    }
    result
}

/// Decompress one compression unit's raw bytes.
pub fn lznt1_decompress(input: &[u8]) -> Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::with_capacity(input.len() * 2);
    let mut i = 0usize;

    loop {
        if input.len() < i + 2 {
            break;
        }
        let chunk_start = out.len();
        let block_offset = i;

        let block_header = LittleEndian::read_u16(&input[i..]);
        i += 2;

        let size = (block_header & SIZE_MASK) as usize;
        let block_end = block_offset + size + 3;
        if size == 0 {
            break;
        }

        if input.len() < i + size {
            return Err(NtfsError::InvalidCompressed(format!(
                "block of size {} exceeds input ({} bytes left)",
                size,
                input.len() - i
            )));
        }

        if block_header & COMPRESSED_MASK != 0 {
            while i < block_end {
                let mut tag = input[i];
                i += 1;

                let mut mask_idx = 0;
                while mask_idx < 8 && i < block_end {
                    if tag & 1 == 0 {
                        // Literal byte.
                        out.push(input[i]);
                        i += 1;
                    } else {
                        if input.len() < i + 2 {
                            return Err(NtfsError::InvalidCompressed(
                                "truncated phrase".into(),
                            ));
                        }
                        let phrase = LittleEndian::read_u16(&input[i..]);
                        i += 2;

                        let disp =
                            displacement(((out.len() - chunk_start) as u16).wrapping_sub(1));
                        let symbol_offset = (phrase >> (12 - disp)) as usize + 1;
                        let symbol_length = (phrase & (0xFFF >> disp)) as usize + 2;

                        if symbol_offset > out.len() {
                            return Err(NtfsError::InvalidCompressed(format!(
                                "back-reference {} exceeds {} output bytes",
                                symbol_offset,
                                out.len()
                            )));
                        }
                        let start = out.len() - symbol_offset;
                        // The copy may overlap its own output (run-length
                        // encoding), so go byte by byte.
                        for j in 0..symbol_length + 1 {
                            let b = out[start + j];
                            out.push(b);
                        }
                    }
                    if out.len() > MAX_DECOMPRESSED_SIZE {
                        return Err(NtfsError::InvalidCompressed("output too large".into()));
                    }
                    tag >>= 1;
                    mask_idx += 1;
                }
            }
        } else {
            // Uncompressed block: size+1 literal bytes.
            out.extend_from_slice(&input[i..i + size + 1]);
            i += size + 1;
        }

        if out.len() > MAX_DECOMPRESSED_SIZE {
            return Err(NtfsError::InvalidCompressed("output too large".into()));
        }
    }

    Ok(out)
}
