/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Reader and writer for the ATZ container. The layout is fixed and
//! little-endian:
//!
//! ```text
//! offset 0:  4 bytes   magic "ATZ\x01"
//! offset 4:  8 bytes   u64 total container length (patched after writing)
//! offset 12: 8 bytes   u64 original file length
//! offset 20: 8 bytes   u64 recompressed-stream count N
//! offset 28: N stream descriptors:
//!     8  u64 offset in the original file
//!     8  u64 streamLength (compressed length in the original)
//!     8  u64 inflatedLength
//!     1  u8  level        1  u8  window       1  u8  memLevel
//!     8  u64 diffCount
//!     [if diffCount > 0]:
//!         8            i64 firstDiffByte
//!         8*diffCount  u64 diffOffsets[]
//!         1*diffCount  u8  diffValues[]
//!     inflatedLength bytes of raw inflated payload
//! then: residue (gaps and non-recompressed streams, verbatim, in order)
//! ```
//!
//! Descriptors carry no pointer to their successor; positions are derived by
//! accumulating sizes, so every length that feeds the accumulation is
//! validated against the container size before it is trusted.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::{
    atz_error::{err_exit_code, ExitCode, Result},
    diff_codec::apply_diff,
    process::AtzConfig,
    stream_info::ZlibStreamInfo,
    utils,
    zlib_codec::{deflate_with_params, inflate_exact, ZlibParams},
};

pub const ATZ_MAGIC: [u8; 4] = *b"ATZ\x01";

const ATZ_HEADER_SIZE: u64 = 28;

/// descriptor bytes before the optional diff block and payload
const DESCRIPTOR_FIXED_SIZE: u64 = 35;

/// Fixed container header, validated on every read.
#[derive(Debug, Copy, Clone)]
pub struct AtzHeader {
    pub container_size: u64,
    pub original_size: u64,
    pub stream_count: u64,
}

/// Serializes the processed stream list into an ATZ container. Streams
/// marked `recompress` are stored as descriptor + inflated payload; all
/// other bytes of the input go into the residue verbatim. Returns the
/// container size in bytes.
pub fn write_atz_file(
    input_path: &Path,
    atz_path: &Path,
    streams: &[ZlibStreamInfo],
    config: &AtzConfig,
) -> Result<u64> {
    let input_size = utils::file_size(input_path)?;
    let recomp_count = streams.iter().filter(|s| s.recompress).count() as u64;

    let mut out = BufWriter::new(File::create(atz_path)?);
    out.write_all(&ATZ_MAGIC)?;
    out.write_u64::<LittleEndian>(0)?; // total length, patched once everything is flushed
    out.write_u64::<LittleEndian>(input_size)?;
    out.write_u64::<LittleEndian>(recomp_count)?;

    for info in streams.iter().filter(|s| s.recompress) {
        write_stream_descriptor(&mut out, input_path, info)?;
    }

    // the residue: the gap in front of every stream, plus the raw bytes of
    // streams that are not being recompressed
    let mut last_end = 0u64;
    for info in streams {
        if last_end != info.offset {
            utils::copy_range(
                &mut out,
                input_path,
                last_end,
                info.offset - last_end,
                config.chunk_size,
            )?;
        }
        if !info.recompress {
            utils::copy_range(
                &mut out,
                input_path,
                info.offset,
                info.stream_length,
                config.chunk_size,
            )?;
        }
        last_end = info.offset + info.stream_length;
    }
    if last_end < input_size {
        utils::copy_range(
            &mut out,
            input_path,
            last_end,
            input_size - last_end,
            config.chunk_size,
        )?;
    }

    out.flush()?;
    let atz_size = out.stream_position()?;
    out.seek(SeekFrom::Start(4))?;
    out.write_u64::<LittleEndian>(atz_size)?;
    out.flush()?;

    log::info!("total bytes written: {}", atz_size);
    Ok(atz_size)
}

fn write_stream_descriptor(
    out: &mut impl Write,
    input_path: &Path,
    info: &ZlibStreamInfo,
) -> Result<()> {
    out.write_u64::<LittleEndian>(info.offset)?;
    out.write_u64::<LittleEndian>(info.stream_length)?;
    out.write_u64::<LittleEndian>(info.inflated_length)?;
    out.write_u8(info.params.level)?;
    out.write_u8(info.params.window)?;
    out.write_u8(info.params.mem_level)?;

    let diff_count = info.diff_offsets.len() as u64;
    out.write_u64::<LittleEndian>(diff_count)?;
    if diff_count > 0 {
        out.write_i64::<LittleEndian>(info.first_diff_byte)?;
        for &step in &info.diff_offsets {
            out.write_u64::<LittleEndian>(step)?;
        }
        out.write_all(&info.diff_values)?;
    }

    // the payload is inflated again right before writing rather than kept in
    // memory since the scan; a stream that validated earlier must still
    // decompress, anything else is an internal invariant violation
    let raw = utils::read_range(input_path, info.offset, info.stream_length)?;
    let payload = inflate_exact(&raw, info.inflated_length)?;
    out.write_all(&payload)?;
    Ok(())
}

/// Reads and validates the fixed container header. The stored total length
/// must agree with the actual file size on disk.
pub fn parse_atz_header(path: &Path) -> Result<AtzHeader> {
    let actual_size = utils::file_size(path)?;
    let mut f = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 4];
    f.read_exact(&mut magic)?;
    if magic != ATZ_MAGIC {
        return err_exit_code(ExitCode::InvalidAtzContainer, "ATZ1 header not found");
    }

    let container_size = f.read_u64::<LittleEndian>()?;
    if container_size != actual_size {
        return err_exit_code(
            ExitCode::InvalidAtzContainer,
            format!(
                "stored container length {} does not match file size {}",
                container_size, actual_size
            ),
        );
    }

    Ok(AtzHeader {
        container_size,
        original_size: f.read_u64::<LittleEndian>()?,
        stream_count: f.read_u64::<LittleEndian>()?,
    })
}

/// Reads all stream descriptors, deriving each payload position by
/// accumulation. Returns the records plus the offset where the residue
/// begins.
fn read_stream_descriptors(
    path: &Path,
    header: &AtzHeader,
) -> Result<(Vec<ZlibStreamInfo>, u64)> {
    let mut f = BufReader::new(File::open(path)?);
    f.seek(SeekFrom::Start(ATZ_HEADER_SIZE))?;

    let mut cursor = ATZ_HEADER_SIZE;
    let mut streams = Vec::new();

    for _ in 0..header.stream_count {
        let offset = f.read_u64::<LittleEndian>()?;
        let stream_length = f.read_u64::<LittleEndian>()?;
        let inflated_length = f.read_u64::<LittleEndian>()?;

        let mut info = ZlibStreamInfo::new(offset, -1, stream_length, inflated_length);
        info.params = ZlibParams::new(f.read_u8()?, f.read_u8()?, f.read_u8()?);

        let diff_count = f.read_u64::<LittleEndian>()?;
        let diff_block = if diff_count > 0 {
            diff_count
                .checked_mul(9)
                .and_then(|v| v.checked_add(8))
                .ok_or_else(|| ExitCode::InvalidAtzContainer.error("diff count overflows"))?
        } else {
            0
        };

        let payload_offset = cursor
            .checked_add(DESCRIPTOR_FIXED_SIZE)
            .and_then(|v| v.checked_add(diff_block))
            .filter(|v| *v <= header.container_size)
            .ok_or_else(|| {
                ExitCode::InvalidAtzContainer.error("descriptor extends past the container")
            })?;

        if diff_count > 0 {
            info.first_diff_byte = f.read_i64::<LittleEndian>()?;
            info.diff_offsets.reserve_exact(diff_count as usize);
            for _ in 0..diff_count {
                info.diff_offsets.push(f.read_u64::<LittleEndian>()?);
            }
            info.diff_values = vec![0u8; diff_count as usize];
            f.read_exact(&mut info.diff_values)?;
        }

        info.payload_offset = payload_offset;
        cursor = payload_offset
            .checked_add(inflated_length)
            .filter(|v| *v <= header.container_size)
            .ok_or_else(|| {
                ExitCode::InvalidAtzContainer.error("payload extends past the container")
            })?;
        f.seek_relative(inflated_length as i64)?;

        streams.push(info);
    }

    Ok((streams, cursor))
}

/// Recreates the original file from an ATZ container: every descriptor's
/// payload is recompressed with its stored parameters, patched with its
/// diff, and interleaved with the residue in ascending offset order.
pub fn reconstruct_atz_file(
    atz_path: &Path,
    output_path: &Path,
    config: &AtzConfig,
) -> Result<()> {
    let header = parse_atz_header(atz_path)?;
    log::info!(
        "reconstructing {} bytes from a {} byte container",
        header.original_size,
        header.container_size
    );

    if header.stream_count == 0 {
        // nothing was recompressed, the residue is the whole file
        let mut out = BufWriter::new(File::create(output_path)?);
        utils::copy_range(
            &mut out,
            atz_path,
            ATZ_HEADER_SIZE,
            header.original_size,
            config.chunk_size,
        )?;
        out.flush()?;
        return Ok(());
    }

    let (streams, residue_offset) = read_stream_descriptors(atz_path, &header)?;

    let mut out = BufWriter::new(File::create(output_path)?);
    let mut gap_sum = 0u64;
    let mut last_end = 0u64;

    for (index, info) in streams.iter().enumerate() {
        let stream_end = info.offset.checked_add(info.stream_length);
        if info.offset < last_end || stream_end.map_or(true, |end| end > header.original_size) {
            return err_exit_code(
                ExitCode::InvalidAtzContainer,
                format!("stream descriptor #{} is out of order or out of range", index),
            );
        }
        if last_end != info.offset {
            let gap = info.offset - last_end;
            log::debug!("gap of {} bytes before stream #{}", gap, index);
            utils::copy_range(
                &mut out,
                atz_path,
                residue_offset + gap_sum,
                gap,
                config.chunk_size,
            )?;
            gap_sum += gap;
        }

        let payload = utils::read_range(atz_path, info.payload_offset, info.inflated_length)?;
        let mut recomp = deflate_with_params(&payload, info.params)?;
        if info.first_diff_byte >= 0 {
            // every diff position must land inside the stream, otherwise the
            // descriptor is corrupt
            let mut pos = Some(info.first_diff_byte as u64);
            for &step in &info.diff_offsets {
                pos = pos
                    .and_then(|p| p.checked_add(step))
                    .filter(|p| *p < info.stream_length);
            }
            if pos.is_none() {
                return err_exit_code(
                    ExitCode::InvalidAtzContainer,
                    format!("stream #{} has diff offsets outside the stream", index),
                );
            }
            log::debug!(
                "modifying {} bytes of stream #{}",
                info.diff_offsets.len(),
                index
            );
            apply_diff(
                &mut recomp,
                info.first_diff_byte as u64,
                &info.diff_offsets,
                &info.diff_values,
            );
        }
        if (recomp.len() as u64) < info.stream_length {
            return err_exit_code(
                ExitCode::InvalidAtzContainer,
                format!("stream #{} recompressed shorter than its descriptor claims", index),
            );
        }
        out.write_all(&recomp[..info.stream_length as usize])?;
        last_end = info.offset + info.stream_length;
    }

    if last_end < header.original_size {
        utils::copy_range(
            &mut out,
            atz_path,
            residue_offset + gap_sum,
            header.original_size - last_end,
            config.chunk_size,
        )?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
use crate::utils::write_file;

#[test]
fn rejects_bad_magic() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("not.atz");
    write_file(&p, b"BTZ\x01aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");

    let e = parse_atz_header(&p).unwrap_err();
    assert_eq!(e.exit_code(), ExitCode::InvalidAtzContainer);
}

#[test]
fn rejects_length_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("short.atz");

    let mut data = Vec::new();
    data.extend_from_slice(&ATZ_MAGIC);
    data.extend_from_slice(&999u64.to_le_bytes());
    data.extend_from_slice(&0u64.to_le_bytes());
    data.extend_from_slice(&0u64.to_le_bytes());
    write_file(&p, &data);

    let e = parse_atz_header(&p).unwrap_err();
    assert_eq!(e.exit_code(), ExitCode::InvalidAtzContainer);
}

#[test]
fn zero_stream_container_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.bin");
    let atz = dir.path().join("input.atz");
    let rec = dir.path().join("input.rec");

    let data = b"no zlib streams in here at all".to_vec();
    write_file(&input, &data);

    let config = AtzConfig::default();
    let size = write_atz_file(&input, &atz, &[], &config).unwrap();
    assert_eq!(size, ATZ_HEADER_SIZE + data.len() as u64);

    let header = parse_atz_header(&atz).unwrap();
    assert_eq!(header.original_size, data.len() as u64);
    assert_eq!(header.stream_count, 0);

    reconstruct_atz_file(&atz, &rec, &config).unwrap();
    assert_eq!(std::fs::read(&rec).unwrap(), data);
}

#[test]
fn descriptor_roundtrip_perfect_match() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.bin");
    let atz = dir.path().join("input.atz");
    let rec = dir.path().join("input.rec");

    let payload: Vec<u8> = b"pack my box with five dozen liquor jugs. "
        .iter()
        .cycle()
        .take(700)
        .copied()
        .collect();
    let stream = deflate_with_params(&payload, ZlibParams::new(6, 15, 8)).unwrap();

    let mut data = vec![0xabu8; 40];
    data.extend_from_slice(&stream);
    data.extend_from_slice(&[0xcdu8; 25]);
    write_file(&input, &data);

    let mut info = ZlibStreamInfo::new(40, 22, stream.len() as u64, payload.len() as u64);
    info.params = ZlibParams::new(6, 15, 8);
    info.ident_bytes = info.stream_length;
    info.recompress = true;

    let config = AtzConfig::default();
    write_atz_file(&input, &atz, &[info], &config).unwrap();

    // compressed bytes are never stored for a recompressed stream
    let expected =
        ATZ_HEADER_SIZE + DESCRIPTOR_FIXED_SIZE + payload.len() as u64 + 40 + 25;
    assert_eq!(utils::file_size(&atz).unwrap(), expected);

    let header = parse_atz_header(&atz).unwrap();
    let (read_back, residue_offset) = read_stream_descriptors(&atz, &header).unwrap();
    assert_eq!(read_back.len(), 1);
    assert_eq!(read_back[0].offset, 40);
    assert_eq!(read_back[0].offset_type, -1);
    assert_eq!(read_back[0].stream_length, stream.len() as u64);
    assert_eq!(read_back[0].params, ZlibParams::new(6, 15, 8));
    assert_eq!(read_back[0].first_diff_byte, -1);
    assert_eq!(
        residue_offset,
        ATZ_HEADER_SIZE + DESCRIPTOR_FIXED_SIZE + payload.len() as u64
    );

    reconstruct_atz_file(&atz, &rec, &config).unwrap();
    assert_eq!(std::fs::read(&rec).unwrap(), data);
}

#[test]
fn descriptor_roundtrip_with_diff() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.bin");
    let atz = dir.path().join("input.atz");
    let rec = dir.path().join("input.rec");

    let payload: Vec<u8> = b"jackdaws love my big sphinx of quartz. "
        .iter()
        .cycle()
        .take(900)
        .copied()
        .collect();
    let mut stream = deflate_with_params(&payload, ZlibParams::new(9, 15, 8)).unwrap();
    // forge the header so the stored bytes differ from the recompression in
    // exactly one position
    assert_eq!(stream[1], 0xda);
    stream[1] = 0x01;

    let mut data = vec![0x10u8; 12];
    data.extend_from_slice(&stream);
    write_file(&input, &data);

    let mut info = ZlibStreamInfo::new(12, 20, stream.len() as u64, payload.len() as u64);
    info.params = ZlibParams::new(9, 15, 8);
    info.ident_bytes = info.stream_length - 1;
    info.first_diff_byte = 1;
    info.diff_offsets = vec![0];
    info.diff_values = vec![0x01];
    info.recompress = true;

    let config = AtzConfig::default();
    write_atz_file(&input, &atz, &[info], &config).unwrap();

    let header = parse_atz_header(&atz).unwrap();
    let (read_back, _) = read_stream_descriptors(&atz, &header).unwrap();
    assert_eq!(read_back[0].first_diff_byte, 1);
    assert_eq!(read_back[0].diff_offsets, vec![0]);
    assert_eq!(read_back[0].diff_values, vec![0x01]);

    reconstruct_atz_file(&atz, &rec, &config).unwrap();
    assert_eq!(std::fs::read(&rec).unwrap(), data);
}

#[test]
fn corrupt_diff_count_is_a_format_error() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.bin");
    let atz = dir.path().join("input.atz");
    let rec = dir.path().join("input.rec");

    let payload: Vec<u8> = (0..64u8).cycle().take(600).collect();
    let stream = deflate_with_params(&payload, ZlibParams::new(6, 15, 8)).unwrap();
    let mut data = vec![0u8; 8];
    data.extend_from_slice(&stream);
    write_file(&input, &data);

    let mut info = ZlibStreamInfo::new(8, 22, stream.len() as u64, payload.len() as u64);
    info.ident_bytes = info.stream_length;
    info.params = ZlibParams::new(6, 15, 8);
    info.recompress = true;
    let config = AtzConfig::default();
    write_atz_file(&input, &atz, &[info], &config).unwrap();

    // smash the diffCount field of the first descriptor (offset 28 + 27)
    let mut raw = std::fs::read(&atz).unwrap();
    raw[28 + 27..28 + 35].copy_from_slice(&u64::MAX.to_le_bytes());
    write_file(&atz, &raw);

    let e = reconstruct_atz_file(&atz, &rec, &config).unwrap_err();
    assert_eq!(e.exit_code(), ExitCode::InvalidAtzContainer);
}
