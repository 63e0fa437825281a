/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Scans a file for zlib streams in a single chunked pass. Every two-byte
//! window is tested against the table of valid zlib headers, and each hit is
//! immediately verified by actually decompressing it; only streams that
//! terminate cleanly are reported. A one byte carry between chunks keeps
//! headers straddling a chunk boundary from being missed, and a stream whose
//! tail lies in a later chunk is continued across the boundary instead of
//! being rescanned.

use std::{fs::File, path::Path};

use crate::{
    atz_error::Result,
    process::AtzConfig,
    stream_info::ZlibStreamInfo,
    utils::read_fill,
    zlib_codec::{InflateStatus, ZlibInflator},
};

/// A zlib stream has the following structure: (http://tools.ietf.org/html/rfc1950)
///  +---+---+   CMF: bits 0 to 3  CM      Compression method (8 = deflate)
///  |CMF|FLG|        bits 4 to 7  CINFO   Compression info (base-2 logarithm of the LZ77 window size minus 8)
///  +---+---+
///              FLG: bits 0 to 4  FCHECK  Check bits for CMF and FLG (in MSB order (CMF*256 + FLG) is a multiple of 31)
///                   bit  5       FDICT   Preset dictionary
///                   bits 6 to 7  FLEVEL  Compression level (0 = fastest, 1 = fast, 2 = default, 3 = maximum)
///
/// With CM fixed to deflate, FDICT clear and the check bits valid, exactly 24
/// byte pairs remain. The index in this table is the offset type: the window
/// hint is `10 + type/4` and the level hint `type % 4`.
pub const ZLIB_HEADERS: [u16; 24] = [
    0x2815, 0x2853, 0x2891, 0x28cf, 0x3811, 0x384f, 0x388d, 0x38cb, 0x480d, 0x484b, 0x4889,
    0x48c7, 0x5809, 0x5847, 0x5885, 0x58c3, 0x6805, 0x6843, 0x6881, 0x68de, 0x7801, 0x785e,
    0x789c, 0x78da,
];

/// Classifies a two-byte big-endian value as one of the 24 valid zlib
/// headers, or None for everything else.
pub fn parse_offset_type(header: u16) -> Option<i32> {
    match header {
        0x2815 => Some(0),
        0x2853 => Some(1),
        0x2891 => Some(2),
        0x28cf => Some(3),
        0x3811 => Some(4),
        0x384f => Some(5),
        0x388d => Some(6),
        0x38cb => Some(7),
        0x480d => Some(8),
        0x484b => Some(9),
        0x4889 => Some(10),
        0x48c7 => Some(11),
        0x5809 => Some(12),
        0x5847 => Some(13),
        0x5885 => Some(14),
        0x58c3 => Some(15),
        0x6805 => Some(16),
        0x6843 => Some(17),
        0x6881 => Some(18),
        0x68de => Some(19),
        0x7801 => Some(20),
        0x785e => Some(21),
        0x789c => Some(22),
        0x78da => Some(23),
        _ => None,
    }
}

/// Streams shorter than this are treated as false positives; nothing useful
/// fits in fewer bytes than a header, an empty stored block and the adler32.
const MIN_STREAM_LENGTH: u64 = 16;

struct PendingStream {
    offset: u64,
    offset_type: i32,
}

/// Incremental scanner+validator. Feed it the file chunk by chunk; for every
/// chunk after the first, byte 0 must repeat the last byte of the previous
/// chunk so headers on the boundary are seen.
pub struct ZlibStreamSearcher {
    inflator: ZlibInflator,
    scratch: Vec<u8>,

    /// file offset of the current chunk's first byte
    chunk_offset: u64,

    /// candidate that ran out of input and continues in the next chunk
    pending: Option<PendingStream>,
}

impl ZlibStreamSearcher {
    pub fn new(scratch_size: usize) -> Result<ZlibStreamSearcher> {
        Ok(ZlibStreamSearcher {
            inflator: ZlibInflator::new()?,
            scratch: vec![0u8; scratch_size.max(1)],
            chunk_offset: 0,
            pending: None,
        })
    }

    /// Scans one chunk, appending every confirmed stream to `streams`. A
    /// candidate still in flight at the end of the chunk is kept pending;
    /// one still pending at end-of-file is simply dropped (a stream that
    /// never terminates is not a stream).
    pub fn scan_chunk(
        &mut self,
        chunk: &[u8],
        streams: &mut Vec<ZlibStreamInfo>,
    ) -> Result<()> {
        let mut i = 0usize;

        if let Some(pending) = self.pending.take() {
            // chunk[0] repeats the carry byte, which the stream in progress
            // already consumed at the end of the previous chunk
            let fresh = &chunk[1.min(chunk.len())..];
            let mut status = self.inflator.refill(fresh, &mut self.scratch)?;
            while status == InflateStatus::NeedsOutput {
                status = self.inflator.resume(fresh, &mut self.scratch)?;
            }
            match status {
                InflateStatus::Finished => {
                    if self.inflator.total_in() >= MIN_STREAM_LENGTH {
                        streams.push(ZlibStreamInfo::new(
                            pending.offset,
                            pending.offset_type,
                            self.inflator.total_in(),
                            self.inflator.total_out(),
                        ));
                        i = 1 + self.inflator.feed_consumed();
                    }
                    // a too-short stream rejects the candidate; rescan the
                    // whole chunk since nothing confirmed covers it
                }
                InflateStatus::NeedsInput => {
                    self.pending = Some(pending);
                    self.chunk_offset += chunk.len().saturating_sub(1) as u64;
                    return Ok(());
                }
                InflateStatus::BadData => {
                    // candidate failed mid-stream; everything between its
                    // header and this chunk is gone, resume scanning here
                }
                InflateStatus::NeedsOutput => unreachable!(),
            }
        }

        let limit = chunk.len().saturating_sub(1);
        while i < limit {
            let header = u16::from_be_bytes([chunk[i], chunk[i + 1]]);
            if let Some(offset_type) = parse_offset_type(header) {
                let absolute = self.chunk_offset + i as u64;
                log::debug!(
                    "zlib header {:#06x} with {}K window at offset {}",
                    header,
                    1u32 << ((header >> 12) - 2),
                    absolute
                );

                let mut status = self.inflator.begin(&chunk[i..], &mut self.scratch)?;
                while status == InflateStatus::NeedsOutput {
                    status = self.inflator.resume(&chunk[i..], &mut self.scratch)?;
                }
                match status {
                    InflateStatus::Finished
                        if self.inflator.total_in() >= MIN_STREAM_LENGTH =>
                    {
                        streams.push(ZlibStreamInfo::new(
                            absolute,
                            offset_type,
                            self.inflator.total_in(),
                            self.inflator.total_out(),
                        ));
                        // skip the confirmed stream; headers inside it
                        // cannot start an independent stream
                        i += self.inflator.total_in() as usize;
                        continue;
                    }
                    InflateStatus::Finished | InflateStatus::BadData => {
                        // false positive, keep scanning at the next byte
                    }
                    InflateStatus::NeedsInput => {
                        self.pending = Some(PendingStream {
                            offset: absolute,
                            offset_type,
                        });
                        self.chunk_offset += limit as u64;
                        return Ok(());
                    }
                    InflateStatus::NeedsOutput => unreachable!(),
                }
            }
            i += 1;
        }

        self.chunk_offset += limit as u64;
        Ok(())
    }
}

/// Result of scanning a whole file.
pub struct ScanResult {
    pub streams: Vec<ZlibStreamInfo>,
    pub input_size: u64,
    pub input_crc32: u32,
}

/// Scans a file for zlib streams using chunked reads with a one byte carry
/// between chunks. Also measures the file and its crc32 along the way, since
/// the scan touches every byte anyway.
pub fn search_file(path: &Path, config: &AtzConfig) -> Result<ScanResult> {
    let chunk_size = config.chunk_size.max(2) as usize;
    let mut f = File::open(path)?;
    let mut buffer = vec![0u8; chunk_size];
    let mut searcher = ZlibStreamSearcher::new(chunk_size)?;
    let mut hasher = crc32fast::Hasher::new();

    let mut streams = Vec::new();
    let mut input_size = 0u64;

    let filled = read_fill(&mut f, &mut buffer)?;
    if filled > 0 {
        hasher.update(&buffer[..filled]);
        input_size += filled as u64;
        searcher.scan_chunk(&buffer[..filled], &mut streams)?;
        let mut carry = buffer[filled - 1];

        loop {
            buffer[0] = carry;
            let fresh = read_fill(&mut f, &mut buffer[1..])?;
            if fresh == 0 {
                break;
            }
            hasher.update(&buffer[1..1 + fresh]);
            input_size += fresh as u64;
            searcher.scan_chunk(&buffer[..1 + fresh], &mut streams)?;
            carry = buffer[fresh];
        }
    }

    log::info!("valid zlib streams: {}", streams.len());
    Ok(ScanResult {
        streams,
        input_size,
        input_crc32: hasher.finalize(),
    })
}

#[cfg(test)]
use crate::zlib_codec::{deflate_with_params, ZlibParams};

#[test]
fn header_classification_totality() {
    for (expected_type, &header) in ZLIB_HEADERS.iter().enumerate() {
        let offset_type = parse_offset_type(header).unwrap();
        assert_eq!(offset_type, expected_type as i32);

        // the inverse mapping must reproduce the literal header fields
        let window_hint = 10 + offset_type / 4;
        let level_hint = offset_type % 4;
        assert_eq!(window_hint, ((header >> 12) + 8) as i32, "CINFO of {:#06x}", header);
        assert_eq!(level_hint, ((header >> 6) & 3) as i32, "FLEVEL of {:#06x}", header);

        // table entries really are valid zlib headers
        assert_eq!(header % 31, 0);
        assert_eq!(header & 0x20, 0, "FDICT must be clear");
    }

    for bad in [0x0000u16, 0x789d, 0x78db, 0x2816, 0x8815, 0x790c] {
        assert_eq!(parse_offset_type(bad), None);
    }
}

#[cfg(test)]
fn scan_buffer(buffer: &[u8]) -> Vec<ZlibStreamInfo> {
    let mut searcher = ZlibStreamSearcher::new(1 << 16).unwrap();
    let mut streams = Vec::new();
    searcher.scan_chunk(buffer, &mut streams).unwrap();
    streams
}

#[cfg(test)]
fn test_payload(len: usize) -> Vec<u8> {
    b"what is hatched here dies as an egg elsewhere. "
        .iter()
        .cycle()
        .take(len)
        .copied()
        .collect()
}

#[test]
fn finds_embedded_stream() {
    let payload = test_payload(400);
    let stream = deflate_with_params(&payload, ZlibParams::new(6, 15, 8)).unwrap();

    let mut file = vec![0x11u8; 30];
    file.extend_from_slice(&stream);
    file.extend_from_slice(&[0x22u8; 50]);

    let found = scan_buffer(&file);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].offset, 30);
    assert_eq!(found[0].offset_type, 22);
    assert_eq!(found[0].stream_length, stream.len() as u64);
    assert_eq!(found[0].inflated_length, payload.len() as u64);
}

#[test]
fn rejects_header_followed_by_garbage() {
    let mut file = vec![0u8; 20];
    file.extend_from_slice(&[0x78, 0x9c]);
    file.extend((0u32..300).map(|i| (i.wrapping_mul(0x9e3779b9) >> 11) as u8));

    assert!(scan_buffer(&file).is_empty());
}

#[test]
fn rejects_trivially_short_stream() {
    // a valid but tiny stream (empty payload) is under the 16 byte floor
    let stream = deflate_with_params(&[], ZlibParams::new(6, 15, 8)).unwrap();
    assert!((stream.len() as u64) < MIN_STREAM_LENGTH);

    let mut file = vec![0u8; 10];
    file.extend_from_slice(&stream);
    file.extend_from_slice(&[0u8; 10]);
    assert!(scan_buffer(&file).is_empty());
}

#[test]
fn finds_adjacent_streams() {
    let payload = test_payload(600);
    let s1 = deflate_with_params(&payload, ZlibParams::new(1, 15, 8)).unwrap();
    let s2 = deflate_with_params(&payload, ZlibParams::new(9, 12, 8)).unwrap();

    let mut file = Vec::new();
    file.extend_from_slice(&s1);
    file.extend_from_slice(&s2);
    file.extend_from_slice(&[0u8; 17]);

    let found = scan_buffer(&file);
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].offset, 0);
    assert_eq!(found[1].offset, s1.len() as u64);
    assert_eq!(found[1].stream_length, s2.len() as u64);
}

#[test]
fn stream_straddling_chunks() {
    crate::init_logging();
    let payload = test_payload(3000);
    let stream = deflate_with_params(&payload, ZlibParams::new(6, 15, 8)).unwrap();

    let mut file = vec![0x33u8; 100];
    file.extend_from_slice(&stream);
    file.extend_from_slice(&[0x44u8; 100]);

    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("straddle.bin");
    crate::utils::write_file(&p, &file);

    // a chunk size well below the stream length forces the refill path
    let config = AtzConfig {
        chunk_size: 64,
        ..AtzConfig::default()
    };
    let result = search_file(&p, &config).unwrap();

    assert_eq!(result.input_size, file.len() as u64);
    assert_eq!(result.input_crc32, crc32fast::hash(&file));
    assert_eq!(result.streams.len(), 1);
    assert_eq!(result.streams[0].offset, 100);
    assert_eq!(result.streams[0].stream_length, stream.len() as u64);
    assert_eq!(result.streams[0].inflated_length, payload.len() as u64);
}
