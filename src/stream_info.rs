/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use crate::zlib_codec::ZlibParams;

/// Everything known about one confirmed zlib stream: where it sits in the
/// source file, what the scanner measured, and the best recompression the
/// parameter search has found so far.
#[derive(Debug, Clone)]
pub struct ZlibStreamInfo {
    /// start of the compressed stream in the source file
    pub offset: u64,

    /// which of the 24 valid header byte pairs was matched, -1 when the
    /// record was read back from a container (the header is not re-derived
    /// on that path)
    pub offset_type: i32,

    /// exact number of compressed bytes the stream occupies in the source
    pub stream_length: u64,

    /// exact number of bytes the stream decompresses to
    pub inflated_length: u64,

    /// best parameter triple found so far
    pub params: ZlibParams,

    /// bytes matching between the best recompression and the original,
    /// never decreases across trials
    pub ident_bytes: u64,

    /// offset of the first mismatching byte relative to the stream start,
    /// -1 means a perfect match with no diff at all
    pub first_diff_byte: i64,

    /// positions of mismatching bytes as an incremental offset list, so that
    /// consecutive runs of mismatches turn into runs of 1s that compress
    /// well downstream
    pub diff_offsets: Vec<u64>,

    /// original byte values at each mismatch position, parallel to
    /// `diff_offsets`
    pub diff_values: Vec<u8>,

    /// whether the container stores this stream as payload+params+diff
    /// instead of its raw bytes
    pub recompress: bool,

    /// absolute position of the inflated payload inside the container file,
    /// only meaningful on the reconstruction path
    pub payload_offset: u64,
}

impl ZlibStreamInfo {
    pub fn new(offset: u64, offset_type: i32, stream_length: u64, inflated_length: u64) -> Self {
        ZlibStreamInfo {
            offset,
            offset_type,
            stream_length,
            inflated_length,
            params: ZlibParams::new(9, 15, 9),
            ident_bytes: 0,
            first_diff_byte: -1,
            diff_offsets: Vec::new(),
            diff_values: Vec::new(),
            recompress: false,
            payload_offset: 0,
        }
    }

    /// windowBits suggested by the header byte pair
    pub fn window_hint(&self) -> u8 {
        debug_assert!(self.offset_type >= 0);
        10 + (self.offset_type / 4) as u8
    }

    /// FLEVEL from the header: 0=fastest, 1=fast, 2=default, 3=best
    pub fn level_hint(&self) -> u8 {
        debug_assert!(self.offset_type >= 0);
        (self.offset_type % 4) as u8
    }

    pub fn mismatched_bytes(&self) -> u64 {
        debug_assert!(self.ident_bytes <= self.stream_length);
        self.stream_length - self.ident_bytes
    }
}

#[test]
fn hints_from_offset_type() {
    let info = ZlibStreamInfo::new(0, 22, 100, 200);
    assert_eq!(info.window_hint(), 15);
    assert_eq!(info.level_hint(), 2);

    let info = ZlibStreamInfo::new(0, 0, 100, 200);
    assert_eq!(info.window_hint(), 10);
    assert_eq!(info.level_hint(), 0);

    let info = ZlibStreamInfo::new(0, 23, 100, 200);
    assert_eq!(info.window_hint(), 15);
    assert_eq!(info.level_hint(), 3);
}

#[test]
fn fresh_record_defaults() {
    let info = ZlibStreamInfo::new(40, 5, 1000, 4000);
    assert_eq!(info.params, ZlibParams::new(9, 15, 9));
    assert_eq!(info.ident_bytes, 0);
    assert_eq!(info.first_diff_byte, -1);
    assert!(!info.recompress);
    assert_eq!(info.mismatched_bytes(), 1000);
}
