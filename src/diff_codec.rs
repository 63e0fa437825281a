/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Delta codec for the per-stream byte diff. Mismatch positions are stored
//! as the distance to the previous position, so a consecutive run like
//! 451,452,453,... becomes 0,1,1,... which the user's outer compressor can
//! squeeze much better than raw offsets.

use crate::stream_info::ZlibStreamInfo;

/// Delta-encodes the ascending mismatch position list into the stream
/// record. `positions` must not be empty; the first entry becomes
/// `first_diff_byte` and the offset list starts with 0.
pub fn delta_encode(positions: &[u64], info: &mut ZlibStreamInfo) {
    info.first_diff_byte = positions[0] as i64;
    info.diff_offsets.push(0);
    for k in 1..positions.len() {
        info.diff_offsets.push(positions[k] - positions[k - 1]);
    }
}

/// Recovers the absolute position list from a delta-encoded diff.
pub fn delta_decode(first_diff_byte: u64, diff_offsets: &[u64]) -> Vec<u64> {
    let mut positions = Vec::with_capacity(diff_offsets.len());
    let mut pos = first_diff_byte;
    for &step in diff_offsets {
        pos += step;
        positions.push(pos);
    }
    positions
}

/// Overwrites the mismatching bytes of a freshly recompressed stream with
/// the original values. Positions past the end of the buffer are appended
/// bytes the recompression could not produce at all, so the buffer grows to
/// cover them.
pub fn apply_diff(
    buffer: &mut Vec<u8>,
    first_diff_byte: u64,
    diff_offsets: &[u64],
    diff_values: &[u8],
) {
    debug_assert_eq!(diff_offsets.len(), diff_values.len());
    let mut pos = first_diff_byte;
    for (step, value) in diff_offsets.iter().zip(diff_values) {
        pos += step;
        if pos as usize >= buffer.len() {
            buffer.resize(pos as usize + 1, 0);
        }
        buffer[pos as usize] = *value;
    }
}

#[test]
fn consecutive_run_collapses_to_ones() {
    let mut info = ZlibStreamInfo::new(0, 0, 100, 100);
    delta_encode(&[451, 452, 453, 454, 460], &mut info);

    assert_eq!(info.first_diff_byte, 451);
    assert_eq!(info.diff_offsets, vec![0, 1, 1, 1, 6]);
}

#[test]
fn encode_decode_inverse() {
    let positions = vec![0u64, 3, 4, 5, 100, 101, 5000];
    let mut info = ZlibStreamInfo::new(0, 0, 100, 100);
    delta_encode(&positions, &mut info);
    assert_eq!(
        delta_decode(info.first_diff_byte as u64, &info.diff_offsets),
        positions
    );
}

#[test]
fn encode_decode_inverse_random() {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..50 {
        let mut positions: Vec<u64> = Vec::new();
        let mut pos = rng.gen_range(0..64u64);
        for _ in 0..rng.gen_range(1..200) {
            positions.push(pos);
            pos += rng.gen_range(1..1000u64);
        }

        let mut info = ZlibStreamInfo::new(0, 0, 100, 100);
        delta_encode(&positions, &mut info);
        assert_eq!(
            delta_decode(info.first_diff_byte as u64, &info.diff_offsets),
            positions
        );
    }
}

#[test]
fn apply_overwrites_and_appends() {
    let mut info = ZlibStreamInfo::new(0, 0, 100, 100);
    // positions 2 and 3 overwrite, positions 5 and 6 extend the buffer
    delta_encode(&[2, 3, 5, 6], &mut info);
    info.diff_values = vec![0xaa, 0xbb, 0xcc, 0xdd];

    let mut buffer = vec![0u8, 1, 2, 3, 4];
    apply_diff(
        &mut buffer,
        info.first_diff_byte as u64,
        &info.diff_offsets,
        &info.diff_values,
    );
    assert_eq!(buffer, vec![0u8, 1, 0xaa, 0xbb, 4, 0xcc, 0xdd]);
}
