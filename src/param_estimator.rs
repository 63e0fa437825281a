/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Recovers the deflate parameters a stream was originally compressed with,
//! by recompressing the inflated payload with candidate `(level, window,
//! memLevel)` triples and counting how many bytes come out identical. The
//! two-byte zlib header narrows the space considerably: its FLEVEL field
//! says which level band the compressor was in, so the bands are tried from
//! most to least probable and the search stops as soon as a trial gets
//! within the mismatch tolerance.

use std::{ops::RangeInclusive, path::Path};

use crate::{
    atz_error::{err_exit_code, ExitCode, Result},
    diff_codec::delta_encode,
    process::AtzConfig,
    stream_info::ZlibStreamInfo,
    utils::read_range,
    zlib_codec::{inflate_exact, DeflateStatus, ZlibDeflator, ZlibParams},
};

/// Runs parameter recovery for every confirmed stream of a file and decides
/// which ones are worth storing recompressed. Each stream is independent:
/// its compressed bytes are read back, inflated once, and handed to the
/// search together with the originals.
pub fn recover_file_params(
    path: &Path,
    streams: &mut [ZlibStreamInfo],
    config: &AtzConfig,
) -> Result<()> {
    for (index, info) in streams.iter_mut().enumerate() {
        if let Some(only) = config.concentrate {
            if index as u64 != only {
                continue;
            }
        }

        let original = read_range(path, info.offset, info.stream_length)?;
        // the scanner already decompressed this stream once, so a failure
        // here is a library invariant violation, not user error
        let inflated = inflate_exact(&original, info.inflated_length)?;

        log::debug!(
            "stream #{} ({}) ready for recompression trials",
            index,
            info.offset
        );
        let trials = estimate_stream_params(&original, &inflated, info, config)?;

        if info.mismatched_bytes() <= config.recomp_tresh as u64 && info.ident_bytes > 0 {
            info.recompress = true;
        }
        log::debug!(
            "stream #{}: best match {}/{} with {:?} after {} trials, {} diff bytes, recompress={}",
            index,
            info.ident_bytes,
            info.stream_length,
            info.params,
            trials,
            info.diff_offsets.len(),
            info.recompress
        );
    }
    Ok(())
}

/// Searches the parameter space for the triple that best reproduces the
/// original compressed bytes, updating the record's best-so-far fields as it
/// goes. Returns the number of recompression trials that were run.
pub fn estimate_stream_params(
    original: &[u8],
    inflated: &[u8],
    info: &mut ZlibStreamInfo,
    config: &AtzConfig,
) -> Result<u64> {
    let mut search = ParamSearch {
        original,
        inflated,
        config,
        trials: 0,
    };

    let window = info.window_hint();
    let accepted = match info.level_hint() {
        0 => search.try_fastest(info, window)?,
        1 => search.try_fast(info, window)?,
        2 => search.try_default(info, window)?,
        3 => search.try_best(info, window)?,
        hint => {
            return err_exit_code(
                ExitCode::InvalidParameters,
                format!("impossible level hint {}", hint),
            )
        }
    };

    // the header's window is occasionally a lie (some encoders always write
    // 32K); sweeping the other windows is expensive so it is opt-in
    if !accepted && config.bruteforce_window {
        if window == 10 {
            search.test_range(info, 1..=9, 11..=15, 1..=9)?;
        } else if window == 15 {
            search.test_range(info, 1..=9, 10..=14, 1..=9)?;
        } else if !search.test_range(info, 1..=9, 10..=window - 1, 1..=9)? {
            search.test_range(info, 1..=9, window + 1..=15, 1..=9)?;
        }
    }

    Ok(search.trials)
}

struct ParamSearch<'a> {
    original: &'a [u8],
    inflated: &'a [u8],
    config: &'a AtzConfig,
    trials: u64,
}

impl ParamSearch<'_> {
    /// FLEVEL 0: zlib only writes it for levels 0 and 1, almost always at
    /// the default memLevel.
    fn try_fastest(&mut self, info: &mut ZlibStreamInfo, window: u8) -> Result<bool> {
        if self.test(info, ZlibParams::new(0, window, 8))? {
            return Ok(true);
        }
        if self.test(info, ZlibParams::new(1, window, 8))? {
            return Ok(true);
        }
        if self.test(info, ZlibParams::new(1, window, 9))? {
            return Ok(true);
        }
        if self.test_range(info, 1..=1, window..=window, 1..=7)? {
            return Ok(true);
        }
        // anything the header may have lied about
        self.test_range(info, 2..=9, window..=window, 1..=9)
    }

    /// FLEVEL 1: levels 2 to 5.
    fn try_fast(&mut self, info: &mut ZlibStreamInfo, window: u8) -> Result<bool> {
        if self.test_range(info, 2..=5, window..=window, 8..=8)? {
            return Ok(true);
        }
        if self.test_range(info, 2..=5, window..=window, 1..=7)? {
            return Ok(true);
        }
        if self.test_range(info, 2..=5, window..=window, 9..=9)? {
            return Ok(true);
        }
        if self.test_range(info, 1..=1, window..=window, 1..=9)? {
            return Ok(true);
        }
        self.test_range(info, 6..=9, window..=window, 1..=9)
    }

    /// FLEVEL 2: level 6, the zlib default profile.
    fn try_default(&mut self, info: &mut ZlibStreamInfo, window: u8) -> Result<bool> {
        if self.test(info, ZlibParams::new(6, window, 8))? {
            return Ok(true);
        }
        if self.test(info, ZlibParams::new(6, window, 9))? {
            return Ok(true);
        }
        if self.test_range(info, 6..=6, window..=window, 1..=7)? {
            return Ok(true);
        }
        if self.test_range(info, 1..=5, window..=window, 1..=9)? {
            return Ok(true);
        }
        self.test_range(info, 7..=9, window..=window, 1..=9)
    }

    /// FLEVEL 3: levels 7 to 9.
    fn try_best(&mut self, info: &mut ZlibStreamInfo, window: u8) -> Result<bool> {
        if self.test_range(info, 7..=9, window..=window, 8..=8)? {
            return Ok(true);
        }
        if self.test_range(info, 7..=9, window..=window, 1..=7)? {
            return Ok(true);
        }
        if self.test_range(info, 7..=9, window..=window, 9..=9)? {
            return Ok(true);
        }
        self.test_range(info, 1..=6, window..=window, 1..=9)
    }

    /// Sweeps a parameter block in a fixed nested order: window descending,
    /// memLevel descending, level descending. The order is load-bearing for
    /// reproducible output, not for correctness.
    fn test_range(
        &mut self,
        info: &mut ZlibStreamInfo,
        levels: RangeInclusive<u8>,
        windows: RangeInclusive<u8>,
        mem_levels: RangeInclusive<u8>,
    ) -> Result<bool> {
        for window in windows.rev() {
            for mem_level in mem_levels.clone().rev() {
                for level in levels.clone().rev() {
                    if self.test(info, ZlibParams::new(level, window, mem_level))? {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Recompresses the payload with one candidate triple and scores the
    /// result against the original bytes. Updates the record only on a
    /// strict improvement; returns true when the match is good enough to
    /// stop the whole search.
    fn test(&mut self, info: &mut ZlibStreamInfo, params: ZlibParams) -> Result<bool> {
        self.trials += 1;
        log::trace!("trying {:?}", params);

        let mut deflator = ZlibDeflator::new(params)?;
        let bound = deflator.bound(self.inflated.len());
        let mut recomp = vec![0u8; bound];

        let shortcut_length = self.config.shortcut_length as usize;
        let use_shortcut = self.config.shortcut_enabled
            && info.stream_length > self.config.shortcut_length as u64
            && shortcut_length < bound;

        if use_shortcut {
            // cheap pre-filter: produce only the first shortcut_length
            // compressed bytes and see if the prefix is even close
            let status = deflator.compress(self.inflated, &mut recomp[..shortcut_length])?;
            let produced = deflator.total_out() as usize;
            let prefix_ident = count_identical(&recomp[..produced], &self.original[..produced]);

            let floor = self
                .config
                .shortcut_length
                .saturating_sub(self.config.recomp_tresh) as u64;
            if prefix_ident < floor {
                log::trace!(
                    "shortcut: only {} of {} prefix bytes identical, bailing",
                    prefix_ident,
                    produced
                );
                return Ok(false);
            }

            if status != DeflateStatus::Finished {
                let status = deflator.compress(self.inflated, &mut recomp[shortcut_length..])?;
                if status != DeflateStatus::Finished {
                    return err_exit_code(
                        ExitCode::ZlibInvariant,
                        "deflate did not fit in its own bound",
                    );
                }
            }
        } else {
            let status = deflator.compress(self.inflated, &mut recomp)?;
            if status != DeflateStatus::Finished {
                return err_exit_code(
                    ExitCode::ZlibInvariant,
                    "deflate did not fit in its own bound",
                );
            }
        }

        let produced = deflator.total_out();
        recomp.truncate(produced as usize);

        // wildly different sizes will not be byte-identical anyway, skip the
        // comparison entirely
        if (produced as i64 - info.stream_length as i64).unsigned_abs()
            > self.config.sizediff_tresh as u64
        {
            log::trace!(
                "size difference {} over threshold, not comparing",
                produced as i64 - info.stream_length as i64
            );
            return Ok(false);
        }

        let smaller = produced.min(info.stream_length) as usize;
        let ident_bytes = count_identical(&recomp[..smaller], &self.original[..smaller]);

        if ident_bytes <= info.ident_bytes {
            return Ok(false);
        }

        // new best
        info.ident_bytes = ident_bytes;
        info.params = params;
        info.first_diff_byte = -1;
        info.diff_offsets.clear();
        info.diff_values.clear();

        let mut fullmatch = ident_bytes == info.stream_length;
        if !fullmatch {
            if ident_bytes + self.config.mismatch_tol as u64 >= info.stream_length {
                fullmatch = true;
            }

            let mut positions = Vec::new();
            for i in 0..smaller {
                if recomp[i] != self.original[i] {
                    positions.push(i as u64);
                    info.diff_values.push(self.original[i]);
                }
            }
            // a shorter recompression cannot produce the original's tail at
            // all; those bytes ride along as appended diff entries
            for i in produced..info.stream_length {
                positions.push(i);
                info.diff_values.push(self.original[i as usize]);
            }
            delta_encode(&positions, info);
        }

        Ok(fullmatch)
    }
}

fn count_identical(a: &[u8], b: &[u8]) -> u64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).filter(|(x, y)| x == y).count() as u64
}

#[cfg(test)]
fn test_payload(len: usize) -> Vec<u8> {
    b"a rising tide lifts all boats, but a falling one shows who was swimming naked. "
        .iter()
        .cycle()
        .take(len)
        .copied()
        .collect()
}

#[cfg(test)]
use crate::zlib_codec::deflate_with_params;

#[test]
fn recovers_default_profile_first_try() {
    crate::init_logging();
    let payload = test_payload(100);
    let stream = deflate_with_params(&payload, ZlibParams::new(6, 15, 8)).unwrap();

    let mut info = ZlibStreamInfo::new(0, 22, stream.len() as u64, payload.len() as u64);
    let trials =
        estimate_stream_params(&stream, &payload, &mut info, &AtzConfig::default()).unwrap();

    // the default hint tier tries exactly this profile first, so the whole
    // ladder must be skipped
    assert_eq!(trials, 1);
    assert_eq!(info.ident_bytes, info.stream_length);
    assert_eq!(info.params, ZlibParams::new(6, 15, 8));
    assert_eq!(info.first_diff_byte, -1);
    assert!(info.diff_offsets.is_empty());
}

#[test]
fn recovers_best_profile_first_try() {
    let payload = test_payload(5000);
    let stream = deflate_with_params(&payload, ZlibParams::new(9, 15, 8)).unwrap();
    assert_eq!(stream[0], 0x78);
    assert_eq!(stream[1], 0xda);

    let mut info = ZlibStreamInfo::new(0, 23, stream.len() as u64, payload.len() as u64);
    let trials =
        estimate_stream_params(&stream, &payload, &mut info, &AtzConfig::default()).unwrap();

    assert_eq!(trials, 1);
    assert_eq!(info.ident_bytes, info.stream_length);
    assert_eq!(info.params, ZlibParams::new(9, 15, 8));
}

#[test]
fn misleading_hint_falls_through_to_real_level() {
    let payload = test_payload(3000);
    let mut stream = deflate_with_params(&payload, ZlibParams::new(9, 15, 8)).unwrap();

    // forge a "fastest" header onto a level 9 stream; 0x7801 is still a
    // valid header so the stream decodes fine, only the hint is wrong
    stream[0] = 0x78;
    stream[1] = 0x01;

    let mut info = ZlibStreamInfo::new(0, 20, stream.len() as u64, payload.len() as u64);
    let config = AtzConfig::default();
    let trials = estimate_stream_params(&stream, &payload, &mut info, &config).unwrap();

    // the fastest ladder must have walked its fallback ranges up to level 9
    assert!(trials > 1);
    assert!(info.ident_bytes + config.mismatch_tol as u64 >= info.stream_length);
    assert_eq!(info.params.level, 9);

    // replaying params + diff must reproduce the forged stream exactly
    let mut recomp = deflate_with_params(&payload, info.params).unwrap();
    if info.first_diff_byte >= 0 {
        crate::diff_codec::apply_diff(
            &mut recomp,
            info.first_diff_byte as u64,
            &info.diff_offsets,
            &info.diff_values,
        );
    }
    recomp.truncate(info.stream_length as usize);
    assert_eq!(recomp, stream);
}

#[test]
fn best_so_far_is_sticky() {
    let payload = test_payload(800);
    let stream = deflate_with_params(&payload, ZlibParams::new(3, 14, 6)).unwrap();

    // window 14 with a "fast" FLEVEL is offset type 17
    let mut info = ZlibStreamInfo::new(0, 17, stream.len() as u64, payload.len() as u64);
    let config = AtzConfig::default();
    estimate_stream_params(&stream, &payload, &mut info, &config).unwrap();

    let best = info.clone();
    assert!(best.ident_bytes > 0);

    // a second search can never regress the record: no trial strictly beats
    // the stored best, so every field must come out unchanged
    estimate_stream_params(&stream, &payload, &mut info, &config).unwrap();
    assert_eq!(info.ident_bytes, best.ident_bytes);
    assert_eq!(info.params, best.params);
    assert_eq!(info.first_diff_byte, best.first_diff_byte);
    assert_eq!(info.diff_offsets, best.diff_offsets);
    assert_eq!(info.diff_values, best.diff_values);
}

#[test]
fn size_gate_leaves_record_untouched() {
    let payload = test_payload(500);
    let stream = deflate_with_params(&payload, ZlibParams::new(6, 15, 8)).unwrap();

    // pretend the original stream is much longer than anything deflate can
    // produce from this payload; every trial fails the size gate
    let mut original = stream.clone();
    original.extend_from_slice(&vec![0u8; 5000]);

    let mut info = ZlibStreamInfo::new(0, 22, original.len() as u64, payload.len() as u64);
    let config = AtzConfig {
        shortcut_enabled: false,
        ..AtzConfig::default()
    };
    estimate_stream_params(&original, &payload, &mut info, &config).unwrap();

    assert_eq!(info.ident_bytes, 0);
    assert_eq!(info.first_diff_byte, -1);
    assert!(info.diff_offsets.is_empty());
    // a stream that never improved is not recompressible
    assert!(!(info.mismatched_bytes() <= config.recomp_tresh as u64 && info.ident_bytes > 0));
}
