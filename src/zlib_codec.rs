/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Thin safe wrappers around the zlib inflate/deflate primitives. All unsafe
//! FFI lives here; the rest of the library sees a resettable decompressor
//! that can be driven across chunk boundaries, and a compressor that takes an
//! explicit `(level, window, memLevel)` triple. The parameter search depends
//! on real zlib because no pure-Rust implementation exposes `memLevel`.

use std::os::raw::c_int;

use libz_sys::{
    deflate, deflateBound, deflateEnd, deflateInit2_, inflate, inflateEnd, inflateInit2_,
    inflateReset, uInt, z_stream, zlibVersion, Z_BUF_ERROR, Z_DATA_ERROR, Z_DEFAULT_STRATEGY,
    Z_DEFLATED, Z_FINISH, Z_MEM_ERROR, Z_NEED_DICT, Z_OK, Z_STREAM_END, Z_STREAM_ERROR,
    Z_SYNC_FLUSH,
};

use crate::atz_error::{err_exit_code, ExitCode, Result};

/// A deflate parameter triple. `window` is the zlib windowBits value (9-15),
/// `mem_level` the internal hash table sizing (1-9).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ZlibParams {
    pub level: u8,
    pub window: u8,
    pub mem_level: u8,
}

impl ZlibParams {
    pub fn new(level: u8, window: u8, mem_level: u8) -> ZlibParams {
        ZlibParams {
            level,
            window,
            mem_level,
        }
    }
}

fn zlib_ret_name(ret: c_int) -> String {
    match ret {
        Z_OK => "Z_OK".into(),
        Z_STREAM_END => "Z_STREAM_END".into(),
        Z_NEED_DICT => "Z_NEED_DICT".into(),
        Z_DATA_ERROR => "Z_DATA_ERROR".into(),
        Z_MEM_ERROR => "Z_MEM_ERROR".into(),
        Z_BUF_ERROR => "Z_BUF_ERROR".into(),
        Z_STREAM_ERROR => "Z_STREAM_ERROR".into(),
        _ => format!("unknown zlib error {}", ret),
    }
}

/// zlib's internal state keeps a back-pointer into the z_stream, so the
/// struct must never move once initialized.
fn new_z_stream() -> Box<z_stream> {
    Box::new(unsafe { std::mem::MaybeUninit::<z_stream>::zeroed().assume_init() })
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InflateStatus {
    /// the stream terminated cleanly
    Finished,
    /// all supplied input was consumed without reaching the end of the stream
    NeedsInput,
    /// the output window filled up, drain and continue
    NeedsOutput,
    /// the bytes are not a valid deflate stream (or fail the adler32 check)
    BadData,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeflateStatus {
    Finished,
    NeedsOutput,
}

/// Stateful decompressor that can be reset between candidate streams and
/// refilled with new input chunks mid-stream without reallocating.
pub struct ZlibInflator {
    strm: Box<z_stream>,
    feed_pos: usize,
}

impl ZlibInflator {
    pub fn new() -> Result<ZlibInflator> {
        let mut strm = new_z_stream();
        let ret = unsafe {
            inflateInit2_(
                &mut *strm,
                15,
                zlibVersion(),
                std::mem::size_of::<z_stream>() as c_int,
            )
        };
        if ret != Z_OK {
            return err_exit_code(
                ExitCode::ZlibInitFailed,
                format!("inflateInit2 failed: {}", zlib_ret_name(ret)),
            );
        }
        Ok(ZlibInflator { strm, feed_pos: 0 })
    }

    /// Total compressed bytes consumed since the last reset.
    pub fn total_in(&self) -> u64 {
        self.strm.total_in as u64
    }

    /// Total decompressed bytes produced since the last reset.
    pub fn total_out(&self) -> u64 {
        self.strm.total_out as u64
    }

    /// How much of the current input slice has been consumed.
    pub fn feed_consumed(&self) -> usize {
        self.feed_pos
    }

    /// Starts decompressing a fresh stream at the beginning of `input`.
    pub fn begin(&mut self, input: &[u8], sink: &mut [u8]) -> Result<InflateStatus> {
        let ret = unsafe { inflateReset(&mut *self.strm) };
        if ret != Z_OK {
            return err_exit_code(
                ExitCode::ZlibInvariant,
                format!("inflateReset failed: {}", zlib_ret_name(ret)),
            );
        }
        self.feed_pos = 0;
        self.step(input, sink)
    }

    /// Continues draining output. `input` must be the same slice that was
    /// passed to the previous call; consumption carries on where it stopped.
    pub fn resume(&mut self, input: &[u8], sink: &mut [u8]) -> Result<InflateStatus> {
        self.step(input, sink)
    }

    /// Continues the stream in progress with a fresh chunk of input.
    pub fn refill(&mut self, input: &[u8], sink: &mut [u8]) -> Result<InflateStatus> {
        self.feed_pos = 0;
        self.step(input, sink)
    }

    fn step(&mut self, input: &[u8], sink: &mut [u8]) -> Result<InflateStatus> {
        let mut out_pos = 0usize;
        loop {
            let remaining = &input[self.feed_pos..];
            let avail_in = remaining.len().min(uInt::MAX as usize) as uInt;
            let out_window = &mut sink[out_pos..];
            let avail_out = out_window.len().min(uInt::MAX as usize) as uInt;

            let ret = unsafe {
                self.strm.next_in = remaining.as_ptr() as *mut _;
                self.strm.avail_in = avail_in;
                self.strm.next_out = out_window.as_mut_ptr();
                self.strm.avail_out = avail_out;
                inflate(&mut *self.strm, Z_SYNC_FLUSH)
            };
            let consumed = (avail_in - self.strm.avail_in) as usize;
            let produced = (avail_out - self.strm.avail_out) as usize;
            self.feed_pos += consumed;
            out_pos += produced;

            match ret {
                Z_STREAM_END => return Ok(InflateStatus::Finished),
                Z_NEED_DICT | Z_DATA_ERROR => return Ok(InflateStatus::BadData),
                Z_OK | Z_BUF_ERROR => {
                    if out_pos == sink.len() {
                        return Ok(InflateStatus::NeedsOutput);
                    }
                    if self.feed_pos == input.len() {
                        return Ok(InflateStatus::NeedsInput);
                    }
                    // both counters were clamped to 32 bits, keep feeding
                    if consumed == 0 && produced == 0 {
                        return err_exit_code(ExitCode::ZlibInvariant, "inflate made no progress");
                    }
                }
                ret => {
                    return err_exit_code(
                        ExitCode::ZlibInvariant,
                        format!("inflate returned {}", zlib_ret_name(ret)),
                    )
                }
            }
        }
    }
}

impl Drop for ZlibInflator {
    fn drop(&mut self) {
        unsafe {
            inflateEnd(&mut *self.strm);
        }
    }
}

/// Compressor bound to one parameter triple. Created fresh per trial, which
/// is what zlib requires anyway since memLevel is fixed at init time.
pub struct ZlibDeflator {
    strm: Box<z_stream>,
    feed_pos: usize,
}

impl std::fmt::Debug for ZlibDeflator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibDeflator")
            .field("feed_pos", &self.feed_pos)
            .finish_non_exhaustive()
    }
}

impl ZlibDeflator {
    pub fn new(params: ZlibParams) -> Result<ZlibDeflator> {
        if params.level > 9 || !(9..=15).contains(&params.window) || !(1..=9).contains(&params.mem_level)
        {
            return err_exit_code(
                ExitCode::InvalidParameters,
                format!("deflate parameters out of range: {:?}", params),
            );
        }

        let mut strm = new_z_stream();
        let ret = unsafe {
            deflateInit2_(
                &mut *strm,
                params.level as c_int,
                Z_DEFLATED,
                params.window as c_int,
                params.mem_level as c_int,
                Z_DEFAULT_STRATEGY,
                zlibVersion(),
                std::mem::size_of::<z_stream>() as c_int,
            )
        };
        if ret != Z_OK {
            return err_exit_code(
                ExitCode::ZlibInitFailed,
                format!("deflateInit2 failed: {}", zlib_ret_name(ret)),
            );
        }
        Ok(ZlibDeflator { strm, feed_pos: 0 })
    }

    /// Worst-case compressed size for `source_len` input bytes.
    pub fn bound(&mut self, source_len: usize) -> usize {
        unsafe { deflateBound(&mut *self.strm, source_len as _) as usize }
    }

    pub fn total_out(&self) -> u64 {
        self.strm.total_out as u64
    }

    /// Compresses as much of `input` as fits into `sink`, finishing the
    /// stream if there is room. Call again with a fresh sink window (and the
    /// same `input` slice) after `NeedsOutput`.
    pub fn compress(&mut self, input: &[u8], sink: &mut [u8]) -> Result<DeflateStatus> {
        let mut out_pos = 0usize;
        loop {
            let remaining = &input[self.feed_pos..];
            let avail_in = remaining.len().min(uInt::MAX as usize) as uInt;
            let out_window = &mut sink[out_pos..];
            let avail_out = out_window.len().min(uInt::MAX as usize) as uInt;

            let ret = unsafe {
                self.strm.next_in = remaining.as_ptr() as *mut _;
                self.strm.avail_in = avail_in;
                self.strm.next_out = out_window.as_mut_ptr();
                self.strm.avail_out = avail_out;
                deflate(&mut *self.strm, Z_FINISH)
            };
            let consumed = (avail_in - self.strm.avail_in) as usize;
            let produced = (avail_out - self.strm.avail_out) as usize;
            self.feed_pos += consumed;
            out_pos += produced;

            match ret {
                Z_STREAM_END => return Ok(DeflateStatus::Finished),
                Z_OK | Z_BUF_ERROR => {
                    if out_pos == sink.len() {
                        return Ok(DeflateStatus::NeedsOutput);
                    }
                    if consumed == 0 && produced == 0 {
                        return err_exit_code(ExitCode::ZlibInvariant, "deflate made no progress");
                    }
                }
                ret => {
                    return err_exit_code(
                        ExitCode::ZlibInvariant,
                        format!("deflate returned {}", zlib_ret_name(ret)),
                    )
                }
            }
        }
    }
}

impl Drop for ZlibDeflator {
    fn drop(&mut self) {
        // deflateEnd reports Z_DATA_ERROR when a stream is abandoned with
        // pending output, which is exactly what the shortcut bail does
        unsafe {
            deflateEnd(&mut *self.strm);
        }
    }
}

/// Decompresses a complete in-memory zlib stream whose inflated size is
/// already known. Anything but a clean end of stream is an invariant
/// violation, since callers only pass streams that validated earlier.
pub fn inflate_exact(stream: &[u8], inflated_length: u64) -> Result<Vec<u8>> {
    let mut inflator = ZlibInflator::new()?;
    let mut output = vec![0u8; inflated_length as usize];
    let status = inflator.begin(stream, &mut output)?;
    if status != InflateStatus::Finished || inflator.total_out() != inflated_length {
        return err_exit_code(
            ExitCode::ZlibInvariant,
            format!("validated stream failed to decompress ({:?})", status),
        );
    }
    Ok(output)
}

/// Compresses `data` with an explicit parameter triple in one pass.
pub fn deflate_with_params(data: &[u8], params: ZlibParams) -> Result<Vec<u8>> {
    let mut deflator = ZlibDeflator::new(params)?;
    let mut output = vec![0u8; deflator.bound(data.len())];
    let status = deflator.compress(data, &mut output)?;
    if status != DeflateStatus::Finished {
        return err_exit_code(ExitCode::ZlibInvariant, "deflate did not fit in its own bound");
    }
    output.truncate(deflator.total_out() as usize);
    Ok(output)
}

#[cfg(test)]
fn sample_payload() -> Vec<u8> {
    b"the quick brown fox jumps over the lazy dog. "
        .iter()
        .cycle()
        .take(2000)
        .copied()
        .collect()
}

#[test]
fn roundtrip_default_profile() {
    let payload = sample_payload();
    let stream = deflate_with_params(&payload, ZlibParams::new(6, 15, 8)).unwrap();

    // level 6 at a 32K window writes the classic 0x789c header
    assert_eq!(stream[0], 0x78);
    assert_eq!(stream[1], 0x9c);

    let back = inflate_exact(&stream, payload.len() as u64).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn rejects_out_of_range_params() {
    for params in [
        ZlibParams::new(10, 15, 8),
        ZlibParams::new(6, 8, 8),
        ZlibParams::new(6, 16, 8),
        ZlibParams::new(6, 15, 0),
        ZlibParams::new(6, 15, 10),
    ] {
        let e = ZlibDeflator::new(params).unwrap_err();
        assert_eq!(e.exit_code(), ExitCode::InvalidParameters);
    }
}

#[test]
fn inflator_refill_across_chunks() {
    let payload = sample_payload();
    let stream = deflate_with_params(&payload, ZlibParams::new(9, 12, 7)).unwrap();
    let split = stream.len() / 2;

    let mut inflator = ZlibInflator::new().unwrap();
    let mut sink = vec![0u8; payload.len()];

    let status = inflator.begin(&stream[..split], &mut sink).unwrap();
    assert_eq!(status, InflateStatus::NeedsInput);

    let status = inflator.refill(&stream[split..], &mut sink).unwrap();
    assert_eq!(status, InflateStatus::Finished);
    assert_eq!(inflator.total_in(), stream.len() as u64);
    assert_eq!(inflator.total_out(), payload.len() as u64);
}

#[test]
fn inflator_drains_small_sink() {
    let payload = sample_payload();
    let stream = deflate_with_params(&payload, ZlibParams::new(6, 15, 8)).unwrap();

    let mut inflator = ZlibInflator::new().unwrap();
    let mut sink = vec![0u8; 64];
    let mut status = inflator.begin(&stream, &mut sink).unwrap();
    while status == InflateStatus::NeedsOutput {
        status = inflator.resume(&stream, &mut sink).unwrap();
    }
    assert_eq!(status, InflateStatus::Finished);
    assert_eq!(inflator.total_out(), payload.len() as u64);
}

#[test]
fn inflator_rejects_garbage() {
    let mut inflator = ZlibInflator::new().unwrap();
    let mut sink = vec![0u8; 256];

    // valid header byte pair followed by bytes that are not a deflate stream
    let mut garbage = vec![0x78, 0x9c];
    garbage.extend((0u32..200).map(|i| (i.wrapping_mul(0x9e37) >> 3) as u8));
    let status = inflator.begin(&garbage, &mut sink).unwrap();
    assert_ne!(status, InflateStatus::Finished);
}

#[test]
fn partial_compress_then_finish() {
    let payload = sample_payload();
    let mut deflator = ZlibDeflator::new(ZlibParams::new(6, 15, 8)).unwrap();
    let bound = deflator.bound(payload.len());
    let mut out = vec![0u8; bound];

    // first produce only a 32 byte prefix, then let it run to completion
    let status = deflator.compress(&payload, &mut out[..32]).unwrap();
    assert_eq!(status, DeflateStatus::NeedsOutput);
    let status = deflator.compress(&payload, &mut out[32..]).unwrap();
    assert_eq!(status, DeflateStatus::Finished);

    let produced = deflator.total_out() as usize;
    out.truncate(produced);
    assert_eq!(out, deflate_with_params(&payload, ZlibParams::new(6, 15, 8)).unwrap());
}
