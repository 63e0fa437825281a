/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Top level entry points: run the scan → recover → write pipeline on a
//! file, reconstruct an original from a container, and verify a container
//! against the file it was built from.

use std::path::Path;

use crate::{
    atz_container::{reconstruct_atz_file, write_atz_file},
    atz_error::{err_exit_code, AddContext, ExitCode, Result},
    param_estimator::recover_file_params,
    scan_zlib::search_file,
    utils,
};

/// Tunables consumed by the scanner, the parameter search and the container
/// codec. One immutable value of this is passed into every component; there
/// is no process-wide state.
#[derive(Debug, Copy, Clone)]
pub struct AtzConfig {
    /// streams are only recompressed if the best match differs from the
    /// original in at most this many bytes
    pub recomp_tresh: u16,

    /// recompression results are only compared to the original when the
    /// size difference is at most this many bytes
    pub sizediff_tresh: u16,

    /// for streams longer than this, compress only this many bytes first
    /// and bail out of the trial if the prefix already has more than
    /// `recomp_tresh` mismatches
    pub shortcut_length: u16,

    /// a parameter set leaving at most this many mismatches is accepted
    /// immediately and the search for the stream stops
    pub mismatch_tol: u16,

    /// sweep the window sizes the header did not announce; expensive and
    /// rarely needed, so off by default
    pub bruteforce_window: bool,

    /// debug switch for the phase-3 speedup shortcut
    pub shortcut_enabled: bool,

    /// debug tool: only run parameter recovery on this stream index
    pub concentrate: Option<u64>,

    /// buffer size for chunked file IO; controls memory usage and nothing
    /// else
    pub chunk_size: u64,
}

impl Default for AtzConfig {
    fn default() -> Self {
        AtzConfig {
            recomp_tresh: 128,
            sizediff_tresh: 128,
            shortcut_length: 512,
            mismatch_tol: 2,
            bruteforce_window: false,
            shortcut_enabled: true,
            concentrate: None,
            chunk_size: 524288,
        }
    }
}

/// Summary of one container creation run.
#[derive(Debug, Default, Copy, Clone)]
pub struct AtzStats {
    pub streams_found: u64,
    pub streams_recompressed: u64,
    pub input_size: u64,
    pub input_crc32: u32,
    pub atz_size: u64,
}

/// Runs the full pipeline on `input` and writes the container to `atz`:
/// scan for streams, recover their deflate parameters, serialize.
pub fn compress_file(input: &Path, atz: &Path, config: &AtzConfig) -> Result<AtzStats> {
    let scan = search_file(input, config)?;
    log::info!(
        "{} bytes scanned (crc32 {:08x}), {} valid zlib streams",
        scan.input_size,
        scan.input_crc32,
        scan.streams.len()
    );

    let mut streams = scan.streams;
    recover_file_params(input, &mut streams, config)?;

    let streams_recompressed = streams.iter().filter(|s| s.recompress).count() as u64;
    log::info!("recompressed: {}/{}", streams_recompressed, streams.len());

    let atz_size = write_atz_file(input, atz, &streams, config)?;

    Ok(AtzStats {
        streams_found: streams.len() as u64,
        streams_recompressed,
        input_size: scan.input_size,
        input_crc32: scan.input_crc32,
        atz_size,
    })
}

/// Recreates the original file from a container.
pub fn reconstruct_file(atz: &Path, output: &Path, config: &AtzConfig) -> Result<()> {
    reconstruct_atz_file(atz, output, config).context()
}

/// Reconstructs a freshly written container to `reconstructed` and compares
/// the result byte for byte against `input`. On success the reconstruction
/// is deleted again; on mismatch it is left behind for inspection.
pub fn verify_atz_file(
    input: &Path,
    atz: &Path,
    reconstructed: &Path,
    config: &AtzConfig,
) -> Result<()> {
    reconstruct_atz_file(atz, reconstructed, config)?;

    if utils::file_size(input)? != utils::file_size(reconstructed)? {
        return err_exit_code(
            ExitCode::RoundtripMismatch,
            "reconstructed file size differs from the original",
        );
    }
    if !utils::files_identical(input, reconstructed, config.chunk_size)? {
        return err_exit_code(
            ExitCode::RoundtripMismatch,
            "reconstructed file differs from the original",
        );
    }

    std::fs::remove_file(reconstructed)?;
    log::info!("roundtrip test OK");
    Ok(())
}

#[test]
fn default_config_matches_documented_values() {
    let config = AtzConfig::default();
    assert_eq!(config.recomp_tresh, 128);
    assert_eq!(config.sizediff_tresh, 128);
    assert_eq!(config.shortcut_length, 512);
    assert_eq!(config.mismatch_tol, 2);
    assert!(!config.bruteforce_window);
    assert!(config.shortcut_enabled);
    assert_eq!(config.concentrate, None);
    assert_eq!(config.chunk_size, 524288);
}
