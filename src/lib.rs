/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

mod atz_container;
mod atz_error;
mod diff_codec;
mod param_estimator;
mod process;
mod scan_zlib;
mod stream_info;
mod utils;
mod zlib_codec;

pub use atz_error::{err_exit_code, AddContext, AtzError, ExitCode, Result};

pub use process::{compress_file, reconstruct_file, verify_atz_file, AtzConfig, AtzStats};

pub use atz_container::{parse_atz_header, reconstruct_atz_file, write_atz_file, AtzHeader, ATZ_MAGIC};

pub use scan_zlib::{parse_offset_type, search_file, ScanResult, ZlibStreamSearcher, ZLIB_HEADERS};

pub use param_estimator::{estimate_stream_params, recover_file_params};

pub use diff_codec::{apply_diff, delta_decode, delta_encode};

pub use stream_info::ZlibStreamInfo;

pub use zlib_codec::{
    deflate_with_params, inflate_exact, DeflateStatus, InflateStatus, ZlibDeflator, ZlibInflator,
    ZlibParams,
};

#[cfg(test)]
static INIT: std::sync::Once = std::sync::Once::new();

/// Initialize the logger for tests. This is a no-op if the logger is already initialized.
#[cfg(test)]
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
