/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Chunked file access primitives. These are the only file operations the
//! rest of the library performs: read a range, append a range to an output
//! stream, measure a file, compare two files. Memory usage of the copy and
//! compare operations is bounded by the chunk size.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::atz_error::Result;

/// Returns the size of a file in bytes.
pub fn file_size(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)?.len())
}

/// Reads exactly `length` bytes starting at `offset`.
pub fn read_range(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>> {
    let mut f = File::open(path)?;
    f.seek(SeekFrom::Start(offset))?;

    let mut buffer = vec![0u8; length as usize];
    f.read_exact(&mut buffer)?;
    Ok(buffer)
}

/// Copies `length` bytes from `path` starting at `offset` into an already
/// opened output stream, at most `chunk_size` bytes at a time.
pub fn copy_range(
    destination: &mut impl Write,
    path: &Path,
    offset: u64,
    length: u64,
    chunk_size: u64,
) -> Result<()> {
    let mut f = File::open(path)?;
    f.seek(SeekFrom::Start(offset))?;

    let mut buffer = vec![0u8; chunk_size.max(1).min(length.max(1)) as usize];
    let mut remaining = length;
    while remaining > 0 {
        let step = remaining.min(buffer.len() as u64) as usize;
        f.read_exact(&mut buffer[..step])?;
        destination.write_all(&buffer[..step])?;
        remaining -= step as u64;
    }
    Ok(())
}

/// Fills `buffer` from the reader as far as possible, stopping only at
/// end-of-file. Returns the number of bytes actually read.
pub(crate) fn read_fill(reader: &mut impl Read, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Compares two files chunk by chunk, returning true when they are
/// byte-for-byte identical.
pub fn files_identical(first: &Path, second: &Path, chunk_size: u64) -> Result<bool> {
    if file_size(first)? != file_size(second)? {
        return Ok(false);
    }

    let mut f1 = File::open(first)?;
    let mut f2 = File::open(second)?;
    let mut b1 = vec![0u8; chunk_size.max(1) as usize];
    let mut b2 = vec![0u8; chunk_size.max(1) as usize];

    loop {
        let n1 = read_fill(&mut f1, &mut b1)?;
        let n2 = read_fill(&mut f2, &mut b2)?;
        if n1 != n2 || b1[..n1] != b2[..n2] {
            return Ok(false);
        }
        if n1 == 0 {
            return Ok(true);
        }
    }
}

#[cfg(test)]
pub fn write_file(filename: &Path, data: &[u8]) {
    let mut f = std::fs::File::create(filename).unwrap();
    std::io::Write::write_all(&mut f, data).unwrap();
}

#[test]
fn range_copy_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("input.bin");
    let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    write_file(&p, &data);

    assert_eq!(file_size(&p).unwrap(), 1000);
    assert_eq!(read_range(&p, 17, 100).unwrap(), &data[17..117]);

    // chunk size smaller than the range being copied
    let mut out = Vec::new();
    copy_range(&mut out, &p, 10, 500, 64).unwrap();
    assert_eq!(out, &data[10..510]);

    // copy of nothing is a no-op
    let mut out = Vec::new();
    copy_range(&mut out, &p, 10, 0, 64).unwrap();
    assert!(out.is_empty());
}

#[test]
fn compare_files() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.bin");
    let b = dir.path().join("b.bin");
    let data: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 256) as u8).collect();

    write_file(&a, &data);
    write_file(&b, &data);
    assert!(files_identical(&a, &b, 512).unwrap());

    let mut tweaked = data.clone();
    tweaked[4000] ^= 1;
    write_file(&b, &tweaked);
    assert!(!files_identical(&a, &b, 512).unwrap());

    write_file(&b, &data[..4095]);
    assert!(!files_identical(&a, &b, 512).unwrap());
}
