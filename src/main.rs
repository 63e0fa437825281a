use std::path::{Path, PathBuf};

use clap::Parser;

use antiz::{compress_file, reconstruct_file, verify_atz_file, AtzConfig, Result};

/// Finds zlib streams embedded in a file and repacks it into an ATZ
/// container that the same tool can expand back to the exact original.
#[derive(Parser, Debug)]
#[command(name = "antiz", version, about)]
struct Args {
    /// Input file name
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Output file name. Defaults to the input name plus ".atz" (or ".rec"
    /// when reconstructing)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Assume the input file is an ATZ container and attempt to reconstruct
    /// the original file from it
    #[arg(short = 'r', long = "reconstruct")]
    reconstruct: bool,

    /// Skip comparing the reconstructed file to the original after creating
    /// a container. Not recommended while the format is still experimental.
    #[arg(long)]
    notest: bool,

    /// Recompression threshold in bytes. Streams are only recompressed if
    /// the best match differs from the original in at most this many bytes.
    #[arg(long = "recomp-tresh", default_value_t = 128)]
    recomp_tresh: u16,

    /// Size difference threshold in bytes. If a recompressed stream differs
    /// in size from the original by more than this, the two are not even
    /// compared.
    #[arg(long = "sizediff-tresh", default_value_t = 128)]
    sizediff_tresh: u16,

    /// Length of the phase 3 shortcut in bytes. Must be noticeably larger
    /// than the recompression threshold for the speedup to matter.
    #[arg(long = "shortcut-len", default_value_t = 512)]
    shortcut_length: u16,

    /// Mismatch tolerance in bytes. A parameter set leaving at most this
    /// many mismatches is accepted without trying anything better.
    #[arg(long = "mismatch-tol", default_value_t = 2)]
    mismatch_tol: u16,

    /// Bruteforce the deflate window size if the header-supplied one does
    /// not lead to a match. Can have a major performance penalty.
    #[arg(long = "brute-window")]
    bruteforce_window: bool,

    /// Size of the memory buffer in bytes for chunked disk IO
    #[arg(long, default_value_t = 524288)]
    chunksize: u64,
}

fn main() {
    env_logger::init();

    if let Err(e) = run(Args::parse()) {
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code() as i32);
    }
}

fn run(args: Args) -> Result<()> {
    let config = AtzConfig {
        recomp_tresh: args.recomp_tresh,
        sizediff_tresh: args.sizediff_tresh,
        shortcut_length: args.shortcut_length,
        mismatch_tol: args.mismatch_tol,
        bruteforce_window: args.bruteforce_window,
        chunk_size: args.chunksize,
        ..AtzConfig::default()
    };

    if args.reconstruct {
        let atz_name = args.input;
        let recon_name = args
            .output
            .unwrap_or_else(|| append_extension(&atz_name, "rec"));
        println!("reconstructing from {}", atz_name.display());

        reconstruct_file(&atz_name, &recon_name, &config)?;
        println!("wrote {}", recon_name.display());
    } else {
        let atz_name = args
            .output
            .unwrap_or_else(|| append_extension(&args.input, "atz"));
        println!("input file: {}", args.input.display());

        let stats = compress_file(&args.input, &atz_name, &config)?;
        println!(
            "recompressed {}/{} streams, {} -> {} bytes",
            stats.streams_recompressed, stats.streams_found, stats.input_size, stats.atz_size
        );

        if !args.notest {
            print!("testing...");
            let recon_name = append_extension(&args.input, "rec");
            verify_atz_file(&args.input, &atz_name, &recon_name, &config)?;
            println!("OK");
        }
    }
    Ok(())
}

/// foo.bin -> foo.bin.atz, keeping the original extension visible
fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.to_path_buf().into_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}
