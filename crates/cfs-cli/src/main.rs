#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use cfs::{BlockSize, CheckReport, Container, ContainerInfo, FileByteDevice, FileType, FormatOptions, FsOps};
use cfs_fuse::MountOptions;
use std::env;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

const MEMORY_IMAGE: &str = ":memory:";

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let verbose = take_flag(&mut args, "--verbose") | take_flag(&mut args, "-v");
    init_tracing(verbose)?;

    if args.is_empty() {
        print_usage();
        return Ok(());
    }
    let command = args.remove(0);

    match command.as_str() {
        "format" => {
            let size = take_value(&mut args, "--size")?
                .ok_or_else(|| anyhow!("format requires --size <bytes>"))?;
            let block_size = take_value(&mut args, "--block-size")?;
            let metadata_blocks = take_value(&mut args, "--metadata-blocks")?;
            let image = positional(&args, 0, "format requires <image>")?;
            format_cmd(Path::new(image), size, block_size, metadata_blocks)
        }
        "mount" => {
            let format_size = take_value(&mut args, "--format")?;
            let allow_other = take_flag(&mut args, "--allow-other");
            let read_only = take_flag(&mut args, "--read-only");
            let image = positional(&args, 0, "mount requires <image|:memory:> <mountpoint>")?;
            let mountpoint = positional(&args, 1, "mount requires <image|:memory:> <mountpoint>")?;
            mount_cmd(
                image,
                Path::new(mountpoint),
                format_size,
                allow_other,
                read_only,
            )
        }
        "inspect" => {
            let json = take_flag(&mut args, "--json");
            let image = positional(&args, 0, "inspect requires <image>")?;
            inspect(Path::new(image), json)
        }
        "fsck" => {
            let json = take_flag(&mut args, "--json");
            let image = positional(&args, 0, "fsck requires <image>")?;
            fsck(Path::new(image), json)
        }
        "ls" => {
            let image = positional(&args, 0, "ls requires <image>")?;
            ls(Path::new(image))
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("cfs-cli\n");
    println!("USAGE:");
    println!("  cfs-cli format <image> --size <bytes> [--block-size <bytes>] [--metadata-blocks <n>]");
    println!(
        "  cfs-cli mount <image|:memory:> <mountpoint> [--format <bytes>] [--allow-other] [--read-only]"
    );
    println!("  cfs-cli inspect <image> [--json]");
    println!("  cfs-cli fsck <image> [--json]");
    println!("  cfs-cli ls <image>");
    println!("\nSizes accept K, M and G suffixes. Set RUST_LOG or pass --verbose for more logging.");
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!(e))
        .context("install tracing subscriber")
}

// ── Argument helpers ────────────────────────────────────────────────────────

fn take_flag(args: &mut Vec<String>, name: &str) -> bool {
    let before = args.len();
    args.retain(|arg| arg != name);
    args.len() != before
}

fn take_value(args: &mut Vec<String>, name: &str) -> Result<Option<u64>> {
    let Some(pos) = args.iter().position(|arg| arg == name) else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        bail!("{name} requires a value");
    }
    let raw = args.remove(pos + 1);
    args.remove(pos);
    parse_size(&raw)
        .map(Some)
        .with_context(|| format!("invalid value for {name}: {raw}"))
}

fn positional<'a>(args: &'a [String], index: usize, missing: &str) -> Result<&'a str> {
    if let Some(flag) = args.iter().find(|arg| arg.starts_with("--")) {
        bail!("unknown option: {flag}");
    }
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{missing}"))
}

/// Parse a byte count with an optional binary `K`, `M` or `G` suffix.
fn parse_size(raw: &str) -> Result<u64> {
    let (digits, shift) = match raw.as_bytes().last() {
        Some(b'K' | b'k') => (&raw[..raw.len() - 1], 10),
        Some(b'M' | b'm') => (&raw[..raw.len() - 1], 20),
        Some(b'G' | b'g') => (&raw[..raw.len() - 1], 30),
        _ => (raw, 0),
    };
    let value: u64 = digits.parse().context("not a number")?;
    value
        .checked_mul(1_u64 << shift)
        .ok_or_else(|| anyhow!("size overflows u64"))
}

fn format_options(block_size: Option<u64>, metadata_blocks: Option<u64>) -> Result<FormatOptions> {
    let mut options = FormatOptions::default();
    if let Some(bs) = block_size {
        let bs = u32::try_from(bs).context("block size too large")?;
        options.block_size = BlockSize::new(bs).context("invalid block size")?;
    }
    options.metadata_blocks = metadata_blocks;
    Ok(options)
}

// ── Commands ────────────────────────────────────────────────────────────────

fn format_cmd(
    image: &Path,
    size: u64,
    block_size: Option<u64>,
    metadata_blocks: Option<u64>,
) -> Result<()> {
    let options = format_options(block_size, metadata_blocks)?;
    let device = FileByteDevice::create(image, size)
        .with_context(|| format!("failed to create container file {}", image.display()))?;
    let container = Container::format(device, options)
        .with_context(|| format!("failed to format {}", image.display()))?;
    let info = container.info();
    container.unmount().context("failed to close container")?;
    println!(
        "formatted {}: {} data blocks of {} bytes ({} bytes usable)",
        image.display(),
        info.geometry.data_blocks,
        info.geometry.block_size.get(),
        info.capacity_bytes
    );
    Ok(())
}

fn open_container(image: &Path, read_only: bool) -> Result<Container> {
    let device = FileByteDevice::open(image)
        .with_context(|| format!("failed to open container file {}", image.display()))?;
    if read_only {
        return Container::mount_read_only(device)
            .with_context(|| format!("failed to mount {}", image.display()));
    }
    if !device.is_writable() {
        bail!(
            "{} is not writable; use --read-only",
            image.display()
        );
    }
    Container::mount(device).with_context(|| format!("failed to mount {}", image.display()))
}

fn mount_options(mountpoint: &Path, allow_other: bool, read_only: bool) -> Result<MountOptions> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(mountpoint)
        .with_context(|| format!("mountpoint {} is not accessible", mountpoint.display()))?;
    if !meta.is_dir() {
        bail!("mountpoint {} is not a directory", mountpoint.display());
    }
    Ok(MountOptions {
        read_only,
        allow_other,
        auto_unmount: true,
        uid: meta.uid(),
        gid: meta.gid(),
    })
}

fn mount_cmd(
    image: &str,
    mountpoint: &Path,
    format_size: Option<u64>,
    allow_other: bool,
    read_only: bool,
) -> Result<()> {
    let container = if image == MEMORY_IMAGE {
        let size = format_size.ok_or_else(|| anyhow!("{MEMORY_IMAGE} requires --format <bytes>"))?;
        let size = usize::try_from(size).context("in-memory size too large")?;
        Container::format_memory(size).context("failed to format in-memory container")?
    } else if let Some(size) = format_size {
        if read_only {
            bail!("--format and --read-only are mutually exclusive");
        }
        let path = Path::new(image);
        let device = FileByteDevice::create(path, size)
            .with_context(|| format!("failed to create container file {image}"))?;
        Container::format(device, FormatOptions::default())
            .with_context(|| format!("failed to format {image}"))?
    } else {
        open_container(Path::new(image), read_only)?
    };

    let options = mount_options(mountpoint, allow_other, read_only)?;
    let info = container.info();
    info!(
        image,
        mountpoint = %mountpoint.display(),
        data_blocks = info.geometry.data_blocks,
        block_size = info.geometry.block_size.get(),
        read_only,
        "serving container"
    );

    let ops: Box<dyn FsOps> = Box::new(container);
    cfs_fuse::mount(ops, mountpoint, &options)
        .with_context(|| format!("FUSE mount failed at {}", mountpoint.display()))?;
    Ok(())
}

fn inspect(image: &Path, json: bool) -> Result<()> {
    let container = open_container(image, true)?;
    let info = container.info();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&info).context("serialize output")?
        );
    } else {
        print_info(image, &info);
    }
    Ok(())
}

fn print_info(image: &Path, info: &ContainerInfo) {
    let g = &info.geometry;
    println!("CanFS container {}", image.display());
    println!("block_size: {}", g.block_size.get());
    println!("block_count: {}", g.block_count);
    println!("metadata: {} blocks per slot from block {}", g.meta_blocks_per_slot, g.meta_start);
    println!("data: {} blocks from block {}", g.data_blocks, g.data_start);
    println!("active_slot: {:?}", info.active_slot);
    println!("generation: {}", info.generation.0);
    println!(
        "metadata_used: {} of {} bytes",
        info.metadata_len, info.metadata_capacity
    );
    println!(
        "used: {} of {} bytes ({} blocks free)",
        info.used_bytes, info.capacity_bytes, info.free_blocks
    );
    println!("entries: {}", info.entries);
}

fn fsck(image: &Path, json: bool) -> Result<()> {
    let device = FileByteDevice::open(image)
        .with_context(|| format!("failed to open container file {}", image.display()))?;
    let report = Container::diagnose(device)
        .with_context(|| format!("failed to read metadata of {}", image.display()))?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize output")?
        );
    } else {
        print_report(image, &report);
    }
    if !report.is_clean() {
        bail!("{} problem(s) found in {}", report.problem_count(), image.display());
    }
    Ok(())
}

fn print_report(image: &Path, report: &CheckReport) {
    println!("checking {}", image.display());
    println!(
        "entries: {} ({} directories, {} files, {} symlinks)",
        report.entries, report.directories, report.files, report.symlinks
    );
    println!(
        "blocks: {} used, {} referenced, {} in data area",
        report.used_blocks, report.referenced_blocks, report.data_blocks
    );
    for finding in &report.findings {
        println!("  {finding}");
    }
    if report.is_clean() {
        println!("clean");
    }
}

fn ls(image: &Path) -> Result<()> {
    let container = open_container(image, true)?;
    for entry in container.tree().context("walk namespace")? {
        let kind = match entry.kind {
            FileType::Directory => 'd',
            FileType::RegularFile => '-',
            FileType::Symlink => 'l',
        };
        if entry.kind == FileType::Symlink {
            let target = container
                .readlink(&entry.path)
                .with_context(|| format!("readlink {}", entry.path))?;
            println!("{kind} {:>10} {} -> {target}", entry.size, entry.path);
        } else {
            println!("{kind} {:>10} {}", entry.size, entry.path);
        }
    }
    Ok(())
}
