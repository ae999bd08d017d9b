use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ext4rescue_core::fs::common::BlockDevice;
use ext4rescue_core::fs::ext4::{find_volumes, locate, restore_primary_descriptor, Volume, ROOT_RECORD};
use ext4rescue_core::fs::DescriptorState;
use ext4rescue_core::recovery::{
	carve_summary, export_carved_files, BitmapRebuilder, DirBackupStore, DirectoryCarver,
	DirectoryReconstructor, DirectoryWalker, FileCarver, ScanProgress,
};
use ext4rescue_core::{recover_records, write_recovered_file, RecoveryConfig};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Parser, Debug)]
#[command(name = "ext4rescue", version, about = "ext4rescue - ext4 recovery and forensics toolkit")]
struct Cli {
	/// JSON configuration file (defaults apply when omitted)
	#[arg(long, global = true)]
	config: Option<PathBuf>,
	/// Log per-block and per-record detail
	#[arg(short, long, global = true)]
	verbose: bool,
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Detect an ext4 volume and show where its superblock was found
	Detect {
		/// Path to image file
		image: PathBuf,
	},
	/// Show superblock information, using a backup if the primary is damaged
	Info { image: PathBuf },
	/// List the backup superblocks and the authoritative one
	Locate { image: PathBuf },
	/// Summarize the metadata a recovery session would use
	Report { image: PathBuf },
	/// Extract one regular file by record number
	Extract {
		image: PathBuf,
		/// Record (inode) number
		#[arg(long)]
		record: u32,
		#[arg(long)]
		out: PathBuf,
	},
	/// Extract several records into a directory as record_<N>
	Recover {
		image: PathBuf,
		#[arg(long, required = true, num_args = 1..)]
		records: Vec<u32>,
		#[arg(long)]
		out: PathBuf,
	},
	/// List one directory
	Ls {
		image: PathBuf,
		#[arg(long, default_value_t = ROOT_RECORD)]
		record: u32,
	},
	/// Rebuild the naming tree from a directory
	Tree {
		image: PathBuf,
		#[arg(long, default_value_t = ROOT_RECORD)]
		root: u32,
		/// Overrides the configured depth bound
		#[arg(long)]
		max_depth: Option<usize>,
		/// Write the report to a file instead of stdout
		#[arg(long)]
		out: Option<PathBuf>,
	},
	/// Rebuild block and inode bitmaps from a full record scan
	RebuildBitmaps {
		image: PathBuf,
		/// Write the rebuilt bitmaps back to the image
		#[arg(long)]
		write: bool,
		/// Where the original bitmaps are saved before writing
		#[arg(long, default_value = "ext4rescue-backup")]
		backup_dir: PathBuf,
	},
	/// Carve files by signature from raw blocks
	Carve {
		image: PathBuf,
		#[arg(long)]
		out: PathBuf,
		#[arg(long, default_value_t = 0)]
		start_block: u64,
		/// Exclusive end block (defaults to the end of the image)
		#[arg(long)]
		end_block: Option<u64>,
		/// Used when no superblock can be found
		#[arg(long, default_value_t = 4096, value_parser = clap::value_parser!(u32).range(1024..=65536))]
		block_size: u32,
		/// Restrict to these types (e.g. JPEG PNG PDF)
		#[arg(long, num_args = 1..)]
		types: Vec<String>,
	},
	/// Carve directory entries from raw blocks and rebuild names
	CarveDirs {
		image: PathBuf,
		/// Write the grouped report to a file instead of stdout
		#[arg(long)]
		out: Option<PathBuf>,
	},
	/// Copy the authoritative backup superblock over a damaged primary
	RestoreDescriptor {
		image: PathBuf,
		#[arg(long, default_value = "ext4rescue-backup")]
		backup_dir: PathBuf,
	},
	/// Write every region saved in a backup directory back into the image
	Rollback {
		image: PathBuf,
		#[arg(long, default_value = "ext4rescue-backup")]
		backup_dir: PathBuf,
	},
	/// Look for ext4 volumes inside a whole-disk image
	FindVolumes { image: PathBuf },
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	// Initialize tracing
	if cli.verbose {
		tracing_subscriber::fmt()
			.with_max_level(tracing::Level::DEBUG)
			.init();
	} else {
		tracing_subscriber::fmt::init();
	}

	let config = match cli.config {
		Some(ref path) => RecoveryConfig::from_json_file(path)
			.with_context(|| format!("loading config {}", path.display()))?,
		None => RecoveryConfig::default(),
	};

	match cli.command {
		Commands::Detect { image } => {
			println!("🔍 Detecting file system for: {}", image.display());
			match ext4rescue_core::fs::detect_filesystem(&image)? {
				Some(DescriptorState::Primary) => println!("✅ Detected: ext4 (primary superblock)"),
				Some(DescriptorState::Backup { group }) => {
					println!("⚠️  Primary superblock damaged; backup found in group {}", group)
				}
				None => println!("❌ No ext4 superblock found"),
			}
		}
		Commands::Info { image } => {
			let info = ext4rescue_core::fs::get_filesystem_info(&image)?;
			println!("📋 File System Information:");
			println!("{}", info);
		}
		Commands::Locate { image } => {
			let device = BlockDevice::open(&image)?;
			let located = locate(&device)?;
			match located.source {
				None => println!("✅ Primary superblock is valid (offset {})", located.offset),
				Some(ref backup) => println!(
					"⚠️  Using backup from group {} at offset {} ({}-byte blocks)",
					backup.group, backup.offset, backup.block_size
				),
			}
			for backup in &located.backups {
				println!(
					"   group {:>4}  offset {:>12}  {} blocks",
					backup.group,
					backup.offset,
					backup.descriptor.total_blocks()
				);
			}
		}
		Commands::Report { image } => {
			let device = BlockDevice::open(&image)?;
			let volume = Volume::open(&device)?;
			println!("{}", volume.recovery_report());
		}
		Commands::Extract { image, record, out } => {
			let device = BlockDevice::open(&image)?;
			let volume = Volume::open(&device)?;
			let data = volume.extract_file(record)?;
			let written = write_recovered_file(&out, &data)?;
			println!("✅ Record {} -> {} ({} bytes)", record, out.display(), written);
		}
		Commands::Recover { image, records, out } => {
			let device = BlockDevice::open(&image)?;
			let volume = Volume::open(&device)?;
			let report = recover_records(&volume, &records, &out)?;
			println!(
				"✅ Recovered {}/{} records ({} bytes) into {}",
				report.recovered_files,
				report.total_files,
				report.total_bytes_recovered,
				out.display()
			);
			println!("{}", serde_json::to_string_pretty(&report)?);
		}
		Commands::Ls { image, record } => {
			let device = BlockDevice::open(&image)?;
			let volume = Volume::open(&device)?;
			let walker = DirectoryWalker::new(&volume, config.walk);
			for entry in walker.list_number(record)? {
				println!("{:>10}  {:8}  {}", entry.number, entry.entry_type.name(), entry.name);
			}
		}
		Commands::Tree { image, root, max_depth, out } => {
			let device = BlockDevice::open(&image)?;
			let volume = Volume::open(&device)?;
			let walker = DirectoryWalker::new(&volume, config.walk);
			let tree = walker.rebuild_tree(root, max_depth.unwrap_or(config.tree_max_depth))?;
			emit_report(&tree.report(), out.as_deref())?;
		}
		Commands::RebuildBitmaps { image, write, backup_dir } => {
			let rebuilt = {
				let device = BlockDevice::open(&image)?;
				let volume = Volume::open(&device)?;
				let records = volume.scan_all_records()?;
				let rebuilt = BitmapRebuilder::new(&volume).rebuild(&records);
				for delta in rebuilt.compare(&device) {
					println!(
						"   group {:>4}: {} block bits, {} inode bits differ",
						delta.group, delta.block_bits_changed, delta.record_bits_changed
					);
				}
				println!(
					"📊 Rebuilt: {} used blocks, {} used inodes",
					rebuilt.used_blocks(),
					rebuilt.used_records()
				);
				rebuilt
			};

			if write {
				let mut device = BlockDevice::open_writable(&image)?;
				let mut store = DirBackupStore::new(&backup_dir)?;
				let written = rebuilt.write_back(&mut device, &mut store)?;
				println!(
					"✅ Wrote {} bitmap regions (originals saved in {})",
					written,
					backup_dir.display()
				);
			} else {
				println!("ℹ️  Dry run; pass --write to update the image");
			}
		}
		Commands::Carve { image, out, start_block, end_block, block_size, types } => {
			let device = BlockDevice::open(&image)?;
			let block_size = locate(&device)
				.and_then(|located| located.descriptor.geometry())
				.map(|geometry| geometry.block_size)
				.unwrap_or(block_size);
			let end = end_block.unwrap_or(device.size() / block_size as u64);

			let mut carver = FileCarver::new(block_size, config.carve.clone());
			if !types.is_empty() {
				let names: Vec<&str> = types.iter().map(String::as_str).collect();
				carver = carver.with_signatures(&names)?;
			}
			let bar = progress_bar(end.saturating_sub(start_block));
			if let Some(ref bar) = bar {
				let bar = bar.clone();
				carver.set_progress_callback(move |p: ScanProgress| update_bar(&bar, &p));
			}

			let files = carver.scan(&device, start_block, end);
			if let Some(bar) = bar {
				bar.finish_and_clear();
			}
			export_carved_files(&files, &out)?;
			print!("{}", carve_summary(&files));
		}
		Commands::CarveDirs { image, out } => {
			let device = BlockDevice::open(&image)?;
			let located = locate(&device)?;
			let geometry = located.descriptor.geometry()?;

			let mut carver = DirectoryCarver::new(&geometry);
			let bar = progress_bar(geometry.total_blocks);
			if let Some(ref bar) = bar {
				let bar = bar.clone();
				carver.set_progress_callback(move |p: ScanProgress| update_bar(&bar, &p));
			}
			carver.scan_directories(&device)?;
			if let Some(bar) = bar {
				bar.finish_and_clear();
			}

			let mut report = carver.report();
			report.push_str("\nPATHS:\n");
			let mut numbers: Vec<u32> = carver.entries().iter().map(|e| e.number).filter(|&n| n != 0).collect();
			numbers.sort_unstable();
			numbers.dedup();
			for number in numbers {
				if let Some(path) = carver.reconstruct_path(number as u64) {
					report.push_str(&format!("{:>10}  {}\n", number, path.display()));
				}
			}
			emit_report(&report, out.as_deref())?;
		}
		Commands::RestoreDescriptor { image, backup_dir } => {
			let mut device = BlockDevice::open_writable(&image)?;
			let located = locate(&device)?;
			let mut store = DirBackupStore::new(&backup_dir)?;
			if restore_primary_descriptor(&mut device, &located, &mut store)? {
				println!("✅ Primary superblock restored (original saved in {})", backup_dir.display());
			} else {
				println!("ℹ️  Primary superblock is already valid");
			}
		}
		Commands::Rollback { image, backup_dir } => {
			let mut device = BlockDevice::open_writable(&image)?;
			let store = DirBackupStore::new(&backup_dir)?;
			let restored = store.restore_all(&mut device)?;
			println!("♻️  Restored {} regions from {}", restored, backup_dir.display());
		}
		Commands::FindVolumes { image } => {
			let device = BlockDevice::open(&image)?;
			let volumes = find_volumes(&device, &config.volume_scan);
			if volumes.is_empty() {
				println!("❌ No ext4 volumes found");
			}
			for volume in volumes {
				println!(
					"✅ offset {:>14}  sector {:>10}  {:>8} MB  {}-byte blocks  '{}'",
					volume.offset,
					volume.start_sector,
					volume.size_bytes / (1024 * 1024),
					volume.block_size,
					volume.descriptor.volume_name()
				);
			}
		}
	}
	Ok(())
}

/// A progress bar on interactive terminals only
fn progress_bar(total: u64) -> Option<ProgressBar> {
	if !atty::is(atty::Stream::Stderr) {
		return None;
	}
	let bar = ProgressBar::new(total);
	if let Ok(style) = ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} blocks {msg}") {
		bar.set_style(style);
	}
	Some(bar)
}

fn update_bar(bar: &ProgressBar, progress: &ScanProgress) {
	bar.set_position(progress.current);
	bar.set_message(format!("{} found", progress.found));
}

fn emit_report(report: &str, out: Option<&Path>) -> Result<()> {
	match out {
		Some(path) => {
			std::fs::write(path, report).with_context(|| format!("writing {}", path.display()))?;
			println!("✅ Report written to {}", path.display());
		}
		None => print!("{}", report),
	}
	Ok(())
}
