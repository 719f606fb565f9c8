use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::*;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use log::*;
use rayon::prelude::*;
use structopt::*;

use pakfs::{OpenMode, Package, PackageOptions, PackageType, Validation};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "pakinfo",
    about = "Describes a game data package and dumps its files into the current directory"
)]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Change to the given directory before perfoming any operations.
    #[structopt(short = "C", long)]
    directory: Option<PathBuf>,

    /// List what would be extracted without writing anything.
    #[structopt(short = "n", long)]
    dry_run: bool,

    /// Read the package into memory instead of memory-mapping it.
    #[structopt(long)]
    no_mmap: bool,

    /// Check every file's checksum instead of extracting.
    #[structopt(long)]
    validate: bool,

    /// Where to find the files an NCF describes
    #[structopt(long)]
    root: Option<PathBuf>,

    #[structopt(name("package"))]
    package_path: PathBuf,
}

fn utf8(path: PathBuf) -> Result<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(path).map_err(|p| anyhow!("{} isn't UTF-8", p.display()))
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    // Resolve paths before we move.
    let package_path = utf8(
        fs::canonicalize(&args.package_path)
            .with_context(|| format!("Couldn't find {}", args.package_path.display()))?,
    )?;
    let root_path = args
        .root
        .map(|r| fs::canonicalize(&r).with_context(|| format!("Couldn't find {}", r.display())))
        .transpose()?
        .map(utf8)
        .transpose()?;

    if let Some(chto) = args.directory {
        std::env::set_current_dir(&chto)
            .with_context(|| format!("Couldn't set working directory to {}", chto.display()))?;
    }

    let mode = if args.no_mmap {
        OpenMode::READ.without_mapping()
    } else {
        OpenMode::READ
    };
    let options = PackageOptions { mode, root_path };

    let package_type = PackageType::detect(&package_path)
        .with_context(|| format!("Couldn't read {}", package_path))?;
    let mut package = Package::new(package_type);
    package
        .open(&package_path, options)
        .with_context(|| format!("Couldn't open {} as a {} package", package_path, package_type))?;

    describe(&package)?;
    if args.validate {
        validate(&package)
    } else {
        extract(&package, args.dry_run)
    }
}

fn describe(package: &Package) -> Result<()> {
    let tree = package.tree()?;
    println!("{} package", package.package_type());
    for attribute in package.attributes()? {
        println!("  {}", attribute);
    }
    println!(
        "  {} files, {} folders",
        tree.file_count(),
        tree.folders().count()
    );
    Ok(())
}

fn validate(package: &Package) -> Result<()> {
    let tree = package.tree()?;
    let files: Vec<_> = tree.files().map(|f| f.id()).collect();
    let corrupt = AtomicUsize::new(0);

    files.par_iter().try_for_each(|&file| -> Result<()> {
        let result = package.validate(file)?;
        debug!("{}: {}", tree.path(file), result);
        if result == Validation::Corrupt {
            println!("{}: {}", tree.path(file), result);
            corrupt.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    })?;

    let package_result = package.validate_package()?;
    println!("Package: {}", package_result);

    let corrupt = corrupt.into_inner();
    if corrupt > 0 || package_result == Validation::Corrupt {
        bail!("{} of {} files are corrupt", corrupt, files.len());
    }
    println!("{} files OK", files.len());
    Ok(())
}

fn extract(package: &Package, dry_run: bool) -> Result<()> {
    let tree = package.tree()?;
    let files: Vec<_> = tree.files().map(|f| f.id()).collect();
    let skipped = AtomicUsize::new(0);

    files.par_iter().try_for_each(|&file| -> Result<()> {
        let path = tree.path(file);
        if dry_run {
            println!("{} ({} bytes)", path, package.size(file)?);
            return Ok(());
        }
        // Names come from the package; don't let them climb out of the current directory.
        if !path
            .components()
            .all(|c| matches!(c, Utf8Component::Normal(_)))
        {
            warn!("Skipping {}: not a relative path", path);
            skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let mut stream = match package.create_stream(file) {
            // One unreadable file shouldn't stop the rest.
            Err(e) if e.is_item_local() => {
                warn!("Skipping {}: {}", path, e);
                skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            result => result?,
        };
        create_parent(&path)?;
        let mut sink =
            File::create(&path).with_context(|| format!("Couldn't create file {}", path))?;
        io::copy(&mut stream, &mut sink).with_context(|| format!("Couldn't extract {}", path))?;
        Ok(())
    })?;

    let skipped = skipped.into_inner();
    if skipped > 0 {
        warn!("Skipped {} of {} files", skipped, files.len());
    }
    Ok(())
}

fn create_parent(path: &Utf8Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Couldn't create directory {}", parent))?;
        }
    }
    Ok(())
}
