use anyhow::{ensure, Result};
use camino::Utf8PathBuf;
use rayon::prelude::*;

use pakfs::*;

mod common;
use common::*;

fn contents(i: usize) -> Vec<u8> {
    format!("file {} says hello\n", i).repeat(i + 1).into_bytes()
}

#[test]
fn many_readers_one_package() -> Result<()> {
    init_logging();
    let names: Vec<String> = (0..64).map(|i| format!("dir{}/file{}.txt", i % 4, i)).collect();
    let bodies: Vec<Vec<u8>> = (0..64).map(contents).collect();
    let entries: Vec<ZipEntry> = names
        .iter()
        .zip(&bodies)
        .map(|(n, b)| ZipEntry::stored(n, b))
        .collect();

    let dir = tempfile::tempdir()?;
    let dir_path = Utf8PathBuf::from_path_buf(dir.path().to_owned())
        .map_err(|p| anyhow::anyhow!("Non-UTF-8 temp dir {}", p.display()))?;
    let path = dir_path.join("many.zip");
    std::fs::write(&path, zip(&entries))?;

    let package = Package::open_path(&path, OpenMode::READ)?;
    let tree = package.tree()?;
    assert_eq!(tree.file_count(), 64);
    assert_eq!(tree.folders().count(), 4);

    // Every file, twice over, from every thread rayon gives us.
    (0..128usize).into_par_iter().try_for_each(|n| -> Result<()> {
        let i = n % 64;
        let item = package.lookup(&names[i])?;
        let read = package.create_stream(item)?.to_vec()?;
        ensure!(read == bodies[i], "{} came back wrong", names[i]);
        ensure!(
            package.validate(item)? == Validation::Ok,
            "{} didn't validate",
            names[i]
        );
        Ok(())
    })?;

    assert_eq!(package.validate(package.root()?)?, Validation::Ok);
    Ok(())
}

#[test]
fn streams_share_a_mapping() -> Result<()> {
    init_logging();
    let files: Vec<(String, Vec<u8>)> = (0..16)
        .map(|i| (format!("sound/s{}.wav", i), contents(i)))
        .collect();
    let borrowed: Vec<(&str, &[u8])> = files
        .iter()
        .map(|(n, b)| (n.as_str(), b.as_slice()))
        .collect();

    let mapping = Mapping::from_bytes(pak(&borrowed, 0));
    let views = mapping.view_counter();
    let mut package = Package::new(PackageType::Pak);
    package.open_mapping(mapping, PackageOptions::default())?;

    let ids: Vec<_> = package.tree()?.files().map(|f| f.id()).collect();
    let streams = ids
        .iter()
        .map(|&id| package.create_stream(id))
        .collect::<PakResult<Vec<_>>>()?;
    assert_eq!(views.mapped(), 16);

    let total: u64 = streams.par_iter().map(|s| s.len()).sum();
    assert_eq!(total, package.size(package.root()?)?);

    drop(streams);
    assert_eq!(views.mapped(), 0);
    package.close();
    assert_eq!(views.mapped(), 0);
    Ok(())
}
