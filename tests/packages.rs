use anyhow::{bail, Result};
use camino::Utf8PathBuf;

use pakfs::*;

mod common;
use common::*;

#[test]
fn pak_ignores_partial_records() -> Result<()> {
    init_logging();
    // 112 bytes of directory: one 64-byte record and 48 bytes of leftovers
    let pak = pak(&[("maps/e1m1.bsp", &b"not really a map"[..])], 48);
    assert_eq!(&pak[4..12], &[12, 0, 0, 0, 112, 0, 0, 0]);

    let mut package = Package::new(PackageType::None);
    package.open_bytes(pak)?;
    assert_eq!(package.package_type(), PackageType::Pak);
    let tree = package.tree()?;
    assert_eq!(tree.file_count(), 1);

    let map = package.lookup("maps/e1m1.bsp")?;
    assert_eq!(package.create_stream(map)?.to_vec()?, b"not really a map");
    assert_eq!(package.validate(map)?, Validation::AssumedOk);
    Ok(())
}

#[test]
fn zip_reports_what_it_stores() -> Result<()> {
    init_logging();
    let mut package = Package::new(PackageType::None);
    package.open_bytes(zip(&[ZipEntry {
        method: 12,
        crc: Some(0x1234_5678),
        ..ZipEntry::stored("bzipped.txt", b"pretend")
    }]))?;
    assert_eq!(package.package_type(), PackageType::Zip);
    assert_eq!(package.tree()?.file_count(), 1);

    let item = package.lookup("bzipped.txt")?;
    let attributes = package.item_attributes(item)?;
    assert_eq!(
        find_attribute(&attributes, "Compression Method").map(ToString::to_string),
        Some("12".to_owned())
    );
    assert_eq!(
        find_attribute(&attributes, "CRC").map(ToString::to_string),
        Some("0x12345678".to_owned())
    );

    match package.create_stream(item) {
        Err(PakError::Extraction(ExtractionError::UnsupportedCompression(12))) => {}
        other => bail!("Expected unsupported compression, got {:?}", other),
    }
    // Still open and usable after an item-level failure
    assert!(package.is_open());
    assert_eq!(package.size(item)?, 7);
    assert_eq!(package.validate(item)?, Validation::AssumedOk);
    Ok(())
}

#[test]
fn zip_unknown_section_unmaps_everything() -> Result<()> {
    init_logging();
    let mut bytes = zip(&[ZipEntry::stored("a.txt", b"abc")]);
    let at = ZIP_LOCAL_HEADER_SIZE + "a.txt".len() + 3;
    bytes.splice(at..at, *b"\xde\xad\xbe\xef");

    let mapping = Mapping::from_bytes(bytes);
    let views = mapping.view_counter();
    let mut package = Package::new(PackageType::Zip);
    match package.open_mapping(mapping, PackageOptions::default()) {
        Err(PakError::Format(FormatError::UnknownSection { offset, signature })) => {
            assert_eq!(offset, at as u64);
            assert_eq!(signature, 0xefbeadde);
        }
        other => bail!("Expected an unknown section, got {:?}", other),
    }
    assert_eq!(package.state(), PackageState::Closed);
    assert_eq!(views.mapped(), 0);
    assert!(matches!(package.tree(), Err(PakError::NotOpen)));
    Ok(())
}

#[test]
fn corruption_flips_validation() -> Result<()> {
    init_logging();
    let mut bytes = zip(&[
        ZipEntry::stored("good.txt", b"all is well"),
        ZipEntry::stored("bad.txt", b"soon to be corrupt"),
        ZipEntry {
            method: 8,
            ..ZipEntry::stored("deflated.txt", b"can't check this")
        },
    ]);

    let mut package = Package::new(PackageType::Zip);
    package.open_bytes(bytes.clone())?;
    let bad = package.lookup("bad.txt")?;
    assert_eq!(package.validate(bad)?, Validation::Ok);
    package.close();

    let at = bytes
        .windows(4)
        .position(|w| w == b"soon")
        .expect("no data to corrupt");
    bytes[at] ^= 0xff;
    package.open_bytes(bytes)?;

    let good = package.lookup("good.txt")?;
    let bad = package.lookup("bad.txt")?;
    let deflated = package.lookup("deflated.txt")?;
    assert_eq!(package.validate(good)?, Validation::Ok);
    assert_eq!(package.validate(bad)?, Validation::Corrupt);
    assert_eq!(package.validate(deflated)?, Validation::AssumedOk);
    // Folders report the worst of what's in them.
    assert_eq!(package.validate(package.root()?)?, Validation::Corrupt);
    Ok(())
}

#[test]
fn bsp_textures_become_bitmaps() -> Result<()> {
    init_logging();
    let bsp = bsp(b"{\n\"classname\" \"worldspawn\"\n}\n\0", &[mip_texture("crate", 16, 16)]);
    let mut package = Package::new(PackageType::None);
    package.open_bytes(bsp)?;
    assert_eq!(package.package_type(), PackageType::Bsp);

    let texture = package.lookup("crate.bmp")?;
    let expected_size = 14 + 40 + 256 * 4 + 16 * 16;
    assert_eq!(package.size(texture)?, expected_size);

    let bitmap = package.create_stream(texture)?.to_vec()?;
    assert_eq!(bitmap.len() as u64, expected_size);
    assert_eq!(&bitmap[..2], b"BM");
    // Gray ramp, as BGR0
    assert_eq!(&bitmap[54 + 4 * 7..54 + 4 * 8], &[7, 7, 7, 0]);
    // Rows are stored bottom-up, so the last row comes first.
    let pixels = &bitmap[54 + 1024..];
    assert!(pixels[..16].iter().all(|&p| p == 15));
    assert!(pixels[16 * 15..].iter().all(|&p| p == 0));

    let entities = package.lookup("entities.ent")?;
    assert_eq!(package.size(entities)?, 29);
    Ok(())
}

#[test]
fn open_and_close() -> Result<()> {
    init_logging();
    let mapping = Mapping::from_bytes(zip(&[
        ZipEntry::stored("one.txt", b"1"),
        ZipEntry::stored("sub/two.txt", b"22"),
    ]));
    let views = mapping.view_counter();

    let mut package = Package::new(PackageType::Zip);
    assert_eq!(package.state(), PackageState::Closed);
    package.open_mapping(mapping, PackageOptions::default())?;
    assert_eq!(package.state(), PackageState::Open);
    assert_eq!(views.mapped(), 0);

    {
        let two = package.lookup("sub/two.txt")?;
        let mut stream = package.create_stream(two)?;
        assert_eq!(views.mapped(), 1);
        assert_eq!(stream.to_vec()?, b"22");
    }
    assert_eq!(views.mapped(), 0);
    assert_eq!(package.size(package.lookup("sub")?)?, 2);

    package.close();
    package.close();
    assert_eq!(package.state(), PackageState::Closed);
    assert_eq!(views.mapped(), 0);
    assert!(matches!(package.lookup("one.txt"), Err(PakError::NotOpen)));
    Ok(())
}

#[test]
fn open_from_disk() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let dir_path = Utf8PathBuf::from_path_buf(dir.path().to_owned())
        .map_err(|p| anyhow::anyhow!("Non-UTF-8 temp dir {}", p.display()))?;
    let path = dir_path.join("base.pak");
    std::fs::write(&path, pak(&[("gfx/palette.lmp", &[1, 2, 3][..])], 0))?;

    assert_eq!(PackageType::detect(&path)?, PackageType::Pak);
    for mode in [OpenMode::READ, OpenMode::READ.without_mapping()] {
        let package = Package::open_path(&path, mode)?;
        assert_eq!(package.path(), Some(path.as_path()));
        let palette = package.lookup("gfx\\palette.lmp")?;
        assert_eq!(package.create_stream(palette)?.to_vec()?, vec![1, 2, 3]);
    }

    // Telling it the wrong type fails cleanly.
    let mut package = Package::new(PackageType::Wad);
    assert!(matches!(
        package.open(&path, OpenMode::READ),
        Err(PakError::Format(FormatError::InvalidSignature { .. }))
    ));
    assert!(!package.is_open());
    Ok(())
}

#[test]
fn user_paths_are_checked() -> Result<()> {
    init_logging();
    let mut package = Package::new(PackageType::Pak);
    package.open_bytes(pak(&[("readme.txt", &b"hi"[..])], 0))?;
    assert!(matches!(
        package.lookup("../readme.txt"),
        Err(PakError::InvalidPath(_))
    ));
    match package.lookup("nope.txt") {
        Err(PakError::NoSuchFile(p)) => assert_eq!(p, "nope.txt"),
        other => bail!("Expected no such file, got {:?}", other),
    }
    let root = package.root()?;
    assert!(matches!(package.create_stream(root), Err(PakError::NotAFile)));
    Ok(())
}

#[test]
fn ids_from_another_package() -> Result<()> {
    init_logging();
    let mut big = Package::new(PackageType::Pak);
    big.open_bytes(pak(
        &[
            ("maps/e1m1.bsp", &b"one"[..]),
            ("maps/e1m2.bsp", &b"two"[..]),
            ("sound/door.wav", &b"creak"[..]),
        ],
        0,
    ))?;
    let door = big.lookup("sound/door.wav")?;

    let mut small = Package::new(PackageType::Pak);
    small.open_bytes(pak(&[("readme.txt", &b"hi"[..])], 0))?;
    assert!(!small.tree()?.contains(door));

    assert!(matches!(small.size(door), Err(PakError::NoSuchItem(_))));
    assert!(matches!(small.size_on_disk(door), Err(PakError::NoSuchItem(_))));
    assert!(matches!(small.validate(door), Err(PakError::NoSuchItem(_))));
    assert!(matches!(small.item_attributes(door), Err(PakError::NoSuchItem(_))));
    match small.create_stream(door) {
        Err(PakError::NoSuchItem(id)) => assert_eq!(id, door),
        other => bail!("Expected no such item, got {:?}", other),
    }
    assert!(small.is_open());
    assert_eq!(small.size(small.lookup("readme.txt")?)?, 2);
    Ok(())
}
