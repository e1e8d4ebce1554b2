use std::sync::Arc;

mod common;

use common::*;
use nffs::AreaDesc;
use nffs::Config;
use nffs::DetectState;
use nffs::Detector;
use nffs::Error;
use nffs::FileSystem;
use nffs::BLOCK_FIXED_SIZE;
use nffs::OBJECT_HEADER_SIZE;

fn remount(flash: &Arc<RamFlash>, descs: &[AreaDesc], config: Config) -> FileSystem<RamFlash> {
    FileSystem::mount(Arc::clone(flash), descs, config).unwrap()
}

/// Absolute flash address of a record's location.
fn addr_of(descs: &[AreaDesc], area: u8, offset: u32) -> u32 {
    descs[area as usize].offset + offset
}

#[test]
fn test_round_trip() {
    init_logger();
    let config = small_blocks(48);
    let (flash, descs) = RamFlash::with_areas(4, 2048);
    let mut fs = FileSystem::format(Arc::clone(&flash), &descs, config).unwrap();
    fs.mkdir("/etc").unwrap();
    fs.mkdir("/var").unwrap();
    fs.mkdir("/var/log").unwrap();
    write_file(&mut fs, "/etc/motd", b"welcome").unwrap();
    write_file(&mut fs, "/var/log/boot", &pattern(200, 4)).unwrap();
    append_file(&mut fs, "/var/log/boot", b"tail").unwrap();
    write_file(&mut fs, "/empty", b"").unwrap();
    fs.rename("/etc/motd", "/var/motd").unwrap();
    let expected_dump = fs.dump();
    assert!(Arc::ptr_eq(&fs.unmount(), &flash));

    let mut fs = remount(&flash, &descs, config);
    log!("{}", fs.dump());
    assert_eq!(fs.dump(), expected_dump);
    assert_eq!(read_file(&mut fs, "/var/motd").unwrap(), b"welcome");
    let mut boot = pattern(200, 4);
    boot.extend_from_slice(b"tail");
    assert_eq!(read_file(&mut fs, "/var/log/boot").unwrap(), boot);
    assert_eq!(fs.file_len("/empty").unwrap(), 0);
    assert!(!fs.exists("/etc/motd"));

    // New ids never collide with ids already on flash.
    let old_ids: Vec<u32> = fs.tree().iter().map(|e| e.id).collect();
    let id = fs.create("/etc/new").unwrap();
    assert!(!old_ids.contains(&id));
}

#[test]
fn test_mount_is_idempotent() {
    init_logger();
    let config = small_blocks(32);
    let (flash, descs) = RamFlash::with_areas(3, 1024);
    let mut fs = FileSystem::format(Arc::clone(&flash), &descs, config).unwrap();
    for i in 0..6u8 {
        write_file(&mut fs, &format!("/f{}", i), &pattern(60, i)).unwrap();
    }
    for i in 0..3u8 {
        fs.unlink(&format!("/f{}", i * 2)).unwrap();
    }
    drop(fs);

    let first = remount(&flash, &descs, config);
    let dump = first.dump();
    drop(first);
    let image = flash.snapshot();
    let second = remount(&flash, &descs, config);
    assert_eq!(second.dump(), dump);
    assert_eq!(flash.snapshot(), image);
}

#[test]
fn test_corrupt_block_drops_only_its_file() {
    init_logger();
    let config = Config::default();
    let (flash, descs) = RamFlash::with_areas(4, 4096);
    let mut fs = FileSystem::format(Arc::clone(&flash), &descs, config).unwrap();
    fs.mkdir("/mydir").unwrap();
    write_file(&mut fs, "/mydir/a", b"aaaa").unwrap();
    write_file(&mut fs, "/mydir/b", b"abcd").unwrap();
    append_file(&mut fs, "/mydir/b", b"1234").unwrap();
    write_file(&mut fs, "/mydir/c", b"cccc").unwrap();

    let b = fs.lookup("/mydir/b").unwrap().0;
    let second = fs.get_inode(b).unwrap().as_file().unwrap().newest_block;
    let loc = fs.index().lookup(second).unwrap().loc;
    let data = addr_of(&descs, loc.area, loc.offset) + (OBJECT_HEADER_SIZE + BLOCK_FIXED_SIZE) as u32;
    drop(fs);
    flash.corrupt(data, &[0x00, 0x00]);

    let mut fs = remount(&flash, &descs, config);
    log!("{}", fs.dump());
    assert!(!fs.exists("/mydir/b"));
    assert_eq!(read_file(&mut fs, "/mydir/a").unwrap(), b"aaaa");
    assert_eq!(read_file(&mut fs, "/mydir/c").unwrap(), b"cccc");
    let names: Vec<String> = fs.read_dir("/mydir").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, ["a", "c"]);

    // Recovery left a tombstone behind, so the next mount agrees without redoing it.
    let mut tombstones = 0;
    fs.walk_log(|entry| {
        if entry.id == b && entry.flags.contains(nffs::ObjectFlag::Tombstone) {
            tombstones += 1;
        }
    })
    .unwrap();
    assert_eq!(tombstones, 1);
    let dump = fs.dump();
    drop(fs);
    let image = flash.snapshot();
    let fs = remount(&flash, &descs, config);
    assert_eq!(fs.dump(), dump);
    assert_eq!(flash.snapshot(), image);
}

#[test]
fn test_corrupt_header_closes_area() {
    init_logger();
    let config = Config::default();
    let (flash, descs) = RamFlash::with_areas(3, 4096);
    let mut fs = FileSystem::format(Arc::clone(&flash), &descs, config).unwrap();
    write_file(&mut fs, "/first", b"1").unwrap();
    let cursor = fs.areas().area(fs.areas().current().unwrap()).cursor;
    let area = fs.areas().current().unwrap() as u8;
    write_file(&mut fs, "/second", b"2").unwrap();
    drop(fs);

    // Smash the magic of the record right after /first.
    flash.corrupt(addr_of(&descs, area, cursor), &[0u8; 4]);
    let mut fs = remount(&flash, &descs, config);
    assert_eq!(read_file(&mut fs, "/first").unwrap(), b"1");
    assert!(!fs.exists("/second"));
    // The damaged area takes no more appends.
    assert_ne!(fs.areas().current(), Some(area as usize));
    write_file(&mut fs, "/third", b"3").unwrap();
    assert_ne!(fs.lookup("/third").map(|(id, _)| fs.index().lookup(id).unwrap().loc.area), Ok(area));
}

#[test]
fn test_orphans_are_deleted() {
    init_logger();
    let config = Config::default();
    let (flash, descs) = RamFlash::with_areas(3, 4096);
    let mut fs = FileSystem::format(Arc::clone(&flash), &descs, config).unwrap();
    let dir = fs.mkdir("/d").unwrap();
    let child = fs.mkdir("/d/sub").unwrap();
    write_file(&mut fs, "/d/sub/x", b"orphan").unwrap();
    let file = fs.lookup("/d/sub/x").unwrap().0;
    write_file(&mut fs, "/y", b"stays").unwrap();

    // Power dies right after the directory's own tombstone lands.
    flash.fail_after(1);
    fs.unlink("/d").unwrap();
    flash.heal();
    drop(fs);

    let mut fs = remount(&flash, &descs, config);
    assert!(!fs.exists("/d"));
    assert_eq!(read_file(&mut fs, "/y").unwrap(), b"stays");
    assert!(!fs.tree().contains(child));
    assert!(!fs.tree().contains(file));
    let mut tombstoned = Vec::new();
    fs.walk_log(|entry| {
        if entry.flags.contains(nffs::ObjectFlag::Tombstone) {
            tombstoned.push(entry.id);
        }
    })
    .unwrap();
    tombstoned.sort();
    assert_eq!(tombstoned, [dir, child, file]);

    // A new directory must not inherit the old children.
    let again = fs.mkdir("/d").unwrap();
    assert_ne!(again, dir);
    assert!(fs.read_dir("/d").unwrap().is_empty());
}

#[test]
fn test_interrupted_append_keeps_old_content() {
    init_logger();
    let config = small_blocks(64);
    let (flash, descs) = RamFlash::with_areas(3, 4096);
    let mut fs = FileSystem::format(Arc::clone(&flash), &descs, config).unwrap();
    write_file(&mut fs, "/f", b"hello").unwrap();

    flash.fail_after(2);
    assert_eq!(append_file(&mut fs, "/f", &pattern(300, 0)).err(), Some(Error::IoError));
    flash.heal();
    assert_eq!(read_file(&mut fs, "/f").unwrap(), b"hello");
    drop(fs);

    let mut fs = remount(&flash, &descs, config);
    assert_eq!(read_file(&mut fs, "/f").unwrap(), b"hello");
    // root, /f and its one block; the two orphaned blocks are not indexed
    assert_eq!(fs.index().len(), 3);
}

#[test]
fn test_not_formatted() {
    init_logger();
    let (flash, descs) = RamFlash::with_areas(3, 1024);
    let mut detector = Detector::new(Arc::clone(&flash), &descs, Config::default());
    assert_eq!(detector.run().err(), Some(Error::FilesystemNotFormatted));
    assert_eq!(detector.state(), DetectState::Failed);

    let fs = FileSystem::format(Arc::clone(&flash), &descs, Config::default()).unwrap();
    drop(fs);
    let mut detector = Detector::new(flash, &descs, Config::default());
    assert!(detector.run().is_ok());
    assert_eq!(detector.state(), DetectState::Done);
}

#[test]
fn test_index_too_small_at_mount() {
    init_logger();
    let config = small_blocks(64);
    let (flash, descs) = RamFlash::with_areas(3, 4096);
    let mut fs = FileSystem::format(Arc::clone(&flash), &descs, config).unwrap();
    for i in 0..5 {
        write_file(&mut fs, &format!("/f{}", i), b"data").unwrap();
    }
    drop(fs);

    let tight = Config {
        max_objects: 8,
        ..config
    };
    assert_eq!(
        FileSystem::mount(Arc::clone(&flash), &descs, tight).err(),
        Some(Error::ConfigError)
    );
    assert!(FileSystem::mount(flash, &descs, config).is_ok());
}

#[test]
fn test_walk_log_sees_every_record() {
    init_logger();
    let config = small_blocks(64);
    let (flash, descs) = RamFlash::with_areas(3, 4096);
    let mut fs = FileSystem::format(flash, &descs, config).unwrap();
    write_file(&mut fs, "/f", &pattern(100, 2)).unwrap();
    fs.unlink("/f").unwrap();

    let mut kinds = Vec::new();
    let count = fs.walk_log(|entry| kinds.push((entry.kind, entry.flags.bits()))).unwrap();
    // root, /f, two blocks, the new /f version, the tombstone
    assert_eq!(count, 6);
    assert_eq!(kinds.iter().filter(|(k, _)| *k == nffs::ObjectKind::Block).count(), 2);
    assert_eq!(kinds.last(), Some(&(nffs::ObjectKind::Inode, 1)));
}

#[test]
fn test_missing_root_is_rewritten() {
    init_logger();
    let config = Config::default();
    let (flash, descs) = RamFlash::with_areas(3, 4096);
    let mut fs = FileSystem::format(Arc::clone(&flash), &descs, config).unwrap();
    let root_loc = fs.index().lookup(nffs::ROOT_DIR_ID).unwrap().loc;
    fs.mkdir("/boot").unwrap();
    write_file(&mut fs, "/boot/image", b"kernel").unwrap();
    drop(fs);

    // Break the root record's checksum.
    flash.corrupt(addr_of(&descs, root_loc.area, root_loc.offset) + 12, &[0u8; 4]);
    let mut fs = remount(&flash, &descs, config);
    assert_eq!(read_file(&mut fs, "/boot/image").unwrap(), b"kernel");
    assert_ne!(fs.index().lookup(nffs::ROOT_DIR_ID).unwrap().loc, root_loc);
    let mut roots = 0;
    fs.walk_log(|entry| {
        if entry.id == nffs::ROOT_DIR_ID {
            roots += 1;
        }
    })
    .unwrap();
    assert_eq!(roots, 1);

    drop(fs);
    let image = flash.snapshot();
    let fs = remount(&flash, &descs, config);
    assert!(fs.exists("/boot/image"));
    assert_eq!(flash.snapshot(), image);
}
