//! End-to-end tests over a synthetic in-memory NTFS volume.
//!
//! The builder below assembles a miniature but structurally honest volume:
//! a valid boot sector, a fixed-up 16-record MFT, nested directories with
//! resident `$I30` indexes (including a deleted entry left in slack), a
//! resident file with an alternate data stream, a compressed multi-VCN
//! file, `$Volume` metadata and a `$Extend\$UsnJrnl:$J` journal with a
//! sparse prefix.
//!
//! Geometry: 512-byte sectors, 2 sectors per cluster (1 KiB clusters),
//! 1 KiB MFT records, MFT at cluster 10.
//!
//! Run with: cargo test --test ntfs_volume

use std::sync::Arc;

use rusty_ntfs::{
    extract_i30_list, get_data_for_mft_id, get_data_for_path, list_dir, open_usn_stream,
    parse_mft_id, parse_usn, stat, CancelToken, NtfsContext, PagedReader, ReadAt,
};

const CLUSTER: usize = 1024;
const RECORD: usize = 1024;
const MFT_CLUSTER: usize = 10;
const MFT_RECORDS: usize = 16;

// MFT ids used by the fixture.
const ID_MFT: u64 = 0;
const ID_VOLUME: u64 = 3;
const ID_ROOT: u64 = 5;
const ID_FOLDER_A: u64 = 6;
const ID_FOLDER_B: u64 = 7;
const ID_HELLO: u64 = 8;
const ID_ONES: u64 = 9;
const ID_EXTEND: u64 = 10;
const ID_USNJRNL: u64 = 11;

// Data placement.
const ONES_PAYLOAD_CLUSTER: usize = 30;
const USN_DATA_CLUSTER: usize = 40;

const TS_2021: u64 = 132_539_328_000_000_000; // 2021-01-01T00:00:00Z
const TS_2022: u64 = 132_854_688_000_000_000; // 2022-01-01T00:00:00Z

// ---------------------------------------------------------------------------
// On-disk structure builders
// ---------------------------------------------------------------------------

fn boot_sector() -> Vec<u8> {
    let mut vbr = vec![0u8; 512];
    vbr[0] = 0xEB;
    vbr[1] = 0x52;
    vbr[2] = 0x90;
    vbr[3..11].copy_from_slice(b"NTFS    ");
    vbr[11..13].copy_from_slice(&512u16.to_le_bytes());
    vbr[13] = 2; // sectors per cluster
    vbr[40..48].copy_from_slice(&128u64.to_le_bytes()); // total sectors (64 KiB)
    vbr[48..56].copy_from_slice(&(MFT_CLUSTER as u64).to_le_bytes());
    vbr[56..64].copy_from_slice(&20u64.to_le_bytes()); // mirror (unused)
    vbr[64] = (-10i8) as u8; // 1 KiB records
    vbr[510] = 0x55;
    vbr[511] = 0xAA;
    vbr
}

fn resident_attr(attr_type: u32, attr_id: u16, name: &str, content: &[u8]) -> Vec<u8> {
    let name_utf16: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    let name_offset = 24usize;
    let content_offset = name_offset + name_utf16.len();
    let total = (content_offset + content.len() + 7) & !7;

    let mut attr = vec![0u8; total];
    attr[0..4].copy_from_slice(&attr_type.to_le_bytes());
    attr[4..8].copy_from_slice(&(total as u32).to_le_bytes());
    attr[8] = 0; // resident
    attr[9] = name.encode_utf16().count() as u8;
    attr[10..12].copy_from_slice(&(name_offset as u16).to_le_bytes());
    attr[14..16].copy_from_slice(&attr_id.to_le_bytes());
    attr[16..20].copy_from_slice(&(content.len() as u32).to_le_bytes());
    attr[20..22].copy_from_slice(&(content_offset as u16).to_le_bytes());
    attr[name_offset..content_offset].copy_from_slice(&name_utf16);
    attr[content_offset..content_offset + content.len()].copy_from_slice(content);
    attr
}

#[allow(clippy::too_many_arguments)]
fn nonresident_attr(
    attr_type: u32,
    attr_id: u16,
    name: &str,
    flags: u16,
    vcn: (u64, u64),
    runlist: &[u8],
    comp_exp: u16,
    sizes: (u64, u64, u64), // allocated, actual, initialized
) -> Vec<u8> {
    let name_utf16: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    let name_offset = 64usize;
    let runlist_offset = (name_offset + name_utf16.len() + 7) & !7;
    let total = (runlist_offset + runlist.len() + 7) & !7;

    let mut attr = vec![0u8; total];
    attr[0..4].copy_from_slice(&attr_type.to_le_bytes());
    attr[4..8].copy_from_slice(&(total as u32).to_le_bytes());
    attr[8] = 1; // non-resident
    attr[9] = name.encode_utf16().count() as u8;
    attr[10..12].copy_from_slice(&(name_offset as u16).to_le_bytes());
    attr[12..14].copy_from_slice(&flags.to_le_bytes());
    attr[14..16].copy_from_slice(&attr_id.to_le_bytes());
    attr[16..24].copy_from_slice(&vcn.0.to_le_bytes());
    attr[24..32].copy_from_slice(&vcn.1.to_le_bytes());
    attr[32..34].copy_from_slice(&(runlist_offset as u16).to_le_bytes());
    attr[34..36].copy_from_slice(&comp_exp.to_le_bytes());
    attr[40..48].copy_from_slice(&sizes.0.to_le_bytes());
    attr[48..56].copy_from_slice(&sizes.1.to_le_bytes());
    attr[56..64].copy_from_slice(&sizes.2.to_le_bytes());
    attr[name_offset..name_offset + name_utf16.len()].copy_from_slice(&name_utf16);
    attr[runlist_offset..runlist_offset + runlist.len()].copy_from_slice(runlist);
    attr
}

fn si_content(filetime: u64) -> Vec<u8> {
    let mut content = vec![0u8; 72];
    for off in [0usize, 8, 16, 24] {
        content[off..off + 8].copy_from_slice(&filetime.to_le_bytes());
    }
    content[32..36].copy_from_slice(&0x20u32.to_le_bytes()); // ARCHIVE
    content
}

fn file_name_content(name: &str, name_type: u8, parent: u64, parent_seq: u16, size: u64) -> Vec<u8> {
    let mut content = vec![0u8; 66];
    let reference = parent | ((parent_seq as u64) << 48);
    content[0..8].copy_from_slice(&reference.to_le_bytes());
    for off in [8usize, 16, 24, 32] {
        content[off..off + 8].copy_from_slice(&TS_2021.to_le_bytes());
    }
    content[40..48].copy_from_slice(&size.to_le_bytes());
    content[48..56].copy_from_slice(&size.to_le_bytes());
    content[64] = name.encode_utf16().count() as u8;
    content[65] = name_type;
    content.extend(name.encode_utf16().flat_map(|u| u.to_le_bytes()));
    content
}

/// One `$I30` entry: header + embedded FILE_NAME, 8-aligned.
fn index_entry(mft_ref: u64, seq: u16, name: &str, is_dir: bool) -> Vec<u8> {
    let mut file_name = file_name_content(name, 1, 0, 0, 13);
    if is_dir {
        file_name[56..60].copy_from_slice(&0x1000_0000u32.to_le_bytes());
    }
    let size = (16 + file_name.len() + 7) & !7;
    let mut entry = vec![0u8; size];
    let reference = mft_ref | ((seq as u64) << 48);
    entry[0..8].copy_from_slice(&reference.to_le_bytes());
    entry[8..10].copy_from_slice(&(size as u16).to_le_bytes());
    entry[10..12].copy_from_slice(&(file_name.len() as u16).to_le_bytes());
    entry[16..16 + file_name.len()].copy_from_slice(&file_name);
    entry
}

/// An `$INDEX_ROOT` value: 16-byte root header, node header, entries,
/// then `slack` bytes inside the allocated area.
fn index_root_content(entries: &[Vec<u8>], slack: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    for entry in entries {
        body.extend_from_slice(entry);
    }
    let mut root = vec![0u8; 32];
    root[0..4].copy_from_slice(&0x30u32.to_le_bytes()); // indexes $FILE_NAME
    root[4..8].copy_from_slice(&1u32.to_le_bytes()); // collation
    root[8..12].copy_from_slice(&4096u32.to_le_bytes()); // block size
    root[12] = 1;
    // Node header at 16.
    root[16..20].copy_from_slice(&16u32.to_le_bytes());
    root[20..24].copy_from_slice(&((16 + body.len()) as u32).to_le_bytes());
    root.extend_from_slice(&body);
    root.extend_from_slice(slack);
    root.extend_from_slice(&[0u8; 0x60]); // room for the slack margin
    let alloc = (root.len() - 16) as u32;
    root[24..28].copy_from_slice(&alloc.to_le_bytes());
    root
}

/// A fixed-up MFT record with the given attributes and an end marker.
fn mft_record(record_number: u64, sequence: u16, flags: u16, attrs: &[Vec<u8>]) -> Vec<u8> {
    let mut rec = vec![0u8; RECORD];
    rec[0..4].copy_from_slice(b"FILE");
    rec[4..6].copy_from_slice(&48u16.to_le_bytes());
    rec[6..8].copy_from_slice(&3u16.to_le_bytes());
    rec[8..16].copy_from_slice(&0x42u64.to_le_bytes()); // lsn
    rec[16..18].copy_from_slice(&sequence.to_le_bytes());
    rec[18..20].copy_from_slice(&1u16.to_le_bytes());
    rec[20..22].copy_from_slice(&56u16.to_le_bytes());
    rec[22..24].copy_from_slice(&flags.to_le_bytes());
    rec[28..32].copy_from_slice(&(RECORD as u32).to_le_bytes());
    rec[40..42].copy_from_slice(&9u16.to_le_bytes());
    rec[44..48].copy_from_slice(&(record_number as u32).to_le_bytes());

    let mut offset = 56;
    for attr in attrs {
        assert!(offset + attr.len() < RECORD, "record overflow");
        rec[offset..offset + attr.len()].copy_from_slice(attr);
        offset += attr.len();
    }
    rec[offset..offset + 4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    offset += 8;
    rec[24..28].copy_from_slice(&(offset as u32).to_le_bytes());

    // Stash the true sector tails in the fixup table, stamp the magic.
    let magic = 0x4242u16;
    rec[48..50].copy_from_slice(&magic.to_le_bytes());
    for sector in 0..2usize {
        let tail = (sector + 1) * 512 - 2;
        let table = 50 + sector * 2;
        rec[table] = rec[tail];
        rec[table + 1] = rec[tail + 1];
        rec[tail..tail + 2].copy_from_slice(&magic.to_le_bytes());
    }
    rec
}

fn usn_record(usn: u64, file_ref: u64, file_seq: u16, parent_ref: u64, parent_seq: u16, name: &str) -> Vec<u8> {
    let name_bytes: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    let length = (60 + name_bytes.len() + 7) & !7;
    let mut rec = vec![0u8; length];
    rec[0..4].copy_from_slice(&(length as u32).to_le_bytes());
    rec[4..6].copy_from_slice(&2u16.to_le_bytes());
    rec[8..16].copy_from_slice(&(file_ref | ((file_seq as u64) << 48)).to_le_bytes());
    rec[16..24].copy_from_slice(&(parent_ref | ((parent_seq as u64) << 48)).to_le_bytes());
    rec[24..32].copy_from_slice(&usn.to_le_bytes());
    rec[32..40].copy_from_slice(&TS_2022.to_le_bytes());
    rec[40..44].copy_from_slice(&0x8000_0200u32.to_le_bytes()); // FILE_DELETE|CLOSE
    rec[56..58].copy_from_slice(&(name_bytes.len() as u16).to_le_bytes());
    rec[58..60].copy_from_slice(&60u16.to_le_bytes());
    rec[60..60 + name_bytes.len()].copy_from_slice(&name_bytes);
    rec
}

/// Assemble the whole 64 KiB volume image.
fn build_volume() -> Vec<u8> {
    let mut image = vec![0u8; 64 * 1024];
    image[..512].copy_from_slice(&boot_sector());

    let mut put_record = |id: u64, rec: Vec<u8>| {
        let offset = MFT_CLUSTER * CLUSTER + id as usize * RECORD;
        image[offset..offset + RECORD].copy_from_slice(&rec);
    };

    // 0: $MFT — its $DATA maps the 16-record table itself.
    put_record(
        ID_MFT,
        mft_record(
            ID_MFT,
            1,
            0x01,
            &[
                resident_attr(0x10, 0, "", &si_content(TS_2021)),
                resident_attr(0x30, 2, "", &file_name_content("$MFT", 3, ID_ROOT, 1, 0)),
                nonresident_attr(
                    0x80,
                    3,
                    "",
                    0,
                    (0, (MFT_RECORDS - 1) as u64),
                    &[0x11, MFT_RECORDS as u8, MFT_CLUSTER as u8, 0x00],
                    0,
                    (
                        (MFT_RECORDS * RECORD) as u64,
                        (MFT_RECORDS * RECORD) as u64,
                        (MFT_RECORDS * RECORD) as u64,
                    ),
                ),
            ],
        ),
    );

    // 3: $Volume — label and version.
    let label: Vec<u8> = "EVIDENCE".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    let mut volume_info = vec![0u8; 12];
    volume_info[8] = 3;
    volume_info[9] = 1;
    put_record(
        ID_VOLUME,
        mft_record(
            ID_VOLUME,
            1,
            0x01,
            &[
                resident_attr(0x10, 0, "", &si_content(TS_2021)),
                resident_attr(0x30, 2, "", &file_name_content("$Volume", 3, ID_ROOT, 1, 0)),
                resident_attr(0x60, 3, "", &label),
                resident_attr(0x70, 4, "", &volume_info),
            ],
        ),
    );

    // 5: root directory.
    put_record(
        ID_ROOT,
        mft_record(
            ID_ROOT,
            1,
            0x03,
            &[
                resident_attr(0x10, 0, "", &si_content(TS_2021)),
                resident_attr(0x30, 2, "", &file_name_content(".", 3, ID_ROOT, 1, 0)),
                resident_attr(
                    0x90,
                    4,
                    "$I30",
                    &index_root_content(
                        &[
                            index_entry(ID_EXTEND, 1, "$Extend", true),
                            index_entry(ID_FOLDER_A, 1, "Folder A", true),
                            index_entry(ID_ONES, 1, "ones.bin", false),
                        ],
                        &[],
                    ),
                ),
            ],
        ),
    );

    // 6: Folder A.
    put_record(
        ID_FOLDER_A,
        mft_record(
            ID_FOLDER_A,
            1,
            0x03,
            &[
                resident_attr(0x10, 0, "", &si_content(TS_2021)),
                resident_attr(0x30, 2, "", &file_name_content("Folder A", 1, ID_ROOT, 1, 0)),
                resident_attr(
                    0x90,
                    4,
                    "$I30",
                    &index_root_content(&[index_entry(ID_FOLDER_B, 1, "Folder B", true)], &[]),
                ),
            ],
        ),
    );

    // 7: Folder B — one live file plus a deleted entry in index slack.
    put_record(
        ID_FOLDER_B,
        mft_record(
            ID_FOLDER_B,
            1,
            0x03,
            &[
                resident_attr(0x10, 0, "", &si_content(TS_2021)),
                resident_attr(0x30, 2, "", &file_name_content("Folder B", 1, ID_FOLDER_A, 1, 0)),
                resident_attr(
                    0x90,
                    4,
                    "$I30",
                    &index_root_content(
                        &[index_entry(
                            ID_HELLO,
                            1,
                            "Hello world text document.txt",
                            false,
                        )],
                        &index_entry(99, 2, "old doc.txt", false),
                    ),
                ),
            ],
        ),
    );

    // 8: the text document with an alternate stream.
    put_record(
        ID_HELLO,
        mft_record(
            ID_HELLO,
            1,
            0x01,
            &[
                resident_attr(0x10, 0, "", &si_content(TS_2021)),
                resident_attr(
                    0x30,
                    2,
                    "",
                    &file_name_content(
                        "Hello world text document.txt",
                        1,
                        ID_FOLDER_B,
                        1,
                        13,
                    ),
                ),
                resident_attr(0x80, 3, "", b"Hello, world!"),
                resident_attr(0x80, 4, "goodbye.txt", b"Goodbye world"),
            ],
        ),
    );

    // 9: ones.bin — compressed, two VCN fragments. The first fragment
    // holds one compression unit (5 data clusters + 11 sparse); the
    // second is a fully sparse unit.
    put_record(
        ID_ONES,
        mft_record(
            ID_ONES,
            1,
            0x01,
            &[
                resident_attr(0x10, 0, "", &si_content(TS_2021)),
                resident_attr(0x30, 2, "", &file_name_content("ones.bin", 1, ID_ROOT, 1, 32768)),
                nonresident_attr(
                    0x80,
                    3,
                    "",
                    0x0001, // COMPRESSED
                    (0, 15),
                    // 5 clusters at ONES_PAYLOAD_CLUSTER, then 11 sparse.
                    &[0x11, 0x05, ONES_PAYLOAD_CLUSTER as u8, 0x01, 0x0B, 0x00],
                    4,
                    (32768, 32768, 32768),
                ),
                nonresident_attr(
                    0x80,
                    5,
                    "",
                    0x0001,
                    (16, 31),
                    &[0x01, 0x10, 0x00], // 16 sparse clusters
                    0,
                    (0, 0, 0),
                ),
            ],
        ),
    );

    // 10: $Extend directory.
    put_record(
        ID_EXTEND,
        mft_record(
            ID_EXTEND,
            1,
            0x03,
            &[
                resident_attr(0x10, 0, "", &si_content(TS_2021)),
                resident_attr(0x30, 2, "", &file_name_content("$Extend", 3, ID_ROOT, 1, 0)),
                resident_attr(
                    0x90,
                    4,
                    "$I30",
                    &index_root_content(&[index_entry(ID_USNJRNL, 1, "$UsnJrnl", false)], &[]),
                ),
            ],
        ),
    );

    // 11: $UsnJrnl — $J with a sparse prefix and one data cluster.
    put_record(
        ID_USNJRNL,
        mft_record(
            ID_USNJRNL,
            1,
            0x01,
            &[
                resident_attr(0x10, 0, "", &si_content(TS_2021)),
                resident_attr(0x30, 2, "", &file_name_content("$UsnJrnl", 3, ID_EXTEND, 1, 0)),
                nonresident_attr(
                    0x80,
                    3,
                    "$J",
                    0,
                    (0, 4),
                    // 4 sparse clusters, then 1 data cluster.
                    &[0x01, 0x04, 0x11, 0x01, USN_DATA_CLUSTER as u8, 0x00],
                    0,
                    (5 * CLUSTER as u64, 5 * CLUSTER as u64, 5 * CLUSTER as u64),
                ),
            ],
        ),
    );

    // Compressed payload for ones.bin: one LZNT1 literal block holding
    // 4096 '1' bytes; the decompressor pads the unit with zeros.
    let payload_offset = ONES_PAYLOAD_CLUSTER * CLUSTER;
    let header: u16 = 0x0FFF | 0x3000;
    image[payload_offset..payload_offset + 2].copy_from_slice(&header.to_le_bytes());
    for b in image[payload_offset + 2..payload_offset + 2 + 4096].iter_mut() {
        *b = b'1';
    }

    // Two journal records at the start of $J's data cluster.
    let usn_offset = USN_DATA_CLUSTER * CLUSTER;
    let rec1 = usn_record(0x1000, 99, 2, ID_FOLDER_B, 1, "old doc.txt");
    let rec2 = usn_record(0x1100, ID_HELLO, 1, ID_FOLDER_B, 1, "Hello world text document.txt");
    image[usn_offset..usn_offset + rec1.len()].copy_from_slice(&rec1);
    image[usn_offset + rec1.len()..usn_offset + rec1.len() + rec2.len()].copy_from_slice(&rec2);

    image
}

fn open_volume() -> NtfsContext {
    let image = build_volume();
    let paged = Arc::new(PagedReader::new(Arc::new(image), 1024, 1000));
    NtfsContext::new(paged, 0).expect("volume must open")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_open_and_volume_metadata() {
    let ntfs = open_volume();
    assert_eq!(ntfs.cluster_size(), 1024);
    assert_eq!(ntfs.record_size(), 1024);
    assert_eq!(ntfs.volume_name().as_deref(), Some("EVIDENCE"));
    let info = ntfs.volume_info().unwrap();
    assert_eq!((info.major, info.minor), (3, 1));
}

#[test]
fn test_open_directory_by_path_and_list() {
    let ntfs = open_volume();
    let root = ntfs.get_mft(5).unwrap();
    let dir = root.open(&ntfs, "Folder A/Folder B").unwrap();
    assert_eq!(dir.record_number(), ID_FOLDER_B);

    let entries = list_dir(&ntfs, &dir);
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"Hello world text document.txt"), "{names:?}");
    assert!(
        names.contains(&"Hello world text document.txt:goodbye.txt"),
        "{names:?}"
    );

    let doc = entries
        .iter()
        .find(|e| e.name == "Hello world text document.txt")
        .unwrap();
    assert!(!doc.is_dir);
    assert_eq!(doc.size, 13);
}

#[test]
fn test_case_insensitive_backslash_paths() {
    let ntfs = open_volume();
    let root = ntfs.get_mft(5).unwrap();
    let dir = root.open(&ntfs, "folder a\\FOLDER B").unwrap();
    assert_eq!(dir.record_number(), ID_FOLDER_B);
}

#[test]
fn test_path_round_trip_id_and_sequence() {
    let ntfs = open_volume();
    let root = ntfs.get_mft(5).unwrap();
    let entry = root
        .open(&ntfs, "Folder A/Folder B/Hello world text document.txt")
        .unwrap();
    assert_eq!(entry.record_number(), ID_HELLO);

    // Re-open the resolved path: same identity.
    let again = root
        .open(&ntfs, "Folder A/Folder B/Hello world text document.txt")
        .unwrap();
    assert_eq!(again.record_number(), entry.record_number());
    assert_eq!(again.sequence_value(), entry.sequence_value());
}

#[test]
fn test_read_resident_file() {
    let ntfs = open_volume();
    let reader = get_data_for_path(&ntfs, "Folder A/Folder B/Hello world text document.txt")
        .unwrap();
    let mut buf = [0u8; 13];
    assert_eq!(reader.read_at(0, &mut buf).unwrap(), 13);
    assert_eq!(&buf, b"Hello, world!");
}

#[test]
fn test_read_alternate_data_stream() {
    let ntfs = open_volume();
    let reader = get_data_for_path(
        &ntfs,
        "Folder A/Folder B/Hello world text document.txt:goodbye.txt",
    )
    .unwrap();
    let mut buf = [0u8; 64];
    let n = reader.read_at(0, &mut buf).unwrap();
    assert_eq!(n, 13);
    assert_eq!(&buf[..13], b"Goodbye world");
}

#[test]
fn test_read_by_inode_selector() {
    let ntfs = open_volume();
    let selector = parse_mft_id("8-128-4:goodbye.txt").unwrap();
    assert_eq!(selector.mft_id, ID_HELLO);

    let reader = get_data_for_mft_id(&ntfs, "8-128-4:goodbye.txt").unwrap();
    let mut buf = [0u8; 13];
    assert_eq!(reader.read_at(0, &mut buf).unwrap(), 13);
    assert_eq!(&buf, b"Goodbye world");
}

#[test]
fn test_stat_merges_streams_and_times() {
    let ntfs = open_volume();
    let entry = ntfs.get_mft(ID_HELLO).unwrap();
    let infos = stat(&ntfs, &entry);

    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].mft_id, "8-128-3");
    assert_eq!(infos[1].mft_id, "8-128-4");
    assert_eq!(infos[1].name, "Hello world text document.txt:goodbye.txt");
    assert!(infos.iter().all(|i| i.size == 13));
    assert!(infos.iter().all(|i| !i.is_dir));
    // 2021-01-01, straight from $STANDARD_INFORMATION.
    assert_eq!(infos[0].btime.unwrap().timestamp(), 1_609_459_200);
}

#[test]
fn test_index_slack_carving() {
    let ntfs = open_volume();
    let root = ntfs.get_mft(5).unwrap();
    let dir = root.open(&ntfs, "Folder A/Folder B").unwrap();

    let infos = extract_i30_list(&ntfs, &dir);
    let live: Vec<_> = infos.iter().filter(|i| !i.is_slack).collect();
    let slack: Vec<_> = infos.iter().filter(|i| i.is_slack).collect();

    assert!(live
        .iter()
        .any(|i| i.name == "Hello world text document.txt"));
    assert!(!slack.is_empty(), "expected a carved slack entry");
    let ghost = slack
        .iter()
        .find(|i| i.name == "old doc.txt")
        .expect("deleted entry not carved");
    assert_eq!(ghost.mft_id, "99");
    assert!(ghost.slack_offset > 0);
    // Carved timestamps fall inside the validity window.
    let year = ghost.btime.unwrap().timestamp();
    assert!((1_000_000_000..=2_000_000_000).contains(&year));
}

#[test]
fn test_read_compressed_multi_vcn_stream() {
    let ntfs = open_volume();
    let reader = get_data_for_path(&ntfs, "ones.bin").unwrap();

    let mut buf = vec![0u8; 32768];
    let n = reader.read_at(0, &mut buf).unwrap();
    assert_eq!(n, 32768);
    assert!(buf[..4096].iter().all(|&b| b == b'1'));
    assert!(buf[4096..].iter().all(|&b| b == 0));

    // One non-sparse prefix (the compressed unit) and one sparse tail.
    let ranges = reader.ranges();
    assert_eq!(ranges.len(), 2);
    assert!(!ranges[0].is_sparse);
    assert!(ranges[1].is_sparse);
    assert_eq!(ranges[0].length + ranges[1].length, 32768);
}

#[test]
fn test_usn_journal_iteration() {
    let ntfs = open_volume();
    let stream = Arc::new(open_usn_stream(&ntfs).unwrap());

    let records: Vec<_> = parse_usn(stream, 0, CancelToken::new()).collect();
    assert_eq!(records.len(), 2);

    // Offsets are strictly increasing and sit in the non-sparse tail.
    assert!(records[0].offset < records[1].offset);
    assert!(records[0].offset >= 4096);
    for record in &records {
        let length = record.record_length();
        assert!((64..=1024).contains(&length));
        assert_eq!(length % 8, 0);
    }

    assert_eq!(records[0].filename(), "old doc.txt");
    assert_eq!(records[0].reason(), vec!["FILE_DELETE", "CLOSE"]);

    // The deleted file resolves through its surviving parent.
    let links = records[0].links(&ntfs);
    assert_eq!(links, vec!["Folder A\\Folder B\\old doc.txt".to_string()]);
}

#[test]
fn test_hard_link_resolution() {
    let ntfs = open_volume();
    let links = rusty_ntfs::get_hard_links(&ntfs, ID_HELLO, 1, 0);
    assert_eq!(
        links,
        vec![vec![
            "Folder A".to_string(),
            "Folder B".to_string(),
            "Hello world text document.txt".to_string(),
        ]]
    );
}

#[test]
fn test_strict_component_resolution() {
    let ntfs = open_volume();
    let entry = ntfs.get_mft(ID_HELLO).unwrap();
    let components = rusty_ntfs::get_components(&ntfs, &entry).unwrap();
    assert_eq!(
        components,
        vec!["Folder A", "Folder B", "Hello world text document.txt"]
    );
}

#[test]
fn test_full_path_resolution() {
    let ntfs = open_volume();
    let entry = ntfs.get_mft(ID_HELLO).unwrap();
    assert_eq!(
        rusty_ntfs::full_path(&ntfs, &entry),
        "/Folder A/Folder B/Hello world text document.txt"
    );
}

#[test]
fn test_bulk_mft_iteration() {
    let ntfs = open_volume();
    // Extract the raw MFT through the context's own reader, as a triage
    // workflow would from an acquired image.
    let mut raw_mft = vec![0u8; MFT_RECORDS * RECORD];
    ntfs.mft_reader().read_at(0, &mut raw_mft).unwrap();

    let rows: Vec<_> = rusty_ntfs::parse_mft_file(
        Arc::new(raw_mft),
        (MFT_RECORDS * RECORD) as i64,
        CLUSTER as i64,
        RECORD as i64,
        CancelToken::new(),
    )
    .collect();

    // Every populated record yields a row; ADS adds one more.
    let numbers: Vec<u64> = rows.iter().map(|r| r.entry_number).collect();
    let mut sorted = numbers.clone();
    sorted.sort();
    assert_eq!(numbers, sorted, "rows must be ordered by MFT id");

    let hello: Vec<_> = rows.iter().filter(|r| r.entry_number == ID_HELLO).collect();
    assert_eq!(hello.len(), 2);
    assert!(hello[0].has_ads);
    assert_eq!(hello[1].inode, "8-128-4:goodbye.txt");

    let ones = rows.iter().find(|r| r.entry_number == ID_ONES).unwrap();
    assert_eq!(ones.file_size, 32768);
}

#[test]
fn test_context_copy_and_purge() {
    let ntfs = open_volume();
    let copy = ntfs.clone();
    // Both contexts resolve through the shared caches.
    assert_eq!(copy.get_mft(ID_HELLO).unwrap().record_number(), ID_HELLO);
    ntfs.purge();
    assert_eq!(ntfs.get_mft(ID_HELLO).unwrap().record_number(), ID_HELLO);
}
