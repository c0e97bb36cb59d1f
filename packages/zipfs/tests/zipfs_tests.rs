//! Round-trip tests against real files: add, copy from a source archive,
//! close and read back.

use std::fs::File;
use std::io::Read;

use zip::{CompressionMethod, ZipArchive};
use zipfs::{FileHeader, ZipError, ZipRw};

fn read_entry(path: &std::path::Path, name: &str) -> (String, CompressionMethod) {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut file = archive.by_name(name).unwrap();
    let mut content = String::new();
    file.read_to_string(&mut content).unwrap();
    (content, file.compression())
}

#[test]
fn closed_archive_is_readable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.zip");

    let mut zip = ZipRw::create(&path).unwrap();
    zip.add(FileHeader::new("index.html").deflated(), "<p>hello</p>".as_bytes())
        .unwrap();
    zip.add(FileHeader::new("_resources/abc.png"), &b"png"[..]).unwrap();
    zip.close().unwrap();

    let (html, method) = read_entry(&path, "index.html");
    assert_eq!(html, "<p>hello</p>");
    assert_eq!(method, CompressionMethod::Deflated);

    let (png, method) = read_entry(&path, "_resources/abc.png");
    assert_eq!(png, "png");
    assert_eq!(method, CompressionMethod::Stored);

    let archive = ZipArchive::new(File::open(&path).unwrap()).unwrap();
    let names: Vec<&str> = archive.file_names().collect();
    assert!(names.contains(&"_resources/"));
}

#[test]
fn duplicate_add_keeps_first_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dup.zip");

    let mut zip = ZipRw::create(&path).unwrap();
    zip.add(FileHeader::new("log"), &b"first"[..]).unwrap();
    let err = zip.add(FileHeader::new("./log"), &b"second"[..]).unwrap_err();
    assert!(matches!(err, ZipError::AlreadyExists(_)));
    zip.close().unwrap();

    let (content, _) = read_entry(&path, "log");
    assert_eq!(content, "first");
}

#[test]
fn copy_from_source_archive() {
    let dir = tempfile::tempdir().unwrap();
    let src_path = dir.path().join("src.zip");
    let dst_path = dir.path().join("dst.zip");

    let mut src = ZipRw::create(&src_path).unwrap();
    src.add(FileHeader::new("a/b/props.json").deflated(), &b"{}"[..])
        .unwrap();
    src.add(FileHeader::new("log"), &b"line"[..]).unwrap();
    src.close().unwrap();

    let mut zip = ZipRw::create(&dst_path).unwrap();
    zip.add_source_file(&src_path).unwrap();

    let mut files = zip.src_files();
    files.sort();
    assert_eq!(files, vec!["a/b/props.json", "log"]);

    zip.copy("a/b/props.json").unwrap();
    assert_eq!(zip.entries(), &["a/", "a/b/", "a/b/props.json"]);

    assert!(matches!(
        zip.copy("a/b/props.json").unwrap_err(),
        ZipError::AlreadyExists(_)
    ));
    assert!(matches!(zip.copy("missing").unwrap_err(), ZipError::NotFound(_)));
    assert!(matches!(zip.copy("a/b/other.json").unwrap_err(), ZipError::NotFound(_)));
    // An existing directory is an existing entry.
    assert!(matches!(zip.copy("a/b").unwrap_err(), ZipError::AlreadyExists(_)));
    zip.close().unwrap();

    let (content, method) = read_entry(&dst_path, "a/b/props.json");
    assert_eq!(content, "{}");
    assert_eq!(method, CompressionMethod::Deflated);
}

#[test]
fn destination_and_source_set_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("once.zip");

    let mut zip = ZipRw::create(&path).unwrap();
    assert!(matches!(
        zip.add_dest_file(dir.path().join("other.zip")).unwrap_err(),
        ZipError::DestinationSet
    ));
    zip.add(FileHeader::new("x"), &b"x"[..]).unwrap();
    zip.close().unwrap();

    let mut zip = ZipRw::create(dir.path().join("second.zip")).unwrap();
    zip.add_source_file(&path).unwrap();
    assert!(matches!(
        zip.add_source_file(&path).unwrap_err(),
        ZipError::SourceSet
    ));
}
