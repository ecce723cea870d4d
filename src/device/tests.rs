//! Tests for device parsing and the local file-system collaborator.

use std::ffi::OsString;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;

struct Scratch {
    _dir: TempDir,
    root: Utf8PathBuf,
}

#[fixture]
fn scratch() -> Scratch {
    let dir = tempfile::tempdir().expect("create temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp path");
    Scratch { _dir: dir, root }
}

fn write(root: &Utf8Path, relative: &str, contents: &[u8]) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dirs");
    }
    fs::write(path, contents).expect("write file");
}

fn io() -> FsDeviceIo<WipeFormatter> {
    FsDeviceIo::new(WipeFormatter)
}

#[rstest]
#[case("usb-a=/mnt/a", "usb-a", "/mnt/a", None)]
#[case("usb-b=/mnt/b@/dev/sdb1", "usb-b", "/mnt/b", Some("/dev/sdb1"))]
#[case(" usb-c = /mnt/c ", "usb-c", "/mnt/c", None)]
fn parses_device_specs(
    #[case] spec: &str,
    #[case] label: &str,
    #[case] root: &str,
    #[case] node: Option<&str>,
) {
    let device: Device = spec.parse().expect("valid device spec");
    assert_eq!(device.id.as_str(), label);
    assert_eq!(device.root.as_str(), root);
    assert_eq!(device.node.as_deref(), node);
    assert_eq!(device.volume_label.as_deref(), Some(label));
}

#[rstest]
#[case("no-separator", DeviceParseError::Malformed(String::from("no-separator")))]
#[case("=/mnt/a", DeviceParseError::EmptyLabel(String::from("=/mnt/a")))]
#[case("usb=", DeviceParseError::EmptyRoot(String::from("usb=")))]
fn rejects_malformed_specs(#[case] spec: &str, #[case] expected: DeviceParseError) {
    let err = spec.parse::<Device>().expect_err("spec should be rejected");
    assert_eq!(err, expected);
}

#[rstest]
#[tokio::test]
async fn list_files_is_recursive_sorted_and_skips_system_dirs(scratch: Scratch) {
    write(&scratch.root, "b.bin", b"b");
    write(&scratch.root, "nested/deeper/a.bin", b"a");
    write(&scratch.root, "System Volume Information/IndexerVolumeGuid", b"x");
    write(&scratch.root, "lost+found/orphan", b"x");

    let files = io().list_files(&scratch.root).await.expect("list files");

    assert_eq!(files, vec!["b.bin", "nested/deeper/a.bin"]);
}

#[rstest]
#[tokio::test]
async fn list_files_reports_missing_root(scratch: Scratch) {
    let missing = scratch.root.join("absent");
    let err = io().list_files(&missing).await.expect_err("missing root");
    assert!(matches!(err, DeviceError::Io { .. }));
}

#[rstest]
#[tokio::test]
async fn root_directories_ignores_system_dirs(scratch: Scratch) {
    write(&scratch.root, "data/file", b"1");
    write(&scratch.root, "lost+found/x", b"1");
    write(&scratch.root, "top.txt", b"1");

    let dirs = io()
        .root_directories(&scratch.root)
        .await
        .expect("list root dirs");

    assert_eq!(dirs, vec!["data"]);
}

#[rstest]
#[case(b"same bytes".as_slice(), b"same bytes".as_slice(), true)]
#[case(b"same bytes".as_slice(), b"same bytez".as_slice(), false)]
#[case(b"short".as_slice(), b"longer".as_slice(), false)]
#[case(b"".as_slice(), b"".as_slice(), true)]
#[tokio::test]
async fn compare_checks_length_and_bytes(
    scratch: Scratch,
    #[case] left: &[u8],
    #[case] right: &[u8],
    #[case] expected: bool,
) {
    write(&scratch.root, "left", left);
    write(&scratch.root, "right", right);

    let same = io()
        .compare(&scratch.root.join("left"), &scratch.root.join("right"))
        .await
        .expect("compare files");

    assert_eq!(same, expected);
}

#[rstest]
#[tokio::test]
async fn compare_spans_multiple_chunks(scratch: Scratch) {
    let mut payload = vec![7_u8; 3 * 1024 * 1024 + 17];
    write(&scratch.root, "left", &payload);
    if let Some(last) = payload.last_mut() {
        *last = 8;
    }
    write(&scratch.root, "right", &payload);

    let same = io()
        .compare(&scratch.root.join("left"), &scratch.root.join("right"))
        .await
        .expect("compare files");

    assert!(!same);
}

#[rstest]
#[tokio::test]
async fn copy_tree_mirrors_and_overwrites(scratch: Scratch) {
    let source = scratch.root.join("source");
    let target = scratch.root.join("target");
    write(&source, "one.txt", b"fresh");
    write(&source, "dir/two.txt", b"two");
    fs::create_dir_all(source.join("empty")).expect("create empty dir");
    write(&target, "one.txt", b"stale");

    let copied = io().copy_tree(&source, &target).await.expect("copy tree");

    assert_eq!(copied, 2);
    assert_eq!(fs::read(target.join("one.txt")).expect("read"), b"fresh");
    assert_eq!(fs::read(target.join("dir/two.txt")).expect("read"), b"two");
    assert!(target.join("empty").is_dir());
}

#[rstest]
#[tokio::test]
async fn wipe_formatter_empties_root_but_keeps_system_dirs(scratch: Scratch) {
    write(&scratch.root, "data/file", b"1");
    write(&scratch.root, "top.txt", b"1");
    write(&scratch.root, "lost+found/keep", b"1");
    let device = Device::new("usb", scratch.root.clone());

    io().format(&device, true).await.expect("wipe succeeds");

    assert!(!scratch.root.join("data").exists());
    assert!(!scratch.root.join("top.txt").exists());
    assert!(scratch.root.join("lost+found/keep").exists());
}

#[rstest]
#[tokio::test]
async fn readiness_follows_mount_root(scratch: Scratch) {
    let present = Device::new("usb", scratch.root.clone());
    let absent = Device::new("usb", scratch.root.join("gone"));

    assert!(io().is_ready(&present).await.expect("ready check"));
    assert!(!io().is_ready(&absent).await.expect("ready check"));
}

#[derive(Debug, Default)]
struct FakeRunner {
    code: i32,
    calls: Mutex<Vec<(String, Vec<OsString>)>>,
}

impl CommandRunner for &'static FakeRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, DeviceError> {
        self.calls.lock().push((program.to_owned(), args.to_vec()));
        Ok(CommandOutput {
            code: Some(self.code),
            stdout: String::new(),
            stderr: String::from("bad sector"),
        })
    }
}

fn leaked_runner(code: i32) -> &'static FakeRunner {
    Box::leak(Box::new(FakeRunner {
        code,
        calls: Mutex::new(Vec::new()),
    }))
}

#[rstest]
#[case(true, vec!["-n", "STICK", "/dev/sdx1"])]
#[case(false, vec!["-n", "STICK", "-c", "/dev/sdx1"])]
fn command_formatter_builds_mkfs_arguments(#[case] quick: bool, #[case] expected: Vec<&str>) {
    let runner = leaked_runner(0);
    let formatter = CommandFormatter::new("mkfs.vfat", runner);
    let device = Device::new("usb", "/mnt/usb")
        .with_node("/dev/sdx1")
        .with_volume_label("STICK");

    formatter
        .format(&device, &FormatOptions::for_device(&device, quick))
        .expect("format succeeds");

    let calls = runner.calls.lock();
    let (program, args) = calls.first().expect("one invocation");
    assert_eq!(program, "mkfs.vfat");
    let rendered: Vec<String> = args
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    assert_eq!(rendered, expected);
}

#[rstest]
fn command_formatter_reports_exit_status() {
    let formatter = CommandFormatter::new("mkfs.vfat", leaked_runner(1));
    let device = Device::new("usb", "/mnt/usb").with_node("/dev/sdx1");

    let err = formatter
        .format(&device, &FormatOptions::for_device(&device, true))
        .expect_err("non-zero exit fails");

    let DeviceError::Format { message, .. } = err else {
        panic!("expected format error, got {err:?}");
    };
    assert!(message.contains("exited with 1"));
    assert!(message.contains("bad sector"));
}

#[rstest]
fn command_formatter_requires_a_node() {
    let formatter = CommandFormatter::new("mkfs.vfat", leaked_runner(0));
    let device = Device::new("usb", "/mnt/usb");

    let err = formatter
        .format(&device, &FormatOptions::for_device(&device, true))
        .expect_err("missing node fails");

    assert!(matches!(err, DeviceError::Format { .. }));
}
