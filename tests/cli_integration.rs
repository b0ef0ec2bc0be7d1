use std::process::Command;
use tempfile::tempdir;

const BLOCK: usize = 4096;

fn bin() -> String {
    env!("CARGO_BIN_EXE_blockdelta").to_string()
}

fn image(fill: &[u8]) -> Vec<u8> {
    fill.iter()
        .flat_map(|&b| std::iter::repeat_n(b, BLOCK))
        .collect()
}

#[test]
fn cli_full_update_writes_artifacts() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("system.img");
    let prefix = dir.path().join("system");
    std::fs::write(&target, image(&[0, 7, 7, 0])).unwrap();

    let out = Command::new(bin())
        .args(["--json", "diff", "--target"])
        .arg(&target)
        .arg("--output")
        .arg(&prefix)
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let list = std::fs::read_to_string(dir.path().join("system.transfer.list")).unwrap();
    assert!(list.starts_with("4\n4\n0\n0\n"));
    assert!(list.contains("new 2,1,3\n"));
    let new_data = std::fs::read(dir.path().join("system.new.dat")).unwrap();
    assert_eq!(new_data.len(), 2 * BLOCK);
    assert!(std::fs::read(dir.path().join("system.patch.dat")).unwrap().is_empty());

    let stderr = String::from_utf8_lossy(&out.stderr);
    let json_start = stderr.find('{').unwrap();
    let json: serde_json::Value = serde_json::from_str(&stderr[json_start..]).unwrap();
    assert_eq!(json["command"], "diff");
    assert_eq!(json["blocks_written"], 4);
    assert_eq!(json["new_blocks"], 2);
}

#[test]
fn cli_incremental_move() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("old.img");
    let target = dir.path().join("new.img");
    let prefix = dir.path().join("out");
    std::fs::write(&source, image(&[5, 6])).unwrap();
    std::fs::write(&target, image(&[5, 6])).unwrap();

    let st = Command::new(bin())
        .args(["diff", "--transfer-version", "3", "-t"])
        .arg(&target)
        .arg("-s")
        .arg(&source)
        .arg("-o")
        .arg(&prefix)
        .status()
        .unwrap();
    assert!(st.success());

    let list = std::fs::read_to_string(dir.path().join("out.transfer.list")).unwrap();
    let lines: Vec<_> = list.lines().collect();
    // Identical images: nothing needs writing.
    assert_eq!(&lines[..4], ["3", "0", "0", "0"]);
}

#[test]
fn cli_refuses_to_overwrite_without_force() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("t.img");
    let prefix = dir.path().join("t");
    std::fs::write(&target, image(&[1])).unwrap();
    std::fs::write(dir.path().join("t.new.dat"), b"old").unwrap();

    let run = |force: bool| {
        let mut cmd = Command::new(bin());
        if force {
            cmd.arg("-f");
        }
        cmd.arg("diff")
            .arg("-t")
            .arg(&target)
            .arg("-o")
            .arg(&prefix)
            .status()
            .unwrap()
    };
    assert!(!run(false).success());
    assert_eq!(std::fs::read(dir.path().join("t.new.dat")).unwrap(), b"old");
    assert!(run(true).success());
    assert_eq!(std::fs::read(dir.path().join("t.new.dat")).unwrap().len(), BLOCK);
}

#[test]
fn cli_unaligned_image_needs_pad_or_trim() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("odd.img");
    std::fs::write(&target, vec![9u8; BLOCK + 100]).unwrap();

    let diff = |extra: &[&str], name: &str| {
        Command::new(bin())
            .arg("diff")
            .args(extra)
            .arg("-t")
            .arg(&target)
            .arg("-o")
            .arg(dir.path().join(name))
            .status()
            .unwrap()
    };
    assert!(!diff(&[], "exact").success());
    assert!(diff(&["--trim"], "trim").success());
    assert!(diff(&["--pad"], "pad").success());

    let padded = std::fs::read_to_string(dir.path().join("pad.transfer.list")).unwrap();
    assert_eq!(padded.lines().nth(1), Some("2"));
}

#[test]
fn cli_ranges_prints_forms() {
    let out = Command::new(bin())
        .args(["ranges", "10-19 30"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("ranges: 10-19 30\n"));
    assert!(stdout.contains("raw: 4,10,20,30,31\n"));
    assert!(stdout.contains("size: 11\n"));
    assert!(stdout.contains("monotonic: true\n"));

    let bad = Command::new(bin()).args(["ranges", "5-2"]).output().unwrap();
    assert!(!bad.status.success());
}

#[test]
fn cli_config_works() {
    let out = Command::new(bin()).arg("config").output().unwrap();
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("BLOCK_SIZE=4096"));
}
