//! Tests that drive the `mboxmigrate` binary.

use std::path::Path;
use std::process::Command;

use assert_fs::prelude::*;
use predicates::prelude::*;

use mboxmigrate::migrate::checkpoint::cache_checkpoint_path_for;

fn fixture(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// A command whose config keeps logs and cache files inside `temp`.
fn mboxmigrate(temp: &assert_fs::TempDir) -> Command {
    let cache = temp.child("cache");
    let config = temp.child("config.toml");
    config
        .write_str(&format!(
            "[general]\ncache_dir = {:?}\n\n[migration]\nthrottle_every = 0\n",
            cache.path().display().to_string()
        ))
        .unwrap();

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_mboxmigrate"));
    cmd.env("MBOXMIGRATE_CONFIG", config.path());
    cmd
}

// ─── Test 1: A dry run writes no checkpoint ─────────────────────────

#[test]
fn test_dry_run_writes_no_checkpoint() {
    let temp = assert_fs::TempDir::new().unwrap();
    let mbox = temp.child("m.mbox");
    mbox.write_file(&fixture("simple.mbox")).unwrap();

    let output = mboxmigrate(&temp)
        .args(["migrate", "--dry-run"])
        .arg(mbox.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    temp.child(".m.mbox.mboxmigrate.json")
        .assert(predicate::path::missing());
    let fallback = cache_checkpoint_path_for(mbox.path(), temp.child("cache").path());
    assert!(!fallback.exists());
}

// ─── Test 2: A real run writes the checkpoint next to the MBOX ──────

#[test]
fn test_migrate_writes_checkpoint() {
    let temp = assert_fs::TempDir::new().unwrap();
    let mbox = temp.child("m.mbox");
    mbox.write_file(&fixture("simple.mbox")).unwrap();
    let store = temp.child("store");

    let output = mboxmigrate(&temp)
        .args(["migrate", "--dest"])
        .arg(store.path())
        .arg(mbox.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    temp.child(".m.mbox.mboxmigrate.json")
        .assert(predicate::str::contains("\"last_completed_index\": 5"));
}
