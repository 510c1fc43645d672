//! Tuning cache seeding from files and under concurrent first use.

use nngpu_core::{FileSource, ShaderConfig, TableSource, TuningCache};
use std::sync::Arc;
use std::thread;

const STEM: &str =
    "optype3_batch1_in224x224x3_out112x112x32_filter3x3_pad0x0_stride2x2_act0_bias1";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("nngpu-{}-{name}", std::process::id()));
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_tuning_file_shadows_builtin_entry() {
    init_tracing();
    let path = temp_file(
        "shadow.txt",
        &format!(
            "# device tuned\n\n{STEM} type0_lsz2_32_1_block2_2_1\nnot-a-pair\nextra type0_lsz1_1_1_block1_1_1\n"
        ),
    );

    let cache = TuningCache::new(vec![
        Box::new(FileSource::new(&path)),
        Box::new(TableSource::builtin()),
    ]);
    assert_eq!(
        cache.lookup(STEM),
        Some(ShaderConfig::new([2, 32, 1], [2, 2, 1]))
    );
    assert_eq!(
        cache.lookup("extra"),
        Some(ShaderConfig::new([1, 1, 1], [1, 1, 1]))
    );
    assert_eq!(cache.len(), TuningCache::builtin().len() + 1);
    std::fs::remove_file(&path).ok();
}

#[test]
fn test_unreadable_file_is_skipped() {
    let cache = TuningCache::new(vec![
        Box::new(FileSource::new("/nonexistent/nngpu/tuning.txt")),
        Box::new(TableSource::builtin()),
    ]);
    assert_eq!(
        cache.lookup(STEM),
        Some(ShaderConfig::new([1, 64, 1], [4, 4, 1]))
    );
}

#[test]
fn test_concurrent_first_lookups_agree() {
    let cache = Arc::new(TuningCache::builtin());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || (cache.lookup(STEM), cache.len()))
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let expected = (Some(ShaderConfig::new([1, 64, 1], [4, 4, 1])), cache.len());
    assert!(results.iter().all(|r| *r == expected));
}

#[test]
fn test_global_cache_is_shared() {
    let a = TuningCache::global();
    let b = TuningCache::global();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(a.lookup(STEM).is_some());
}
