use std::path::Path;
use std::process::{Command, Output};

/// Header-only module: magic, version 1.0, generator, bound, schema.
const EMPTY_MODULE: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];

fn vkscene(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_vkscene"))
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("vkscene should start")
}

#[test]
fn reflect_prints_bytecode_module() {
    let dir = tempfile::tempdir().unwrap();
    let shaders = dir.path().join("shaders");
    std::fs::create_dir(&shaders).unwrap();
    let bytes: Vec<u8> = EMPTY_MODULE.iter().flat_map(|w| w.to_le_bytes()).collect();
    std::fs::write(shaders.join("empty.vert.spv"), bytes).unwrap();

    let out = vkscene(dir.path(), &["reflect", "empty.vert.spv"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("(Vertex, 5 words)"), "{stdout}");
}

#[test]
fn config_loading_is_logged() {
    let dir = tempfile::tempdir().unwrap();

    let out = vkscene(dir.path(), &["--config", "absent.toml", "reflect", "missing.frag.spv"]);
    assert!(!out.status.success());

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Config file not found"), "{stderr}");
}

#[test]
fn config_file_load_is_logged_before_its_level_applies() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.toml"), "[logging]\nlevel = \"error\"\n").unwrap();

    let out = vkscene(dir.path(), &["reflect", "missing.frag.spv"]);
    assert!(!out.status.success());

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Loaded configuration"), "{stderr}");
}
