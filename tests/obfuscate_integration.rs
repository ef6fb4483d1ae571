use jar_obfuscator::bytecode::op;
use jar_obfuscator::classfile::ClassFile;
use jar_obfuscator::jar::{self, Manifest};
use jar_obfuscator::runtime::ClassBuilder;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "jar_obfuscator_it_{}_{}_{}",
        std::process::id(),
        nanos,
        name
    ))
}

/// `demo/App.main` prints `demo/util/Helper.greet()`, which returns "hello from helper".
fn write_app_jar(path: &Path) -> anyhow::Result<()> {
    let mut app = ClassBuilder::new("demo/App")?;
    app.static_method("main", "([Ljava/lang/String;)V", |e| {
        e.get_static("java/lang/System", "out", "Ljava/io/PrintStream;")?
            .invoke_static("demo/util/Helper", "greet", "()Ljava/lang/String;")?
            .invoke_virtual("java/io/PrintStream", "println", "(Ljava/lang/String;)V")?
            .op(op::RETURN);
        Ok(())
    })?;
    let mut helper = ClassBuilder::new("demo/util/Helper")?;
    helper.static_method("greet", "()Ljava/lang/String;", |e| {
        e.string("hello from helper")?.op(op::ARETURN);
        Ok(())
    })?;

    let mut manifest = Manifest::default();
    manifest.set("Manifest-Version", "1.0");
    manifest.set_main_class("demo/App");

    let manifest = manifest.to_bytes();
    let app = app.finish().to_bytes()?;
    let helper = helper.finish().to_bytes()?;

    // Written entry by entry so the signature file really is in the input jar.
    let entries: [(&str, &[u8]); 5] = [
        ("META-INF/MANIFEST.MF", manifest.as_slice()),
        ("demo/App.class", app.as_slice()),
        ("demo/util/Helper.class", helper.as_slice()),
        ("app.properties", b"name=demo\n".as_slice()),
        ("META-INF/APP.SF", b"Signature-Version: 1.0\n".as_slice()),
    ];
    write_jar(path, &entries)
}

fn write_jar(path: &Path, entries: &[(&str, &[u8])]) -> anyhow::Result<()> {
    use std::io::Write;
    use zip::write::FileOptions;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.add_directory("demo/", options)?;
    zip.add_directory("demo/util/", options)?;
    for (name, content) in entries {
        zip.start_file(*name, options)?;
        zip.write_all(content)?;
    }
    zip.finish()?;
    Ok(())
}

fn run(args: &[&str]) -> anyhow::Result<Output> {
    Ok(Command::new(env!("CARGO_BIN_EXE_jar-obfuscator"))
        .args(args)
        .env("RUST_LOG", "jar_obfuscator=warn")
        .output()?)
}

fn run_json(args: &[&str]) -> anyhow::Result<Value> {
    let out = run(args)?;
    if !out.status.success() {
        return Err(anyhow::anyhow!(
            "command failed: status={:?}, stderr={}",
            out.status.code(),
            String::from_utf8_lossy(&out.stderr)
        ));
    }
    Ok(serde_json::from_slice(&out.stdout)?)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn all_passes_produce_a_renamed_encrypted_jar() -> anyhow::Result<()> {
    let base = temp_dir("all");
    let input = base.join("app.jar");
    let output = base.join("out/app-obf.jar");
    let mapping = base.join("mapping.json");
    write_app_jar(&input)?;

    let report = run_json(&[
        "obfuscate",
        input.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
        "--all",
        "--seed",
        "7",
        "--mapping",
        mapping.to_str().unwrap(),
    ])?;

    assert_eq!(report["classes"], 2);
    assert_eq!(report["resources"], 2);
    assert_eq!(report["renamed_classes"], 2);
    assert_eq!(report["main_class_before"], "demo/App");
    assert_eq!(report["main_class_after"], "C0");
    assert_eq!(report["seed"], 7);
    assert_eq!(
        report["passes"],
        serde_json::json!(["anti-debug", "flow", "strings", "rename"])
    );
    assert_eq!(report["injected_classes"], serde_json::json!(["obf/StringDecryptor"]));
    assert!(report["encrypted_strings"].as_u64().unwrap() >= 1);
    assert!(report.get("generated_password").is_none());

    let written = jar::read_jar(&output)?;
    assert_eq!(
        written.manifest.as_ref().and_then(Manifest::main_class).as_deref(),
        Some("C0")
    );
    let names: Vec<&str> = written.classes.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["C0.class", "C1.class", "obf/StringDecryptor.class"]);
    let resources: Vec<&str> = written.resources.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(resources, ["app.properties"], "signature files are dropped");

    for entry in &written.classes[..2] {
        let class = ClassFile::parse(&entry.data)?;
        assert!(class.major >= 50);
        assert!(!contains(&entry.data, b"hello from helper"));
        assert!(!contains(&entry.data, b"demo/"));
    }

    let digest = report["output_sha256"].as_str().unwrap();
    assert_eq!(digest.len(), 64);

    let map: Value = serde_json::from_str(&std::fs::read_to_string(&mapping)?)?;
    assert_eq!(map["demo/App"], "C0");
    assert_eq!(map["demo/util/Helper"], "C1");

    std::fs::remove_dir_all(base)?;
    Ok(())
}

#[test]
fn same_seed_gives_the_same_jar() -> anyhow::Result<()> {
    let base = temp_dir("seed");
    let input = base.join("app.jar");
    write_app_jar(&input)?;

    let mut digests = Vec::new();
    for n in 0..2 {
        let output = base.join(format!("out{n}.jar"));
        let report = run_json(&[
            "obfuscate",
            input.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "--strings",
            "--flow",
            "--seed",
            "99",
        ])?;
        let written = jar::read_jar(&output)?;
        digests.push((report["dead_branches"].clone(), written.classes));
    }
    assert_eq!(digests[0].0, digests[1].0);
    let a: Vec<&Vec<u8>> = digests[0].1.iter().map(|e| &e.data).collect();
    let b: Vec<&Vec<u8>> = digests[1].1.iter().map(|e| &e.data).collect();
    assert_eq!(a, b);

    std::fs::remove_dir_all(base)?;
    Ok(())
}

#[test]
fn password_is_generated_and_guard_injected() -> anyhow::Result<()> {
    let base = temp_dir("password");
    let input = base.join("app.jar");
    write_app_jar(&input)?;

    // Implicit `obfuscate`, default output path next to the input.
    let report = run_json(&[input.to_str().unwrap(), "--password", "--bind-dir", "/opt/app"])?;

    let password = report["generated_password"].as_str().unwrap();
    assert_eq!(password.len(), 16);
    assert!(password.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(report["passes"], serde_json::json!(["binding", "password"]));
    assert_eq!(report["injected_classes"], serde_json::json!(["obf/Guard"]));
    assert_eq!(report["guarded_entry_points"], 2);
    assert_eq!(report["main_class_after"], "demo/App");

    let output = base.join("app-obf.jar");
    assert_eq!(report["output"], output.to_str().unwrap());
    let written = jar::read_jar(&output)?;
    assert!(written.classes.iter().any(|e| e.name == "obf/Guard.class"));

    std::fs::remove_dir_all(base)?;
    Ok(())
}

#[test]
fn no_pass_is_an_error() -> anyhow::Result<()> {
    let base = temp_dir("nopass");
    let input = base.join("app.jar");
    write_app_jar(&input)?;

    let out = run(&["obfuscate", input.to_str().unwrap()])?;
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("Nothing to do"));
    assert!(!base.join("app-obf.jar").exists());

    std::fs::remove_dir_all(base)?;
    Ok(())
}

#[test]
fn config_file_enables_passes() -> anyhow::Result<()> {
    let base = temp_dir("config");
    let input = base.join("app.jar");
    let output = base.join("app-out.jar");
    let config = base.join("obf.toml");
    write_app_jar(&input)?;
    std::fs::write(
        &config,
        "seed = 3\nruntime_package = \"com/acme/rt\"\n\n[strings]\nenabled = true\n",
    )?;

    let report = run_json(&[
        "--config",
        config.to_str().unwrap(),
        "obfuscate",
        input.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
    ])?;
    assert_eq!(report["passes"], serde_json::json!(["strings"]));
    assert_eq!(report["seed"], 3);
    assert_eq!(
        report["injected_classes"],
        serde_json::json!(["com/acme/rt/StringDecryptor"])
    );

    std::fs::remove_dir_all(base)?;
    Ok(())
}

#[test]
fn directory_input_mirrors_every_jar() -> anyhow::Result<()> {
    let base = temp_dir("batch");
    let root = base.join("libs");
    write_app_jar(&root.join("a.jar"))?;
    write_app_jar(&root.join("nested/b.jar"))?;
    let out_root = base.join("libs-out");
    let maps = base.join("maps");

    let report = run_json(&[
        "obfuscate",
        root.to_str().unwrap(),
        "-o",
        out_root.to_str().unwrap(),
        "--rename",
        "--seed",
        "5",
        "--mapping",
        maps.to_str().unwrap(),
    ])?;
    let jars = report["jars"].as_array().unwrap();
    assert_eq!(jars.len(), 2);
    assert!(report["failed"].as_array().unwrap().is_empty());
    assert!(out_root.join("a.jar").is_file());
    assert!(out_root.join("nested/b.jar").is_file());
    assert!(maps.join("a.jar.json").is_file());
    assert!(maps.join("nested/b.jar.json").is_file());
    assert_ne!(jars[0]["seed"], jars[1]["seed"]);

    std::fs::remove_dir_all(base)?;
    Ok(())
}

#[test]
fn inspect_reports_classes_and_main() -> anyhow::Result<()> {
    let base = temp_dir("inspect");
    let input = base.join("app.jar");
    write_app_jar(&input)?;

    let summary = run_json(&["inspect", input.to_str().unwrap()])?;
    assert_eq!(summary["main_class"], "demo/App");
    assert_eq!(summary["class_count"], 2);
    assert_eq!(summary["signed"], true);
    assert_eq!(summary["classes"][1]["name"], "demo/util/Helper");

    let out = run(&["inspect", input.to_str().unwrap(), "--format", "text"])?;
    assert!(out.status.success());
    let text = String::from_utf8(out.stdout)?;
    assert!(text.contains("main_class: demo/App\n"));
    assert!(text.contains("- demo/util/Helper extends java/lang/Object"));

    std::fs::remove_dir_all(base)?;
    Ok(())
}
