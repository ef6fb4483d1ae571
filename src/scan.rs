use anyhow::Result;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

/// Every `*.jar` below `base_path`, sorted. Hidden directories are searched and ignore files
/// are not honored.
pub fn scan_jars(base_path: &Path) -> Result<Vec<PathBuf>> {
    let (tx, rx) = mpsc::channel();

    let walker = WalkBuilder::new(base_path)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry {
                let path = entry.path();
                if path.is_file() && path.extension().is_some_and(|e| e == "jar") {
                    let _ = tx.send(path.to_path_buf());
                }
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    let mut jars: Vec<PathBuf> = rx.iter().collect();
    jars.sort();
    Ok(jars)
}

/// `<stem>-obf.jar` next to the input jar, or `<dir>-obf` next to an input directory.
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "output".to_string());
    let name = if input.is_dir() {
        format!("{stem}-obf")
    } else {
        format!("{stem}-obf.jar")
    };
    match input.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Where `jar` (found below `input_root`) goes below `output_root`.
pub fn mirrored_output(input_root: &Path, jar: &Path, output_root: &Path) -> PathBuf {
    match jar.strip_prefix(input_root) {
        Ok(relative) => output_root.join(relative),
        Err(_) => output_root.join(jar.file_name().unwrap_or(jar.as_os_str())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(prefix: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "{prefix}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        p
    }

    #[test]
    fn scan_jars_finds_nested_and_hidden_jars() {
        let base = temp_dir("jar-obfuscator-scan");
        fs::create_dir_all(base.join("libs/.cache")).unwrap();
        fs::write(base.join("app.jar"), b"").unwrap();
        fs::write(base.join("libs/.cache/dep.jar"), b"").unwrap();
        fs::write(base.join("libs/readme.txt"), b"").unwrap();
        fs::write(base.join(".gitignore"), b"*.jar\n").unwrap();

        let jars = scan_jars(&base).unwrap();
        assert_eq!(
            jars,
            vec![base.join("app.jar"), base.join("libs/.cache/dep.jar")]
        );
        fs::remove_dir_all(base).unwrap();
    }

    #[test]
    fn outputs_mirror_the_input_tree() {
        let out = mirrored_output(
            Path::new("/in"),
            Path::new("/in/libs/dep.jar"),
            Path::new("/out"),
        );
        assert_eq!(out, PathBuf::from("/out/libs/dep.jar"));
        assert_eq!(
            default_output_path(Path::new("/tmp/does-not-exist/app.jar")),
            PathBuf::from("/tmp/does-not-exist/app-obf.jar")
        );
    }
}
