use anyhow::{Context, Result};
use memmap2::Mmap;
use std::collections::HashSet;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";
pub const MAIN_CLASS: &str = "Main-Class";

const MAX_LINE: usize = 72;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JarEntry {
    pub name: String,
    pub data: Vec<u8>,
}

/// Archive contents in archive order.
#[derive(Debug, Default)]
pub struct JarContents {
    pub manifest: Option<Manifest>,
    pub classes: Vec<JarEntry>,
    pub resources: Vec<JarEntry>,
    pub directories: Vec<String>,
}

/// A `.class` entry that gets parsed and transformed. Module and package descriptors and
/// anything under `META-INF/` (multi-release classes included) travel as resources.
pub fn is_class_entry(name: &str) -> bool {
    if !name.ends_with(".class") || name.starts_with("META-INF/") {
        return false;
    }
    let file = name.rsplit('/').next().unwrap_or(name);
    file != "module-info.class" && file != "package-info.class"
}

/// Jar signature files, invalid once class bytes change.
pub fn is_signature_file(name: &str) -> bool {
    let Some(file) = name.strip_prefix("META-INF/") else {
        return false;
    };
    if file.contains('/') {
        return false;
    }
    let upper = file.to_ascii_uppercase();
    [".SF", ".RSA", ".DSA", ".EC"]
        .iter()
        .any(|ext| upper.ends_with(ext))
}

pub fn read_jar(jar_path: &Path) -> Result<JarContents> {
    let file = File::open(jar_path)
        .with_context(|| format!("Failed to open jar: {}", jar_path.display()))?;
    // SAFETY: The file is opened read-only and outlives the mapping.
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to mmap jar: {}", jar_path.display()))?;
    let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))
        .with_context(|| format!("Failed to read zip structure: {}", jar_path.display()))?;

    let mut contents = JarContents::default();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        if entry.is_dir() {
            contents.directories.push(name);
            continue;
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("Failed to read jar entry: {name}"))?;

        if name.eq_ignore_ascii_case(MANIFEST_PATH) {
            contents.manifest = Some(
                Manifest::parse(&data)
                    .with_context(|| format!("Invalid manifest in {}", jar_path.display()))?,
            );
        } else if is_class_entry(&name) {
            contents.classes.push(JarEntry { name, data });
        } else {
            contents.resources.push(JarEntry { name, data });
        }
    }
    Ok(contents)
}

/// Writes the output archive: manifest, directories, classes, then every resource whose name
/// was not already written. Signature files are dropped.
pub fn write_jar(
    jar_path: &Path,
    manifest: Option<&Manifest>,
    directories: &[String],
    classes: &[JarEntry],
    resources: &[JarEntry],
) -> Result<()> {
    let file = File::create(jar_path)
        .with_context(|| format!("Failed to create jar: {}", jar_path.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut written: HashSet<String> = HashSet::new();

    if let Some(manifest) = manifest {
        zip.start_file(MANIFEST_PATH, options)?;
        zip.write_all(&manifest.to_bytes())?;
        written.insert(MANIFEST_PATH.to_string());
    }
    for dir in directories {
        if written.insert(dir.clone()) {
            zip.add_directory(dir.as_str(), options)?;
        }
    }
    for entry in classes.iter().chain(resources) {
        if is_signature_file(&entry.name) || !written.insert(entry.name.clone()) {
            continue;
        }
        zip.start_file(entry.name.as_str(), options)?;
        zip.write_all(&entry.data)
            .with_context(|| format!("Failed to write jar entry: {}", entry.name))?;
    }
    zip.finish()
        .with_context(|| format!("Failed to finish jar: {}", jar_path.display()))?;
    Ok(())
}

/// `META-INF/MANIFEST.MF`: a main section followed by named sections, each a list of
/// attributes in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub main: Vec<(String, String)>,
    pub sections: Vec<Vec<(String, String)>>,
}

impl Manifest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(data);
        let mut manifest = Manifest::default();
        let mut current: Vec<(String, String)> = Vec::new();
        let mut in_main = true;

        let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l)).peekable();
        while let Some(line) = lines.next() {
            if line.is_empty() {
                if in_main {
                    manifest.main = std::mem::take(&mut current);
                    in_main = false;
                } else if !current.is_empty() {
                    manifest.sections.push(std::mem::take(&mut current));
                }
                continue;
            }
            let mut logical = line.to_string();
            while let Some(next) = lines.peek() {
                let Some(cont) = next.strip_prefix(' ') else {
                    break;
                };
                logical.push_str(cont);
                lines.next();
            }
            let (key, value) = logical
                .split_once(": ")
                .or_else(|| logical.split_once(':'))
                .with_context(|| format!("Malformed manifest line: {logical}"))?;
            current.push((key.trim().to_string(), value.to_string()));
        }
        if in_main {
            manifest.main = current;
        } else if !current.is_empty() {
            manifest.sections.push(current);
        }
        Ok(manifest)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        for (key, value) in &self.main {
            write_attribute(&mut out, key, value);
        }
        out.push_str("\r\n");
        for section in &self.sections {
            for (key, value) in section {
                write_attribute(&mut out, key, value);
            }
            out.push_str("\r\n");
        }
        out.into_bytes()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.main
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self.main.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some((_, v)) => *v = value.to_string(),
            None => self.main.push((key.to_string(), value.to_string())),
        }
    }

    /// `Main-Class` as an internal name (`com/acme/App`).
    pub fn main_class(&self) -> Option<String> {
        self.get(MAIN_CLASS)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.replace('.', "/"))
    }

    pub fn set_main_class(&mut self, internal_name: &str) {
        self.set(MAIN_CLASS, &internal_name.replace('/', "."));
    }
}

/// One `Key: value` attribute, wrapped so no line exceeds 72 bytes.
fn write_attribute(out: &mut String, key: &str, value: &str) {
    let line = format!("{key}: {value}");
    let mut budget = MAX_LINE;
    let mut width = 0;
    for c in line.chars() {
        let len = c.len_utf8();
        if width + len > budget {
            out.push_str("\r\n ");
            budget = MAX_LINE - 1;
            width = 0;
        }
        out.push(c);
        width += len;
    }
    out.push_str("\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(name: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "jar_obfuscator_test_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ))
    }

    fn write_raw_jar(path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
        let file = File::create(path)?;
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, content) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, options)?;
            } else {
                zip.start_file(*name, options)?;
                zip.write_all(content)?;
            }
        }
        zip.finish()?;
        Ok(())
    }

    fn entry_names(path: &Path) -> Result<Vec<String>> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file)?;
        let mut names = Vec::new();
        for i in 0..archive.len() {
            names.push(archive.by_index(i)?.name().to_string());
        }
        Ok(names)
    }

    #[test]
    fn classifies_entries() {
        assert!(is_class_entry("com/acme/App.class"));
        assert!(is_class_entry("App.class"));
        assert!(!is_class_entry("module-info.class"));
        assert!(!is_class_entry("com/acme/package-info.class"));
        assert!(!is_class_entry("META-INF/versions/11/com/acme/App.class"));
        assert!(!is_class_entry("com/acme/app.properties"));

        assert!(is_signature_file("META-INF/CERT.SF"));
        assert!(is_signature_file("META-INF/cert.rsa"));
        assert!(!is_signature_file("META-INF/MANIFEST.MF"));
        assert!(!is_signature_file("META-INF/services/x.SF"));
    }

    #[test]
    fn manifest_parses_continuations_and_sections() -> Result<()> {
        let raw = b"Manifest-Version: 1.0\r\nMain-Class: com.acme.VeryLong\r\n Name\r\n\r\nName: com/acme/\r\nSealed: true\r\n\r\n";
        let m = Manifest::parse(raw)?;
        assert_eq!(m.get("manifest-version"), Some("1.0"));
        assert_eq!(m.main_class().as_deref(), Some("com/acme/VeryLongName"));
        assert_eq!(m.sections.len(), 1);
        assert_eq!(m.sections[0][1], ("Sealed".to_string(), "true".to_string()));
        Ok(())
    }

    #[test]
    fn manifest_lines_wrap_at_72_bytes() -> Result<()> {
        let mut m = Manifest::default();
        m.set("Manifest-Version", "1.0");
        let long = format!("com/acme/{}", "x".repeat(150));
        m.set_main_class(&long);
        let bytes = m.to_bytes();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.split("\r\n").all(|l| l.len() <= 72));
        assert!(text.ends_with("\r\n\r\n"));

        let reparsed = Manifest::parse(&bytes)?;
        assert_eq!(reparsed.main_class(), Some(long));
        Ok(())
    }

    #[test]
    fn read_then_write_keeps_order_and_drops_signatures() -> Result<()> {
        let input = temp_path("in.jar");
        write_raw_jar(
            &input,
            &[
                ("META-INF/", b""),
                ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\r\nMain-Class: a.App\r\n\r\n"),
                ("META-INF/SIGNER.SF", b"sig"),
                ("a/", b""),
                ("a/App.class", b"\xCA\xFE"),
                ("a/config.txt", b"cfg"),
                ("module-info.class", b"mod"),
            ],
        )?;

        let contents = read_jar(&input)?;
        assert_eq!(contents.directories, vec!["META-INF/", "a/"]);
        assert_eq!(contents.classes.len(), 1);
        assert_eq!(contents.classes[0].name, "a/App.class");
        assert_eq!(contents.resources.len(), 3);
        let manifest = contents.manifest.clone().unwrap();
        assert_eq!(manifest.main_class().as_deref(), Some("a/App"));

        let output = temp_path("out.jar");
        let renamed = vec![JarEntry {
            name: "C0.class".to_string(),
            data: b"\xCA\xFE".to_vec(),
        }];
        write_jar(
            &output,
            Some(&manifest),
            &contents.directories,
            &renamed,
            &contents.resources,
        )?;
        let names = entry_names(&output)?;
        assert_eq!(
            names,
            vec![
                "META-INF/MANIFEST.MF",
                "META-INF/",
                "a/",
                "C0.class",
                "a/config.txt",
                "module-info.class",
            ]
        );

        std::fs::remove_file(input)?;
        std::fs::remove_file(output)?;
        Ok(())
    }
}
