//! File-tree fixtures for transfer tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Create a file (and its parent directories) beneath `root`.
pub fn write_file(root: &Path, relative: &str, contents: &[u8]) {
    let full = root.join(relative);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).expect("create fixture directories");
    }
    fs::write(full, contents).expect("write fixture file");
}

/// A buffer of `len` copies of `byte`.
pub fn fill(byte: u8, len: usize) -> Vec<u8> {
    vec![byte; len]
}

/// Read every regular file beneath `root` into a map keyed by
/// forward-slash relative path. Hidden files (resume state) are included;
/// callers filter what they do not care about.
pub fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    collect(root, root, &mut out);
    out
}

fn collect(dir: &Path, root: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
    for entry in fs::read_dir(dir).expect("read fixture directory") {
        let entry = entry.expect("read fixture entry");
        let path = entry.path();
        if path.is_dir() {
            collect(&path, root, out);
        } else {
            let relative = path
                .strip_prefix(root)
                .expect("entry under root")
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.insert(relative, fs::read(&path).expect("read fixture file"));
        }
    }
}
