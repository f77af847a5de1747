use std::path::Path;

/// Assert CLI output mentions `needle`, echoing the whole output if not.
pub fn assert_contains(output: &str, needle: &str) {
    assert!(output.contains(needle), "missing '{needle}' in vmh output:\n{output}");
}

pub fn assert_not_contains(output: &str, needle: &str) {
    assert!(!output.contains(needle), "unexpected '{needle}' in vmh output:\n{output}");
}

pub fn assert_path_exists(path: &Path) {
    assert!(path.exists(), "vmh did not create {}", path.display());
}
