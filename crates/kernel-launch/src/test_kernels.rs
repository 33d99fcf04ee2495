//! Throwaway kernelspecs for tests that launch real processes.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tempfile::TempDir;

/// A kernel whose process exits as soon as it starts.
pub const EXITING_KERNEL: &str = "exits-immediately";
/// A kernel whose executable does not exist.
pub const UNSPAWNABLE_KERNEL: &str = "missing-executable";

static JUPYTER_DIR: OnceLock<TempDir> = OnceLock::new();

/// Point kernelspec and runtime lookups at a temp dir holding the test
/// kernelspecs. Returns the runtime dir connection files are written to.
pub fn install() -> PathBuf {
    let dir = JUPYTER_DIR.get_or_init(|| {
        let dir = TempDir::new().unwrap();
        write_kernelspec(
            dir.path(),
            EXITING_KERNEL,
            &["sh", "-c", "exit 0", "{connection_file}"],
        );
        write_kernelspec(
            dir.path(),
            UNSPAWNABLE_KERNEL,
            &["/nonexistent/kernel-launch-test-kernel", "{connection_file}"],
        );
        std::env::set_var("JUPYTER_PATH", dir.path());
        std::env::set_var("JUPYTER_RUNTIME_DIR", dir.path().join("runtime"));
        dir
    });
    dir.path().join("runtime")
}

fn write_kernelspec(root: &Path, name: &str, argv: &[&str]) {
    let kernel_dir = root.join("kernels").join(name);
    std::fs::create_dir_all(&kernel_dir).unwrap();
    let spec = serde_json::json!({
        "argv": argv,
        "display_name": name,
        "language": "sh",
    });
    std::fs::write(kernel_dir.join("kernel.json"), spec.to_string()).unwrap();
}
