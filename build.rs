use std::fs;
use std::path::Path;

fn main() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR missing");
    let taxonomy = Path::new(&manifest_dir).join("src").join("errorx.rs");
    println!("cargo:rerun-if-changed={}", taxonomy.display());
    if taxonomy.exists() {
        let contents = fs::read_to_string(&taxonomy)
            .unwrap_or_else(|e| panic!("Failed to read {}: {}", taxonomy.display(), e));
        enforce_taxonomy_guards(&contents, &taxonomy);
    }
}

/// The failure taxonomy must stay a pure mapping: no process-wide state,
/// no I/O, no logging.
fn enforce_taxonomy_guards(contents: &str, path: &Path) {
    let forbidden = [
        "static mut",
        "lazy_static",
        "thread_local!",
        "Mutex",
        "RwLock",
        "Atomic",
        "OnceLock",
        "std::env",
        "std::fs",
        "tracing::",
        "println!(",
        "eprintln!(",
    ];

    for token in forbidden {
        if contents.contains(token) {
            panic!(
                "Forbidden token `{}` in taxonomy module: {}",
                token,
                path.display()
            );
        }
    }
}
