use std::env;

fn main() {
    // Host builds (tests, tooling) don't link against memory.x
    let target = env::var("TARGET").unwrap_or_default();
    if target.starts_with("thumb") {
        // Tell the linker where to find memory.x
        println!("cargo:rustc-link-search={}", env::var("CARGO_MANIFEST_DIR").unwrap_or_default());

        println!("cargo:rustc-link-arg-bins=-Tlink.x");
        println!("cargo:rustc-link-arg-bins=-Tdefmt.x");
    }

    // Only re-run the build script when memory.x is changed
    println!("cargo:rerun-if-changed=memory.x");
}
