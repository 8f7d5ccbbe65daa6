fn main() {
    println!("cargo:rerun-if-changed=link.ld");

    // Only the bare-metal target uses the kernel layout; hosted builds
    // (the test suite) link normally.
    let target = std::env::var("TARGET").unwrap_or_default();
    if target.ends_with("-none") || target.contains("-none-") {
        let dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR is always set");
        println!("cargo:rustc-link-arg-bins=-T{dir}/link.ld");
    }
}
