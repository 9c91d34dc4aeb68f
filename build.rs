fn main() {
    println!("cargo:rerun-if-env-changed=PALMGR_BUILD_VERSION");

    let version = std::env::var("PALMGR_BUILD_VERSION")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

    println!("cargo:rustc-env=PALMGR_BUILD_VERSION={version}");
}
