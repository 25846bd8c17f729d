fn main() {
    let target = std::env::var("TARGET").unwrap_or_default();

    // Classify the target the same way the assembly code does.
    if target.starts_with("thumbv6m") {
        println!("cargo:rustc-cfg=armv6m");
    }
    if target.starts_with("thumbv8m.base") {
        println!("cargo:rustc-cfg=armv8m_base");
    }
    if target.ends_with("eabihf") {
        println!("cargo:rustc-cfg=has_fpu");
    }

    println!("cargo:rustc-check-cfg=cfg(armv6m)");
    println!("cargo:rustc-check-cfg=cfg(armv8m_base)");
    println!("cargo:rustc-check-cfg=cfg(has_fpu)");
    println!("cargo:rerun-if-changed=build.rs");
}
