use std::env;


fn main() {
    println!("cargo:rerun-if-env-changed=CARGO_CFG_TARGET_OS");

    // Android is Linux as far as procfs and the ELF core format are
    // concerned.
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "linux" || target_os == "android" {
        println!("cargo:rustc-cfg=linux");
    }
}
