use std::env;

fn main() {
    let target = env::var("TARGET").unwrap_or_default();
    if target.contains("windows") {
        panic!("strand runtime is unix-only: the readiness loop is built on poll(2)");
    }
    let mut build = cc::Build::new();
    if target.contains("apple") {
        if target.contains("aarch64") || target.contains("arm64") {
            build.file("strandctx_arm64_macos.asm");
        } else {
            build.file("strandctx_x86_64_macos.asm");
        }
    } else if target.contains("aarch64") || target.contains("arm64") {
        build.file("strandctx_arm64.asm");
    } else if target.contains("x86_64") {
        build.file("strandctx_x86_64_sysv.asm");
    } else {
        panic!("strand runtime has no context switch for target {target}");
    }
    build.flag("-x").flag("assembler");
    build.flag_if_supported("-Qunused-arguments");
    build.compile("strandctx");
}
