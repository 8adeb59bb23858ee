use std::env;
use std::path::Path;
use std::process::Command;

fn main() {
    let out_dir = env::var("OUT_DIR").unwrap();
    let dest_path = Path::new(&out_dir).join("xsk_def_xdp_prog.o");
    let src_path = "bpf/xsk_def_xdp_prog.c";

    // Compile the default redirect program using clang
    let status = Command::new("clang")
        .arg("-O2")
        .arg("-g")
        .arg("-target")
        .arg("bpf")
        .arg("-c")
        .arg(src_path)
        .arg("-o")
        .arg(&dest_path)
        .status()
        .expect("Failed to compile the default XDP program (clang with BPF target required)");

    assert!(status.success());

    println!("cargo:rerun-if-changed={src_path}");
}
