/// Build flow with the `verbs` feature:
///
/// 1. Try to link to an existing `MLNX_OFED` installation.
/// 2. If failed, try to link to an upstream `rdma-core` installation.
/// 3. Generate bindings for the verbs this crate uses.
///
/// Without the feature, nothing is linked and only the software provider is built.
fn main() {
    // Refuse to compile on non-64-bit platforms.
    if cfg!(not(target_pointer_width = "64")) {
        panic!("`rdxfer` currently only supports 64-bit platforms");
    }

    #[cfg(feature = "verbs")]
    verbs::build();
}

#[cfg(feature = "verbs")]
mod verbs {
    use std::env::{self, consts};
    use std::path::{Path, PathBuf};
    use std::process::Command;

    /// Try to link to an existing `MLNX_OFED` installation.
    /// Return the include directories to pass to `bindgen`.
    fn link_mlnx_ofed() -> Result<Vec<String>, ()> {
        let output = Command::new("ofed_info")
            .arg("-n")
            .output()
            .map_err(|_| ())?;

        match *output.stdout.first().ok_or(())? {
            b'4' => {
                // MLNX_OFED v4.9-x LTS will not register `libibverbs` to `pkg-config`.
                // We assume the default installation path as `/usr`.
                let lib_dir = env::var("MLNX_OFED_LIB_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| Path::new("/usr/lib").to_owned());

                let dylib_name = format!("{}ibverbs{}", consts::DLL_PREFIX, consts::DLL_SUFFIX);
                if !lib_dir.join(dylib_name).exists() && !lib_dir.join("libibverbs.a").exists() {
                    return Err(());
                }
                println!("cargo:rustc-link-search=native={}", lib_dir.display());
                println!("cargo:rustc-link-lib=ibverbs");
                Ok(env::var("MLNX_OFED_INCLUDE_DIR")
                    .map(|dir| vec![dir])
                    .unwrap_or_default())
            }
            b'5' => link_rdma_core("1.8.28"),
            _ => Err(()),
        }
    }

    /// Link to `libibverbs` registered to `pkg-config`.
    fn link_rdma_core(min_version: &str) -> Result<Vec<String>, ()> {
        let lib = pkg_config::Config::new()
            .atleast_version(min_version)
            .statik(false)
            .probe("libibverbs")
            .map_err(|_| ())?;
        Ok(lib
            .include_paths
            .iter()
            .filter_map(|p| p.to_str().map(str::to_owned))
            .collect())
    }

    pub fn build() {
        println!("cargo:rerun-if-changed=src/rdma/verbs/verbs.h");
        println!("cargo:rerun-if-env-changed=MLNX_OFED_INCLUDE_DIR");
        println!("cargo:rerun-if-env-changed=MLNX_OFED_LIB_DIR");

        let include_dirs = link_mlnx_ofed()
            .or_else(|_| link_rdma_core("1.1"))
            .expect("cannot find libibverbs; install rdma-core or MLNX_OFED");
        gen_verb_bindings(include_dirs);
    }

    fn gen_verb_bindings(include_dirs: Vec<String>) {
        let include_args = include_dirs.iter().map(|p| format!("-I{}", p));
        let bindings = bindgen::builder()
            .clang_args(include_args)
            .header("src/rdma/verbs/verbs.h")
            .allowlist_function("ibv_.*")
            .allowlist_type("ibv_.*")
            .allowlist_var("IBV_.*")
            .opaque_type("pthread_.*")
            .blocklist_type("in6_addr")
            .blocklist_type("sockaddr.*")
            .blocklist_type("timespec")
            // `ibv_query_port` is a macro over an inline function; declared by hand.
            .blocklist_function("ibv_query_port")
            .bitfield_enum("ibv_access_flags")
            .bitfield_enum("ibv_qp_attr_mask")
            .bitfield_enum("ibv_send_flags")
            .bitfield_enum("ibv_wc_flags")
            .constified_enum_module("ibv_mtu")
            .constified_enum_module("ibv_port_state")
            .constified_enum_module("ibv_qp_type")
            .constified_enum_module("ibv_qp_state")
            .constified_enum_module("ibv_wc_status")
            .constified_enum_module("ibv_wc_opcode")
            .constified_enum_module("ibv_wr_opcode")
            .derive_copy(true)
            .derive_debug(false)
            .derive_default(true)
            .generate_comments(false)
            .layout_tests(false)
            .prepend_enum_name(false)
            .size_t_is_usize(true)
            .generate()
            .expect("failed to generate bindings");

        let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo");
        let dest = Path::new(&out_dir).join("verbs_bindings.rs");
        bindings
            .write_to_file(dest)
            .expect("failed to write bindings");
    }
}
