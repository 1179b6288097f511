/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::env;
use std::path::PathBuf;

// Enums matched on by value are generated as modules of constants.
const CONSTIFIED_ENUMS: &[&str] = &[
    "ibv_qp_type",
    "ibv_qp_state",
    "ibv_wc_opcode",
    "ibv_wr_opcode",
    "ibv_wc_status",
    "rdma_cm_event_type",
    "rdma_port_space",
];

fn main() {
    for lib in ["ibverbs", "rdmacm"] {
        println!("cargo:rustc-link-lib={}", lib);
    }
    for dir in ["/usr/lib", "/usr/lib64"] {
        println!("cargo:rustc-link-search={}", dir);
    }
    println!("cargo:rerun-if-changed=src/wrapper.h");

    let manifest_dir =
        PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));
    let header = manifest_dir.join("src/wrapper.h");
    assert!(header.exists(), "missing {}", header.display());

    let mut builder = bindgen::Builder::default()
        .header(header.to_string_lossy())
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
        .allowlist_function("(ibv|rdma)_.*")
        .allowlist_type("(ibv|rdma)_.*")
        .allowlist_var("(IBV|RDMA)_.*")
        // Declared by hand in lib.rs.
        .blocklist_type("ibv_wc")
        .bitfield_enum("ibv_send_flags")
        .derive_default(true)
        .prepend_enum_name(false);
    for name in CONSTIFIED_ENUMS {
        builder = builder.constified_enum_module(*name);
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    builder
        .generate()
        .expect("failed to generate rdma bindings")
        .write_to_file(out_dir.join("bindings.rs"))
        .expect("failed to write rdma bindings");
}
