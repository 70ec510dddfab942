fn main() {
    // ── macOS: embed Info.plist so CoreBluetooth lets the CLI scan ───────────
    //
    // CBCentralManager stays "unauthorised" for a bare command-line binary
    // unless the executable carries NSBluetoothAlwaysUsageDescription.  The
    // plist is linked into the `__TEXT,__info_plist` section, which macOS
    // reads the same way it reads an app bundle's Info.plist.
    //
    // `CARGO_CFG_TARGET_OS` is the target, not the host, so cross builds work.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    // Only the BLE binary needs the section.
    if std::env::var_os("CARGO_FEATURE_BLE").is_none() {
        return;
    }

    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        return;
    };
    let plist = format!("{dir}/Info.plist");

    println!("cargo:rustc-link-arg-bins=-sectcreate");
    println!("cargo:rustc-link-arg-bins=__TEXT");
    println!("cargo:rustc-link-arg-bins=__info_plist");
    println!("cargo:rustc-link-arg-bins={plist}");
    println!("cargo:rerun-if-changed=Info.plist");
}
