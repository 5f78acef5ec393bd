fn main() {
    // No-op off msvc.
    static_vcruntime::metabuild();

    if std::env::var("CARGO_CFG_TARGET_ENV").as_deref() == Ok("msvc") {
        // The server pid cell lives in a section mapped shared and writable
        // across every process the library is loaded into.
        println!("cargo:rustc-link-arg=/SECTION:.shared,RWS");
    }
}
