fn main() {
    // Embed a UTC build timestamp so --version can report it.
    let built = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    println!("cargo:rustc-env=WV_BUILD_TIME={built}");
}
