use std::env;
use std::fs;
use std::path::PathBuf;

/// Dialect compiler sources, by environment variable and embedded file name.
const DIALECT_BLOBS: [(&str, &str); 2] =
    [("PLV8_COFFEE_SCRIPT_JS", "coffee_script.js"), ("PLV8_LIVESCRIPT_JS", "livescript.js")];

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));

    for (variable, file_name) in DIALECT_BLOBS {
        println!("cargo:rerun-if-env-changed={variable}");
        let target = out_dir.join(file_name);

        let contents = match env::var_os(variable) {
            Some(path) if !path.is_empty() => {
                let path = PathBuf::from(path);
                println!("cargo:rerun-if-changed={}", path.display());
                fs::read(&path).unwrap_or_else(|err| {
                    panic!("failed to read {variable}={} for the plv8 build: {err}", path.display())
                })
            }
            // an empty blob leaves the dialect disabled
            _ => Vec::new(),
        };

        fs::write(&target, contents).unwrap_or_else(|err| {
            panic!("failed to write dialect blob {}: {err}", target.display())
        });
    }
}
