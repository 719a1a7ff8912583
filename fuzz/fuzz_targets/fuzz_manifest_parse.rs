#![no_main]

use abot::codegen;
use abot::manifest::PluginManifest;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(manifest) = PluginManifest::parse(text) else {
        return;
    };

    // Accepted paths never escape the module root
    for path in manifest.paths() {
        assert!(!path.starts_with('/'));
        assert!(path.split('/').all(|segment| segment != ".." && !segment.is_empty()));
    }

    // Rendering is deterministic and emits one import per path
    let rendered = codegen::render(&manifest);
    assert_eq!(rendered, codegen::render(&manifest));
    let imports = rendered.lines().filter(|l| l.starts_with("\t_ ")).count();
    assert_eq!(imports, manifest.len());
});
