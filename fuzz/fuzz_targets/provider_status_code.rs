#![no_main]

//! Fuzz target for provider delivery code classification.
//!
//! Status codes come straight from the provider's response body. The
//! classifier must be total and ignore case and surrounding whitespace.

use herald_pipeline::classify_provider_code;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(code) = std::str::from_utf8(data) else {
        return;
    };

    let status = classify_provider_code(code);
    assert_eq!(classify_provider_code(&code.to_ascii_uppercase()), status);
    assert_eq!(classify_provider_code(&format!("  {code}\t")), status);
});
