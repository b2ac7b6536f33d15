#![no_main]

//! Fuzz target for stored job payload decoding.
//!
//! Workers decode every claimed row with `Job::from_payload`. A payload
//! written by an older release, or corrupted in the table, must come back
//! as an error and never panic the worker.

use herald_pipeline::Job;
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    if let Ok(job) = Job::from_payload(&payload) {
        // Anything that decodes must encode back to the same job.
        let encoded = job.to_payload().expect("decoded job re-encodes");
        let decoded = Job::from_payload(&encoded).expect("re-encoded job decodes");
        assert_eq!(decoded, job);
        assert_eq!(decoded.queue(), job.queue());
    }
});
