#![no_main]

use libfuzzer_sys::fuzz_target;
use patchbay_engine::state::fuzz_parse_patch;

fuzz_target!(|data: &[u8]| {
    fuzz_parse_patch(data);
});
