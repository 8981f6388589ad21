#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = std::str::from_utf8(data) else {
        return;
    };

    // Exercise every decoder; decode must fail closed, never panic
    for descriptor in hesperus::topics::topic_table() {
        let _ = hesperus::codec::decode(payload, &descriptor);
    }
    let _ = hesperus::codec::decode_bool(payload);
    let _ = hesperus::codec::decode_float_field(payload, "max");
});
