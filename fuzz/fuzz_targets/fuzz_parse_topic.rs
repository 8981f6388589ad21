#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(topic) = std::str::from_utf8(data) else {
        return;
    };

    if let Some(parsed) = hesperus::topic_parser::ParsedTopic::from_topic(topic) {
        for descriptor in hesperus::topics::topic_table() {
            let _ = parsed.finalize(&descriptor);
        }
    }
});
