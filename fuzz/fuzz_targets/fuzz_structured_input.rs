#![no_main]

use abot::message::{StructuredInput, Trigger};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let structured = StructuredInput::from_sentence(text);
    for command in &structured.commands {
        assert!(!command.is_empty());
        assert!(!command.chars().any(char::is_whitespace));
    }

    let trigger = Trigger::new(text.split(','));
    let mut seen = std::collections::HashSet::new();
    for keyword in trigger.commands() {
        assert!(seen.insert(keyword.clone()), "duplicate keyword {keyword:?}");
        assert_eq!(keyword, keyword.trim());
    }

    let json = serde_json::to_string(&trigger).unwrap();
    let back: Trigger = serde_json::from_str(&json).unwrap();
    assert_eq!(back, trigger);
});
