#![no_main]

use deathwatch_core::DeathNote;
use libfuzzer_sys::fuzz_target;

// The post-mortem check feeds whatever is on disk to the parser; any input,
// including a marker truncated mid-write, must be rejected without panicking.
fuzz_target!(|data: &[u8]| {
    let Ok(note) = DeathNote::parse(data) else {
        return;
    };

    // Anything accepted must survive a write/read cycle unchanged.
    let bytes = serde_json::to_vec(&note).expect("accepted note serializes");
    let again = DeathNote::parse(&bytes).expect("serialized note parses");
    assert_eq!(again.reason, note.reason);
    assert_eq!(again.pid, note.pid);
    assert_eq!(again.error, note.error);
    assert_eq!(again.graceful, note.graceful);
});
